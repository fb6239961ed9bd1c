use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    registry::{ChannelRegistry, UserId},
    state::AppState,
    token::SubmissionTokens,
};

const ITEM_ERROR: &str = "user_id and body are required";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    SuccessSent,
    SuccessNotConnected,
    Failed,
}

impl DeliveryStatus {
    fn metric_label(self) -> &'static str {
        match self {
            DeliveryStatus::SuccessSent => "success_sent",
            DeliveryStatus::SuccessNotConnected => "success_not_connected",
            DeliveryStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationResult {
    /// Echoes whatever the submitter sent, so failed items may carry a
    /// non-integer or `null` here.
    pub user_id: Value,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NotificationResult {
    fn delivered(user_id: UserId, connected: bool) -> Self {
        Self {
            user_id: Value::from(user_id),
            status: if connected {
                DeliveryStatus::SuccessSent
            } else {
                DeliveryStatus::SuccessNotConnected
            },
            error: None,
        }
    }

    fn failed(user_id: Value) -> Self {
        Self {
            user_id,
            status: DeliveryStatus::Failed,
            error: Some(ITEM_ERROR.to_string()),
        }
    }
}

/// Whole-batch rejections. Per-item problems never surface here.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Payload must be valid JSON")]
    InvalidJson,
    #[error("Payload must be an object with 'date' and 'notifications' keys")]
    MissingKeys,
    #[error("'date' must be a string and 'notifications' must be an array")]
    WrongTypes,
    #[error("Unauthorized")]
    Unauthorized,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        match self {
            DispatchError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": self.to_string() })),
            )
                .into_response(),
            other => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": other.to_string() })),
            )
                .into_response(),
        }
    }
}

#[derive(Debug)]
pub struct Batch {
    pub date: String,
    pub notifications: Vec<Value>,
}

pub fn parse_batch(payload: &[u8]) -> Result<Batch, DispatchError> {
    let value: Value = serde_json::from_slice(payload).map_err(|_| DispatchError::InvalidJson)?;
    let Value::Object(mut fields) = value else {
        return Err(DispatchError::MissingKeys);
    };

    let (Some(date), Some(notifications)) = (fields.remove("date"), fields.remove("notifications"))
    else {
        return Err(DispatchError::MissingKeys);
    };

    match (date, notifications) {
        (Value::String(date), Value::Array(notifications)) => Ok(Batch {
            date,
            notifications,
        }),
        _ => Err(DispatchError::WrongTypes),
    }
}

/// Validates, authorises and delivers one submission. The shape is checked
/// first because the expected token depends on the batch `date`.
pub async fn dispatch(
    registry: &ChannelRegistry,
    tokens: &SubmissionTokens,
    authorization: Option<&str>,
    payload: &[u8],
) -> Result<Vec<NotificationResult>, DispatchError> {
    let batch = parse_batch(payload)?;
    if !tokens.validate(authorization, &batch.date) {
        return Err(DispatchError::Unauthorized);
    }
    Ok(deliver_all(registry, &batch.notifications).await)
}

/// Delivers items one after another, so every connection sees a batch's
/// notifications in submission order.
pub async fn deliver_all(registry: &ChannelRegistry, items: &[Value]) -> Vec<NotificationResult> {
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let result = match validate_item(item) {
            Some((user_id, body)) => {
                NotificationResult::delivered(user_id, registry.send(user_id, body).await)
            }
            None => {
                debug!(item = %item, "rejecting malformed notification item");
                NotificationResult::failed(item.get("user_id").cloned().unwrap_or(Value::Null))
            }
        };
        counter!(
            "beach_beacon_notifications_total",
            1,
            "status" => result.status.metric_label()
        );
        results.push(result);
    }
    results
}

// `user_id` must be a non-zero integer and `body` a non-empty object.
fn validate_item(item: &Value) -> Option<(UserId, &Value)> {
    let user_id = item
        .get("user_id")?
        .as_i64()
        .filter(|user_id| *user_id != 0)?;
    let body = item
        .get("body")
        .filter(|body| body.as_object().is_some_and(|fields| !fields.is_empty()))?;
    Some((user_id, body))
}

/// POST /notify
pub async fn notify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Bytes,
) -> Result<Json<Vec<NotificationResult>>, DispatchError> {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match dispatch(&state.registry, &state.tokens, authorization, &payload).await {
        Ok(results) => {
            debug!(items = results.len(), "notification batch dispatched");
            Ok(Json(results))
        }
        Err(err) => {
            warn!(error = %err, "notification batch rejected");
            Err(err)
        }
    }
}
