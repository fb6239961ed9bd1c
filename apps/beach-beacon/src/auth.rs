use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::registry::UserId;

/// Result of exchanging a client token for a user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success(UserId),
    /// The auth service answered with anything other than 200.
    Rejected,
    /// 200, but `uid` was absent or empty.
    MissingIdentity,
    /// 200, but `uid` could not be read as an integer.
    BadIdentity,
    /// Network failure or a response body we could not interpret.
    Unreachable(String),
}

/// Client for the external authentication service.
///
/// Calls `GET {auth_url}?cid=<connection id>` with the client's token as a
/// bearer credential and expects `{"data": {"uid": ...}}` on success.
#[derive(Clone)]
pub struct AuthBridge {
    auth_url: String,
    client: Client,
}

impl AuthBridge {
    pub fn new(auth_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            auth_url: auth_url.into(),
            client,
        })
    }

    pub async fn authenticate(&self, connection_id: &str, token: &str) -> AuthOutcome {
        let response = match self
            .client
            .get(&self.auth_url)
            .query(&[("cid", connection_id)])
            .bearer_auth(token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(connection_id, error = %err, "auth service request failed");
                return AuthOutcome::Unreachable(err.to_string());
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            debug!(connection_id, %status, "auth service rejected token");
            return AuthOutcome::Rejected;
        }

        match response.json::<Value>().await {
            Ok(body) => resolve_identity(&body),
            Err(err) => {
                warn!(connection_id, error = %err, "auth service returned unreadable body");
                AuthOutcome::Unreachable(err.to_string())
            }
        }
    }
}

fn resolve_identity(body: &Value) -> AuthOutcome {
    let Some(data) = body.get("data").filter(|data| data.is_object()) else {
        return AuthOutcome::Unreachable("auth response missing data object".into());
    };

    match data.get("uid") {
        Some(uid) => parse_uid(uid),
        None => AuthOutcome::MissingIdentity,
    }
}

fn parse_uid(uid: &Value) -> AuthOutcome {
    match uid {
        Value::Null | Value::Bool(false) => AuthOutcome::MissingIdentity,
        Value::Number(number) => match number.as_i64() {
            Some(0) => AuthOutcome::MissingIdentity,
            Some(id) => AuthOutcome::Success(id),
            None if number.as_f64() == Some(0.0) => AuthOutcome::MissingIdentity,
            None => AuthOutcome::BadIdentity,
        },
        Value::String(raw) if raw.is_empty() => AuthOutcome::MissingIdentity,
        Value::String(raw) => raw
            .trim()
            .parse::<UserId>()
            .map(AuthOutcome::Success)
            .unwrap_or(AuthOutcome::BadIdentity),
        Value::Array(items) if items.is_empty() => AuthOutcome::MissingIdentity,
        Value::Object(fields) if fields.is_empty() => AuthOutcome::MissingIdentity,
        _ => AuthOutcome::BadIdentity,
    }
}
