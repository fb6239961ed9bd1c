//! WebSocket side of the relay.
//!
//! Every connection runs through
//! `Accepted -> AwaitingToken -> Authenticating -> Registered -> Relaying -> Closed`
//! on its own task. Each exit path produces a [`ConnectionEnd`], and
//! [`ConnectionEnd::close_code`] is the only place close codes are chosen.

use std::{
    borrow::Cow,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};

use crate::{auth::AuthOutcome, registry::UserId, state::AppState};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Caller-chosen connection id, forwarded to the auth service.
    pub cid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Accepted,
    AwaitingToken,
    Authenticating,
    Registered,
    Relaying,
    Closed,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("client sent invalid payload: {0}")]
    InvalidPayload(String),
    #[error("auth service unreachable: {0}")]
    AuthUnreachable(String),
}

/// Why a connection reached `Closed`.
#[derive(Debug)]
pub enum ConnectionEnd {
    /// Client closed the socket or the network dropped it.
    Disconnected,
    /// No token frame arrived within the handshake bound.
    TimedOut,
    Rejected,
    MissingIdentity,
    BadIdentity,
    /// The registry dropped the channel after a failed write.
    Evicted,
    Failed(HandshakeError),
}

impl ConnectionEnd {
    /// Close code the relay sends for this outcome; `None` means the peer is
    /// already gone and no close frame is written.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            ConnectionEnd::Disconnected => None,
            ConnectionEnd::MissingIdentity => Some(close_code::NORMAL),
            ConnectionEnd::BadIdentity => Some(close_code::UNSUPPORTED),
            ConnectionEnd::Rejected | ConnectionEnd::TimedOut => Some(close_code::POLICY),
            ConnectionEnd::Evicted | ConnectionEnd::Failed(_) => Some(close_code::ERROR),
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ConnectionEnd::Disconnected | ConnectionEnd::MissingIdentity => "",
            ConnectionEnd::TimedOut => "handshake timeout",
            ConnectionEnd::Rejected => "authentication failed",
            ConnectionEnd::BadIdentity => "invalid user id",
            ConnectionEnd::Evicted => "delivery backlog",
            ConnectionEnd::Failed(_) => "internal error",
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            ConnectionEnd::Disconnected => "disconnected",
            ConnectionEnd::TimedOut => "timeout",
            ConnectionEnd::Rejected => "rejected",
            ConnectionEnd::MissingIdentity => "missing_identity",
            ConnectionEnd::BadIdentity => "bad_identity",
            ConnectionEnd::Evicted => "evicted",
            ConnectionEnd::Failed(HandshakeError::InvalidPayload(_)) => "invalid_payload",
            ConnectionEnd::Failed(HandshakeError::AuthUnreachable(_)) => "auth_unreachable",
        }
    }
}

/// Splits an auth outcome into the registered user id or the reason to close.
fn authenticated(outcome: AuthOutcome) -> Result<UserId, ConnectionEnd> {
    match outcome {
        AuthOutcome::Success(user_id) => Ok(user_id),
        AuthOutcome::Rejected => Err(ConnectionEnd::Rejected),
        AuthOutcome::MissingIdentity => Err(ConnectionEnd::MissingIdentity),
        AuthOutcome::BadIdentity => Err(ConnectionEnd::BadIdentity),
        AuthOutcome::Unreachable(reason) => Err(ConnectionEnd::Failed(
            HandshakeError::AuthUnreachable(reason),
        )),
    }
}

/// GET /ws?cid=<connection id>
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state, query.cid))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, connection_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    transition(&connection_id, HandshakeState::Accepted);

    let end = run_connection(&state, &connection_id, &mut ws_tx, &mut ws_rx).await;

    counter!(
        "beach_beacon_connections_closed_total",
        1,
        "reason" => end.metric_label()
    );
    match &end {
        ConnectionEnd::Failed(err) => {
            warn!(connection_id = %connection_id, error = %err, "connection failed")
        }
        other => debug!(connection_id = %connection_id, end = ?other, "connection ended"),
    }

    send_close(&mut ws_tx, &end).await;
    transition(&connection_id, HandshakeState::Closed);
}

async fn run_connection(
    state: &AppState,
    connection_id: &str,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
) -> ConnectionEnd {
    let started = Instant::now();

    transition(connection_id, HandshakeState::AwaitingToken);
    let token = match await_token(state.handshake_timeout, ws_rx).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            debug!(connection_id, "token frame carried no token");
            record_handshake(&ConnectionEnd::Rejected, started);
            return ConnectionEnd::Rejected;
        }
        Err(end) => {
            record_handshake(&end, started);
            return end;
        }
    };

    transition(connection_id, HandshakeState::Authenticating);
    let user_id = match authenticated(state.auth.authenticate(connection_id, &token).await) {
        Ok(user_id) => user_id,
        Err(end) => {
            record_handshake(&end, started);
            return end;
        }
    };
    counter!("beach_beacon_handshakes_total", 1, "outcome" => "registered");
    histogram!(
        "beach_beacon_handshake_duration_ms",
        started.elapsed().as_secs_f64() * 1000.0
    );

    transition(connection_id, HandshakeState::Registered);
    let (channel, mut outbound) = state.registry.open_channel();
    let channel_id = channel.id();
    state.registry.register(user_id, channel);
    info!(
        connection_id,
        user_id,
        channel_id = %channel_id,
        "channel registered"
    );

    transition(connection_id, HandshakeState::Relaying);
    let end = relay(user_id, ws_tx, ws_rx, &mut outbound).await;

    state.registry.unregister(user_id, channel_id);
    info!(
        connection_id,
        user_id,
        channel_id = %channel_id,
        "channel unregistered"
    );
    end
}

async fn await_token(
    limit: Option<Duration>,
    ws_rx: &mut WsStream,
) -> Result<Option<String>, ConnectionEnd> {
    match limit {
        Some(limit) => timeout(limit, read_token_frame(ws_rx))
            .await
            .map_err(|_| ConnectionEnd::TimedOut)?,
        None => read_token_frame(ws_rx).await,
    }
}

/// Waits for the first data frame and pulls a string `token` out of it.
/// `Ok(None)` means the frame was a JSON object without a usable token.
async fn read_token_frame(ws_rx: &mut WsStream) -> Result<Option<String>, ConnectionEnd> {
    while let Some(frame) = ws_rx.next().await {
        let payload = match frame {
            Ok(Message::Text(text)) => parse_json(text.as_bytes())?,
            Ok(Message::Binary(bytes)) => parse_json(&bytes)?,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return Err(ConnectionEnd::Disconnected),
            Err(err) => {
                debug!(error = %err, "socket error while awaiting token");
                return Err(ConnectionEnd::Disconnected);
            }
        };
        return token_from(payload);
    }
    Err(ConnectionEnd::Disconnected)
}

fn token_from(payload: Value) -> Result<Option<String>, ConnectionEnd> {
    let Value::Object(mut fields) = payload else {
        return Err(ConnectionEnd::Failed(HandshakeError::InvalidPayload(
            "token frame must be a JSON object".into(),
        )));
    };
    Ok(match fields.remove("token") {
        Some(Value::String(token)) => Some(token),
        _ => None,
    })
}

/// Post-registration loop: inbound frames are checked and dropped, queued
/// notifications are written out.
async fn relay(
    user_id: UserId,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
    outbound: &mut mpsc::Receiver<Message>,
) -> ConnectionEnd {
    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(end) = parse_json(text.as_bytes()) {
                        return end;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if let Err(end) = parse_json(&bytes) {
                        return end;
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Disconnected,
                Some(Err(err)) => {
                    debug!(user_id, error = %err, "socket error while relaying");
                    return ConnectionEnd::Disconnected;
                }
            },
            queued = outbound.recv() => match queued {
                Some(frame) => {
                    if let Err(err) = ws_tx.send(frame).await {
                        debug!(user_id, error = %err, "failed to write notification");
                        return ConnectionEnd::Disconnected;
                    }
                }
                None => return ConnectionEnd::Evicted,
            },
        }
    }
}

fn parse_json(bytes: &[u8]) -> Result<Value, ConnectionEnd> {
    serde_json::from_slice(bytes)
        .map_err(|err| ConnectionEnd::Failed(HandshakeError::InvalidPayload(err.to_string())))
}

async fn send_close(ws_tx: &mut WsSink, end: &ConnectionEnd) {
    let Some(code) = end.close_code() else {
        return;
    };
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(end.reason()),
    };
    if let Err(err) = ws_tx.send(Message::Close(Some(frame))).await {
        debug!(error = %err, code, "failed to send close frame");
    }
}

fn record_handshake(end: &ConnectionEnd, started: Instant) {
    counter!("beach_beacon_handshakes_total", 1, "outcome" => end.metric_label());
    histogram!(
        "beach_beacon_handshake_duration_ms",
        started.elapsed().as_secs_f64() * 1000.0
    );
}

fn transition(connection_id: &str, next: HandshakeState) {
    debug!(connection_id, state = ?next, "connection state");
}
