//! HTTP and WebSocket handlers

use axum::{
    Json,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{Value, json};
use sha1::Sha1;

use crate::SESSION_HEADER;
use crate::state::{SharedState, UploadRecord};

/// Successful envelope, `result` omitted when null
fn success(result: Value) -> Response {
    let body = if result.is_null() {
        json!({ "success": true })
    } else {
        json!({ "success": true, "result": result })
    };
    Json(body).into_response()
}

fn failure(status: StatusCode, error_code: &str, msg: &str) -> Response {
    let body = json!({ "success": false, "error_code": error_code, "msg": msg });
    (status, Json(body)).into_response()
}

fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

async fn require_session(state: &SharedState, headers: &HeaderMap) -> Result<(), Response> {
    let token = session_token(headers).unwrap_or_default();
    if state.read().await.is_session(token) {
        Ok(())
    } else {
        Err(failure(StatusCode::FORBIDDEN, "auth_required", "Invalid session token"))
    }
}

/// Hex HMAC-SHA1 of `challenge` keyed by `app_token`
pub fn expected_password(app_token: &str, challenge: &str) -> String {
    let mut mac = match Hmac::<Sha1>::new_from_slice(app_token.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// API discovery document
pub async fn api_version_handler() -> impl IntoResponse {
    Json(json!({
        "api_base_url": "/api/",
        "api_version": "8.0",
        "device_name": "boxlink-mock",
        "device_type": "mock",
        "uid": "00000000000000000000000000000000",
        "https_available": false
    }))
}

#[derive(Deserialize)]
pub struct AuthorizeBody {
    app_id: String,
    app_name: String,
    #[serde(default)]
    device_name: String,
}

pub async fn authorize_handler(
    State(state): State<SharedState>,
    Json(body): Json<AuthorizeBody>,
) -> Response {
    if body.app_id.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "invalid_request", "app_id is required");
    }

    let mut s = state.write().await;
    s.observations.authorize_requests += 1;
    tracing::info!(app_id = %body.app_id, app_name = %body.app_name, device = %body.device_name, "Pairing requested");

    success(json!({
        "app_token": s.script.app_token,
        "track_id": s.script.track_id,
    }))
}

pub async fn authorize_status_handler(
    State(state): State<SharedState>,
    Path(track_id): Path<i64>,
) -> Response {
    let mut s = state.write().await;
    if track_id != s.script.track_id {
        return failure(StatusCode::NOT_FOUND, "noent", "Unknown track id");
    }

    let status = s.next_authorize_status();
    tracing::debug!(track_id, %status, "Pairing polled");
    success(json!({ "status": status, "challenge": s.challenge }))
}

pub async fn login_challenge_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    let s = state.read().await;
    let logged_in = session_token(&headers).is_some_and(|t| s.is_session(t));
    success(json!({
        "logged_in": logged_in,
        "challenge": s.challenge,
        "password_salt": "",
        "password_set": true,
    }))
}

#[derive(Deserialize)]
pub struct SessionBody {
    app_id: String,
    password: String,
}

pub async fn open_session_handler(
    State(state): State<SharedState>,
    Json(body): Json<SessionBody>,
) -> Response {
    let mut s = state.write().await;
    let expected = expected_password(&s.script.app_token, &s.challenge);

    if body.password != expected {
        s.observations.failed_logins += 1;
        tracing::warn!(app_id = %body.app_id, "Login with a wrong password");
        return failure(StatusCode::FORBIDDEN, "invalid_token", "Wrong password");
    }

    let challenge = s.challenge.clone();
    let token = s.open_session();
    tracing::info!(app_id = %body.app_id, "Session opened");

    success(json!({
        "session_token": token,
        "challenge": challenge,
        "permissions": s.script.permissions,
    }))
}

pub async fn logout_handler(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_session(&state, &headers).await {
        return resp;
    }

    let mut s = state.write().await;
    if let Some(token) = session_token(&headers) {
        s.sessions.remove(token);
    }
    s.observations.logouts += 1;
    success(Value::Null)
}

/// A session-scoped read
pub async fn system_handler(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_session(&state, &headers).await {
        return resp;
    }

    success(json!({
        "firmware_version": "4.8.0",
        "board_name": "mock",
        "uptime_val": 3600,
    }))
}

/// A session-scoped delete; only id 1 exists
pub async fn delete_download_handler(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_session(&state, &headers).await {
        return resp;
    }

    if id == 1 {
        success(Value::Null)
    } else {
        failure(StatusCode::NOT_FOUND, "noent", "No such download")
    }
}

/// Event socket upgrade
pub async fn ws_event_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_socket_session(&state, &headers).await {
        return resp;
    }
    ws.on_upgrade(|socket| handle_event_socket(socket, state))
}

/// Upload socket upgrade
pub async fn ws_upload_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_socket_session(&state, &headers).await {
        return resp;
    }
    ws.on_upgrade(|socket| handle_upload_socket(socket, state))
}

async fn require_socket_session(state: &SharedState, headers: &HeaderMap) -> Result<(), Response> {
    let result = require_session(state, headers).await;
    if result.is_err() {
        state.write().await.observations.rejected_sockets += 1;
        tracing::warn!("WebSocket upgrade without a valid session");
    }
    result
}

async fn send_json(socket: &mut WebSocket, value: Value) -> bool {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .is_ok()
}

fn reply(frame: &Value, action: &str, result: Value) -> Value {
    let mut reply = json!({
        "request_id": frame["request_id"],
        "action": action,
        "success": true,
    });
    if !result.is_null() {
        reply["result"] = result;
    }
    reply
}

fn reply_error(frame: &Value, action: &str, error_code: &str, msg: &str) -> Value {
    json!({
        "request_id": frame["request_id"],
        "action": action,
        "success": false,
        "error_code": error_code,
        "msg": msg,
    })
}

/// Record a text frame's action, or a close frame's code
async fn observe(state: &SharedState, msg: &Message) -> Option<Value> {
    match msg {
        Message::Text(text) => {
            let frame: Value = serde_json::from_str(text.as_str()).ok()?;
            let action = frame["action"].as_str().unwrap_or_default().to_string();
            state.write().await.observations.socket_actions.push(action);
            Some(frame)
        }
        Message::Close(frame) => {
            // A close without a payload counts as 1005, no status received
            let code = frame.as_ref().map(|f| f.code).unwrap_or(1005);
            tracing::info!(code, "Client closed the socket");
            state.write().await.observations.close_codes.push(code);
            None
        }
        _ => None,
    }
}

async fn handle_event_socket(mut socket: WebSocket, state: SharedState) {
    tracing::info!("Event socket opened");

    // Keep reading after a close frame so the reply gets flushed
    while let Some(Ok(msg)) = socket.recv().await {
        let Some(frame) = observe(&state, &msg).await else {
            continue;
        };

        if frame["action"] != "register" {
            let resp = reply_error(&frame, frame["action"].as_str().unwrap_or_default(), "invalid_request", "Unsupported action");
            if !send_json(&mut socket, resp).await {
                break;
            }
            continue;
        }

        let events: Vec<String> = serde_json::from_value(frame["events"].clone()).unwrap_or_default();
        let (register_error, without_id, scripted) = {
            let mut s = state.write().await;
            s.observations.registrations.push(events);
            (
                s.script.register_error.clone(),
                s.script.register_reply_without_id,
                s.script.events.clone(),
            )
        };

        if let Some(code) = register_error {
            if !send_json(&mut socket, reply_error(&frame, "register", &code, "Registration refused")).await {
                break;
            }
            continue;
        }

        let mut registered = reply(&frame, "register", Value::Null);
        if without_id {
            if let Some(fields) = registered.as_object_mut() {
                fields.remove("request_id");
            }
        }
        if !send_json(&mut socket, registered).await {
            break;
        }

        for event in scripted {
            let note = json!({
                "action": "notification",
                "success": true,
                "source": event.source,
                "event": event.event,
                "result": event.result,
            });
            if !send_json(&mut socket, note).await {
                break;
            }
        }
    }

    tracing::info!("Event socket closed");
}

/// Per-connection upload progress
#[derive(Default)]
struct UploadSession {
    request_id: Option<i64>,
    size: u64,
    total_len: u64,
    chunks: u32,
}

async fn handle_upload_socket(mut socket: WebSocket, state: SharedState) {
    tracing::info!("Upload socket opened");
    let mut upload = UploadSession::default();

    while let Some(Ok(msg)) = socket.recv().await {
        let resp = match msg {
            Message::Binary(data) => handle_chunk(&state, &mut upload, &data).await,
            msg => match observe(&state, &msg).await {
                Some(frame) => handle_upload_command(&state, &mut upload, &frame).await,
                None => continue,
            },
        };

        if !send_json(&mut socket, resp).await {
            break;
        }
    }

    tracing::info!("Upload socket closed");
}

async fn handle_upload_command(state: &SharedState, upload: &mut UploadSession, frame: &Value) -> Value {
    let action = frame["action"].as_str().unwrap_or_default();
    let request_id = frame["request_id"].as_i64().unwrap_or_default();
    let mut s = state.write().await;

    match action {
        "upload_start" => {
            if let Some(code) = s.script.upload_start_error.clone() {
                return reply_error(frame, action, &code, "Upload refused");
            }

            let dirname = frame["dirname"]
                .as_str()
                .and_then(|d| base64::engine::general_purpose::STANDARD.decode(d).ok())
                .and_then(|d| String::from_utf8(d).ok());
            let Some(dirname) = dirname else {
                return reply_error(frame, action, "invalid_request", "dirname is not base64");
            };

            let record = UploadRecord {
                request_id,
                dirname,
                filename: frame["filename"].as_str().unwrap_or_default().to_string(),
                size: frame["size"].as_u64().unwrap_or_default(),
                ..UploadRecord::default()
            };
            tracing::info!(request_id, dirname = %record.dirname, filename = %record.filename, size = record.size, "Upload started");

            *upload = UploadSession {
                request_id: Some(request_id),
                size: record.size,
                ..UploadSession::default()
            };
            s.observations.uploads.push(record);
            reply(frame, action, Value::Null)
        }
        "upload_finalize" | "upload_cancel" => {
            let Some(record) = s.upload_mut(request_id) else {
                return reply_error(frame, action, "noent", "Unknown upload");
            };
            if action == "upload_finalize" {
                record.finalized = true;
            } else {
                record.cancelled = true;
            }
            upload.request_id = None;
            reply(frame, action, Value::Null)
        }
        _ => reply_error(frame, action, "invalid_request", "Unsupported action"),
    }
}

async fn handle_chunk(state: &SharedState, upload: &mut UploadSession, data: &[u8]) -> Value {
    let Some(request_id) = upload.request_id else {
        return json!({
            "action": "upload_data",
            "success": false,
            "error_code": "invalid_request",
            "msg": "No upload in progress",
        });
    };

    let mut s = state.write().await;
    let mut accepted = data.len();
    if upload.chunks == 0 {
        if let Some(short) = s.script.short_ack {
            accepted = accepted.saturating_sub(short);
        }
    }
    upload.chunks += 1;
    upload.total_len += accepted as u64;

    let cancelled = s.script.cancel_after.is_some_and(|limit| upload.total_len >= limit);
    let total_len = upload.total_len;
    if let Some(record) = s.upload_mut(request_id) {
        record.data.extend_from_slice(&data[..accepted]);
        record.cancelled |= cancelled;
    }

    json!({
        "request_id": request_id,
        "action": "upload_data",
        "success": true,
        "result": {
            "total_len": total_len,
            "complete": total_len == upload.size,
            "cancelled": cancelled,
        },
    })
}
