//! Realtime channel over the device socket
//!
//! A [`Channel`] is one authenticated WebSocket connection. Replies are
//! matched to requests by `(request_id, action)`, never by arrival order:
//! a frame that does not match what the caller waits for is dropped, not
//! queued. Two requests in flight on one channel therefore need distinct
//! request ids, otherwise one wait can swallow the other's reply.

use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, Stream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::SessionHeader;
use crate::error::{Error, Result, ResultExt};
use crate::protocol::{Action, SocketEnvelope};

/// Type alias for the client side of the socket
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the peer to acknowledge our close frame
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket path for event subscriptions
pub const EVENT_PATH: &str = "ws/event";

/// Socket path for file uploads
pub const UPLOAD_PATH: &str = "ws/upload";

/// Fresh request id from a nanosecond clock
///
/// Uniqueness is likely, not guaranteed. Each subscription and upload owns
/// its connection, so ids only have to differ within one exchange.
pub fn next_request_id() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros())
}

/// Build the socket URL for an HTTP(S) API base URL
pub fn websocket_url(base_url: &str, path: &str) -> Result<String> {
    let (scheme, rest) = if let Some(rest) = base_url.strip_prefix("https://") {
        ("wss://", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        ("ws://", rest)
    } else {
        return Err(Error::InvalidEndpoint(base_url.to_string()));
    };

    Ok(format!(
        "{}{}/{}",
        scheme,
        rest.trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

/// Which reply a wait is looking for
///
/// A reply that carries no `request_id` matches on its action alone; the
/// device leaves the id out of some replies, `register` among them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    /// `None` matches any request id
    pub request_id: Option<i64>,
    pub action: Action,
}

impl Correlation {
    pub fn reply(request_id: i64, action: Action) -> Self {
        Self {
            request_id: Some(request_id),
            action,
        }
    }

    /// Match on the action alone
    pub fn action(action: Action) -> Self {
        Self {
            request_id: None,
            action,
        }
    }

    pub fn matches(&self, envelope: &SocketEnvelope) -> bool {
        if envelope.action != self.action.as_str() {
            return false;
        }
        match self.request_id {
            Some(id) => envelope.request_id.is_none_or(|got| got == id),
            None => true,
        }
    }
}

/// One authenticated socket connection
pub struct Channel {
    ws: WsStream,
    url: String,
}

impl Channel {
    /// Dial `url` with the session header attached
    pub async fn connect(url: &str, session: &SessionHeader) -> Result<Self> {
        debug!(url = %url, "Connecting to WebSocket");

        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert(session.name(), HeaderValue::from_str(session.value())?);

        let (ws, _) = connect_async(request).await.context("dial websocket")?;

        debug!(url = %url, "WebSocket connected");
        Ok(Self {
            ws,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one JSON text frame
    pub async fn send_json<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)?;
        debug!(url = %self.url, frame = %json, "Sending frame");
        self.ws.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Send one binary frame
    pub async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        debug!(url = %self.url, len = data.len(), "Sending binary frame");
        self.ws.send(Message::Binary(data.into())).await?;
        Ok(())
    }

    /// Read the next data frame and decode it as an envelope
    ///
    /// Control frames are skipped. A close frame or the end of the stream
    /// is reported as [`Error::ConnectionClosed`].
    pub async fn read_envelope(&mut self, cancel: &CancellationToken) -> Result<SocketEnvelope> {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                frame = self.ws.next() => frame,
            };

            let envelope = match frame {
                Some(Ok(Message::Text(text))) => serde_json::from_str(text.as_str())?,
                Some(Ok(Message::Binary(data))) => serde_json::from_slice(&data)?,
                Some(Ok(Message::Close(_))) | None => return Err(Error::ConnectionClosed),
                Some(Ok(_)) => continue, // ping, pong and raw frames
                Some(Err(WsError::ConnectionClosed)) => return Err(Error::ConnectionClosed),
                Some(Err(e)) => return Err(e.into()),
            };
            return Ok(envelope);
        }
    }

    /// Read frames until one matches `correlation`, then check its success flag
    pub async fn wait_for_envelope(
        &mut self,
        correlation: Correlation,
        cancel: &CancellationToken,
    ) -> Result<SocketEnvelope> {
        loop {
            let envelope = match self.read_envelope(cancel).await {
                Ok(envelope) => envelope,
                Err(Error::Decode(e)) => {
                    warn!(url = %self.url, error = %e, "Dropping undecodable frame");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if correlation.matches(&envelope) {
                return envelope.check();
            }

            debug!(
                action = %envelope.action,
                request_id = ?envelope.request_id,
                expected = ?correlation,
                "Dropping unrelated frame"
            );
        }
    }

    /// Wait for the reply matching `correlation` and decode its result as `T`
    pub async fn wait_for<T: DeserializeOwned>(
        &mut self,
        correlation: Correlation,
        cancel: &CancellationToken,
    ) -> Result<T> {
        self.wait_for_envelope(correlation, cancel)
            .await?
            .decode_result()
    }

    /// Send `message` and wait for its `(request_id, expected)` reply
    pub async fn send_and_wait_for<M, T>(
        &mut self,
        message: &M,
        request_id: i64,
        expected: Action,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        M: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(message).await?;
        self.wait_for(Correlation::reply(request_id, expected), cancel)
            .await
    }

    /// Lazily yield every frame carrying `action`, decoded as `T`
    ///
    /// Frames with another action are skipped. A matching frame that
    /// reports failure or does not decode yields an `Err` and the pump
    /// goes on. The stream ends for good once a read fails, the peer
    /// closes, or `cancel` fires.
    pub fn notifications<'a, T>(
        &'a mut self,
        action: Action,
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = Result<T>> + 'a
    where
        T: DeserializeOwned + 'a,
    {
        stream::unfold(self, move |channel| async move {
            loop {
                let envelope = match channel.read_envelope(cancel).await {
                    Ok(envelope) => envelope,
                    Err(Error::Decode(e)) => {
                        warn!(url = %channel.url, error = %e, "Dropping undecodable frame");
                        continue;
                    }
                    Err(e) => {
                        debug!(url = %channel.url, reason = %e, "Notification pump stopped");
                        return None;
                    }
                };

                if envelope.action != action.as_str() {
                    continue;
                }

                let item = envelope.check().and_then(|e| e.decode_result());
                return Some((item, channel));
            }
        })
        .fuse()
    }

    /// Send a normal-closure frame and wait for the peer to acknowledge it
    pub async fn close_handshake(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };

        match self.ws.send(Message::Close(Some(frame))).await {
            Ok(()) => {}
            // The peer closed first and tungstenite already answered it
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return Ok(()),
            // Close frame already received; flush the reply tungstenite queued
            Err(WsError::Protocol(ProtocolError::SendAfterClosing)) => {
                return match self.ws.flush().await {
                    Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
                    Err(e) => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        }

        match tokio::time::timeout(CLOSE_ACK_TIMEOUT, self.await_close_ack()).await {
            Ok(result) => result,
            Err(_) => Err(Error::CloseTimeout(CLOSE_ACK_TIMEOUT)),
        }
    }

    async fn await_close_ack(&mut self) -> Result<()> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) if frame.code != CloseCode::Normal => {
                    return Err(Error::AbnormalClose {
                        code: frame.code.into(),
                        reason: frame.reason.as_str().to_string(),
                    });
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Run the close handshake and release the connection
    pub async fn close(mut self) -> Result<()> {
        let result = self.close_handshake().await;
        debug!(url = %self.url, "WebSocket closed");
        drop(self.ws);
        result
    }
}
