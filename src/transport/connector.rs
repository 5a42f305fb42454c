//! Websocket [`Connector`] backed by `tokio-tungstenite`.
//!
//! After the handshake the socket is split and a pump task forwards frames
//! between the socket halves and the [`Duplex`] channels.  The pump exits
//! when either side goes away; dropping the inbound sender is how the owner
//! learns the connection was lost.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;

use super::{ConnectRequest, Connector, Duplex, Frame, TransportError};

/// Real websocket connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Map a handshake failure onto the transport taxonomy.
fn classify(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                TransportError::Auth(format!("handshake rejected with HTTP {status}"))
            } else {
                TransportError::Connection(format!("handshake failed with HTTP {status}"))
            }
        }
        other => TransportError::Connection(other.to_string()),
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Duplex, TransportError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connection(format!("invalid url: {e}")))?;

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connection(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Connection(format!("invalid header value: {e}")))?;
            ws_request.headers_mut().insert(name, value);
        }

        log::debug!("transport: connecting to {}", request.redacted_url());
        let (ws_stream, _) = connect_async(ws_request).await.map_err(classify)?;
        log::debug!("transport: connected to {}", request.redacted_url());

        let (mut ws_sink, mut ws_source) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
        let label = request.redacted_url().to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => {
                        let message = match outbound {
                            Some(Frame::Text(text)) => Message::Text(text),
                            Some(Frame::Binary(data)) => Message::Binary(data),
                            Some(Frame::Close) | None => {
                                let _ = ws_sink.send(Message::Close(None)).await;
                                break;
                            }
                        };
                        if let Err(e) = ws_sink.send(message).await {
                            log::warn!("transport: send to {label} failed: {e}");
                            break;
                        }
                    }
                    inbound = ws_source.next() => {
                        let frame = match inbound {
                            Some(Ok(Message::Text(text))) => Frame::Text(text),
                            Some(Ok(Message::Binary(data))) => Frame::Binary(data),
                            Some(Ok(Message::Close(frame))) => {
                                log::debug!("transport: {label} closed by peer: {frame:?}");
                                let _ = in_tx.send(Frame::Close);
                                break;
                            }
                            // Ping/pong are answered by tungstenite itself.
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                log::warn!("transport: {label} read error: {e}");
                                break;
                            }
                            None => break,
                        };
                        if in_tx.send(frame).is_err() {
                            // Owner dropped the receiver.
                            let _ = ws_sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
            log::debug!("transport: pump for {label} finished");
        });

        Ok(Duplex {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
