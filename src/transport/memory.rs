//! In-process [`Connector`] whose remote end is driven by the caller.
//!
//! Every successful `connect` hands a [`RemotePeer`] to whoever holds the
//! receiver returned by [`MemoryConnector::new`].  The peer sees the
//! original [`ConnectRequest`] and can read client frames, reply, or drop
//! itself to simulate a lost connection.  Failures can be queued with
//! [`MemoryConnector::fail_next`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ConnectRequest, Connector, Duplex, Frame, TransportError};

/// The remote half of an in-memory connection.
#[derive(Debug)]
pub struct RemotePeer {
    pub request: ConnectRequest,
    /// Frames the client sent.
    pub from_client: mpsc::UnboundedReceiver<Frame>,
    /// Frames delivered to the client.
    pub to_client: mpsc::UnboundedSender<Frame>,
}

impl RemotePeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Frame::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.to_client.send(Frame::json(&value)).is_ok()
    }

    pub fn send_binary(&self, data: Vec<u8>) -> bool {
        self.to_client.send(Frame::Binary(data)).is_ok()
    }

    /// Next frame from the client, `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Next text frame parsed as JSON, skipping binary frames.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        while let Some(frame) = self.from_client.recv().await {
            match frame {
                Frame::Text(text) => {
                    if let Ok(value) = serde_json::from_str(&text) {
                        return Some(value);
                    }
                }
                Frame::Binary(_) => continue,
                Frame::Close => return None,
            }
        }
        None
    }
}

#[derive(Default)]
struct Shared {
    failures: VecDeque<TransportError>,
    attempts: u32,
}

/// See the module docs.
#[derive(Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<RemotePeer>,
    shared: Arc<Mutex<Shared>>,
}

impl MemoryConnector {
    /// Create a connector and the receiver on which new peers arrive.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemotePeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: tx,
                shared: Arc::new(Mutex::new(Shared::default())),
            },
            rx,
        )
    }

    /// Make the next `connect` call fail with `err`.  Calls stack.
    pub fn fail_next(&self, err: TransportError) {
        self.shared.lock().unwrap().failures.push_back(err);
    }

    /// Number of `connect` calls so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.shared.lock().unwrap().attempts
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Duplex, TransportError> {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.attempts += 1;
            if let Some(err) = shared.failures.pop_front() {
                return Err(err);
            }
        }

        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let peer = RemotePeer {
            request,
            from_client,
            to_client,
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connection("no listener for in-memory peer".into()))?;

        Ok(Duplex {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
