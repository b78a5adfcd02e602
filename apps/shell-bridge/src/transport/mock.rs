//! In-process connector whose far end is driven by the caller.

use super::{Connection, Connector, Inbound, TransportError};
use crate::protocol::{self, DecodeError, Frame};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use url::Url;

#[derive(Debug, Clone)]
pub enum MockOutcome {
    Accept,
    Refuse(String),
    /// Never resolves; used to exercise connect timeouts.
    Hang,
}

/// Connector that follows a script of outcomes and defaults to accepting.
pub struct MockConnector {
    script: Mutex<VecDeque<MockOutcome>>,
    peers: mpsc::UnboundedSender<MockPeer>,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            peers,
            attempts: AtomicUsize::new(0),
        });
        (connector, peer_rx)
    }

    pub fn push(&self, outcome: MockOutcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(MockOutcome::Accept);
        match outcome {
            MockOutcome::Accept => {}
            MockOutcome::Refuse(reason) => {
                return Err(TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    reason,
                });
            }
            MockOutcome::Hang => return std::future::pending().await,
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peer = MockPeer {
            received: outbound_rx,
            inbound: Some(inbound_tx),
        };
        if self.peers.send(peer).is_err() {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: "mock peer receiver dropped".to_string(),
            });
        }
        Ok(Connection::from_channels(
            endpoint.clone(),
            outbound_tx,
            inbound_rx,
            Vec::new(),
        ))
    }
}

/// The host side of a mock connection.
pub struct MockPeer {
    received: mpsc::UnboundedReceiver<String>,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
}

impl MockPeer {
    pub fn send_raw(&self, raw: impl Into<String>) {
        self.push(Inbound::Message(raw.into()));
    }

    pub fn send_frame(&self, frame: &Frame) {
        self.send_raw(protocol::encode(frame));
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.push(Inbound::Error(reason.into()));
    }

    /// Simulates the host going away.
    pub fn close(&mut self) {
        self.push(Inbound::Closed);
        self.inbound = None;
    }

    /// Next frame text the client wrote, or `None` once the client closed its side.
    pub async fn recv_raw(&mut self) -> Option<String> {
        self.received.recv().await
    }

    pub async fn recv_frame(&mut self) -> Option<Result<Frame, DecodeError>> {
        self.recv_raw().await.map(|raw| protocol::decode(&raw))
    }

    pub fn try_recv_raw(&mut self) -> Option<String> {
        self.received.try_recv().ok()
    }

    fn push(&self, event: Inbound) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(event);
        }
    }
}
