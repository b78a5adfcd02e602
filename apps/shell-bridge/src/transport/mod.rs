//! Duplex text channel to the shell host.
//!
//! A [`Connector`] opens a [`Connection`]; the connection owns the socket and exposes
//! send plus single-slot `on_message` / `on_error` / `on_close` registration. The transport
//! never retries; reconnect policy belongs to the session controller.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

pub mod mock;
pub mod websocket;

pub use websocket::WebSocketConnector;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("connecting to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error("connection is not open")]
    SendRejected,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolves once the channel reports open.
    async fn connect(&self, endpoint: &Url) -> Result<Connection, TransportError>;
}

/// Events produced by a socket pump.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(String),
    Error(String),
    Closed,
}

type MessageHandler = Box<dyn FnMut(String) + Send>;
type ErrorHandler = Box<dyn FnMut(String) + Send>;
type CloseHandler = Box<dyn FnMut() + Send>;

/// Handler slots plus, per kind, the events that arrived before that kind's handler existed.
#[derive(Default)]
struct Handlers {
    message: Option<MessageHandler>,
    error: Option<ErrorHandler>,
    close: Option<CloseHandler>,
    pending_messages: VecDeque<String>,
    pending_errors: VecDeque<String>,
    close_pending: bool,
    close_fired: bool,
    explicit_close: bool,
}

impl Handlers {
    fn dispatch(&mut self, event: Inbound) {
        match event {
            Inbound::Message(text) => self.pending_messages.push_back(text),
            Inbound::Error(reason) => {
                if !self.explicit_close {
                    self.pending_errors.push_back(reason);
                }
            }
            Inbound::Closed => self.close_pending = true,
        }
        self.flush();
    }

    /// Each kind drains independently, so a close is never held back by undelivered
    /// messages or errors.
    fn flush(&mut self) {
        if let Some(handler) = self.message.as_mut() {
            while let Some(text) = self.pending_messages.pop_front() {
                handler(text);
            }
        }
        if let Some(handler) = self.error.as_mut() {
            while let Some(reason) = self.pending_errors.pop_front() {
                handler(reason);
            }
        }
        if !self.close_pending || self.close_fired || self.explicit_close {
            return;
        }
        if let Some(handler) = self.close.as_mut() {
            self.close_pending = false;
            self.close_fired = true;
            handler();
        }
    }
}

pub struct Connection {
    endpoint: Url,
    outbound: Option<mpsc::UnboundedSender<String>>,
    open: Arc<AtomicBool>,
    handlers: Arc<Mutex<Handlers>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Wraps a pump: `outbound` feeds the socket writer, `inbound` carries what the
    /// reader saw. `tasks` are aborted when the connection is dropped.
    pub(crate) fn from_channels(
        endpoint: Url,
        outbound: mpsc::UnboundedSender<String>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        let open = Arc::new(AtomicBool::new(true));
        let handlers = Arc::new(Mutex::new(Handlers::default()));

        let pump_open = Arc::clone(&open);
        let pump_handlers = Arc::clone(&handlers);
        let pump_endpoint = endpoint.to_string();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let closing = matches!(event, Inbound::Closed);
                if closing {
                    pump_open.store(false, Ordering::SeqCst);
                }
                pump_handlers.lock().dispatch(event);
                if closing {
                    return;
                }
            }
            trace!(target = "transport", endpoint = %pump_endpoint, "reader ended without close");
            pump_open.store(false, Ordering::SeqCst);
            pump_handlers.lock().dispatch(Inbound::Closed);
        }));

        Self {
            endpoint,
            outbound: Some(outbound),
            open,
            handlers,
            tasks,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queues one frame for the writer. Frames keep submission order.
    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        let Some(outbound) = self.outbound.as_ref().filter(|_| self.is_open()) else {
            warn!(
                target = "transport",
                endpoint = %self.endpoint,
                bytes = frame.len(),
                "send on closed connection dropped"
            );
            return Err(TransportError::SendRejected);
        };
        if outbound.send(frame).is_err() {
            self.open.store(false, Ordering::SeqCst);
            warn!(target = "transport", endpoint = %self.endpoint, "writer gone; frame dropped");
            return Err(TransportError::SendRejected);
        }
        Ok(())
    }

    /// Replaces the message handler. Must not call back into this connection.
    pub fn on_message<F>(&self, handler: F)
    where
        F: FnMut(String) + Send + 'static,
    {
        let mut handlers = self.handlers.lock();
        handlers.message = Some(Box::new(handler));
        handlers.flush();
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: FnMut(String) + Send + 'static,
    {
        let mut handlers = self.handlers.lock();
        handlers.error = Some(Box::new(handler));
        handlers.flush();
    }

    /// Fires at most once, and only for closures this side did not request.
    pub fn on_close<F>(&self, handler: F)
    where
        F: FnMut() + Send + 'static,
    {
        let mut handlers = self.handlers.lock();
        handlers.close = Some(Box::new(handler));
        handlers.flush();
    }

    /// Explicit shutdown; `on_close` will not fire for it.
    pub fn close(&mut self) {
        {
            let mut handlers = self.handlers.lock();
            handlers.explicit_close = true;
            handlers.pending_errors.clear();
            handlers.close_pending = false;
        }
        self.open.store(false, Ordering::SeqCst);
        if self.outbound.take().is_some() {
            debug!(target = "transport", endpoint = %self.endpoint, "closing connection");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint.as_str())
            .field("open", &self.is_open())
            .finish()
    }
}
