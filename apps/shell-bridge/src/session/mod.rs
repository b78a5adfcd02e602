//! Session controller: owns the connection lifecycle of one shell session.
//!
//! Each session runs as a single tokio task. Commands arrive through a [`SessionHandle`],
//! transport callbacks and timers are funnelled into the same `select!` loop, so every
//! state transition happens in one place.

use crossterm::event::KeyEvent;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::protocol::{self, DecodeError, Frame};
use crate::scheduler::Scheduler;
use crate::surface::{ResizeOutcome, ScreenSnapshot, SurfaceOptions, TerminalSurface, Viewport};
use crate::transport::{Connection, Connector, TransportError};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const SGR_RED: &str = "\x1b[31m";
const SGR_GREEN: &str = "\x1b[32m";
const SGR_YELLOW: &str = "\x1b[33m";
const SGR_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Url,
    pub viewport: Viewport,
    /// Fixed delay before every reconnect attempt. There is no retry cap.
    pub reconnect_delay: Duration,
    /// Upper bound for transport open plus the `connected` acknowledgement.
    pub connect_timeout: Duration,
    pub surface: SurfaceOptions,
}

impl SessionConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            viewport: Viewport::DEFAULT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            surface: SurfaceOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub connection: ConnectionState,
    /// Assigned by the host on `connected`; kept across reconnects until replaced.
    pub session_id: Option<String>,
    pub viewport: Viewport,
    /// Reconnect cycles armed so far.
    pub reconnects: u32,
}

#[derive(Debug)]
enum Command {
    WriteToTerminal(String),
    UserInput(String),
    Key(KeyEvent),
    Paste(String),
    Resize { cols: u16, rows: u16 },
    Scroll(i32),
    ScrollToBottom,
    Dispose,
}

/// Command port into a running session. Every method returns immediately, also once the
/// session has closed.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    screen: watch::Receiver<ScreenSnapshot>,
}

impl SessionHandle {
    /// Text from a non-terminal producer, such as dictation. Sent as input only while the
    /// session is open; otherwise dropped.
    pub fn write_to_terminal(&self, text: impl Into<String>) {
        self.submit(Command::WriteToTerminal(text.into()));
    }

    pub fn user_input(&self, data: impl Into<String>) {
        self.submit(Command::UserInput(data.into()));
    }

    pub fn key(&self, key: KeyEvent) {
        self.submit(Command::Key(key));
    }

    pub fn paste(&self, text: impl Into<String>) {
        self.submit(Command::Paste(text.into()));
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.submit(Command::Resize { cols, rows });
    }

    pub fn scroll(&self, delta: i32) {
        self.submit(Command::Scroll(delta));
    }

    pub fn scroll_to_bottom(&self) {
        self.submit(Command::ScrollToBottom);
    }

    pub fn dispose(&self) {
        self.submit(Command::Dispose);
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn screen(&self) -> ScreenSnapshot {
        self.screen.borrow().clone()
    }

    pub fn subscribe_screen(&self) -> watch::Receiver<ScreenSnapshot> {
        self.screen.clone()
    }

    /// Waits until the published state satisfies `predicate`. Returns the last state if the
    /// session ends first.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> SessionState
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut state = self.state.clone();
        if let Ok(matched) = state.wait_for(|current| predicate(current)).await {
            return matched.clone();
        }
        let last = state.borrow().clone();
        last
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            trace!(target = "session", "command after session end ignored");
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

#[derive(Debug)]
struct LinkEvent {
    generation: u64,
    kind: LinkEventKind,
}

#[derive(Debug)]
enum LinkEventKind {
    Message(String),
    Error(String),
    Closed,
}

#[derive(Debug)]
enum SurfaceEvent {
    Input(String),
    Resize(Viewport),
}

enum Step {
    Command(Option<Command>),
    Link(LinkEvent),
    Connected(Result<Connection, TransportError>),
    ConnectTimedOut,
    ReconnectDue,
    ResizeDue,
}

pub struct SessionController {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
    surface: TerminalSurface,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    screen_tx: watch::Sender<ScreenSnapshot>,
    screen_dirty: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    surface_rx: mpsc::UnboundedReceiver<SurfaceEvent>,
    connection: Option<Connection>,
    /// Bumped whenever a connection is abandoned; events tagged with an older value are stale.
    generation: u64,
    connecting: Option<BoxFuture<'static, Result<Connection, TransportError>>>,
    connect_deadline: Option<BoxFuture<'static, ()>>,
    reconnect: Option<BoxFuture<'static, ()>>,
    resize_timer: Option<BoxFuture<'static, ()>>,
    last_error: Option<String>,
    opened_before: bool,
}

impl SessionController {
    /// Starts the session task. The session leaves `Idle` right away and closes when
    /// disposed or when every handle is dropped.
    pub fn spawn(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        scheduler: Arc<dyn Scheduler>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (surface_tx, surface_rx) = mpsc::unbounded_channel();

        let mut surface = TerminalSurface::new(config.viewport, config.surface);
        let input_tx = surface_tx.clone();
        surface.on_user_input(move |data| {
            let _ = input_tx.send(SurfaceEvent::Input(data));
        });
        surface.on_resize(move |viewport| {
            let _ = surface_tx.send(SurfaceEvent::Resize(viewport));
        });

        let state = SessionState {
            connection: ConnectionState::Idle,
            session_id: None,
            viewport: config.viewport,
            reconnects: 0,
        };
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (screen_tx, screen_rx) = watch::channel(surface.snapshot());

        let controller = SessionController {
            config,
            connector,
            scheduler,
            surface,
            state,
            state_tx,
            screen_tx,
            screen_dirty: false,
            commands: command_rx,
            link_tx,
            link_rx,
            surface_rx,
            connection: None,
            generation: 0,
            connecting: None,
            connect_deadline: None,
            reconnect: None,
            resize_timer: None,
            last_error: None,
            opened_before: false,
        };
        let task = tokio::spawn(controller.run());
        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
            screen: screen_rx,
        };
        (handle, task)
    }

    async fn run(mut self) {
        self.start_attempt();
        self.publish();
        while self.state.connection != ConnectionState::Closed {
            let step = self.next_step().await;
            self.apply(step);
            self.publish();
        }
        debug!(target = "session", endpoint = %self.config.endpoint, "session task finished");
    }

    async fn next_step(&mut self) -> Step {
        let Self {
            commands,
            link_rx,
            connecting,
            connect_deadline,
            reconnect,
            resize_timer,
            ..
        } = self;
        tokio::select! {
            command = commands.recv() => Step::Command(command),
            Some(event) = link_rx.recv() => Step::Link(event),
            result = poll_slot(connecting) => Step::Connected(result),
            _ = poll_slot(connect_deadline) => Step::ConnectTimedOut,
            _ = poll_slot(reconnect) => Step::ReconnectDue,
            _ = poll_slot(resize_timer) => Step::ResizeDue,
        }
    }

    fn apply(&mut self, step: Step) {
        match step {
            Step::Command(Some(command)) => self.handle_command(command),
            Step::Command(None) => {
                debug!(target = "session", "all handles dropped");
                self.dispose();
            }
            Step::Link(event) => self.handle_link_event(event),
            Step::Connected(result) => {
                self.connecting = None;
                match result {
                    Ok(connection) => self.attach(connection),
                    Err(err) => self.connection_lost(err.to_string()),
                }
            }
            Step::ConnectTimedOut => {
                self.connect_deadline = None;
                let err = TransportError::Timeout {
                    endpoint: self.config.endpoint.to_string(),
                    timeout: self.config.connect_timeout,
                };
                self.connection_lost(err.to_string());
            }
            Step::ReconnectDue => {
                self.reconnect = None;
                self.start_attempt();
            }
            Step::ResizeDue => {
                self.resize_timer = None;
                self.surface.flush_resize(self.scheduler.now());
                self.drain_surface_events();
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::WriteToTerminal(text) => {
                if self.state.connection == ConnectionState::Open {
                    if let Err(err) = self.send_frame(&Frame::input(text)) {
                        debug!(target = "session", error = %err, "write_to_terminal dropped");
                    }
                } else {
                    debug!(
                        target = "session",
                        state = %self.state.connection,
                        bytes = text.len(),
                        "write_to_terminal ignored while not open"
                    );
                }
            }
            Command::UserInput(data) => self.surface.user_input(&data),
            Command::Key(key) => self.surface.key(&key),
            Command::Paste(text) => self.surface.paste(&text),
            Command::Resize { cols, rows } => {
                match self.surface.resize(cols, rows, self.scheduler.now()) {
                    Ok(ResizeOutcome::Scheduled { deadline }) => {
                        self.resize_timer = Some(self.scheduler.sleep_until(deadline));
                    }
                    Ok(ResizeOutcome::Unchanged) => self.resize_timer = None,
                    Err(err) => warn!(target = "session", error = %err, "resize rejected"),
                }
                self.state.viewport = self.surface.viewport();
                self.screen_dirty = true;
            }
            Command::Scroll(delta) => {
                self.surface.scroll(delta);
                self.screen_dirty = true;
            }
            Command::ScrollToBottom => {
                self.surface.scroll_to_bottom();
                self.screen_dirty = true;
            }
            Command::Dispose => self.dispose(),
        }
        self.drain_surface_events();
    }

    fn drain_surface_events(&mut self) {
        while let Ok(event) = self.surface_rx.try_recv() {
            match event {
                SurfaceEvent::Input(data) => {
                    // Typing scrolls the view back to the live screen.
                    self.screen_dirty = true;
                    self.forward_input(data);
                }
                SurfaceEvent::Resize(viewport) => {
                    if self.state.connection != ConnectionState::Open {
                        trace!(target = "session", %viewport, "resize held until open");
                        continue;
                    }
                    let frame = Frame::Resize {
                        cols: viewport.cols(),
                        rows: viewport.rows(),
                    };
                    if let Err(err) = self.send_frame(&frame) {
                        debug!(target = "session", error = %err, "resize frame dropped");
                    }
                }
            }
        }
    }

    fn forward_input(&mut self, data: String) {
        if self.state.connection != ConnectionState::Open {
            debug!(
                target = "session",
                state = %self.state.connection,
                bytes = data.len(),
                "input dropped while not open"
            );
            return;
        }
        if let Err(err) = self.send_frame(&Frame::input(data)) {
            warn!(target = "session", error = %err, "keystroke input lost");
            self.status_line(SGR_RED, &format!("[input lost: {err}]"));
        }
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let connection = self.connection.as_ref().ok_or(TransportError::SendRejected)?;
        trace!(target = "session", kind = %frame.kind(), "send frame");
        connection.send(protocol::encode(frame))
    }

    fn start_attempt(&mut self) {
        if self.state.connection == ConnectionState::Closed {
            return;
        }
        self.generation += 1;
        if self.state.connection == ConnectionState::Idle {
            self.set_connection(ConnectionState::Connecting);
            let endpoint = self.config.endpoint.to_string();
            self.status_line(SGR_YELLOW, &format!("Connecting to {endpoint}..."));
        }
        debug!(
            target = "session",
            endpoint = %self.config.endpoint,
            generation = self.generation,
            "connection attempt"
        );
        let connector = Arc::clone(&self.connector);
        let endpoint = self.config.endpoint.clone();
        self.connecting = Some(Box::pin(async move { connector.connect(&endpoint).await }));
        self.connect_deadline = Some(self.scheduler.sleep(self.config.connect_timeout));
    }

    /// Transport is open; the session opens once the host acknowledges with `connected`.
    fn attach(&mut self, connection: Connection) {
        let generation = self.generation;
        let tx = self.link_tx.clone();
        connection.on_message(move |text| {
            let _ = tx.send(LinkEvent {
                generation,
                kind: LinkEventKind::Message(text),
            });
        });
        let tx = self.link_tx.clone();
        connection.on_error(move |reason| {
            let _ = tx.send(LinkEvent {
                generation,
                kind: LinkEventKind::Error(reason),
            });
        });
        let tx = self.link_tx.clone();
        connection.on_close(move || {
            let _ = tx.send(LinkEvent {
                generation,
                kind: LinkEventKind::Closed,
            });
        });
        debug!(target = "session", endpoint = %connection.endpoint(), generation, "transport open");
        self.connection = Some(connection);
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        if event.generation != self.generation {
            trace!(
                target = "session",
                generation = event.generation,
                current = self.generation,
                "stale connection event ignored"
            );
            return;
        }
        match event.kind {
            LinkEventKind::Message(raw) => match protocol::decode(&raw) {
                Ok(frame) => self.handle_frame(frame),
                Err(err) => log_decode_error(&err, &raw),
            },
            LinkEventKind::Error(reason) => {
                debug!(target = "session", %reason, "transport error");
                self.last_error = Some(reason);
            }
            LinkEventKind::Closed => {
                let reason = self
                    .last_error
                    .take()
                    .unwrap_or_else(|| "connection closed".to_string());
                self.connection_lost(reason);
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Output { data } => {
                self.surface.write(&data);
                self.screen_dirty = true;
            }
            Frame::Error { message } => {
                warn!(target = "session", %message, "host reported error");
                self.status_line(SGR_RED, &format!("Error: {message}"));
            }
            Frame::Connected { session_id } => {
                if self.state.connection == ConnectionState::Open {
                    debug!(target = "session", ?session_id, "repeated connected frame");
                    if session_id.is_some() {
                        self.state.session_id = session_id;
                    }
                } else {
                    self.enter_open(session_id);
                }
            }
            other => {
                debug!(
                    target = "session",
                    kind = %other.kind(),
                    "unexpected client-bound frame ignored"
                );
            }
        }
    }

    fn enter_open(&mut self, session_id: Option<String>) {
        self.connect_deadline = None;
        self.last_error = None;
        if session_id.is_some() {
            self.state.session_id = session_id;
        }
        self.set_connection(ConnectionState::Open);
        if self.opened_before {
            self.status_line(SGR_GREEN, "Reconnected.");
        } else {
            self.status_line(SGR_GREEN, "Connected.");
        }
        self.opened_before = true;
        info!(
            target = "session",
            endpoint = %self.config.endpoint,
            session_id = ?self.state.session_id,
            "session open"
        );
        self.surface.sync_viewport();
        self.drain_surface_events();
    }

    /// Abandons the current attempt or connection and arms the single reconnect timer.
    fn connection_lost(&mut self, reason: String) {
        if self.state.connection == ConnectionState::Closed {
            return;
        }
        self.abandon_connection();
        if self.reconnect.is_some() {
            trace!(target = "session", %reason, "reconnect already armed");
            return;
        }
        let delay = self.config.reconnect_delay;
        warn!(
            target = "session",
            endpoint = %self.config.endpoint,
            %reason,
            delay_ms = delay.as_millis() as u64,
            "connection lost; reconnect scheduled"
        );
        self.state.reconnects = self.state.reconnects.saturating_add(1);
        self.set_connection(ConnectionState::Reconnecting);
        self.status_line(
            SGR_YELLOW,
            &format!("Connection lost ({reason}). Reconnecting in {}...", format_delay(delay)),
        );
        self.reconnect = Some(self.scheduler.sleep(delay));
    }

    fn abandon_connection(&mut self) {
        self.generation += 1;
        self.connecting = None;
        self.connect_deadline = None;
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }

    fn dispose(&mut self) {
        if self.state.connection == ConnectionState::Closed {
            return;
        }
        self.abandon_connection();
        self.reconnect = None;
        self.resize_timer = None;
        self.status_line(SGR_YELLOW, "Session closed.");
        self.set_connection(ConnectionState::Closed);
        // Last frame stays visible to observers after the grid is released.
        self.screen_tx.send_replace(self.surface.snapshot());
        self.screen_dirty = false;
        self.surface.dispose();
        info!(target = "session", endpoint = %self.config.endpoint, "session closed");
    }

    fn set_connection(&mut self, next: ConnectionState) {
        let previous = self.state.connection;
        if previous == next || previous == ConnectionState::Closed {
            return;
        }
        debug!(target = "session", from = %previous, to = %next, "state transition");
        self.state.connection = next;
    }

    fn status_line(&mut self, color: &str, text: &str) {
        let at_line_start = self.surface.cursor_column().is_none_or(|col| col == 0);
        let prefix = if at_line_start { "" } else { "\r\n" };
        self.surface
            .write(&format!("{prefix}{color}{text}{SGR_RESET}\r\n"));
        self.screen_dirty = true;
    }

    fn publish(&mut self) {
        if *self.state_tx.borrow() != self.state {
            self.state_tx.send_replace(self.state.clone());
        }
        if self.screen_dirty && !self.surface.is_disposed() {
            self.screen_tx.send_replace(self.surface.snapshot());
        }
        self.screen_dirty = false;
    }
}

async fn poll_slot<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot.as_mut() {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

fn log_decode_error(err: &DecodeError, raw: &str) {
    let preview: String = raw.chars().take(64).collect();
    warn!(target = "session", error = %err, %preview, "dropping undecodable frame");
}

fn format_delay(delay: Duration) -> String {
    if delay.subsec_millis() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{}ms", delay.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use crate::surface::CellColor;
    use crate::transport::mock::{MockConnector, MockOutcome, MockPeer};
    use tokio::time::sleep;

    fn config() -> SessionConfig {
        SessionConfig {
            reconnect_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(2),
            ..SessionConfig::new(Url::parse("ws://127.0.0.1:3001/terminal").expect("url"))
        }
    }

    fn spawn(
        config: SessionConfig,
        connector: &Arc<MockConnector>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let connector: Arc<dyn Connector> = Arc::clone(connector) as Arc<dyn Connector>;
        SessionController::spawn(config, connector, Arc::new(TokioScheduler))
    }

    async fn wait_for(handle: &SessionHandle, target: ConnectionState) -> SessionState {
        handle.wait_for_state(|state| state.connection == target).await
    }

    async fn wait_for_text(handle: &SessionHandle, needle: &str) -> ScreenSnapshot {
        let mut screen = handle.subscribe_screen();
        let snapshot = screen
            .wait_for(|snapshot| snapshot.find(needle).is_some())
            .await
            .expect("session alive");
        snapshot.clone()
    }

    async fn open(handle: &SessionHandle, peer: &mut MockPeer, session_id: &str) {
        peer.send_frame(&Frame::Connected {
            session_id: Some(session_id.to_string()),
        });
        wait_for(handle, ConnectionState::Open).await;
        assert_eq!(
            peer.recv_frame().await.expect("frame").expect("decodes"),
            Frame::Resize { cols: 80, rows: 24 },
            "current viewport is announced on open"
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn opens_only_after_connected_frame() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, _task) = spawn(config(), &connector);

        let mut peer = peers.recv().await.expect("peer");
        sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state().connection, ConnectionState::Connecting);

        open(&handle, &mut peer, "abc-123").await;
        let state = handle.state();
        assert_eq!(state.session_id.as_deref(), Some("abc-123"));
        assert_eq!(state.reconnects, 0);
        wait_for_text(&handle, "Connected.").await;
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn output_frames_render_with_color() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, _task) = spawn(config(), &connector);
        let mut peer = peers.recv().await.expect("peer");
        open(&handle, &mut peer, "s1").await;

        peer.send_frame(&Frame::output("\r\n\x1b[32mTerminal connected!\x1b[0m\r\n"));
        let screen = wait_for_text(&handle, "Terminal connected!").await;
        let (row, col) = screen.find("Terminal connected!").expect("rendered");
        assert_eq!(screen.cell(row, col).map(|cell| cell.fg), Some(CellColor::GREEN));
        assert!(!screen.text().contains("\x1b[32m"));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn input_is_dropped_until_open() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, _task) = spawn(config(), &connector);
        let mut peer = peers.recv().await.expect("peer");

        handle.write_to_terminal("ls -la");
        handle.user_input("whoami\r");
        sleep(Duration::from_millis(50)).await;
        assert_eq!(peer.try_recv_raw(), None);
        assert_eq!(handle.state().connection, ConnectionState::Connecting);

        open(&handle, &mut peer, "s1").await;
        handle.write_to_terminal("pwd\r");
        handle.user_input("x");
        assert_eq!(
            peer.recv_frame().await.expect("frame").expect("decodes"),
            Frame::input("pwd\r")
        );
        assert_eq!(
            peer.recv_frame().await.expect("frame").expect("decodes"),
            Frame::input("x")
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn unexpected_close_reconnects_once() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, _task) = spawn(config(), &connector);
        let mut peer = peers.recv().await.expect("peer");
        open(&handle, &mut peer, "first").await;

        peer.fail("broken pipe");
        peer.close();
        let state = wait_for(&handle, ConnectionState::Reconnecting).await;
        assert_eq!(state.reconnects, 1);
        wait_for_text(&handle, "Connection lost (broken pipe)").await;

        let mut second = peers.recv().await.expect("second peer");
        assert_eq!(connector.attempts(), 2);
        open(&handle, &mut second, "second").await;
        wait_for_text(&handle, "Reconnected.").await;

        sleep(Duration::from_millis(300)).await;
        let state = handle.state();
        assert_eq!(state.connection, ConnectionState::Open);
        assert_eq!(state.reconnects, 1);
        assert_eq!(state.session_id.as_deref(), Some("second"));
        assert_eq!(connector.attempts(), 2, "no duplicate reconnect timers");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn refused_connection_retries_after_delay() {
        let (connector, mut peers) = MockConnector::new();
        connector.push(MockOutcome::Refuse("connection refused".into()));
        let (handle, _task) = spawn(config(), &connector);

        wait_for(&handle, ConnectionState::Reconnecting).await;
        wait_for_text(&handle, "Reconnecting in 100ms").await;

        let mut peer = peers.recv().await.expect("peer");
        assert_eq!(connector.attempts(), 2);
        open(&handle, &mut peer, "s1").await;
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn connect_that_never_settles_times_out() {
        let (connector, mut peers) = MockConnector::new();
        connector.push(MockOutcome::Hang);
        let config = SessionConfig {
            connect_timeout: Duration::from_millis(100),
            ..config()
        };
        let (handle, _task) = spawn(config, &connector);

        wait_for(&handle, ConnectionState::Reconnecting).await;
        wait_for_text(&handle, "timed out").await;
        let _peer = peers.recv().await.expect("retry reaches a peer");
        assert_eq!(connector.attempts(), 2);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn missing_connected_frame_times_out() {
        let (connector, mut peers) = MockConnector::new();
        let config = SessionConfig {
            connect_timeout: Duration::from_millis(100),
            ..config()
        };
        let (handle, _task) = spawn(config, &connector);

        let mut silent = peers.recv().await.expect("peer");
        wait_for(&handle, ConnectionState::Reconnecting).await;
        assert_eq!(silent.recv_raw().await, None, "abandoned connection is closed");

        // A late acknowledgement on the abandoned connection must not open the session.
        silent.send_frame(&Frame::Connected { session_id: None });
        let mut peer = peers.recv().await.expect("peer");
        open(&handle, &mut peer, "fresh").await;
        assert_eq!(handle.state().session_id.as_deref(), Some("fresh"));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn dispose_while_reconnecting_is_terminal() {
        let (connector, _peers) = MockConnector::new();
        connector.push(MockOutcome::Refuse("no route".into()));
        let config = SessionConfig {
            reconnect_delay: Duration::from_millis(200),
            ..config()
        };
        let (handle, task) = spawn(config, &connector);
        wait_for(&handle, ConnectionState::Reconnecting).await;

        handle.dispose();
        task.await.expect("session task");
        assert_eq!(handle.state().connection, ConnectionState::Closed);
        assert!(handle.screen().find("Session closed.").is_some());

        sleep(Duration::from_millis(400)).await;
        assert_eq!(connector.attempts(), 1, "pending reconnect was cancelled");
        handle.write_to_terminal("after close");
        handle.dispose();
        assert_eq!(handle.state().connection, ConnectionState::Closed);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn dispose_while_open_closes_the_connection() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, task) = spawn(config(), &connector);
        let mut peer = peers.recv().await.expect("peer");
        open(&handle, &mut peer, "s1").await;

        handle.dispose();
        task.await.expect("session task");
        assert_eq!(peer.recv_raw().await, None);

        // Closing from the host side after dispose changes nothing.
        peer.close();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.state().connection, ConnectionState::Closed);
        assert_eq!(connector.attempts(), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn dropping_every_handle_ends_the_session() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, task) = spawn(config(), &connector);
        let mut peer = peers.recv().await.expect("peer");

        drop(handle);
        task.await.expect("session task");
        assert_eq!(peer.recv_raw().await, None);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn error_frames_are_shown_and_keep_the_session() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, _task) = spawn(config(), &connector);
        let mut peer = peers.recv().await.expect("peer");
        open(&handle, &mut peer, "s1").await;

        peer.send_frame(&Frame::error("pty spawn failed"));
        let screen = wait_for_text(&handle, "Error: pty spawn failed").await;
        let (row, col) = screen.find("Error: pty spawn failed").expect("rendered");
        assert_eq!(screen.cell(row, col).map(|cell| cell.fg), Some(CellColor::RED));
        assert_eq!(handle.state().connection, ConnectionState::Open);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn status_lines_start_a_fresh_row_under_a_hidden_cursor() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, _task) = spawn(config(), &connector);
        let mut peer = peers.recv().await.expect("peer");
        open(&handle, &mut peer, "s1").await;

        peer.send_frame(&Frame::output("\x1b[?25lprompt$ "));
        wait_for_text(&handle, "prompt$").await;
        peer.send_frame(&Frame::error("disk full"));

        let screen = wait_for_text(&handle, "Error: disk full").await;
        let (error_row, error_col) = screen.find("Error: disk full").expect("rendered");
        let (prompt_row, _) = screen.find("prompt$").expect("prompt kept");
        assert_eq!(error_col, 0);
        assert!(error_row > prompt_row);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn malformed_frames_are_ignored() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, _task) = spawn(config(), &connector);
        let mut peer = peers.recv().await.expect("peer");
        open(&handle, &mut peer, "s1").await;

        peer.send_raw("not json at all");
        peer.send_raw(r#"{"type":"telemetry","data":"x"}"#);
        peer.send_raw(r#"{"data":"no type"}"#);
        peer.send_raw(r#"{"type":"resize","cols":0,"rows":10}"#);
        peer.send_frame(&Frame::output("still alive"));

        wait_for_text(&handle, "still alive").await;
        assert_eq!(handle.state().connection, ConnectionState::Open);
        assert_eq!(connector.attempts(), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn resize_sends_one_frame_per_distinct_size() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, _task) = spawn(config(), &connector);
        let mut peer = peers.recv().await.expect("peer");
        open(&handle, &mut peer, "s1").await;

        handle.resize(100, 30);
        handle.resize(110, 35);
        handle.resize(120, 40);
        assert_eq!(
            peer.recv_frame().await.expect("frame").expect("decodes"),
            Frame::Resize { cols: 120, rows: 40 }
        );
        let state = handle.wait_for_state(|state| state.viewport.cols() == 120).await;
        assert_eq!(state.viewport.rows(), 40);

        handle.resize(120, 40);
        handle.resize(0, 40);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(peer.try_recv_raw(), None);
        assert_eq!(handle.state().viewport.to_string(), "120x40");
    }
}
