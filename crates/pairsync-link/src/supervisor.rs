//! The connection state machine.
//!
//! One task owns every piece of mutable link state. User commands, socket
//! events and timer expiries all arrive as messages and are handled one at a
//! time, so a timer firing while a socket is accepted cannot interleave.
//!
//! ```text
//! Disabled --enable--> Discovering --assignment--> AwaitingSessionConnect
//!                        ^    |                            |
//!                        |    +--connect error--> ErrorBackoff (10s)
//!                        |                                 |
//!                        +--(5s)-- Connected <--session open
//! ```
//!
//! Exactly one state timer exists at a time. Entering any state drops the
//! previous timer; stale expiries are recognised by their generation.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use pairsync_core::{DISCOVERY_PATH, LinkState, SESSION_PATH, WireMessage};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};

use crate::allocator::PortAllocator;
use crate::bridge::{EditorBridge, FocusChain, FocusReason};
use crate::config::{LinkConfig, Role};
use crate::connection::{ConnectionId, PairConnection};
use crate::discovery::{self, DiscoveryListener, PortAssignment};
use crate::error::{LinkError, Result};
use crate::event::{LinkEvent, LinkStatus};
use crate::session::{self, SessionListener, SessionSocket};
use crate::store::PairStore;
use crate::sync::{Inbound, Selection, StateSync};

/// Everything that can happen to the supervisor besides user commands.
pub(crate) enum Input {
    /// Host: a dialer sent a valid hello and wants a session port.
    DiscoveryHello {
        epoch: u64,
        path: String,
        reply: oneshot::Sender<Result<u16>>,
    },
    /// Host: the current discovery handshake no longer needs servicing.
    HandshakeDone { epoch: u64 },
    /// Host: a data connection was upgraded on an assigned port.
    SessionAccepted { port: u16, socket: SessionSocket },
    /// Peer: discovery dial finished.
    DiscoveryOutcome {
        epoch: u64,
        outcome: Result<Option<PortAssignment>>,
    },
    /// Peer: session dial finished.
    SessionDialed {
        epoch: u64,
        port: u16,
        outcome: Result<SessionSocket>,
    },
    Frame { conn: ConnectionId, text: String },
    Closed { conn: ConnectionId },
    TimerFired { generation: u64 },
    PendingExpired { port: u16, created_at: Instant },
}

pub(crate) enum Command {
    Enable(oneshot::Sender<Result<()>>),
    Disable(oneshot::Sender<()>),
    SwitchNow(oneshot::Sender<Result<()>>),
    Publish(Selection),
    SetAutoReconnect(bool),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Connected socket closed; restart discovery.
    Reconnect,
    /// Discovery closed without an assignment; dial again.
    RetryDiscovery,
    /// Discovery could not be reached; dial again.
    Backoff,
}

struct StateTimer {
    kind: TimerKind,
    generation: u64,
    handle: JoinHandle<()>,
}

impl Drop for StateTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Bookkeeping between "port assigned" and "peer connected".
struct PendingConnection {
    workspace_path: String,
    created_at: Instant,
    /// Handed to the supervisor once the peer connects.
    listener: Option<SessionListener>,
    expiry: JoinHandle<()>,
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        self.expiry.abort();
    }
}

/// Start a link. Must be called inside a tokio runtime.
pub fn spawn(
    config: LinkConfig,
    mut store: PairStore,
    bridge: Arc<dyn EditorBridge>,
    focus: FocusChain,
) -> LinkHandle {
    store.persist_in_background();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(LinkStatus::disabled(config.auto_reconnect));
    let (events, _) = broadcast::channel(64);

    let allocator = PortAllocator::new(config.session_port_floor(), store.max_port());
    let sync = StateSync::new(
        config.identity.clone(),
        bridge,
        Arc::new(focus),
        events.clone(),
    );

    let supervisor = Supervisor {
        auto_reconnect: config.auto_reconnect,
        config,
        state: LinkState::Disabled,
        epoch: 0,
        timer: None,
        timer_generation: 0,
        allocator,
        store,
        discovery: None,
        handshake_busy: false,
        handshakes: JoinSet::new(),
        pending: HashMap::new(),
        session_listener: None,
        dial: None,
        connection: None,
        assigned_port: None,
        peer_path: None,
        sync,
        inputs: inputs_tx,
        status: status_tx,
        events: events.clone(),
    };
    tokio::spawn(supervisor.run(commands_rx, inputs_rx));

    LinkHandle {
        commands: commands_tx,
        status: status_rx,
        events,
    }
}

struct Supervisor {
    config: LinkConfig,
    state: LinkState,
    auto_reconnect: bool,
    /// Bumped on enable and disable; results from older tasks are dropped.
    epoch: u64,
    timer: Option<StateTimer>,
    timer_generation: u64,
    allocator: PortAllocator,
    store: PairStore,
    discovery: Option<DiscoveryListener>,
    handshake_busy: bool,
    handshakes: JoinSet<()>,
    pending: HashMap<u16, PendingConnection>,
    /// Host: stays bound for the live pair and refuses any further connect.
    session_listener: Option<SessionListener>,
    /// Peer: the in-flight discovery or session dial.
    dial: Option<JoinHandle<()>>,
    connection: Option<PairConnection>,
    assigned_port: Option<u16>,
    peer_path: Option<String>,
    sync: StateSync,
    inputs: mpsc::UnboundedSender<Input>,
    status: watch::Sender<LinkStatus>,
    events: broadcast::Sender<LinkEvent>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) {
        loop {
            let accepting = self.discovery.is_some() && !self.handshake_busy;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.disable();
                        break;
                    }
                },
                Some(input) = inputs.recv() => self.handle_input(input).await,
                accepted = accept_discovery(self.discovery.as_ref()), if accepting => {
                    match accepted {
                        Ok((stream, addr)) => self.start_handshake(stream, addr),
                        Err(e) => warn!(error = %e, "discovery accept failed"),
                    }
                }
            }
        }
        debug!("link supervisor stopped");
    }

    /// Returns `false` once the supervisor should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Enable(reply) => {
                let result = self.enable().await;
                let _ = reply.send(result);
            }
            Command::Disable(reply) => {
                self.disable();
                let _ = reply.send(());
            }
            Command::SwitchNow(reply) => {
                let _ = reply.send(self.switch_now());
            }
            Command::Publish(selection) => self.publish(selection),
            Command::SetAutoReconnect(on) => {
                self.auto_reconnect = on;
                self.publish_status();
            }
            Command::Shutdown(reply) => {
                self.disable();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::DiscoveryHello { epoch, path, reply } => {
                let result = if epoch == self.epoch && self.discovery.is_some() {
                    self.open_pending(path).await
                } else {
                    Err(LinkError::Disabled)
                };
                let _ = reply.send(result);
            }
            Input::HandshakeDone { epoch } => {
                if epoch == self.epoch {
                    self.handshake_busy = false;
                }
                while self.handshakes.try_join_next().is_some() {}
            }
            Input::SessionAccepted { port, socket } => self.on_session_accepted(port, socket),
            Input::DiscoveryOutcome { epoch, outcome } => {
                if epoch == self.epoch && self.state == LinkState::Discovering {
                    self.on_discovery_outcome(outcome);
                }
            }
            Input::SessionDialed {
                epoch,
                port,
                outcome,
            } => {
                if epoch == self.epoch && self.state == LinkState::AwaitingSessionConnect {
                    self.on_session_dialed(port, outcome);
                } else if let Ok(socket) = outcome {
                    socket.reject("stale session dial");
                }
            }
            Input::Frame { conn, text } => self.on_frame(conn, &text),
            Input::Closed { conn } => self.on_closed(conn),
            Input::TimerFired { generation } => self.on_timer(generation).await,
            Input::PendingExpired { port, created_at } => {
                if self
                    .pending
                    .get(&port)
                    .is_some_and(|p| p.created_at == created_at)
                {
                    self.pending.remove(&port);
                    info!(port, "pending connection expired");
                    self.publish_status();
                }
            }
        }
    }

    async fn enable(&mut self) -> Result<()> {
        if self.state.is_enabled() {
            return Ok(());
        }
        self.epoch += 1;
        info!(role = ?self.config.role, identity = %self.config.identity, "enabling link");
        self.start_discovery().await
    }

    fn disable(&mut self) {
        self.epoch += 1;
        self.teardown();
        self.enter(LinkState::Disabled);
    }

    /// Close every socket and cancel every timer.
    fn teardown(&mut self) {
        self.timer = None;
        self.discovery = None;
        self.handshake_busy = false;
        self.handshakes.abort_all();
        self.pending.clear();
        self.session_listener = None;
        if let Some(dial) = self.dial.take() {
            dial.abort();
        }
        self.connection = None;
        self.assigned_port = None;
        self.peer_path = None;
    }

    async fn start_discovery(&mut self) -> Result<()> {
        self.assigned_port = None;
        match self.config.role {
            Role::Host => {
                let bound =
                    DiscoveryListener::bind(&self.config.bind_host, self.config.discovery_port).await;
                match bound {
                    Ok(listener) => {
                        self.discovery = Some(listener);
                        self.handshake_busy = false;
                        self.enter(LinkState::Discovering);
                        Ok(())
                    }
                    Err(e) => {
                        error!(error = %e, "cannot host discovery; auto-reconnect turned off");
                        self.auto_reconnect = false;
                        self.epoch += 1;
                        self.teardown();
                        self.enter(LinkState::Disabled);
                        self.notice(e.to_string());
                        Err(e)
                    }
                }
            }
            Role::Peer => {
                self.enter(LinkState::Discovering);
                self.dial_discovery();
                Ok(())
            }
        }
    }

    fn start_handshake(&mut self, stream: TcpStream, addr: SocketAddr) {
        debug!(%addr, "discovery connection");
        self.handshake_busy = true;
        self.handshakes.spawn(discovery::serve_handshake(
            stream,
            addr,
            self.inputs.clone(),
            self.epoch,
            self.config.timings,
        ));
    }

    async fn open_pending(&mut self, workspace_path: String) -> Result<u16> {
        let in_use = self.ports_in_use();
        let (port, listener) =
            session::bind_next(&self.config.bind_host, &mut self.allocator, &in_use).await?;
        let listener = SessionListener::spawn(
            port,
            listener,
            self.config.timings.connect_timeout,
            self.inputs.clone(),
        );

        let created_at = Instant::now();
        let ttl = self.config.timings.pending_ttl;
        let inputs = self.inputs.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep_until(created_at + ttl).await;
            let _ = inputs.send(Input::PendingExpired { port, created_at });
        });

        info!(port, workspace = %workspace_path, "assigned session port");
        self.pending.insert(
            port,
            PendingConnection {
                workspace_path,
                created_at,
                listener: Some(listener),
                expiry,
            },
        );
        Ok(port)
    }

    fn ports_in_use(&self) -> HashSet<u16> {
        self.pending
            .keys()
            .copied()
            .chain(self.assigned_port)
            .collect()
    }

    fn on_session_accepted(&mut self, port: u16, socket: SessionSocket) {
        let Some(mut pending) = self.pending.remove(&port) else {
            warn!(port, "rejecting session connect: no pending connection");
            socket.reject("no pending connection");
            return;
        };
        if let Some(previous) = self.connection.take() {
            info!(port, "replacing previous pair connection");
            previous.close(CloseCode::Normal, "replaced");
        }

        let conn = socket.into_connection(self.inputs.clone());
        if let Err(e) = conn.send(&WireMessage::hello(&self.config.workspace)) {
            warn!(error = %e, "failed to queue session hello");
        }
        self.connection = Some(conn);
        if let Some(listener) = self.discovery.take() {
            debug!(port = listener.port(), "discovery listener stopped");
        }
        self.session_listener = pending.listener.take();
        self.assigned_port = Some(port);
        self.peer_path = Some(pending.workspace_path.clone());
        info!(port, peer = %pending.workspace_path, "paired");
        self.enter(LinkState::Connected);
        self.remember_pair();
    }

    fn dial_discovery(&mut self) {
        let url = self.config.ws_url(self.config.discovery_port, DISCOVERY_PATH);
        let workspace = self.config.workspace.clone();
        let connect_timeout = self.config.timings.connect_timeout;
        let inputs = self.inputs.clone();
        let epoch = self.epoch;
        debug!(%url, "dialing discovery");
        self.replace_dial(tokio::spawn(async move {
            let outcome = discovery::request_port(&url, &workspace, connect_timeout).await;
            let _ = inputs.send(Input::DiscoveryOutcome { epoch, outcome });
        }));
    }

    fn dial_session(&mut self, port: u16) {
        let url = self.config.ws_url(port, SESSION_PATH);
        let connect_timeout = self.config.timings.connect_timeout;
        let inputs = self.inputs.clone();
        let epoch = self.epoch;
        debug!(%url, "dialing session");
        self.replace_dial(tokio::spawn(async move {
            let outcome = session::dial(&url, connect_timeout).await;
            let _ = inputs.send(Input::SessionDialed {
                epoch,
                port,
                outcome,
            });
        }));
    }

    fn replace_dial(&mut self, task: JoinHandle<()>) {
        if let Some(previous) = self.dial.replace(task) {
            previous.abort();
        }
    }

    fn on_discovery_outcome(&mut self, outcome: Result<Option<PortAssignment>>) {
        self.dial = None;
        match outcome {
            Ok(Some(assignment)) => {
                info!(port = assignment.port, "received port assignment");
                self.assigned_port = Some(assignment.port);
                self.enter(LinkState::AwaitingSessionConnect);
                self.dial_session(assignment.port);
            }
            Ok(None) if self.auto_reconnect => {
                info!("discovery closed without an assignment, retrying");
                self.enter_armed(LinkState::Discovering, TimerKind::RetryDiscovery);
            }
            Ok(None) => {
                info!("discovery closed without an assignment");
                self.disable();
            }
            Err(e) => {
                warn!(error = %e, "discovery unreachable");
                self.notice(format!("cannot reach discovery host: {e}"));
                self.enter_armed(LinkState::ErrorBackoff, TimerKind::Backoff);
            }
        }
    }

    fn on_session_dialed(&mut self, port: u16, outcome: Result<SessionSocket>) {
        self.dial = None;
        match outcome {
            Ok(socket) => {
                self.connection = Some(socket.into_connection(self.inputs.clone()));
                info!(port, "paired");
                self.enter(LinkState::Connected);
                self.remember_pair();
            }
            Err(e) => {
                warn!(port, error = %e, "session connect failed");
                self.assigned_port = None;
                self.notice(format!("cannot connect to session port {port}: {e}"));
                self.enter_armed(LinkState::ErrorBackoff, TimerKind::Backoff);
            }
        }
    }

    fn on_frame(&mut self, conn: ConnectionId, text: &str) {
        if self.connection.as_ref().map(PairConnection::id) != Some(conn) {
            debug!(?conn, "dropping frame from a stale connection");
            return;
        }
        match self.sync.apply(text, &self.config.workspace) {
            Ok(Inbound::PeerHello(path)) => {
                let changed = self.peer_path.as_deref() != Some(path.as_str());
                self.peer_path = Some(path);
                if changed {
                    self.publish_status();
                    self.remember_pair();
                }
            }
            Ok(outcome) => debug!(?outcome, "session frame handled"),
            Err(e) => warn!(error = %e, "dropping malformed session frame"),
        }
    }

    fn on_closed(&mut self, conn: ConnectionId) {
        if self.connection.as_ref().map(PairConnection::id) != Some(conn) {
            return;
        }
        self.connection = None;
        self.session_listener = None;
        self.assigned_port = None;
        if self.auto_reconnect {
            info!("peer disconnected, rediscovering shortly");
            self.enter_armed(LinkState::Discovering, TimerKind::Reconnect);
        } else {
            info!("peer disconnected");
            self.disable();
        }
    }

    async fn on_timer(&mut self, generation: u64) {
        let Some(kind) = self
            .timer
            .as_ref()
            .filter(|t| t.generation == generation)
            .map(|t| t.kind)
        else {
            return;
        };
        self.timer = None;
        debug!(?kind, "state timer fired");

        match kind {
            TimerKind::Reconnect => {
                // Errors are already surfaced as a notice.
                let _ = self.start_discovery().await;
            }
            TimerKind::RetryDiscovery => {
                self.enter(LinkState::Discovering);
                self.dial_discovery();
            }
            TimerKind::Backoff if self.assigned_port.is_none() => {
                self.enter(LinkState::Discovering);
                self.dial_discovery();
            }
            TimerKind::Backoff => self.publish_status(),
        }
    }

    fn publish(&mut self, selection: Selection) {
        let Some(state) = self.sync.outbound(selection) else {
            return;
        };
        match (&self.connection, self.state) {
            (Some(conn), LinkState::Connected) => {
                if let Err(e) = conn.send(&WireMessage::State(state)) {
                    debug!(error = %e, "state not sent");
                }
            }
            _ => debug!("not connected, local state kept for later switch"),
        }
    }

    fn switch_now(&mut self) -> Result<()> {
        let conn = match (&self.connection, self.state) {
            (Some(conn), LinkState::Connected) => conn,
            _ => return Err(LinkError::NotConnected),
        };
        for frame in self.sync.switch_frames()? {
            conn.send(&frame)?;
        }
        self.sync
            .raise(FocusReason::LocalSwitch, self.peer_path.clone());

        if let (Some(port), Some(remote)) = (self.assigned_port, self.peer_path.as_deref()) {
            if let Err(e) = self.store.record_switch(&self.config.workspace, remote, port) {
                warn!(error = %e, "failed to record switch");
            }
        }
        Ok(())
    }

    fn remember_pair(&mut self) {
        let (Some(port), Some(remote)) = (self.assigned_port, self.peer_path.as_deref()) else {
            return;
        };
        if let Err(e) = self.store.record_connected(&self.config.workspace, remote, port) {
            warn!(error = %e, "failed to record pair");
        }
    }

    fn enter(&mut self, state: LinkState) {
        self.timer = None;
        self.set_state(state);
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "state transition");
        }
        self.state = state;
        self.publish_status();
    }

    /// Enter `state` and start its timer, publishing a single status update.
    fn enter_armed(&mut self, state: LinkState, kind: TimerKind) {
        let timings = &self.config.timings;
        let delay = match kind {
            TimerKind::Reconnect => timings.reconnect_delay,
            TimerKind::RetryDiscovery => timings.discovery_retry,
            TimerKind::Backoff => timings.error_backoff,
        };
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let inputs = self.inputs.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(Input::TimerFired { generation });
        });
        // Replacing the old timer aborts it.
        self.timer = Some(StateTimer {
            kind,
            generation,
            handle,
        });
        self.set_state(state);
    }

    fn publish_status(&self) {
        let status = LinkStatus {
            state: self.state,
            auto_reconnect: self.auto_reconnect,
            reconnecting: self.timer.is_some(),
            assigned_port: self.assigned_port,
            peer_path: self.peer_path.clone(),
        };
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status.clone();
            true
        });
        if changed {
            let _ = self.events.send(LinkEvent::Status(status));
        }
    }

    fn notice(&self, message: String) {
        let _ = self.events.send(LinkEvent::Notice(message));
    }
}

async fn accept_discovery(
    listener: Option<&DiscoveryListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Cheap, cloneable control surface of a running link.
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<LinkStatus>,
    events: broadcast::Sender<LinkEvent>,
}

impl LinkHandle {
    /// Start discovery. Hosts fail here when the discovery port is taken.
    pub async fn enable(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Enable(reply))?;
        rx.await.map_err(|_| LinkError::Stopped)?
    }

    /// Close all sockets and cancel all timers.
    pub async fn disable(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disable(reply))?;
        rx.await.map_err(|_| LinkError::Stopped)
    }

    /// Hand focus to the peer: send the current state as a switch, ask the
    /// peer to raise itself, and raise the peer window locally.
    pub async fn switch_now(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SwitchNow(reply))?;
        rx.await.map_err(|_| LinkError::Stopped)?
    }

    /// Report a local caret move. Sent only while connected.
    pub fn publish_selection(&self, selection: Selection) -> Result<()> {
        self.send(Command::Publish(selection))
    }

    pub fn set_auto_reconnect(&self, on: bool) -> Result<()> {
        self.send(Command::SetAutoReconnect(on))
    }

    /// Disable and stop the supervisor task.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown(reply))?;
        rx.await.map_err(|_| LinkError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().state == LinkState::Connected
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status.borrow().reconnecting
    }

    pub fn assigned_port(&self) -> Option<u16> {
        self.status.borrow().assigned_port
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl Fn(&LinkStatus) -> bool) -> Result<LinkStatus> {
        let mut status = self.status.clone();
        let matched = status
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| LinkError::Stopped)?;
        Ok(matched.clone())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| LinkError::Stopped)
    }
}
