//! Relay handle and its event loop.
//!
//! Every relay instance owns one task that holds all transport state: the
//! outbound channel (panel and tabs), the channel registry (hub), the
//! pending queue and the dedup windows. The [`Relay`] handle talks to it
//! through a command channel, so no lock guards routing state.
//!
//! # Loop inputs
//!
//! | Source | Effect |
//! |--------|--------|
//! | Commands | Send, identity change, shutdown |
//! | Loop events | Channel opened, accepted, message, disconnect |
//! | Retry deadline | Next connect or listen attempt |
//! | Sweep interval | Evicts expired message ids |
//!
//! Events carry the link id or epoch they were produced under. Anything
//! from a replaced channel or a previous identity is ignored.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ChannelName, ContextId};
use crate::protocol::{Message, MessageType};
use crate::transport::{ChannelEvent, ChannelHandle, DisconnectReason, Host};

use super::builder::RelayBuilder;
use super::config::RelayConfig;
use super::dedup::ProcessedIds;
use super::dispatcher::{Dispatcher, Subscription, Topic};
use super::lifecycle::{ConnectionState, Lifecycle};
use super::queue::PendingQueue;
use super::registry::{ChannelRegistry, LiveChannel};
use super::router::{Route, route};

// ============================================================================
// SendOutcome
// ============================================================================

/// What happened to a sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Posted on the live channel to the hub.
    Posted,
    /// Held in the pending queue until a channel is available.
    Queued,
    /// Sent by the hub itself to this many channels.
    Routed {
        /// Channels the message was posted to.
        recipients: usize,
    },
}

// ============================================================================
// Commands and Events
// ============================================================================

/// Message to send, built in the loop so it carries the current identity.
enum Outgoing {
    New {
        kind: MessageType,
        payload: Value,
        target: Option<ContextId>,
    },
    Prebuilt(Message),
}

/// Request from a [`Relay`] handle.
enum RelayCommand {
    Send {
        outgoing: Outgoing,
        reply: oneshot::Sender<Result<SendOutcome>>,
    },
    SetIdentity {
        identity: ContextId,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Produced by tasks spawned from the loop.
enum LoopEvent {
    /// An outbound open finished.
    Opened {
        epoch: u64,
        result: Result<ChannelHandle>,
    },
    /// A listen request finished.
    Listening {
        epoch: u64,
        result: Result<mpsc::UnboundedReceiver<ChannelHandle>>,
    },
    /// The hub accepted a channel.
    Accepted { epoch: u64, handle: ChannelHandle },
    /// The host closed the accept queue.
    ListenEnded { epoch: u64 },
    /// A channel delivered a message.
    Inbound {
        link: u64,
        name: ChannelName,
        message: Message,
    },
    /// A channel went away.
    Disconnected {
        link: u64,
        name: ChannelName,
        reason: DisconnectReason,
    },
}

// ============================================================================
// Relay
// ============================================================================

/// Shared state behind every [`Relay`] clone.
struct RelayInner {
    /// Command channel into the loop.
    commands: mpsc::UnboundedSender<RelayCommand>,
    /// Handler table, shared with the loop.
    dispatcher: Dispatcher,
    /// Current identity.
    identity: watch::Receiver<ContextId>,
    /// Current connection state.
    state: watch::Receiver<ConnectionState>,
    /// Pending queue length.
    pending: watch::Receiver<usize>,
    /// Live channel count.
    connections: watch::Receiver<usize>,
    /// Timing configuration.
    config: RelayConfig,
}

/// Message relay for one execution context.
///
/// Cheap to clone; every clone drives the same event loop. The loop stops
/// on [`Relay::shutdown`] or once every clone is dropped.
///
/// # Examples
///
/// ```no_run
/// use context_relay::{ContextId, MessageType, Relay};
/// use context_relay::transport::MemoryHost;
///
/// # async fn example() -> context_relay::Result<()> {
/// let host = MemoryHost::new();
/// let hub = Relay::builder().host(host.clone()).identity(ContextId::Hub).build()?;
/// let panel = Relay::builder().host(host).identity(ContextId::Panel).build()?;
///
/// let _sub = hub.subscribe(MessageType::Ping, |message| {
///     println!("ping from {}", message.source);
/// });
/// panel.send(MessageType::Ping, serde_json::json!({}), None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

// ============================================================================
// Relay - Display
// ============================================================================

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("identity", &self.identity())
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Relay - Public API
// ============================================================================

impl Relay {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> RelayBuilder {
        RelayBuilder::new()
    }

    /// Starts the event loop on `runtime` and returns its handle.
    pub(crate) fn spawn(
        runtime: &Handle,
        host: Arc<dyn Host>,
        identity: ContextId,
        config: RelayConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (identity_tx, identity_rx) = watch::channel(identity);
        let (pending_tx, pending_rx) = watch::channel(0);
        let (connections_tx, connections_rx) = watch::channel(0);

        let dispatcher = Dispatcher::new();
        let lifecycle = Lifecycle::new();
        let state_rx = lifecycle.subscribe();

        let relay_loop = RelayLoop {
            host,
            config,
            identity,
            identity_tx,
            lifecycle,
            dispatcher: dispatcher.clone(),
            commands: command_rx,
            events_tx,
            events_rx,
            epoch: 0,
            next_link: 0,
            retry_at: None,
            setting_up: false,
            invalidated: false,
            setup_task: None,
            acceptor: None,
            outbound: None,
            registry: ChannelRegistry::new(),
            queue: PendingQueue::new(),
            processed: ProcessedIds::new(config.dedup_ttl),
            forwarded: ProcessedIds::new(config.dedup_ttl),
            pending_tx,
            connections_tx,
        };
        runtime.spawn(relay_loop.run());

        Self {
            inner: Arc::new(RelayInner {
                commands: command_tx,
                dispatcher,
                identity: identity_rx,
                state: state_rx,
                pending: pending_rx,
                connections: connections_rx,
                config,
            }),
        }
    }

    /// Sends a message of `kind` from the current identity.
    ///
    /// `target` of `None` broadcasts. Without a live channel the message is
    /// queued and flushed in order once one opens.
    ///
    /// # Errors
    ///
    /// - [`Error::IdentityUnassigned`] before an identity is adopted
    /// - [`Error::Invalidated`] after the host was torn down
    /// - [`Error::Json`] if `payload` cannot be serialized
    /// - [`Error::RelayClosed`] if the loop has stopped
    pub async fn send(
        &self,
        kind: MessageType,
        payload: impl Serialize,
        target: Option<ContextId>,
    ) -> Result<SendOutcome> {
        let payload = serde_json::to_value(payload)?;
        self.request_send(Outgoing::New {
            kind,
            payload,
            target,
        })
        .await
    }

    /// Sends a fully built message, keeping its id and source.
    ///
    /// # Errors
    ///
    /// Same as [`Relay::send`].
    pub async fn send_message(&self, message: Message) -> Result<SendOutcome> {
        self.request_send(Outgoing::Prebuilt(message)).await
    }

    /// Registers `handler` for `topic`.
    ///
    /// Handlers run on the relay loop and must not block.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe(topic, handler)
    }

    /// Adopts a new identity.
    ///
    /// Tears down every channel, clears the pending queue and the dedup
    /// windows, then connects (or listens) as `identity`. Adopting the
    /// current identity is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RelayClosed`] if the loop has stopped.
    pub async fn set_identity(&self, identity: ContextId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(RelayCommand::SetIdentity { identity, reply })?;
        rx.await.map_err(|_| Error::RelayClosed)
    }

    /// Current identity.
    #[inline]
    #[must_use]
    pub fn identity(&self) -> ContextId {
        *self.inner.identity.borrow()
    }

    /// Current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribes to connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Number of queued messages.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Live channels: registered channels on the hub, 0 or 1 elsewhere.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        *self.inner.connections.borrow()
    }

    /// Subscribes to live channel count changes.
    #[must_use]
    pub fn watch_connections(&self) -> watch::Receiver<usize> {
        self.inner.connections.clone()
    }

    /// Timing configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Stops the event loop and closes every channel.
    ///
    /// Later calls on any clone return [`Error::RelayClosed`].
    pub fn shutdown(&self) {
        let _ = self.inner.commands.send(RelayCommand::Shutdown);
    }
}

// ============================================================================
// Relay - Internal
// ============================================================================

impl Relay {
    fn command(&self, command: RelayCommand) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| Error::RelayClosed)
    }

    async fn request_send(&self, outgoing: Outgoing) -> Result<SendOutcome> {
        let (reply, rx) = oneshot::channel();
        self.command(RelayCommand::Send { outgoing, reply })?;
        rx.await.map_err(|_| Error::RelayClosed)?
    }
}

// ============================================================================
// RelayLoop
// ============================================================================

/// State owned by the event loop task.
struct RelayLoop {
    host: Arc<dyn Host>,
    config: RelayConfig,
    identity: ContextId,
    identity_tx: watch::Sender<ContextId>,
    lifecycle: Lifecycle,
    dispatcher: Dispatcher,
    commands: mpsc::UnboundedReceiver<RelayCommand>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    /// Bumped on every identity change.
    epoch: u64,
    next_link: u64,
    /// Next connect or listen attempt.
    retry_at: Option<Instant>,
    /// An open or listen request is in flight.
    setting_up: bool,
    /// Host torn down for the current identity.
    invalidated: bool,
    setup_task: Option<JoinHandle<()>>,
    /// Hub accept pump.
    acceptor: Option<JoinHandle<()>>,
    /// Channel to the hub (panel and tabs).
    outbound: Option<LiveChannel>,
    /// Accepted channels (hub).
    registry: ChannelRegistry,
    queue: PendingQueue,
    /// Ids dispatched locally.
    processed: ProcessedIds,
    /// Ids already fanned out by the hub.
    forwarded: ProcessedIds,
    pending_tx: watch::Sender<usize>,
    connections_tx: watch::Sender<usize>,
}

impl RelayLoop {
    async fn run(mut self) {
        info!(identity = %self.identity, "Relay started");
        self.setup();

        let mut sweep = interval(self.config.dedup_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(RelayCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },

                Some(event) = self.events_rx.recv() => self.handle_event(event),

                () = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    self.attempt_setup();
                }

                _ = sweep.tick() => self.sweep(),
            }

            self.publish_counters();
        }

        self.teardown();
        self.publish_counters();
        info!(identity = %self.identity, "Relay stopped");
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Send { outgoing, reply } => {
                let outcome = self.handle_send(outgoing);
                self.publish_counters();
                let _ = reply.send(outcome);
            }
            RelayCommand::SetIdentity { identity, reply } => {
                self.handle_set_identity(identity);
                self.publish_counters();
                let _ = reply.send(());
            }
            RelayCommand::Shutdown => {}
        }
    }

    fn handle_send(&mut self, outgoing: Outgoing) -> Result<SendOutcome> {
        if self.identity.is_unassigned() {
            return Err(Error::IdentityUnassigned);
        }
        if self.invalidated {
            return Err(Error::invalidated(self.identity));
        }

        let message = match outgoing {
            Outgoing::New {
                kind,
                payload,
                target,
            } => Message::new(kind, payload, self.identity, target),
            Outgoing::Prebuilt(message) => message,
        };

        if self.identity.is_hub() {
            let recipients = self.forward(&message, None);
            if message.is_for(&ContextId::Hub) {
                self.dispatch_local(&message);
            }
            return Ok(SendOutcome::Routed { recipients });
        }

        // Own id is marked so an echo from the hub is never dispatched here.
        self.processed.check_and_record(message.id.clone(), Instant::now());
        self.queue.push(message);

        if self.outbound.is_none() {
            debug!(queued = self.queue.len(), "No live channel; message queued");
            return Ok(SendOutcome::Queued);
        }

        self.flush_queue();
        if self.queue.is_empty() {
            Ok(SendOutcome::Posted)
        } else {
            Ok(SendOutcome::Queued)
        }
    }

    fn handle_set_identity(&mut self, identity: ContextId) {
        if identity == self.identity {
            debug!(%identity, "Identity unchanged");
            return;
        }

        info!(from = %self.identity, to = %identity, "Identity reassigned");
        self.teardown();
        self.identity = identity;
        self.identity_tx.send_replace(identity);
        self.setup();
    }

    // ========================================================================
    // Setup
    // ========================================================================

    /// Starts the transport side of the current identity.
    fn setup(&mut self) {
        match self.identity {
            ContextId::Unassigned => debug!("No identity; relay idle"),
            ContextId::Hub => self.start_listening(),
            _ => self.schedule_setup(self.config.initial_connect_delay),
        }
    }

    /// Arms the retry deadline.
    fn schedule_setup(&mut self, delay: Duration) {
        if self.invalidated || self.identity.is_unassigned() {
            return;
        }
        if self.setting_up || self.retry_at.is_some() {
            trace!("Setup already pending");
            return;
        }

        if !self.identity.is_hub() {
            self.lifecycle.transition(ConnectionState::Connecting);
        }
        self.retry_at = Some(Instant::now() + delay);
    }

    fn attempt_setup(&mut self) {
        if self.identity.is_hub() {
            self.start_listening();
        } else {
            self.start_connect();
        }
    }

    fn start_listening(&mut self) {
        if self.invalidated || self.setting_up || self.acceptor.is_some() {
            return;
        }
        self.setting_up = true;

        let host = Arc::clone(&self.host);
        let events = self.events_tx.clone();
        let epoch = self.epoch;
        self.setup_task = Some(tokio::spawn(async move {
            let result = host.listen().await;
            let _ = events.send(LoopEvent::Listening { epoch, result });
        }));
    }

    fn start_connect(&mut self) {
        if self.invalidated || self.setting_up || self.outbound.is_some() {
            return;
        }
        self.setting_up = true;

        let name = ChannelName::for_context(self.identity);
        debug!(channel = %name, "Opening channel to hub");

        let host = Arc::clone(&self.host);
        let events = self.events_tx.clone();
        let epoch = self.epoch;
        self.setup_task = Some(tokio::spawn(async move {
            let result = host.open_channel(&name).await;
            let _ = events.send(LoopEvent::Opened { epoch, result });
        }));
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Opened { epoch, result } => self.on_opened(epoch, result),
            LoopEvent::Listening { epoch, result } => self.on_listening(epoch, result),
            LoopEvent::Accepted { epoch, handle } => {
                if epoch == self.epoch && self.identity.is_hub() {
                    self.on_accepted(handle);
                } else {
                    handle.sink.close();
                }
            }
            LoopEvent::ListenEnded { epoch } => self.on_listen_ended(epoch),
            LoopEvent::Inbound {
                link,
                name,
                message,
            } => self.on_inbound(link, &name, message),
            LoopEvent::Disconnected { link, name, reason } => {
                self.on_disconnected(link, &name, &reason);
            }
        }
    }

    fn on_opened(&mut self, epoch: u64, result: Result<ChannelHandle>) {
        if epoch != self.epoch {
            if let Ok(handle) = result {
                trace!(channel = %handle.name, "Closing channel opened for a previous identity");
                handle.sink.close();
            }
            return;
        }
        self.setting_up = false;
        self.setup_task = None;

        match result {
            Ok(handle) => {
                let ChannelHandle { name, sink, events } = handle;
                let link = self.allocate_link();
                let forwarder = self.spawn_forwarder(link, name.clone(), events);
                self.outbound = Some(LiveChannel::new(
                    name.clone(),
                    self.identity,
                    link,
                    sink,
                    Some(forwarder),
                ));
                self.lifecycle.transition(ConnectionState::Connected);
                info!(channel = %name, queued = self.queue.len(), "Connected to hub");
                self.flush_queue();
            }
            Err(Error::HostInvalidated) => self.invalidate(),
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in = ?self.config.reconnect_delay,
                    "Channel open failed"
                );
                self.schedule_setup(self.config.reconnect_delay);
            }
        }
    }

    fn on_listening(
        &mut self,
        epoch: u64,
        result: Result<mpsc::UnboundedReceiver<ChannelHandle>>,
    ) {
        if epoch != self.epoch {
            return;
        }
        self.setting_up = false;
        self.setup_task = None;

        match result {
            Ok(accepted) => {
                self.acceptor = Some(self.spawn_acceptor(accepted));
                self.lifecycle.transition(ConnectionState::Listening);
                info!("Hub listening for channels");
            }
            Err(Error::HostInvalidated) => self.invalidate(),
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in = ?self.config.reconnect_delay,
                    "Hub listen failed"
                );
                self.schedule_setup(self.config.reconnect_delay);
            }
        }
    }

    fn on_accepted(&mut self, handle: ChannelHandle) {
        let ChannelHandle { name, sink, events } = handle;

        let identity = match name.context() {
            Ok(identity) if !identity.is_hub() && !identity.is_unassigned() => identity,
            Ok(identity) => {
                warn!(channel = %name, %identity, "Refusing channel declared as non-routable identity");
                sink.close();
                return;
            }
            Err(e) => {
                warn!(channel = %name, error = %e, "Refusing channel with malformed name");
                sink.close();
                return;
            }
        };

        let link = self.allocate_link();
        let forwarder = self.spawn_forwarder(link, name.clone(), events);
        self.registry.register(LiveChannel::new(
            name.clone(),
            identity,
            link,
            sink,
            Some(forwarder),
        ));
        info!(channel = %name, %identity, channels = self.registry.len(), "Channel registered");
    }

    fn on_listen_ended(&mut self, epoch: u64) {
        if epoch != self.epoch || self.invalidated {
            return;
        }
        self.acceptor = None;

        if self.host.is_invalidated() {
            self.invalidate();
            return;
        }

        warn!(
            retry_in = ?self.config.reconnect_delay,
            "Host stopped accepting channels"
        );
        self.schedule_setup(self.config.reconnect_delay);
    }

    fn on_inbound(&mut self, link: u64, name: &ChannelName, message: Message) {
        if self.identity.is_hub() {
            if self.registry.get(name, link).is_none() {
                trace!(channel = %name, link, "Ignoring message from stale channel");
                return;
            }
            self.forward(&message, Some(name));
            self.dispatch_local(&message);
            return;
        }

        if self.outbound.as_ref().is_none_or(|channel| channel.link != link) {
            trace!(channel = %name, link, "Ignoring message from stale channel");
            return;
        }
        if !message.is_for(&self.identity) {
            debug!(id = %message.id, target = ?message.target, "Dropping message addressed elsewhere");
            return;
        }
        self.dispatch_local(&message);
    }

    fn on_disconnected(&mut self, link: u64, name: &ChannelName, reason: &DisconnectReason) {
        if self.identity.is_hub() {
            if self.registry.remove(name, link).is_some() {
                info!(channel = %name, %reason, channels = self.registry.len(), "Channel unregistered");
            }
            // A peer may relay its own teardown; only our host ends the hub.
            if reason.is_terminal() && !self.invalidated && self.host.is_invalidated() {
                self.invalidate();
            }
            return;
        }

        if self.outbound.as_ref().is_none_or(|channel| channel.link != link) {
            trace!(channel = %name, link, "Ignoring disconnect of stale channel");
            return;
        }
        self.outbound = None;

        if reason.is_terminal() {
            self.invalidate();
            return;
        }

        self.lifecycle.transition(ConnectionState::Disconnected);
        warn!(
            channel = %name,
            %reason,
            retry_in = ?self.config.reconnect_delay,
            "Channel to hub lost"
        );
        self.schedule_setup(self.config.reconnect_delay);
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Hub fan-out. Each id is forwarded at most once.
    ///
    /// Returns the number of channels posted to.
    fn forward(&mut self, message: &Message, origin: Option<&ChannelName>) -> usize {
        if !self.forwarded.check_and_record(message.id.clone(), Instant::now()) {
            trace!(id = %message.id, "Already forwarded");
            return 0;
        }

        match route(&self.registry, message, origin) {
            Route::Forward(names) => {
                let mut delivered = 0;
                for name in &names {
                    let Some(channel) = self.registry.by_name(name) else {
                        continue;
                    };
                    match channel.post(message) {
                        Ok(()) => delivered += 1,
                        Err(e) => warn!(channel = %name, id = %message.id, error = %e, "Forward failed"),
                    }
                }
                trace!(id = %message.id, kind = %message.kind, delivered, "Forwarded");
                delivered
            }
            Route::Local => 0,
            Route::Miss(target) => {
                debug!(id = %message.id, %target, "No channel for target; message dropped");
                0
            }
        }
    }

    /// Runs handlers unless the id was already processed.
    fn dispatch_local(&mut self, message: &Message) {
        if !self.processed.check_and_record(message.id.clone(), Instant::now()) {
            trace!(id = %message.id, "Duplicate suppressed");
            return;
        }

        let handlers = self.dispatcher.dispatch(message);
        if message.kind.is_chatty() {
            trace!(id = %message.id, kind = %message.kind, source = %message.source, handlers, "Dispatched");
        } else {
            debug!(id = %message.id, kind = %message.kind, source = %message.source, handlers, "Dispatched");
        }
    }

    fn flush_queue(&mut self) {
        let Some(channel) = self.outbound.as_ref() else {
            return;
        };
        if self.queue.is_empty() {
            return;
        }

        let report = self.queue.flush(|message| channel.post(message));
        match report.error {
            Some(e) => warn!(
                error = %e,
                posted = report.posted,
                remaining = report.remaining,
                "Flush stopped; head message kept"
            ),
            None => debug!(posted = report.posted, "Pending queue flushed"),
        }
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    fn allocate_link(&mut self) -> u64 {
        self.next_link += 1;
        self.next_link
    }

    /// Pumps one channel's events into the loop, tagged with `link`.
    fn spawn_forwarder(
        &self,
        link: u64,
        name: ChannelName,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> JoinHandle<()> {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Message(message) => {
                        let event = LoopEvent::Inbound {
                            link,
                            name: name.clone(),
                            message,
                        };
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                    ChannelEvent::Disconnected(reason) => {
                        let _ = tx.send(LoopEvent::Disconnected { link, name, reason });
                        return;
                    }
                }
            }

            let _ = tx.send(LoopEvent::Disconnected {
                link,
                name,
                reason: DisconnectReason::Closed,
            });
        })
    }

    /// Pumps accepted channels into the loop.
    fn spawn_acceptor(&self, mut accepted: mpsc::UnboundedReceiver<ChannelHandle>) -> JoinHandle<()> {
        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            while let Some(handle) = accepted.recv().await {
                if tx.send(LoopEvent::Accepted { epoch, handle }).is_err() {
                    return;
                }
            }
            let _ = tx.send(LoopEvent::ListenEnded { epoch });
        })
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Enters the terminal state for the current identity.
    fn invalidate(&mut self) {
        self.invalidated = true;
        self.retry_at = None;
        self.setting_up = false;
        if let Some(task) = self.setup_task.take() {
            task.abort();
        }
        if let Some(task) = self.acceptor.take() {
            task.abort();
        }
        self.outbound = None;
        self.registry.clear();

        self.lifecycle.transition(ConnectionState::Invalidated);
        warn!(
            identity = %self.identity,
            queued = self.queue.len(),
            "Host invalidated; reconnection disabled"
        );
    }

    /// Drops all transport state of the current identity.
    fn teardown(&mut self) {
        self.epoch += 1;
        self.retry_at = None;
        self.setting_up = false;
        self.invalidated = false;

        if let Some(task) = self.setup_task.take() {
            task.abort();
        }
        if let Some(task) = self.acceptor.take() {
            task.abort();
        }

        let outbound = usize::from(self.outbound.take().is_some());
        let channels = self.registry.clear() + outbound;
        let dropped = self.queue.clear();
        self.processed.clear();
        self.forwarded.clear();
        self.lifecycle.reset();

        debug!(identity = %self.identity, channels, dropped, "Transport state torn down");
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let evicted = self.processed.evict_expired(now) + self.forwarded.evict_expired(now);
        if evicted > 0 {
            trace!(evicted, "Expired message ids evicted");
        }
    }

    fn publish_counters(&self) {
        let pending = self.queue.len();
        let connections = if self.identity.is_hub() {
            self.registry.len()
        } else {
            usize::from(self.outbound.is_some())
        };

        self.pending_tx.send_if_modified(|value| replace_if_changed(value, pending));
        self.connections_tx
            .send_if_modified(|value| replace_if_changed(value, connections));
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Sleeps until `deadline`, or forever without one.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn replace_if_changed(value: &mut usize, next: usize) -> bool {
    if *value == next {
        false
    } else {
        *value = next;
        true
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::time::{sleep, timeout};

    use crate::identifiers::MessageId;
    use crate::transport::MemoryHost;

    fn tab(n: u32) -> ContextId {
        ContextId::tab(n)
    }

    fn spawn_relay(host: &MemoryHost, identity: ContextId) -> Relay {
        Relay::builder()
            .host(host.clone())
            .identity(identity)
            .initial_connect_delay(Duration::from_millis(10))
            .reconnect_delay(Duration::from_millis(100))
            .dedup_ttl(Duration::from_secs(5))
            .dedup_sweep_interval(Duration::from_secs(1))
            .build()
            .unwrap()
    }

    /// Collects every message dispatched to `topic`.
    fn collect(relay: &Relay, topic: impl Into<Topic>) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _subscription = relay.subscribe(topic, move |message| {
            let _ = tx.send(message.clone());
        });
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("handler channel closed")
    }

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Message>) {
        sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err(), "unexpected message");
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Hub plus connected relays for `identities`.
    async fn mesh(host: &MemoryHost, identities: &[ContextId]) -> (Relay, Vec<Relay>) {
        let hub = spawn_relay(host, ContextId::Hub);
        eventually(|| hub.state() == ConnectionState::Listening).await;

        let relays: Vec<_> = identities.iter().map(|id| spawn_relay(host, *id)).collect();
        eventually(|| {
            hub.connection_count() == identities.len()
                && relays.iter().all(|r| r.state() == ConnectionState::Connected)
        })
        .await;
        (hub, relays)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_identity_fails() {
        let relay = spawn_relay(&MemoryHost::new(), ContextId::Unassigned);
        let result = relay.send(MessageType::Ping, json!({}), None).await;
        assert!(matches!(result, Err(Error::IdentityUnassigned)));
        assert_eq!(relay.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_broadcast_reaches_every_context() {
        let host = MemoryHost::new();
        let (hub, relays) = mesh(&host, &[ContextId::Panel, tab(3)]).await;

        let mut at_hub = collect(&hub, MessageType::Ping);
        let mut at_panel = collect(&relays[0], MessageType::Ping);
        let mut at_tab = collect(&relays[1], MessageType::Ping);

        let outcome = hub.send(MessageType::Ping, json!({}), None).await.unwrap();
        assert_eq!(outcome, SendOutcome::Routed { recipients: 2 });

        let received = next(&mut at_panel).await;
        assert_eq!(received.source, ContextId::Hub);
        assert_eq!(next(&mut at_tab).await.id, received.id);
        assert_eq!(next(&mut at_hub).await.id, received.id);

        assert_silent(&mut at_panel).await;
        assert_silent(&mut at_tab).await;
        assert_silent(&mut at_hub).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_is_not_echoed_to_sender() {
        let host = MemoryHost::new();
        let (hub, relays) = mesh(&host, &[ContextId::Panel, tab(3)]).await;

        let mut at_panel = collect(&relays[0], Topic::All);
        let mut at_tab = collect(&relays[1], Topic::All);
        let mut at_hub = collect(&hub, Topic::All);

        let outcome = relays[0]
            .send(MessageType::InspectStart, json!({ "mode": "hover" }), None)
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Posted);

        assert_eq!(next(&mut at_tab).await.kind, MessageType::InspectStart);
        assert_eq!(next(&mut at_hub).await.source, ContextId::Panel);
        assert_silent(&mut at_panel).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_sends_flush_in_order() {
        let host = MemoryHost::new();
        let tab3 = spawn_relay(&host, tab(3));

        for seq in 0..3 {
            let outcome = tab3
                .send(MessageType::StyleChanged, json!({ "seq": seq }), None)
                .await
                .unwrap();
            assert_eq!(outcome, SendOutcome::Queued);
        }
        assert_eq!(tab3.pending_count(), 3);

        let hub = spawn_relay(&host, ContextId::Hub);
        let mut at_hub = collect(&hub, MessageType::StyleChanged);

        for seq in 0..3 {
            let message = next(&mut at_hub).await;
            assert_eq!(message.payload["seq"], seq);
            assert_eq!(message.source, tab(3));
        }
        assert_silent(&mut at_hub).await;
        assert_eq!(tab3.pending_count(), 0);
        assert_eq!(tab3.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_delivery_dispatches_once() {
        let host = MemoryHost::new();
        let (_hub, relays) = mesh(&host, &[ContextId::Panel, tab(3)]).await;
        let mut at_tab = collect(&relays[1], MessageType::ElementSelected);

        let m1 = Message::new(
            MessageType::ElementSelected,
            json!({ "selector": "#main" }),
            ContextId::Panel,
            None,
        );
        relays[0].send_message(m1.clone()).await.unwrap();
        assert_eq!(next(&mut at_tab).await.id, m1.id);

        let channel = host.channels_for(tab(3)).pop().unwrap();
        host.deliver(&channel, m1).unwrap();
        assert_silent(&mut at_tab).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_chosen_id_is_deduplicated() {
        let host = MemoryHost::new();
        let (_hub, relays) = mesh(&host, &[tab(3)]).await;
        let mut at_tab = collect(&relays[0], MessageType::Ping);

        let id: MessageId = "m1".parse().unwrap();
        let m1 = Message::with_id(id.clone(), MessageType::Ping, json!({}), ContextId::Panel, None);

        let channel = host.channels_for(tab(3)).pop().unwrap();
        host.deliver(&channel, m1.clone()).unwrap();
        host.deliver(&channel, m1).unwrap();

        assert_eq!(next(&mut at_tab).await.id, id);
        assert_silent(&mut at_tab).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_targeted_message_reaches_only_target() {
        let host = MemoryHost::new();
        let (hub, relays) = mesh(&host, &[ContextId::Panel, tab(3), tab(7)]).await;

        let mut at_tab3 = collect(&relays[1], Topic::All);
        let mut at_tab7 = collect(&relays[2], Topic::All);
        let mut at_hub = collect(&hub, Topic::All);

        relays[0]
            .send(MessageType::TagInject, json!({ "tag": "h1" }), Some(tab(7)))
            .await
            .unwrap();

        let received = next(&mut at_tab7).await;
        assert_eq!(received.target, Some(tab(7)));
        assert_eq!(next(&mut at_hub).await.id, received.id);
        assert_silent(&mut at_tab3).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_targeted_message_stays_at_hub() {
        let host = MemoryHost::new();
        let (hub, relays) = mesh(&host, &[ContextId::Panel, tab(3)]).await;

        let mut at_hub = collect(&hub, MessageType::ScreenshotRequest);
        let mut at_tab = collect(&relays[1], Topic::All);

        relays[0]
            .send(MessageType::ScreenshotRequest, json!({}), Some(ContextId::Hub))
            .await
            .unwrap();

        assert_eq!(next(&mut at_hub).await.target, Some(ContextId::Hub));
        assert_silent(&mut at_tab).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_target_is_dropped() {
        let host = MemoryHost::new();
        let (hub, relays) = mesh(&host, &[ContextId::Panel]).await;

        let outcome = hub
            .send(MessageType::TabClosed, json!({}), Some(tab(9)))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Routed { recipients: 0 });

        let mut at_panel = collect(&relays[0], Topic::All);
        assert_silent(&mut at_panel).await;
        assert_eq!(relays[0].pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_channel_loss() {
        let host = MemoryHost::new();
        let (hub, relays) = mesh(&host, &[tab(3)]).await;
        let tab3 = &relays[0];

        let mut states = tab3.watch_state();
        states.mark_unchanged();

        let channel = host.channels_for(tab(3)).pop().unwrap();
        assert!(host.disconnect(&channel, DisconnectReason::Error("reset".into())));

        states
            .wait_for(|state| *state != ConnectionState::Connected)
            .await
            .unwrap();
        eventually(|| tab3.state() == ConnectionState::Connected && hub.connection_count() == 1)
            .await;

        let mut at_hub = collect(&hub, MessageType::Pong);
        tab3.send(MessageType::Pong, json!({}), None).await.unwrap();
        assert_eq!(next(&mut at_hub).await.source, tab(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failures_keep_retrying() {
        let host = MemoryHost::new();
        let _hub = spawn_relay(&host, ContextId::Hub);
        host.refuse_next_opens(3);

        let panel = spawn_relay(&host, ContextId::Panel);
        eventually(|| panel.state() == ConnectionState::Connected).await;
        assert_eq!(host.open_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_invalidation_is_terminal() {
        let host = MemoryHost::new();
        let (_hub, relays) = mesh(&host, &[tab(3)]).await;
        let tab3 = &relays[0];

        host.invalidate();
        eventually(|| tab3.state() == ConnectionState::Invalidated).await;

        let attempts = host.open_attempts();
        let mut states = tab3.watch_state();
        states.mark_unchanged();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(host.open_attempts(), attempts);
        assert!(!states.has_changed().unwrap());

        let result = tab3.send(MessageType::Ping, json!({}), None).await;
        assert!(matches!(result, Err(Error::Invalidated { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_invalidation_is_terminal() {
        let host = MemoryHost::new();
        let (hub, relays) = mesh(&host, &[ContextId::Panel]).await;

        host.invalidate();
        eventually(|| hub.state() == ConnectionState::Invalidated).await;
        eventually(|| relays[0].state() == ConnectionState::Invalidated).await;
        assert_eq!(hub.connection_count(), 0);

        let mut states = hub.watch_state();
        states.mark_unchanged();
        sleep(Duration::from_secs(10)).await;
        assert!(!states.has_changed().unwrap());

        let result = hub.send(MessageType::Ping, json!({}), None).await;
        assert!(matches!(result, Err(Error::Invalidated { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_hub_notices_invalidation() {
        let host = MemoryHost::new();
        let hub = spawn_relay(&host, ContextId::Hub);
        eventually(|| hub.state() == ConnectionState::Listening).await;

        host.invalidate();
        eventually(|| hub.state() == ConnectionState::Invalidated).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_host_refuses_first_open() {
        let host = MemoryHost::new();
        host.invalidate();

        let panel = spawn_relay(&host, ContextId::Panel);
        eventually(|| panel.state() == ConnectionState::Invalidated).await;
        assert_eq!(host.open_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_post_is_requeued() {
        let host = MemoryHost::new();
        let (hub, relays) = mesh(&host, &[tab(3)]).await;
        let tab3 = &relays[0];
        let mut at_hub = collect(&hub, MessageType::ElementHovered);

        let channel = host.channels_for(tab(3)).pop().unwrap();
        host.fail_posts(&channel, true);

        for seq in 0..2 {
            let outcome = tab3
                .send(MessageType::ElementHovered, json!({ "seq": seq }), None)
                .await
                .unwrap();
            assert_eq!(outcome, SendOutcome::Queued);
        }
        assert_eq!(tab3.pending_count(), 2);

        host.fail_posts(&channel, false);
        let outcome = tab3
            .send(MessageType::ElementHovered, json!({ "seq": 2 }), None)
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Posted);

        for seq in 0..3 {
            assert_eq!(next(&mut at_hub).await.payload["seq"], seq);
        }
        assert_eq!(tab3.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_arrive_in_send_order() {
        let host = MemoryHost::new();
        let (hub, relays) = mesh(&host, &[ContextId::Panel]).await;
        let mut at_hub = collect(&hub, MessageType::StyleChanged);

        for seq in 0..20 {
            relays[0]
                .send(MessageType::StyleChanged, json!({ "seq": seq }), None)
                .await
                .unwrap();
        }
        for seq in 0..20 {
            assert_eq!(next(&mut at_hub).await.payload["seq"], seq);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_identity_reconnects_under_new_name() {
        let host = MemoryHost::new();
        let (hub, relays) = mesh(&host, &[tab(3)]).await;
        let relay = &relays[0];

        relay.set_identity(tab(4)).await.unwrap();
        assert_eq!(relay.identity(), tab(4));

        eventually(|| {
            relay.state() == ConnectionState::Connected
                && host.channels_for(tab(4)).len() == 1
                && host.channels_for(tab(3)).is_empty()
                && hub.connection_count() == 1
        })
        .await;
        assert_eq!(host.link_count(), 1);

        let mut at_relay = collect(relay, MessageType::TabActivated);
        hub.send(MessageType::TabActivated, json!({}), Some(tab(4)))
            .await
            .unwrap();
        assert_eq!(next(&mut at_relay).await.target, Some(tab(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_identity_clears_queue() {
        let host = MemoryHost::new();
        let relay = spawn_relay(&host, tab(3));

        relay.send(MessageType::Ping, json!({}), None).await.unwrap();
        relay.send(MessageType::Ping, json!({}), None).await.unwrap();
        assert_eq!(relay.pending_count(), 2);

        relay.set_identity(ContextId::Panel).await.unwrap();
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_same_identity_is_noop() {
        let host = MemoryHost::new();
        let (_hub, relays) = mesh(&host, &[ContextId::Panel]).await;
        let attempts = host.open_attempts();

        relays[0].set_identity(ContextId::Panel).await.unwrap();
        sleep(Duration::from_secs(1)).await;

        assert_eq!(relays[0].state(), ConnectionState::Connected);
        assert_eq!(host.open_attempts(), attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_handler_stops_receiving() {
        let host = MemoryHost::new();
        let (hub, relays) = mesh(&host, &[ContextId::Panel]).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = relays[0].subscribe(MessageType::Ping, move |m| {
            let _ = tx.send(m.clone());
        });

        hub.send(MessageType::Ping, json!({}), None).await.unwrap();
        next(&mut rx).await;

        assert!(subscription.unsubscribe());
        hub.send(MessageType::Ping, json!({}), None).await.unwrap();
        assert_silent(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_relay() {
        let host = MemoryHost::new();
        let relay = spawn_relay(&host, ContextId::Panel);

        relay.shutdown();
        sleep(Duration::from_millis(10)).await;

        let result = relay.send(MessageType::Ping, json!({}), None).await;
        assert!(matches!(result, Err(Error::RelayClosed)));
        assert!(matches!(
            relay.set_identity(tab(1)).await,
            Err(Error::RelayClosed)
        ));
    }
}
