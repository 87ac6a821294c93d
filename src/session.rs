//! ChatSession actor
//!
//! The central actor that owns all client-side chat state: the active
//! channel, its live subscription, the message store, typing records and the
//! reconnect schedule. [`ChatClient`](crate::client::ChatClient) handles talk
//! to it over an mpsc channel and observe it through watch channels, so no
//! locks guard the state itself.
//!
//! Only one channel is active at a time. Switching unsubscribes the previous
//! feed before anything else happens, and every envelope carries the
//! generation of the subscription that produced it so nothing queued from an
//! older feed reaches the new channel's store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{profile_or_placeholder, AuthProvider, ChangeFeed, ChatBackend, ProfileStore};
use crate::config::ChatConfig;
use crate::connection::{ConnectionMonitor, ConnectionState, Phase, Signal};
use crate::error::{ChatError, Result, SendFailure};
use crate::history::{HistoryLoad, HistoryLoader};
use crate::memory::{MemoryBackend, StaticAuth};
use crate::message::{Delivery, Message, NewMessage, SenderProfile, SentReceipt};
use crate::realtime::RealtimeFeed;
use crate::resolver::ChannelResolver;
use crate::rest::RestBackend;
use crate::sender::MessageSender;
use crate::store::MessageStore;
use crate::subscriber::{FeedEnvelope, FeedEvent, RealtimeSubscriber, Subscription};
use crate::typing::TypingIndicatorTracker;
use crate::types::{ChannelId, ChannelIdentity, MessageId, UserId};

/// Channel buffer size for feed envelopes
const FEED_BUFFER_SIZE: usize = 256;

/// Channel buffer size for finished sends
const COMPLETION_BUFFER_SIZE: usize = 64;

/// How often expired typing records are swept from the published view
const TYPING_PRUNE_INTERVAL: Duration = Duration::from_secs(1);

pub type SendResult = std::result::Result<SentReceipt, SendFailure>;

/// The collaborators a session talks to
#[derive(Clone)]
pub struct Services {
    pub backend: Arc<dyn ChatBackend>,
    pub auth: Arc<dyn AuthProvider>,
    pub profiles: Arc<dyn ProfileStore>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl Services {
    /// REST tables, session auth and the realtime socket of the hosted backend
    pub fn remote(config: &ChatConfig) -> Result<Self> {
        let rest = RestBackend::new(config)?;
        let auth = rest.session_auth();
        let rest = Arc::new(rest);
        Ok(Self {
            backend: rest.clone(),
            auth: Arc::new(auth),
            profiles: rest,
            feed: Arc::new(RealtimeFeed::new(config)),
        })
    }

    /// Every collaborator backed by one in-process store
    pub fn in_memory(backend: MemoryBackend, auth: StaticAuth) -> Self {
        let backend = Arc::new(backend);
        Self {
            backend: backend.clone(),
            auth: Arc::new(auth),
            profiles: backend.clone(),
            feed: backend,
        }
    }
}

/// Commands sent from client handles to the session actor
#[derive(Debug)]
pub enum SessionCommand {
    /// Make `name` the active channel
    SelectChannel {
        name: String,
        reply: oneshot::Sender<ChannelIdentity>,
    },
    /// Send a message to the active channel
    SendMessage {
        content: String,
        reply: oneshot::Sender<SendResult>,
    },
    /// Resend a message whose delivery failed
    RetryMessage {
        id: MessageId,
        reply: oneshot::Sender<SendResult>,
    },
    /// Drop a failed message from the view without sending it
    DiscardMessage {
        id: MessageId,
        reply: oneshot::Sender<()>,
    },
    /// Soft-delete a message
    DeleteMessage {
        id: MessageId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// The local user typed in the composer
    NotifyTyping {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Platform network reachability changed
    NetworkChanged {
        online: bool,
        reply: oneshot::Sender<ConnectionState>,
    },
    /// User asked to reconnect now
    Reconnect {
        reply: oneshot::Sender<ConnectionState>,
    },
    /// Fetch the active channel's history again
    ReloadHistory {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A delivery task that reached a terminal phase
struct SendCompletion {
    channel_id: ChannelId,
    local_id: MessageId,
    result: SendResult,
    reply: oneshot::Sender<SendResult>,
}

/// Read side of the session, published on every change
#[derive(Debug, Clone)]
pub struct ChatViews {
    /// Messages of the active channel, ascending
    pub messages: watch::Receiver<Vec<Message>>,
    pub connection: watch::Receiver<ConnectionState>,
    /// Other users typing in the active channel
    pub typing: watch::Receiver<Vec<UserId>>,
    pub channel: watch::Receiver<Option<ChannelIdentity>>,
    /// Most recent failure worth showing to the user
    pub last_error: watch::Receiver<Option<ChatError>>,
}

struct Outputs {
    messages: watch::Sender<Vec<Message>>,
    typing: watch::Sender<Vec<UserId>>,
    channel: watch::Sender<Option<ChannelIdentity>>,
    last_error: watch::Sender<Option<ChatError>>,
}

pub struct ChatSession {
    resolver: ChannelResolver,
    history: HistoryLoader,
    subscriber: RealtimeSubscriber,
    sender: Arc<MessageSender>,
    typing: TypingIndicatorTracker,
    connection: ConnectionMonitor,
    backend: Arc<dyn ChatBackend>,
    profiles: Arc<dyn ProfileStore>,
    local_user: Option<UserId>,
    local_profile: Option<SenderProfile>,
    history_limit: usize,
    query_timeout: Duration,
    profile_timeout: Duration,

    active: Option<ChannelIdentity>,
    subscription: Option<Subscription>,
    /// Bumped on every (re)subscribe
    generation: u64,
    store: MessageStore,
    network_available: bool,
    reconnect_at: Option<Instant>,

    receiver: mpsc::Receiver<SessionCommand>,
    feed_tx: mpsc::Sender<FeedEnvelope>,
    feed_rx: mpsc::Receiver<FeedEnvelope>,
    done_tx: mpsc::Sender<SendCompletion>,
    done_rx: mpsc::Receiver<SendCompletion>,
    outputs: Outputs,
}

impl ChatSession {
    pub fn new(services: Services, config: &ChatConfig, receiver: mpsc::Receiver<SessionCommand>) -> Self {
        let connection = ConnectionMonitor::new(config.reconnect);
        let local_user = services.auth.current_user();
        let timeouts = config.timeouts;

        let resolver = ChannelResolver::new(
            Arc::clone(&services.backend),
            Arc::clone(&services.auth),
            config.channel_kind,
            timeouts.query,
        );
        let history = HistoryLoader::new(
            Arc::clone(&services.backend),
            Arc::clone(&services.profiles),
            timeouts.query,
            timeouts.profile,
        );
        let subscriber = RealtimeSubscriber::new(
            Arc::clone(&services.feed),
            Arc::clone(&services.profiles),
            local_user,
            timeouts.subscribe,
            timeouts.profile,
        );
        let sender = MessageSender::new(
            Arc::clone(&services.backend),
            Arc::clone(&services.auth),
            config.retry,
            config.max_content_len,
        )
        .with_connection(connection.subscribe());
        let typing = TypingIndicatorTracker::new(Arc::clone(&services.backend), config.typing, timeouts.query)
            .with_connection(connection.subscribe());

        let (feed_tx, feed_rx) = mpsc::channel(FEED_BUFFER_SIZE);
        let (done_tx, done_rx) = mpsc::channel(COMPLETION_BUFFER_SIZE);

        Self {
            resolver,
            history,
            subscriber,
            sender: Arc::new(sender),
            typing,
            connection,
            backend: services.backend,
            profiles: services.profiles,
            local_user,
            local_profile: None,
            history_limit: config.history_limit,
            query_timeout: timeouts.query,
            profile_timeout: timeouts.profile,
            active: None,
            subscription: None,
            generation: 0,
            store: MessageStore::new(),
            network_available: true,
            reconnect_at: None,
            receiver,
            feed_tx,
            feed_rx,
            done_tx,
            done_rx,
            outputs: Outputs {
                messages: watch::channel(Vec::new()).0,
                typing: watch::channel(Vec::new()).0,
                channel: watch::channel(None).0,
                last_error: watch::channel(None).0,
            },
        }
    }

    pub fn views(&self) -> ChatViews {
        ChatViews {
            messages: self.outputs.messages.subscribe(),
            connection: self.connection.subscribe(),
            typing: self.outputs.typing.subscribe(),
            channel: self.outputs.channel.subscribe(),
            last_error: self.outputs.last_error.subscribe(),
        }
    }

    /// Run the session event loop
    ///
    /// Processes commands, feed events, finished sends and timers until every
    /// client handle has been dropped.
    pub async fn run(mut self) {
        info!("ChatSession started");

        let mut prune = tokio::time::interval(TYPING_PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reconnect_at = self.reconnect_at;
            let reconnect_due = async move {
                match reconnect_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(envelope) = self.feed_rx.recv() => self.handle_feed(envelope).await,
                Some(done) = self.done_rx.recv() => self.handle_send_finished(done),
                _ = reconnect_due => self.attempt_reconnect().await,
                _ = prune.tick() => self.publish_typing(),
            }
        }

        self.leave_channel().await;
        info!("ChatSession shutting down");
    }

    /// Process a single command
    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::SelectChannel { name, reply } => {
                let identity = self.select_channel(&name).await;
                let _ = reply.send(identity);
            }
            SessionCommand::SendMessage { content, reply } => {
                self.send_message(&content, reply).await;
            }
            SessionCommand::RetryMessage { id, reply } => {
                self.retry_message(id, reply).await;
            }
            SessionCommand::DiscardMessage { id, reply } => {
                debug!("Discarding message {}", id);
                self.update_store(|store| store.discard(id));
                let _ = reply.send(());
            }
            SessionCommand::DeleteMessage { id, reply } => {
                let result = self.delete_message(id).await;
                let _ = reply.send(result);
            }
            SessionCommand::NotifyTyping { reply } => {
                let result = self.notify_typing();
                let _ = reply.send(result);
            }
            SessionCommand::NetworkChanged { online, reply } => {
                self.network_changed(online).await;
                let _ = reply.send(self.connection.current());
            }
            SessionCommand::Reconnect { reply } => {
                self.manual_reconnect().await;
                let _ = reply.send(self.connection.current());
            }
            SessionCommand::ReloadHistory { reply } => {
                let result = self.reload_history().await;
                let _ = reply.send(result);
            }
        }
    }

    fn active_channel_id(&self) -> Option<ChannelId> {
        self.active.as_ref().and_then(|c| c.id())
    }

    // -- Channel lifecycle --

    async fn select_channel(&mut self, name: &str) -> ChannelIdentity {
        self.leave_channel().await;
        self.update_store(|_| MessageStore::new());

        let (identity, error) = self.resolver.resolve_reporting(name).await;
        info!("Active channel is now {}", identity);
        self.active = Some(identity.clone());
        self.outputs.channel.send_replace(Some(identity.clone()));
        self.set_error(error);

        if let Some(channel_id) = identity.id() {
            if let Err(e) = self.open_channel(channel_id).await {
                warn!("Live updates for {} unavailable: {}", identity, e);
                self.set_error(Some(e));
                self.connection_lost();
            }
        }
        identity
    }

    /// Load history and open the feed concurrently
    ///
    /// A failed history load is published but does not fail the call; only
    /// the subscription outcome is returned.
    async fn open_channel(&mut self, channel_id: ChannelId) -> Result<()> {
        self.generation += 1;
        let generation = self.generation;

        let (load, subscription) = tokio::join!(
            self.history.load(channel_id, self.history_limit),
            self.subscriber.subscribe(channel_id, generation, self.feed_tx.clone()),
        );
        self.apply_history(load);
        self.subscription = Some(subscription?);
        Ok(())
    }

    async fn leave_channel(&mut self) {
        self.drop_subscription().await;
        if let (Some(channel_id), Some(user)) = (self.active_channel_id(), self.local_user) {
            self.typing.clear(channel_id, user);
        }
        self.typing.reset();
        self.active = None;
        self.publish_typing();
    }

    async fn drop_subscription(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe().await;
        }
    }

    fn apply_history(&mut self, load: HistoryLoad) {
        match load.error {
            Some(e) => self.set_error(Some(e)),
            None => {
                self.set_error(None);
                self.update_store(|store| store.sync_history(load.messages, load.complete));
            }
        }
    }

    async fn reload_history(&mut self) -> Result<()> {
        let channel_id = self
            .active_channel_id()
            .ok_or_else(|| ChatError::Validation("No connected channel".to_string()))?;
        let load = self.history.load(channel_id, self.history_limit).await;
        let result = match &load.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        };
        self.apply_history(load);
        result
    }

    // -- Live feed --

    async fn handle_feed(&mut self, envelope: FeedEnvelope) {
        let current = self
            .subscription
            .as_ref()
            .map(|s| (s.channel_id(), s.generation()));
        if current != Some((envelope.channel_id, envelope.generation)) {
            debug!(
                "Dropping stale event from {} (generation {})",
                envelope.channel_id, envelope.generation
            );
            return;
        }

        match envelope.event {
            FeedEvent::Inserted(message) => self.update_store(|store| store.merge_insert(message)),
            FeedEvent::Deleted(id) => self.update_store(|store| store.merge_deletion(id)),
            FeedEvent::Typing(record) => {
                self.typing.observe(record);
                self.publish_typing();
            }
            FeedEvent::TypingCleared(user_id) => {
                self.typing.observe_cleared(envelope.channel_id, user_id);
                self.publish_typing();
            }
            FeedEvent::Status(status) if status.is_connected() => {
                if !self.connection.current().is_online() {
                    self.connection.apply(Signal::Subscribed);
                }
                self.reconnect_at = None;
            }
            FeedEvent::Status(status) => {
                warn!("Live feed for {} lost: {:?}", envelope.channel_id, status);
                self.drop_subscription().await;
                self.connection_lost();
            }
        }
    }

    // -- Connection --

    fn connection_lost(&mut self) {
        let state = self.connection.apply(Signal::NetworkLost);
        self.schedule_reconnect(&state);
    }

    fn schedule_reconnect(&mut self, state: &ConnectionState) {
        if state.phase != Phase::Reconnecting {
            self.reconnect_at = None;
            return;
        }
        if self.reconnect_at.is_none() {
            let interval = self.connection.policy().interval;
            debug!("Next reconnect attempt in {:?}", interval);
            self.reconnect_at = Some(Instant::now() + interval);
        }
    }

    fn needs_resubscribe(&self) -> bool {
        self.active.is_some() && self.subscription.is_none()
    }

    async fn network_changed(&mut self, online: bool) {
        self.network_available = online;
        if !online {
            info!("Network lost");
            self.drop_subscription().await;
            self.connection_lost();
            return;
        }

        info!("Network restored");
        let state = self.connection.apply(Signal::NetworkRestored);
        if state.phase == Phase::Reconnecting || self.needs_resubscribe() {
            self.attempt_reconnect().await;
        } else {
            self.reconnect_at = None;
        }
    }

    async fn manual_reconnect(&mut self) {
        let state = self.connection.apply(Signal::ManualRetry);
        if state.phase == Phase::Reconnecting || self.needs_resubscribe() {
            self.attempt_reconnect().await;
        }
    }

    async fn attempt_reconnect(&mut self) {
        self.reconnect_at = None;
        let attempt = self.connection.current().loop_attempts() + 1;
        info!(attempt, "Reconnecting");

        match self.reestablish().await {
            Ok(()) => {
                self.connection.apply(Signal::Subscribed);
            }
            Err(e) => {
                warn!(attempt, "Reconnect attempt failed: {}", e);
                let signal = if self.connection.phase() == Phase::Reconnecting {
                    Signal::AttemptFailed
                } else {
                    Signal::NetworkLost
                };
                let state = self.connection.apply(signal);
                if state.is_exhausted() {
                    self.set_error(Some(e));
                }
                self.schedule_reconnect(&state);
            }
        }
    }

    /// Re-open the active channel's feed and catch up on missed history
    async fn reestablish(&mut self) -> Result<()> {
        if !self.network_available {
            return Err(ChatError::Network("network unavailable".to_string()));
        }
        let Some(identity) = self.active.clone() else {
            return Ok(());
        };

        let channel_id = match identity.id() {
            Some(id) => id,
            None => {
                // A channel that only exists locally gets another resolve
                let (resolved, error) = self.resolver.resolve_reporting(identity.name()).await;
                let Some(id) = resolved.id() else {
                    return Err(error.unwrap_or_else(|| ChatError::Network("unresolved".to_string())));
                };
                info!("Channel {} is now connected", resolved);
                self.active = Some(resolved.clone());
                self.outputs.channel.send_replace(Some(resolved));
                id
            }
        };

        self.drop_subscription().await;
        self.open_channel(channel_id).await
    }

    // -- Sending --

    async fn prepare_send(&mut self, content: &str) -> Result<NewMessage> {
        let identity = self
            .active
            .clone()
            .ok_or_else(|| ChatError::Validation("No channel selected".to_string()))?;
        self.sender.prepare(&identity, content).await
    }

    async fn send_message(&mut self, content: &str, reply: oneshot::Sender<SendResult>) {
        match self.prepare_send(content).await {
            Ok(draft) => self.dispatch(draft, reply).await,
            Err(e) => {
                debug!("Send rejected: {}", e);
                let _ = reply.send(Err(SendFailure::from(e)));
            }
        }
    }

    async fn retry_message(&mut self, id: MessageId, reply: oneshot::Sender<SendResult>) {
        let content = match self.store.get(id) {
            Some(message) if message.delivery == Delivery::Failed => message.content.clone(),
            _ => {
                let error = ChatError::Validation("Only failed messages can be retried".to_string());
                let _ = reply.send(Err(SendFailure::from(error)));
                return;
            }
        };

        // The failed copy stays visible until the resend is accepted
        match self.prepare_send(&content).await {
            Ok(draft) => {
                self.update_store(|store| store.discard(id));
                self.dispatch(draft, reply).await;
            }
            Err(e) => {
                let _ = reply.send(Err(SendFailure::from(e)));
            }
        }
    }

    /// Show the optimistic copy and hand delivery to a background task
    async fn dispatch(&mut self, draft: NewMessage, reply: oneshot::Sender<SendResult>) {
        let profile = self.profile_of(draft.sender_id).await;
        let optimistic = Message::optimistic(&draft, Some(profile), Utc::now());
        self.update_store(|store| store.add_optimistic(optimistic));

        self.typing.clear(draft.channel_id, draft.sender_id);
        self.publish_typing();

        let sender = Arc::clone(&self.sender);
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let result = sender.deliver(&draft).await;
            let completion = SendCompletion {
                channel_id: draft.channel_id,
                local_id: draft.id,
                result,
                reply,
            };
            if done.send(completion).await.is_err() {
                debug!("Session gone before message {} finished", draft.id);
            }
        });
    }

    fn handle_send_finished(&mut self, done: SendCompletion) {
        let SendCompletion {
            channel_id,
            local_id,
            result,
            reply,
        } = done;

        let visible = self.active_channel_id() == Some(channel_id) && self.store.get(local_id).is_some();
        if visible {
            match &result {
                Ok(receipt) => {
                    let receipt = *receipt;
                    self.update_store(|store| store.confirm(local_id, receipt));
                }
                Err(failure) => {
                    self.set_error(Some(failure.error.clone()));
                    self.update_store(|store| store.mark_failed(local_id));
                }
            }
        }
        let _ = reply.send(result);
    }

    async fn profile_of(&mut self, user: UserId) -> SenderProfile {
        if let Some(profile) = self.local_profile.as_ref().filter(|p| p.id == user) {
            return profile.clone();
        }
        let profile = profile_or_placeholder(&self.profiles, user, self.profile_timeout).await;
        self.local_profile = Some(profile.clone());
        profile
    }

    async fn delete_message(&mut self, id: MessageId) -> Result<()> {
        match self.store.get(id).map(|m| m.delivery) {
            Some(Delivery::Pending) => {
                return Err(ChatError::Validation("Message is still being sent".to_string()));
            }
            Some(Delivery::Failed) => {
                // Never reached the server; nothing to delete remotely
                self.update_store(|store| store.discard(id));
                return Ok(());
            }
            _ => {}
        }

        match tokio::time::timeout(self.query_timeout, self.backend.soft_delete_message(id)).await {
            Ok(Ok(())) => {
                info!("Message {} deleted", id);
                self.update_store(|store| store.merge_deletion(id));
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ChatError::Timeout(self.query_timeout)),
        }
    }

    // -- Typing --

    fn notify_typing(&mut self) -> Result<()> {
        let user = self.local_user.ok_or(ChatError::Auth)?;
        let channel_id = self
            .active_channel_id()
            .ok_or_else(|| ChatError::Validation("No connected channel".to_string()))?;
        self.typing.notify_typing(channel_id, user)?;
        self.publish_typing();
        Ok(())
    }

    fn publish_typing(&mut self) {
        let now = Utc::now();
        let pruned = self.typing.prune(now);
        if pruned > 0 {
            debug!("Pruned {} expired typing record(s)", pruned);
        }

        let users: Vec<UserId> = match self.active_channel_id() {
            Some(channel_id) => self
                .typing
                .active(channel_id, now)
                .into_iter()
                .filter(|u| Some(*u) != self.local_user)
                .collect(),
            None => Vec::new(),
        };
        self.outputs.typing.send_if_modified(|current| {
            if *current == users {
                return false;
            }
            *current = users;
            true
        });
    }

    // -- Outputs --

    fn update_store(&mut self, apply: impl FnOnce(MessageStore) -> MessageStore) {
        self.store = apply(std::mem::take(&mut self.store));
        self.outputs.messages.send_replace(self.store.messages().to_vec());
    }

    fn set_error(&mut self, error: Option<ChatError>) {
        self.outputs.last_error.send_if_modified(|current| {
            if *current == error {
                return false;
            }
            *current = error;
            true
        });
    }
}
