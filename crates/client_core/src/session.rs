//! The chat session: a handle the application talks to, backed by a single
//! actor task that owns the connection, the conversation store, the
//! reconciler and the presence tracker. Commands and inbound frames are
//! applied one at a time, in arrival order.

use std::{future::pending, sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{ConversationId, MessageId, TempMessageId, UserId},
    error::ProtocolFault,
    protocol::{
        ConversationSummary, CreateConversationRequest, DecodeError, InboundEvent, MessagePage,
        MessagePayload, OutboundAction, SearchHit, UserSummary,
    },
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::EngineConfig,
    connection::{ConnectionManager, ConnectionStatus, LinkEvent, Reconnect, Sent},
    delivery::{DeliveryEvent, DeliveryStatus},
    error::{ClientError, ClientResult},
    gateway::{ComposeDraft, GatewayOutcome, ScheduledDeliveryGateway, SendRoute},
    presence::PresenceTracker,
    reconciler::{MessageReconciler, Reconciled},
    side_channel::MessageStore,
    store::ConversationStore,
    transport::Connector,
    types::{Conversation, Message, MessageKey},
};

/// User-actionable failures, surfaced once each.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    ProtocolError(ProtocolFault),
    UploadFailed {
        conversation_id: ConversationId,
        reason: String,
    },
}

/// Incremental state changes for renderers. Each event describes one diff.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionChanged {
        status: ConnectionStatus,
        reconnect_attempts: u32,
    },
    /// Reconnection gave up. Emitted at most once per session.
    ConnectionLost { attempts: u32 },
    ConversationsLoaded(Vec<Conversation>),
    ConversationUpdated(Conversation),
    ConversationRemoved(ConversationId),
    ActiveConversationChanged(Option<ConversationId>),
    MessageInserted(Message),
    MessageReplaced {
        temp_id: TempMessageId,
        message: Message,
    },
    MessageStatusChanged {
        key: MessageKey,
        status: DeliveryStatus,
    },
    MessageRemoved {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    HistoryLoaded {
        conversation_id: ConversationId,
        added: usize,
    },
    TypingChanged {
        conversation_id: ConversationId,
        user_ids: Vec<UserId>,
    },
    Notification(Notice),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub queued_actions: usize,
    pub active: Option<ConversationId>,
    pub conversations: Vec<Conversation>,
    /// Remote users typing in the active conversation.
    pub typing: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendReceipt {
    /// Sent live and rendered optimistically as this placeholder.
    Pending(Message),
    /// Accepted by the side-channel for deferred delivery.
    Scheduled,
    /// Stored immediately by the side-channel.
    Stored(Option<MessageId>),
}

type Reply<T> = oneshot::Sender<ClientResult<T>>;

enum Command {
    Connect {
        reply: Reply<ConnectionStatus>,
    },
    LoadConversations {
        summaries: Vec<ConversationSummary>,
        replace: bool,
        reply: Reply<Vec<Conversation>>,
    },
    AddConversation {
        summary: ConversationSummary,
        reply: Reply<Conversation>,
    },
    DropConversation {
        conversation_id: ConversationId,
        reply: Reply<()>,
    },
    Select {
        conversation_id: ConversationId,
        reply: Reply<()>,
    },
    OldestMessage {
        conversation_id: ConversationId,
        reply: Reply<Option<MessageId>>,
    },
    HistoryLoaded {
        conversation_id: ConversationId,
        page: Vec<MessagePayload>,
        reply: Reply<usize>,
    },
    MarkRead {
        conversation_id: ConversationId,
        reply: Reply<()>,
    },
    Keystroke {
        conversation_id: ConversationId,
        reply: Reply<()>,
    },
    SendLive {
        conversation_id: ConversationId,
        content: String,
        reply: Reply<Message>,
    },
    Stored {
        payload: MessagePayload,
        reply: Reply<()>,
    },
    RemoveMessage {
        message_id: MessageId,
        reply: Reply<()>,
    },
    Messages {
        conversation_id: ConversationId,
        reply: Reply<Vec<Message>>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct ChatSession {
    local_user: UserId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    store: Arc<dyn MessageStore>,
    gateway: ScheduledDeliveryGateway,
    history_page_size: u32,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    /// Spawns the session actor. Must be called inside a tokio runtime.
    pub fn start(
        config: EngineConfig,
        local_user: UserId,
        connector: Arc<dyn Connector>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer);
        let (events, _) = broadcast::channel(config.event_buffer);
        let actor = SessionActor {
            ack_timeout: config.ack_timeout,
            commands: commands_rx,
            events: events.clone(),
            connection: ConnectionManager::new(connector, &config),
            store: ConversationStore::new(local_user),
            reconciler: MessageReconciler::new(),
            presence: PresenceTracker::new(config.typing_debounce, config.typing_ttl),
            lost_reported: false,
        };
        let handle = tokio::spawn(actor.run());
        info!(user_id = local_user.0, "session: started");

        Self {
            local_user,
            commands: commands_tx,
            events,
            gateway: ScheduledDeliveryGateway::new(Arc::clone(&store)),
            store,
            history_page_size: config.history_page_size,
            actor: Mutex::new(Some(handle)),
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Same feed as `subscribe`, as a `Stream`. Lagging consumers see an
    /// error item instead of silently missing diffs.
    pub fn event_stream(&self) -> BroadcastStream<SessionEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Opens the live connection. Idempotent while connecting or open;
    /// fails once the session has been declared lost.
    pub async fn connect(&self) -> ClientResult<ConnectionStatus> {
        self.request(|reply| Command::Connect { reply }).await
    }

    pub async fn initial_sync(&self) -> ClientResult<Vec<Conversation>> {
        let summaries = self.store.list_conversations().await?;
        self.request(|reply| Command::LoadConversations {
            summaries,
            replace: false,
            reply,
        })
        .await
    }

    pub async fn refresh_conversations(&self) -> ClientResult<Vec<Conversation>> {
        let summaries = self.store.list_conversations().await?;
        self.request(|reply| Command::LoadConversations {
            summaries,
            replace: true,
            reply,
        })
        .await
    }

    pub async fn list_users(&self) -> ClientResult<Vec<UserSummary>> {
        Ok(self.store.list_users().await?)
    }

    pub async fn create_conversation(
        &self,
        participant_ids: Vec<UserId>,
        name: Option<String>,
    ) -> ClientResult<Conversation> {
        if participant_ids.is_empty() {
            return Err(ClientError::Validation(
                "a conversation needs at least one other participant".to_string(),
            ));
        }
        let request = CreateConversationRequest {
            is_group: participant_ids.len() > 1,
            participant_ids,
            name,
        };
        let summary = self.store.create_conversation(request).await?;
        self.request(|reply| Command::AddConversation { summary, reply })
            .await
    }

    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> ClientResult<()> {
        self.store.delete_conversation(conversation_id).await?;
        self.request(|reply| Command::DropConversation {
            conversation_id,
            reply,
        })
        .await
    }

    /// Makes a conversation active, joins it on the live connection and
    /// loads its most recent history page. Returns how many messages the
    /// page added.
    pub async fn select_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> ClientResult<usize> {
        self.request(|reply| Command::Select {
            conversation_id,
            reply,
        })
        .await?;
        self.load_history(conversation_id, None).await
    }

    /// Loads the page before the oldest message currently known.
    pub async fn load_older(&self, conversation_id: ConversationId) -> ClientResult<usize> {
        let before = self
            .request(|reply| Command::OldestMessage {
                conversation_id,
                reply,
            })
            .await?;
        self.load_history(conversation_id, before).await
    }

    pub async fn mark_read(&self, conversation_id: ConversationId) -> ClientResult<()> {
        self.request(|reply| Command::MarkRead {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn keystroke(&self, conversation_id: ConversationId) -> ClientResult<()> {
        self.request(|reply| Command::Keystroke {
            conversation_id,
            reply,
        })
        .await
    }

    /// Sends a composed message over the live connection or the
    /// side-channel, whichever its content and delivery option call for.
    pub async fn send(&self, draft: ComposeDraft) -> ClientResult<SendReceipt> {
        draft.validate()?;
        if draft.route() == SendRoute::Live {
            let ComposeDraft {
                conversation_id,
                content,
                ..
            } = draft;
            let placeholder = self
                .request(|reply| Command::SendLive {
                    conversation_id,
                    content,
                    reply,
                })
                .await?;
            return Ok(SendReceipt::Pending(placeholder));
        }

        let conversation_id = draft.conversation_id;
        match self.gateway.submit(draft).await {
            Ok(GatewayOutcome::Scheduled) => Ok(SendReceipt::Scheduled),
            Ok(GatewayOutcome::Confirmed(None)) => Ok(SendReceipt::Stored(None)),
            Ok(GatewayOutcome::Confirmed(Some(payload))) => {
                let message_id = payload.id;
                self.request(|reply| Command::Stored { payload, reply })
                    .await?;
                Ok(SendReceipt::Stored(Some(message_id)))
            }
            Err(err) => {
                if let ClientError::Upload { reason, .. } = &err {
                    let _ = self
                        .events
                        .send(SessionEvent::Notification(Notice::UploadFailed {
                            conversation_id,
                            reason: reason.clone(),
                        }));
                }
                Err(err)
            }
        }
    }

    pub async fn delete_message(&self, message_id: MessageId) -> ClientResult<()> {
        self.store.delete_message(message_id).await?;
        self.request(|reply| Command::RemoveMessage { message_id, reply })
            .await
    }

    /// Archived messages leave the conversation view like deleted ones.
    pub async fn archive_message(&self, message_id: MessageId) -> ClientResult<()> {
        self.store.archive_message(message_id).await?;
        self.request(|reply| Command::RemoveMessage { message_id, reply })
            .await
    }

    pub async fn search_messages(
        &self,
        conversation_id: ConversationId,
        query: &str,
    ) -> ClientResult<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ClientError::Validation("search query is empty".to_string()));
        }
        Ok(self.store.search_messages(conversation_id, query).await?)
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> ClientResult<Vec<Message>> {
        self.request(|reply| Command::Messages {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> ClientResult<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Closes the connection and stops the actor. Pending timers go with it.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
        if let Some(handle) = self.actor.lock().await.take() {
            if let Err(err) = handle.await {
                warn!("session: actor task ended abnormally: {err}");
            }
        }
    }

    async fn load_history(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
    ) -> ClientResult<usize> {
        let page = MessagePage {
            limit: self.history_page_size,
            before,
        };
        let page = self.store.list_messages(conversation_id, page).await?;
        self.request(|reply| Command::HistoryLoaded {
            conversation_id,
            page,
            reply,
        })
        .await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> ClientResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ClientError::SessionClosed)?;
        response.await.map_err(|_| ClientError::SessionClosed)?
    }
}

struct SessionActor {
    ack_timeout: Option<Duration>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<SessionEvent>,
    connection: ConnectionManager,
    store: ConversationStore,
    reconciler: MessageReconciler,
    presence: PresenceTracker,
    lost_reported: bool,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            let timer = self.next_timer();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                event = self.connection.next_event() => self.handle_link_event(event).await,
                _ = sleep_until_opt(timer) => self.handle_timers().await,
            }
        }
        debug!("session: actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::LoadConversations {
                summaries,
                replace,
                reply,
            } => {
                let _ = reply.send(self.load_conversations(summaries, replace));
            }
            Command::AddConversation { summary, reply } => {
                let conversation = Conversation::from(summary);
                let result = if self.store.insert(conversation.clone()) {
                    self.publish(SessionEvent::ConversationUpdated(conversation.clone()));
                    Ok(conversation)
                } else {
                    Err(ClientError::UnknownConversation(conversation.id))
                };
                let _ = reply.send(result);
            }
            Command::DropConversation {
                conversation_id,
                reply,
            } => {
                self.drop_conversation(conversation_id);
                let _ = reply.send(Ok(()));
            }
            Command::Select {
                conversation_id,
                reply,
            } => {
                let result = self.select(conversation_id).await;
                let _ = reply.send(result);
            }
            Command::OldestMessage {
                conversation_id,
                reply,
            } => {
                let result = self
                    .known(conversation_id)
                    .map(|()| self.store.oldest_server_message(conversation_id));
                let _ = reply.send(result);
            }
            Command::HistoryLoaded {
                conversation_id,
                page,
                reply,
            } => {
                let _ = reply.send(self.merge_history(conversation_id, page));
            }
            Command::MarkRead {
                conversation_id,
                reply,
            } => {
                let result = self.mark_read(conversation_id).await;
                let _ = reply.send(result);
            }
            Command::Keystroke {
                conversation_id,
                reply,
            } => {
                let result = self.keystroke(conversation_id).await;
                let _ = reply.send(result);
            }
            Command::SendLive {
                conversation_id,
                content,
                reply,
            } => {
                let result = self.send_live(conversation_id, content).await;
                let _ = reply.send(result);
            }
            Command::Stored { payload, reply } => {
                let outcome = self.reconciler.apply_stored(&mut self.store, payload);
                self.publish_reconciled(outcome);
                let _ = reply.send(Ok(()));
            }
            Command::RemoveMessage { message_id, reply } => {
                if let Some(message) = self.store.remove_message(message_id) {
                    self.publish(SessionEvent::MessageRemoved {
                        conversation_id: message.conversation_id,
                        message_id,
                    });
                }
                let _ = reply.send(Ok(()));
            }
            Command::Messages {
                conversation_id,
                reply,
            } => {
                let result = self
                    .known(conversation_id)
                    .map(|()| self.store.messages(conversation_id).to_vec());
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(text) => self.dispatch_frame(&text),
            LinkEvent::Closed(reason) => {
                match reason {
                    Some(err) => warn!("session: link failed: {err:#}"),
                    None => info!("session: link closed by peer"),
                }
                self.on_link_down();
            }
            LinkEvent::HeartbeatDue => {
                let ping = OutboundAction::Ping {
                    timestamp: Utc::now().timestamp_millis(),
                };
                self.transmit(ping).await;
            }
            LinkEvent::ReconnectDue => self.establish().await,
        }
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();
        for stop in self.presence.poll_local(now) {
            self.transmit(stop).await;
        }
        for conversation_id in self.presence.expire_remote(now) {
            self.publish_typing(conversation_id);
        }
        if let Some(timeout) = self.ack_timeout {
            let expired = self
                .reconciler
                .expire_unacknowledged(&mut self.store, now, timeout);
            for (temp_id, status) in expired {
                warn!(%temp_id, "session: send was not acknowledged in time");
                self.publish(SessionEvent::MessageStatusChanged {
                    key: MessageKey::Local(temp_id),
                    status,
                });
            }
        }
    }

    fn next_timer(&self) -> Option<Instant> {
        let ack = self
            .ack_timeout
            .and_then(|timeout| self.reconciler.next_ack_deadline(timeout));
        [self.presence.next_deadline(), ack].into_iter().flatten().min()
    }

    // Connection lifecycle.

    async fn connect(&mut self) -> ClientResult<ConnectionStatus> {
        match self.connection.status() {
            ConnectionStatus::Lost => {
                return Err(ClientError::ConnectionLost {
                    attempts: self.connection.reconnect_attempts(),
                })
            }
            ConnectionStatus::Closed if !self.connection.reconnect_pending() => {
                self.establish().await
            }
            _ => {}
        }
        Ok(self.connection.status())
    }

    async fn establish(&mut self) {
        self.publish(SessionEvent::ConnectionChanged {
            status: ConnectionStatus::Connecting,
            reconnect_attempts: self.connection.reconnect_attempts(),
        });
        match self.connection.open().await {
            Ok(()) => self.on_open().await,
            Err(err) => {
                warn!("session: connect failed: {err:#}");
                self.on_link_down();
            }
        }
    }

    async fn on_open(&mut self) {
        info!(
            user_id = self.store.local_user().0,
            "session: connection open"
        );
        self.publish_status();

        let flush = self.connection.flush_queue().await;
        let now = Instant::now();
        for action in &flush.written {
            if let OutboundAction::SendMessage { client_ref, .. } = action {
                self.reconciler.mark_written(*client_ref, now);
            }
        }
        if !flush.written.is_empty() {
            debug!(
                replayed = flush.written.len(),
                "session: outbound queue replayed"
            );
        }
        if let Some(err) = flush.error {
            warn!("session: queue replay failed: {err:#}");
            self.on_link_down();
            return;
        }

        if let Some(conversation_id) = self.store.active() {
            self.transmit(OutboundAction::JoinConversation { conversation_id })
                .await;
        }
    }

    fn on_link_down(&mut self) {
        self.connection.drop_link();
        match self.connection.schedule_reconnect(Instant::now()) {
            Reconnect::Scheduled { attempt, delay } => {
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "session: reconnect scheduled"
                );
                self.publish_status();
            }
            Reconnect::Exhausted { attempts } => {
                error!(attempts, "session: reconnection exhausted, connection lost");
                self.publish_status();
                for (temp_id, status) in self.reconciler.fail_all(&mut self.store) {
                    self.publish(SessionEvent::MessageStatusChanged {
                        key: MessageKey::Local(temp_id),
                        status,
                    });
                }
                if !self.lost_reported {
                    self.lost_reported = true;
                    self.publish(SessionEvent::ConnectionLost { attempts });
                }
            }
        }
    }

    async fn transmit(&mut self, action: OutboundAction) {
        let kind = action.kind();
        let client_ref = match &action {
            OutboundAction::SendMessage { client_ref, .. } => Some(*client_ref),
            _ => None,
        };
        match self.connection.send_or_queue(action).await {
            Ok(Sent::Written) => {
                if let Some(client_ref) = client_ref {
                    self.reconciler.mark_written(client_ref, Instant::now());
                }
                trace!(kind, "session: action written");
            }
            Ok(Sent::Queued) => debug!(kind, "session: action queued until reconnect"),
            Ok(Sent::Dropped) => debug!(kind, "session: action dropped"),
            Err(err) => {
                warn!(kind, "session: write failed: {err:#}");
                self.on_link_down();
            }
        }
    }

    async fn teardown(&mut self) {
        self.connection.close().await;
        self.presence.reset();
        self.publish_status();
        info!("session: closed");
    }

    // Inbound dispatch.

    fn dispatch_frame(&mut self, text: &str) {
        match InboundEvent::decode(text) {
            Ok(event) => self.dispatch(event),
            Err(DecodeError::UnknownType(kind)) => {
                warn!(kind = %kind, "session: unknown event type discarded")
            }
            Err(err) => warn!("session: undecodable frame discarded: {err}"),
        }
    }

    fn dispatch(&mut self, event: InboundEvent) {
        trace!(kind = event.kind(), "session: inbound event");
        match event {
            InboundEvent::ConnectionEstablished(payload) => {
                info!(
                    user_id = ?payload.user_id.map(|id| id.0),
                    "session: handshake acknowledged"
                );
            }
            InboundEvent::NewMessage(payload) => {
                let (conversation_id, sender_id) = (payload.conversation_id, payload.sender_id);
                let outcome = self.reconciler.apply_confirmed(&mut self.store, payload);
                self.publish_reconciled(outcome);
                if self.presence.remote_stopped(conversation_id, sender_id) {
                    self.publish_typing(conversation_id);
                }
            }
            InboundEvent::UserTyping(payload) => {
                if payload.user_id == self.store.local_user()
                    || !self.store.is_active(payload.conversation_id)
                {
                    return;
                }
                let changed = self.presence.remote_started(
                    payload.conversation_id,
                    payload.user_id,
                    Instant::now(),
                );
                if changed {
                    self.publish_typing(payload.conversation_id);
                }
            }
            InboundEvent::UserStoppedTyping(payload) => {
                if self
                    .presence
                    .remote_stopped(payload.conversation_id, payload.user_id)
                {
                    self.publish_typing(payload.conversation_id);
                }
            }
            InboundEvent::MessageRead(payload) => {
                if payload.reader_id == Some(self.store.local_user()) {
                    return;
                }
                self.apply_delivery(
                    MessageKey::Server(payload.message_id),
                    DeliveryEvent::ReadReceipt,
                );
            }
            InboundEvent::UserStatusChanged(payload) => {
                for conversation in self.store.set_online(payload.user_id, payload.is_online) {
                    self.publish(SessionEvent::ConversationUpdated(conversation));
                }
            }
            InboundEvent::ScheduledMessageDelivered(payload) => {
                let outcome = self.reconciler.apply_scheduled(&mut self.store, payload);
                self.publish_reconciled(outcome);
            }
            InboundEvent::MessageSent(payload) => {
                self.apply_delivery(
                    MessageKey::Server(payload.message_id),
                    DeliveryEvent::SendConfirmed,
                );
            }
            InboundEvent::MessageDelivered(payload) => {
                self.apply_delivery(
                    MessageKey::Server(payload.message_id),
                    DeliveryEvent::Delivered,
                );
            }
            InboundEvent::Pong(payload) => {
                trace!(timestamp = ?payload.timestamp, "session: pong");
            }
            InboundEvent::Error(fault) => {
                warn!(code = ?fault.code, "session: server error: {}", fault.message);
                if let Some(message_id) = fault.message_id {
                    self.apply_delivery(MessageKey::Server(message_id), DeliveryEvent::Rejected);
                }
                if let Some(temp_id) = fault.client_ref {
                    if let Some(status) = self.reconciler.reject(&mut self.store, temp_id) {
                        self.publish(SessionEvent::MessageStatusChanged {
                            key: MessageKey::Local(temp_id),
                            status,
                        });
                    }
                }
                self.publish(SessionEvent::Notification(Notice::ProtocolError(fault)));
            }
        }
    }

    fn apply_delivery(&mut self, key: MessageKey, event: DeliveryEvent) {
        if let Some(status) = self.store.apply_delivery(key, event) {
            self.publish(SessionEvent::MessageStatusChanged { key, status });
        }
    }

    // Conversation state.

    fn known(&self, conversation_id: ConversationId) -> ClientResult<()> {
        if self.store.accepts(conversation_id) {
            Ok(())
        } else {
            Err(ClientError::UnknownConversation(conversation_id))
        }
    }

    fn load_conversations(
        &mut self,
        summaries: Vec<ConversationSummary>,
        replace: bool,
    ) -> ClientResult<Vec<Conversation>> {
        let conversations = summaries.into_iter().map(Conversation::from).collect();
        let active_before = self.store.active();
        if replace {
            self.store.replace_all(conversations);
        } else {
            self.store.load(conversations)?;
        }

        let list = self.store.conversations();
        info!(count = list.len(), replace, "session: conversations loaded");
        self.publish(SessionEvent::ConversationsLoaded(list.clone()));
        if self.store.active() != active_before {
            self.publish(SessionEvent::ActiveConversationChanged(self.store.active()));
        }
        Ok(list)
    }

    fn drop_conversation(&mut self, conversation_id: ConversationId) {
        let was_active = self.store.is_active(conversation_id);
        self.store.delete(conversation_id);
        self.reconciler.forget_conversation(conversation_id);
        self.presence.stop_local(conversation_id);
        self.presence.clear_remote(conversation_id);
        self.publish(SessionEvent::ConversationRemoved(conversation_id));
        if was_active {
            self.publish(SessionEvent::ActiveConversationChanged(None));
        }
    }

    async fn select(&mut self, conversation_id: ConversationId) -> ClientResult<()> {
        let selection = self.store.select(conversation_id)?;
        if selection.previous == Some(conversation_id) {
            return Ok(());
        }
        if let Some(previous) = selection.previous {
            if let Some(stop) = self.presence.stop_local(previous) {
                self.transmit(stop).await;
            }
            if self.presence.clear_remote(previous) {
                self.publish_typing(previous);
            }
        }
        self.publish(SessionEvent::ActiveConversationChanged(Some(
            conversation_id,
        )));
        // A closed link re-joins the active conversation when it reopens.
        if self.connection.is_open() {
            self.transmit(OutboundAction::JoinConversation { conversation_id })
                .await;
        }
        Ok(())
    }

    fn merge_history(
        &mut self,
        conversation_id: ConversationId,
        page: Vec<MessagePayload>,
    ) -> ClientResult<usize> {
        self.known(conversation_id)?;
        let local_user = self.store.local_user();
        let messages = page
            .into_iter()
            .filter(|payload| payload.conversation_id == conversation_id)
            .map(|payload| {
                let status = if payload.sender_id == local_user {
                    DeliveryStatus::Sent
                } else {
                    DeliveryStatus::Delivered
                };
                Message::confirmed(payload, status)
            })
            .collect();
        let added = self.store.merge_history(conversation_id, messages);
        self.publish(SessionEvent::HistoryLoaded {
            conversation_id,
            added,
        });
        Ok(added)
    }

    async fn mark_read(&mut self, conversation_id: ConversationId) -> ClientResult<()> {
        let newest = self.store.mark_read(conversation_id)?;
        if let Some(conversation) = self.store.conversation(conversation_id).cloned() {
            self.publish(SessionEvent::ConversationUpdated(conversation));
        }
        if let Some(message_id) = newest {
            self.transmit(OutboundAction::MarkRead { message_id }).await;
        }
        Ok(())
    }

    async fn keystroke(&mut self, conversation_id: ConversationId) -> ClientResult<()> {
        self.known(conversation_id)?;
        if let Some(start) = self.presence.keystroke(conversation_id, Instant::now()) {
            self.transmit(start).await;
        }
        Ok(())
    }

    async fn send_live(
        &mut self,
        conversation_id: ConversationId,
        content: String,
    ) -> ClientResult<Message> {
        self.known(conversation_id)?;
        if self.connection.status() == ConnectionStatus::Lost {
            return Err(ClientError::ConnectionLost {
                attempts: self.connection.reconnect_attempts(),
            });
        }

        let placeholder =
            self.reconciler
                .stage_local_send(&mut self.store, conversation_id, content.clone());
        self.publish(SessionEvent::MessageInserted(placeholder.clone()));
        if let Some(conversation) = self.store.conversation(conversation_id).cloned() {
            self.publish(SessionEvent::ConversationUpdated(conversation));
        }

        if let Some(stop) = self.presence.stop_local(conversation_id) {
            self.transmit(stop).await;
        }
        if let MessageKey::Local(client_ref) = placeholder.key {
            self.transmit(OutboundAction::SendMessage {
                conversation_id,
                content,
                client_ref,
            })
            .await;
        }
        Ok(placeholder)
    }

    // Publishing.

    fn snapshot(&self) -> SessionSnapshot {
        let active = self.store.active();
        SessionSnapshot {
            status: self.connection.status(),
            reconnect_attempts: self.connection.reconnect_attempts(),
            queued_actions: self.connection.queued(),
            active,
            conversations: self.store.conversations(),
            typing: active
                .map(|conversation_id| self.presence.typing_users(conversation_id))
                .unwrap_or_default(),
        }
    }

    fn publish_reconciled(&self, outcome: Reconciled) {
        match outcome {
            Reconciled::Replaced {
                temp_id,
                message,
                conversation,
            } => {
                self.publish(SessionEvent::MessageReplaced { temp_id, message });
                if let Some(conversation) = conversation {
                    self.publish(SessionEvent::ConversationUpdated(conversation));
                }
            }
            Reconciled::Inserted {
                message,
                conversation,
            } => {
                self.publish(SessionEvent::MessageInserted(message));
                if let Some(conversation) = conversation {
                    self.publish(SessionEvent::ConversationUpdated(conversation));
                }
            }
            Reconciled::Duplicate(message_id) => {
                debug!(message_id = message_id.0, "session: duplicate message ignored");
            }
            Reconciled::Ignored(conversation_id) => {
                debug!(
                    conversation_id = conversation_id.0,
                    "session: message for unknown conversation ignored"
                );
            }
        }
    }

    fn publish_typing(&self, conversation_id: ConversationId) {
        self.publish(SessionEvent::TypingChanged {
            conversation_id,
            user_ids: self.presence.typing_users(conversation_id),
        });
    }

    fn publish_status(&self) {
        self.publish(SessionEvent::ConnectionChanged {
            status: self.connection.status(),
            reconnect_attempts: self.connection.reconnect_attempts(),
        });
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
