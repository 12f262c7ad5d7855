//! Client orchestration: subscriptions, publishing and connection routing.
//!
//! [`Client`] is a cheap, cloneable handle. Its methods validate input and
//! hand work to a single routing task that owns every subscription, the
//! publish queue and the view of the connection state. Connection events are
//! forwarded into the same queue, so caller commands and inbound frames are
//! never routed concurrently.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures_util::FutureExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{ClientOptions, ConfigError};
use crate::rest::{RestClient, RestError, StreamRecord};
use crate::stream::connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionListener, ConnectionState,
};
use crate::stream::proto::{
    ProtocolError, PublishRequest, Request, ResendOptions, ResendRequest, Response,
    StreamMessage, SubscribeRequest, UnsubscribeRequest,
};
use crate::stream::registry::SubscriptionRegistry;
use crate::stream::session::{SessionToken, TokenFetcher};
use crate::stream::subscription::{
    Subscription, SubscriptionError, SubscriptionEvent, SubscriptionId, SubscriptionState,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The initial session token could not be fetched.
    #[error("session token fetch failed: {0}")]
    Session(RestError),

    #[error("rest call failed: {0}")]
    Rest(#[from] RestError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("publish data must be a json object or array")]
    InvalidPublishData,

    #[error("stream id is required")]
    MissingStreamId,

    #[error("not connected and auto connect is disabled")]
    NotConnected,

    #[error("no session token available")]
    NoSessionToken,

    #[error("client routing task has stopped")]
    Closed,

    #[error("failed to serialize publish data: {0}")]
    Json(#[from] serde_json::Error),
}

/// Notification delivered to the receiver returned by [`Client::events`].
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// Unsolicited close. `reconnecting == false` means the retry budget is
    /// spent and the client stays disconnected until `connect` is called.
    ConnectionLost { attempt: u32, reconnecting: bool },
    Subscription {
        id: SubscriptionId,
        stream_id: String,
        event: SubscriptionEvent,
    },
    /// Error response sent by the server.
    ServerError(String),
    Error(Arc<ConnectionError>),
    /// Inbound frame that could not be decoded or routed.
    DecodeError(Arc<ProtocolError>),
}

/// Per-subscription settings.
#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
    pub partition: u32,
    pub resend: ResendOptions,
    /// Overrides the client api key for this subscription.
    pub api_key: Option<SecretString>,
}

impl SubscribeOptions {
    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_resend(mut self, resend: ResendOptions) -> Self {
        self.resend = resend;
        self
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }
}

/// Anything that names a stream.
pub trait StreamTarget {
    fn into_stream_id(self) -> String;
}

impl StreamTarget for String {
    fn into_stream_id(self) -> String {
        self
    }
}

impl StreamTarget for &String {
    fn into_stream_id(self) -> String {
        self.clone()
    }
}

impl StreamTarget for &str {
    fn into_stream_id(self) -> String {
        self.to_string()
    }
}

impl StreamTarget for StreamRecord {
    fn into_stream_id(self) -> String {
        self.id
    }
}

impl StreamTarget for &StreamRecord {
    fn into_stream_id(self) -> String {
        self.id.clone()
    }
}

impl StreamTarget for &SubscriptionHandle {
    fn into_stream_id(self) -> String {
        self.stream_id.clone()
    }
}

/// Caller-side view of a subscription owned by the routing task.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    stream_id: String,
    partition: u32,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Resolves once the subscription reaches `state`. Fails if the
    /// subscription is dropped first.
    pub async fn wait_for(&self, state: SubscriptionState) -> Result<(), ClientError> {
        let mut receiver = self.state.clone();
        receiver
            .wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Closed)
    }
}

pub(crate) enum ClientInput {
    Subscribe(Box<Subscription>),
    Unsubscribe(SubscriptionId),
    UnsubscribeAll(String),
    Publish {
        stream_id: String,
        data: Value,
        api_key: Option<SecretString>,
    },
    Disconnect,
    AttachEvents(mpsc::UnboundedSender<ClientEvent>),
    Connection(ConnectionEvent),
}

/// Socket operations the routing core needs.
pub(crate) trait Link {
    fn connect(&self) -> Result<(), ConnectionError>;
    fn disconnect(&self) -> Result<(), ConnectionError>;
    fn send(&self, request: Request);
}

impl Link for Connection {
    fn connect(&self) -> Result<(), ConnectionError> {
        Connection::connect(self)
    }

    fn disconnect(&self) -> Result<(), ConnectionError> {
        Connection::disconnect(self)
    }

    fn send(&self, request: Request) {
        Connection::send(self, request)
    }
}

struct PendingPublish {
    stream_id: String,
    data: Value,
    api_key: Option<SecretString>,
}

/// Routing state. Only the routing task touches it.
pub(crate) struct ClientCore<L> {
    link: L,
    link_state: ConnectionState,
    registry: SubscriptionRegistry,
    publish_queue: VecDeque<PendingPublish>,
    session: Arc<SessionToken>,
    api_key: SecretString,
    auto_connect: bool,
    auto_disconnect: bool,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl<L: Link> ClientCore<L> {
    pub(crate) fn new(
        link: L,
        session: Arc<SessionToken>,
        api_key: SecretString,
        auto_connect: bool,
        auto_disconnect: bool,
    ) -> Self {
        Self {
            link,
            link_state: ConnectionState::Disconnected,
            registry: SubscriptionRegistry::new(),
            publish_queue: VecDeque::new(),
            session,
            api_key,
            auto_connect,
            auto_disconnect,
            events: None,
        }
    }

    pub(crate) fn handle(&mut self, input: ClientInput) {
        match input {
            ClientInput::Subscribe(subscription) => self.subscribe(*subscription),
            ClientInput::Unsubscribe(id) => self.unsubscribe(&id),
            ClientInput::UnsubscribeAll(stream_id) => {
                for id in self.registry.ids_for_stream(&stream_id) {
                    self.unsubscribe(&id);
                }
            }
            ClientInput::Publish {
                stream_id,
                data,
                api_key,
            } => self.publish(PendingPublish {
                stream_id,
                data,
                api_key,
            }),
            ClientInput::Disconnect => self.disconnect(),
            ClientInput::AttachEvents(events) => self.events = Some(events),
            ClientInput::Connection(event) => self.on_connection_event(event),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        if self.link_state != ConnectionState::Disconnected || !self.registry.is_empty() {
            self.disconnect();
        }
        self.session.stop_refresh();
    }

    fn subscribe(&mut self, subscription: Subscription) {
        let id = self.registry.insert(subscription);
        if self.link_state == ConnectionState::Connected {
            self.resend_and_subscribe(&id);
        } else if self.auto_connect {
            self.connect_link();
        }
        self.flush(&id);
    }

    /// Subscribes on the wire unless another subscription on the same
    /// stream partition is already receiving it.
    fn resend_and_subscribe(&mut self, id: &SubscriptionId) {
        let Some(subscription) = self.registry.get(id) else {
            return;
        };
        if subscription.state() == SubscriptionState::Subscribed || subscription.is_resending() {
            return;
        }

        let piggyback = self
            .peers(id)
            .iter()
            .filter_map(|peer| self.registry.get(peer))
            .any(|peer| peer.state() == SubscriptionState::Subscribed);
        let session_token = self.session_token();

        let Some(subscription) = self.registry.get_mut(id) else {
            return;
        };
        subscription.arm_resend_on_subscribed();
        if piggyback {
            debug!(event = "client_subscribe_piggyback", sub_id = %id, stream_id = subscription.stream_id());
            subscription.set_state(SubscriptionState::Subscribed);
        } else {
            let request = SubscribeRequest {
                stream_id: subscription.stream_id().to_string(),
                partition: subscription.partition(),
                api_key: Some(subscription.api_key().expose_secret().to_string()),
                session_token,
            };
            subscription.set_state(SubscriptionState::Subscribing);
            self.link.send(Request::Subscribe(request));
        }
        self.flush(id);
    }

    fn request_resend(&mut self, id: &SubscriptionId, options: Option<ResendOptions>) {
        let session_token = self.session_token();
        let Some(subscription) = self.registry.get_mut(id) else {
            return;
        };
        let options = options.unwrap_or_else(|| subscription.effective_resend_options());
        let request = ResendRequest::new(
            subscription.stream_id(),
            subscription.partition(),
            id.as_str(),
            options,
            Some(subscription.api_key().expose_secret().to_string()),
            session_token,
        );
        match request {
            Ok(request) => {
                debug!(event = "client_resend_requested", sub_id = %id, options = ?request.options);
                subscription.set_resending(true);
                self.link.send(Request::Resend(request));
            }
            Err(err) => warn!(event = "client_resend_invalid", sub_id = %id, error = %err),
        }
    }

    fn unsubscribe(&mut self, id: &SubscriptionId) {
        let Some(subscription) = self.registry.get(id) else {
            debug!(event = "client_unsubscribe_unknown", sub_id = %id);
            return;
        };
        let state = subscription.state();
        let last_on_stream = self.peers(id).is_empty();

        if last_on_stream
            && self.link_state == ConnectionState::Connected
            && state == SubscriptionState::Subscribed
        {
            let session_token = self.session_token();
            let Some(subscription) = self.registry.get_mut(id) else {
                return;
            };
            let request = UnsubscribeRequest {
                stream_id: subscription.stream_id().to_string(),
                partition: subscription.partition(),
                api_key: Some(subscription.api_key().expose_secret().to_string()),
                session_token,
            };
            subscription.set_state(SubscriptionState::Unsubscribing);
            self.link.send(Request::Unsubscribe(request));
            self.flush(id);
        } else if state == SubscriptionState::Unsubscribing {
            debug!(event = "client_unsubscribe_in_progress", sub_id = %id);
        } else {
            if let Some(mut subscription) = self.registry.remove(id) {
                subscription.set_state(SubscriptionState::Unsubscribed);
                self.forward_events(&mut subscription);
            }
            self.check_auto_disconnect();
        }
    }

    fn publish(&mut self, pending: PendingPublish) {
        if self.link_state == ConnectionState::Connected {
            let api_key = pending.api_key.as_ref().unwrap_or(&self.api_key);
            let request = PublishRequest::new(
                pending.stream_id,
                pending.data,
                Some(api_key.expose_secret().to_string()),
                self.session_token(),
            );
            match request {
                Ok(request) => self.link.send(Request::Publish(request)),
                Err(err) => warn!(event = "client_publish_invalid", error = %err),
            }
        } else if self.auto_connect || self.link_state == ConnectionState::Connecting {
            debug!(event = "client_publish_queued", stream_id = %pending.stream_id);
            self.publish_queue.push_back(pending);
            if self.auto_connect {
                self.connect_link();
            }
        } else {
            warn!(event = "client_publish_dropped", stream_id = %pending.stream_id, state = %self.link_state);
        }
    }

    fn disconnect(&mut self) {
        for mut subscription in self.registry.drain() {
            subscription.set_state(SubscriptionState::Unsubscribed);
            self.forward_events(&mut subscription);
        }
        match self.link.disconnect() {
            Ok(()) => self.link_state = ConnectionState::Disconnecting,
            Err(err) => debug!(event = "client_disconnect_skipped", error = %err),
        }
        self.session.stop_refresh();
    }

    fn connect_link(&mut self) {
        if matches!(
            self.link_state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }
        self.session.start_refresh();
        match self.link.connect() {
            Ok(()) => self.link_state = ConnectionState::Connecting,
            Err(ConnectionError::AlreadyConnecting | ConnectionError::AlreadyConnected) => {}
            Err(err) => self.emit(ClientEvent::Error(Arc::new(err))),
        }
    }

    fn check_auto_disconnect(&mut self) {
        if self.auto_disconnect
            && self.registry.is_empty()
            && matches!(
                self.link_state,
                ConnectionState::Connected | ConnectionState::Connecting
            )
        {
            info!(event = "client_auto_disconnect");
            self.disconnect();
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => {
                // Connected is adopted with the catch-up on ConnectionEvent::Connected.
                if state != ConnectionState::Connected {
                    self.link_state = state;
                }
                if state == ConnectionState::Disconnected {
                    for id in self.registry.ids() {
                        if let Some(subscription) = self.registry.get_mut(&id) {
                            subscription.on_disconnected();
                        }
                        self.flush(&id);
                    }
                }
            }
            ConnectionEvent::Connected => {
                self.link_state = ConnectionState::Connected;
                for id in self.registry.ids() {
                    let pending = self.registry.get(&id).is_some_and(|sub| {
                        !matches!(
                            sub.state(),
                            SubscriptionState::Subscribed | SubscriptionState::Subscribing
                        )
                    });
                    if pending {
                        self.resend_and_subscribe(&id);
                    }
                }
                for pending in std::mem::take(&mut self.publish_queue) {
                    self.publish(pending);
                }
                self.emit(ClientEvent::Connected);
            }
            ConnectionEvent::Disconnected => self.emit(ClientEvent::Disconnected),
            ConnectionEvent::ConnectionLost {
                attempt,
                reconnecting,
            } => self.emit(ClientEvent::ConnectionLost {
                attempt,
                reconnecting,
            }),
            ConnectionEvent::Response(response) => self.route_response(response),
            ConnectionEvent::DecodeError(error) => self.route_decode_error(error),
            ConnectionEvent::Error(error) => self.emit(ClientEvent::Error(error)),
        }
    }

    fn route_response(&mut self, response: Response) {
        match response {
            Response::Broadcast(message) => {
                for id in self.ids_for(&message.stream_id, message.partition) {
                    self.deliver(&id, message.clone(), false);
                }
            }
            Response::Unicast { sub_id, message } => {
                let id = SubscriptionId::from(sub_id.as_str());
                if self.registry.get(&id).is_some() {
                    self.deliver(&id, message, true);
                } else {
                    warn!(event = "client_unicast_unknown_subscription", sub_id = %id);
                }
            }
            Response::SubscribeAck(ack) => {
                for id in self.ids_for(&ack.stream, ack.partition) {
                    if let Some(subscription) = self.registry.get_mut(&id) {
                        if !subscription.is_resending() {
                            subscription.set_state(SubscriptionState::Subscribed);
                        }
                    }
                    self.flush(&id);
                }
            }
            Response::UnsubscribeAck(ack) => {
                for id in self.ids_for(&ack.stream, ack.partition) {
                    if let Some(mut subscription) = self.registry.remove(&id) {
                        subscription.set_state(SubscriptionState::Unsubscribed);
                        self.forward_events(&mut subscription);
                    }
                }
                self.check_auto_disconnect();
            }
            Response::ResendResending(status) => {
                self.on_resend_status(&status.sub, Subscription::on_resending)
            }
            Response::ResendResent(status) => {
                self.on_resend_status(&status.sub, Subscription::on_resent)
            }
            Response::ResendNoResend(status) => {
                self.on_resend_status(&status.sub, Subscription::on_no_resend)
            }
            Response::Error(payload) => {
                warn!(event = "client_server_error", error = %payload.error);
                self.emit(ClientEvent::ServerError(payload.error));
            }
        }
    }

    fn on_resend_status(&mut self, sub_id: &str, apply: fn(&mut Subscription)) {
        let id = SubscriptionId::from(sub_id);
        match self.registry.get_mut(&id) {
            Some(subscription) => {
                apply(subscription);
                self.flush(&id);
            }
            None => warn!(event = "client_resend_status_unknown_subscription", sub_id = %id),
        }
    }

    fn route_decode_error(&mut self, error: Arc<ProtocolError>) {
        let target = match error.as_ref() {
            ProtocolError::InvalidJson { message, .. } => {
                self.ids_for(&message.stream_id, message.partition)
            }
            _ => Vec::new(),
        };
        if target.is_empty() {
            self.emit(ClientEvent::DecodeError(error));
            return;
        }
        for id in target {
            if let Some(subscription) = self.registry.get_mut(&id) {
                subscription.handle_error(Arc::clone(&error));
            }
            self.flush(&id);
        }
    }

    fn deliver(&mut self, id: &SubscriptionId, message: StreamMessage, is_resend: bool) {
        if let Some(subscription) = self.registry.get_mut(id) {
            subscription.handle_message(message, is_resend);
        }
        self.flush(id);
    }

    /// Forwards pending subscription events and reacts to them until the
    /// subscription has nothing more to report.
    fn flush(&mut self, id: &SubscriptionId) {
        loop {
            let Some(subscription) = self.registry.get_mut(id) else {
                return;
            };
            let events = subscription.take_events();
            if events.is_empty() {
                return;
            }
            let stream_id = subscription.stream_id().to_string();
            for event in events {
                self.emit(ClientEvent::Subscription {
                    id: id.clone(),
                    stream_id: stream_id.clone(),
                    event: event.clone(),
                });
                self.react(id, event);
            }
        }
    }

    fn react(&mut self, id: &SubscriptionId, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::Gap { from, to } => {
                self.request_resend(id, Some(ResendOptions::range(from, to)))
            }
            SubscriptionEvent::Done => self.unsubscribe(id),
            SubscriptionEvent::StateChanged(SubscriptionState::Subscribed) => {
                let resend = self.registry.get_mut(id).is_some_and(|subscription| {
                    subscription.take_resend_on_subscribed() && subscription.has_resend_option()
                });
                if resend {
                    self.request_resend(id, None);
                }
            }
            _ => {}
        }
    }

    /// Forwards events of a subscription that has left the registry.
    fn forward_events(&self, subscription: &mut Subscription) {
        for event in subscription.take_events() {
            self.emit(ClientEvent::Subscription {
                id: subscription.id().clone(),
                stream_id: subscription.stream_id().to_string(),
                event,
            });
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = self.events.as_ref() {
            let _ = events.send(event);
        }
    }

    fn ids_for(&self, stream_id: &str, partition: u32) -> Vec<SubscriptionId> {
        self.registry
            .ids_for_stream(stream_id)
            .into_iter()
            .filter(|id| {
                self.registry
                    .get(id)
                    .is_some_and(|subscription| subscription.partition() == partition)
            })
            .collect()
    }

    /// Other subscriptions on the same stream partition.
    fn peers(&self, id: &SubscriptionId) -> Vec<SubscriptionId> {
        let Some(subscription) = self.registry.get(id) else {
            return Vec::new();
        };
        self.ids_for(subscription.stream_id(), subscription.partition())
            .into_iter()
            .filter(|peer| peer != id)
            .collect()
    }

    fn session_token(&self) -> Option<String> {
        self.session
            .current()
            .map(|token| token.expose_secret().to_string())
    }
}

pub(crate) async fn run_client_loop<L: Link>(
    mut core: ClientCore<L>,
    mut commands: mpsc::UnboundedReceiver<ClientInput>,
) {
    while let Some(input) = commands.recv().await {
        core.handle(input);
    }
    debug!(event = "client_loop_stopped");
    core.shutdown();
}

/// Handle to a stream client. Clones share one connection and one set of
/// subscriptions; the connection closes when the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    api_key: SecretString,
    auto_connect: bool,
    rest: RestClient,
    session: Arc<SessionToken>,
    connection: Connection,
    commands: mpsc::UnboundedSender<ClientInput>,
}

impl Client {
    /// Validates `options`, fetches the first session token and starts the
    /// routing task. Does not connect.
    pub async fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let api_key = options.validate()?;
        let rest = RestClient::with_options(options.rest_url.as_str(), options.rest.clone())?;

        let fetcher: TokenFetcher = {
            let rest = rest.clone();
            let api_key = api_key.clone();
            Arc::new(move || {
                let rest = rest.clone();
                let api_key = api_key.clone();
                async move { rest.fetch_session_token(&api_key).await }.boxed()
            })
        };
        let session = SessionToken::fetch(fetcher, options.session_refresh_interval)
            .await
            .map_err(ClientError::Session)?;
        let session = Arc::new(session);
        session.start_refresh();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let weak_commands = commands_tx.downgrade();
        let listener: ConnectionListener = Arc::new(move |event: ConnectionEvent| {
            if let Some(commands) = weak_commands.upgrade() {
                let _ = commands.send(ClientInput::Connection(event));
            }
        });

        let runtime = Handle::current();
        let connection = Connection::new(
            options.url.as_str(),
            options.max_reconnect_attempts,
            runtime.clone(),
            listener,
        );
        let core = ClientCore::new(
            connection.clone(),
            Arc::clone(&session),
            api_key.clone(),
            options.auto_connect,
            options.auto_disconnect,
        );
        runtime.spawn(run_client_loop(core, commands_rx));
        info!(event = "client_ready", url = %options.url);

        Ok(Self {
            inner: Arc::new(ClientInner {
                api_key,
                auto_connect: options.auto_connect,
                rest,
                session,
                connection,
                commands: commands_tx,
            }),
        })
    }

    /// Returns a receiver of client events. A later call replaces the
    /// previous receiver, which then stops yielding.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        // A closed loop leaves the receiver empty, which is what callers see.
        let _ = self.send(ClientInput::AttachEvents(events_tx));
        events_rx
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn session_token(&self) -> Option<SecretString> {
        self.inner.session.current()
    }

    pub fn connect(&self) -> Result<(), ClientError> {
        self.inner.session.start_refresh();
        self.inner.connection.connect()?;
        Ok(())
    }

    /// Drops every subscription, closes the socket and stops token refresh.
    /// The subscriptions are dropped even when the connection is already
    /// down, in which case the illegal state is still reported.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        let illegal = match self.inner.connection.state() {
            ConnectionState::Disconnected => Some(ConnectionError::AlreadyDisconnected),
            ConnectionState::Disconnecting => Some(ConnectionError::AlreadyDisconnecting),
            ConnectionState::Connecting | ConnectionState::Connected => None,
        };
        self.send(ClientInput::Disconnect)?;
        match illegal {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub fn subscribe<T, F>(
        &self,
        target: T,
        handler: F,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, ClientError>
    where
        T: StreamTarget,
        F: Fn(&Value, &StreamMessage) + Send + Sync + 'static,
    {
        let api_key = options
            .api_key
            .unwrap_or_else(|| self.inner.api_key.clone());
        let subscription = Subscription::new(
            target.into_stream_id(),
            options.partition,
            api_key,
            Arc::new(handler),
            options.resend,
        )?;
        let handle = SubscriptionHandle {
            id: subscription.id().clone(),
            stream_id: subscription.stream_id().to_string(),
            partition: subscription.partition(),
            state: subscription.watch_state(),
        };
        self.send(ClientInput::Subscribe(Box::new(subscription)))?;
        Ok(handle)
    }

    pub fn unsubscribe(&self, subscription: &SubscriptionHandle) -> Result<(), ClientError> {
        self.send(ClientInput::Unsubscribe(subscription.id.clone()))
    }

    /// Unsubscribes every subscription on the stream.
    pub fn unsubscribe_all<T: StreamTarget>(&self, target: T) -> Result<(), ClientError> {
        self.send(ClientInput::UnsubscribeAll(target.into_stream_id()))
    }

    /// Publishes `data` to the stream. While disconnected the message is
    /// queued and sent in order once the connection opens.
    pub fn publish<T, D>(
        &self,
        target: T,
        data: &D,
        api_key: Option<SecretString>,
    ) -> Result<(), ClientError>
    where
        T: StreamTarget,
        D: Serialize + ?Sized,
    {
        let stream_id = target.into_stream_id();
        if stream_id.trim().is_empty() {
            return Err(ClientError::MissingStreamId);
        }
        let data = serde_json::to_value(data)?;
        if !(data.is_object() || data.is_array()) {
            return Err(ClientError::InvalidPublishData);
        }
        if !self.inner.auto_connect && self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.send(ClientInput::Publish {
            stream_id,
            data,
            api_key,
        })
    }

    pub fn rest(&self) -> &RestClient {
        &self.inner.rest
    }

    pub async fn create_stream(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<StreamRecord, ClientError> {
        let token = self.require_session_token()?;
        Ok(self.inner.rest.create_stream(name, description, &token).await?)
    }

    /// First stream with exactly this name.
    pub async fn get_stream_by_name(&self, name: &str) -> Result<Option<StreamRecord>, ClientError> {
        let token = self.require_session_token()?;
        let streams = self.inner.rest.get_streams_by_name(name, &token).await?;
        Ok(streams.and_then(|streams| streams.into_iter().next()))
    }

    pub async fn get_stream_by_id(
        &self,
        stream_id: &str,
    ) -> Result<Option<StreamRecord>, ClientError> {
        let token = self.require_session_token()?;
        Ok(self.inner.rest.get_stream_by_id(stream_id, &token).await?)
    }

    pub async fn get_or_create_stream(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<StreamRecord, ClientError> {
        if let Some(stream) = self.get_stream_by_name(name).await? {
            return Ok(stream);
        }
        info!(event = "client_stream_created", name);
        self.create_stream(name, description).await
    }

    fn require_session_token(&self) -> Result<SecretString, ClientError> {
        self.inner
            .session
            .current()
            .ok_or(ClientError::NoSessionToken)
    }

    fn send(&self, input: ClientInput) -> Result<(), ClientError> {
        self.inner
            .commands
            .send(input)
            .map_err(|_| ClientError::Closed)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.connection.url())
            .field("state", &self.state())
            .field("rest_url", &self.inner.rest.base_url())
            .finish()
    }
}
