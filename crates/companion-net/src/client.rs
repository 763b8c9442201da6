//! The client facade.
//!
//! [`CompanionClient`] owns one identity, one connection and the state scoped
//! to them: sequence counter, limiter bucket, listener registries, pending
//! subscriptions, the camera slot and the marker watcher. Inbound frames and
//! subscription completions are handled on a single dispatch task (see
//! [`crate::dispatch`]).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use companion_config::Config;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};

use crate::camera::CameraSession;
use crate::commands::{CommandDispatch, CommandOptions};
use crate::connection::{Connection, ConnectionState, FailureCallback};
use crate::conversation::ConversationFactory;
use crate::correlator::{ErrorCheck, RequestCorrelator, ResendPolicy};
use crate::dispatch::{self, Control};
use crate::error::ClientError;
use crate::heartbeat::{Heartbeat, Keepalive};
use crate::identity::ServerIdentity;
use crate::limiter::{AdmissionPolicy, BucketConfig, RateLimiter};
use crate::listeners::{
    ChatEvent, EntityEvent, EventHandler, EventRegistries, ListenerHandle, ListenerId,
    MarkerEvent, ProtobufEvent, TeamEvent,
};
use crate::markers::MarkerWatcher;
use crate::messages::{
    AppRequest, AppResponse, ChatMessage, EntityInfo, GameTime, MapData, MapMarker, RequestBody,
    ResponseBody, ServerInfo, StorageContents, TeamInfo,
};
use crate::reconnection::ReconnectConfig;
use crate::subscriptions::{PendingSubscription, SubscriptionQueue};
use crate::transport::{TcpTransport, Transport};

/// Default companion port.
pub const DEFAULT_PORT: u16 = 28082;

/// Default idle time before the heartbeat sends a wakeup.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(240);

const DISPATCH_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects settings for a [`CompanionClient`].
///
/// Host, owner id, credential token and keepalive are required; `build`
/// fails with [`ClientError::Configuration`] when any is missing.
pub struct ClientBuilder {
    host: Option<String>,
    port: u16,
    owner_id: Option<u64>,
    credential_token: Option<i32>,
    bucket: BucketConfig,
    resend: ResendPolicy,
    retry: ReconnectConfig,
    keepalive_interval: Duration,
    raise_on_limit: bool,
    use_test_server: bool,
    transport: Option<Arc<dyn Transport>>,
    keepalive: Option<Arc<dyn Keepalive>>,
    limiter: Option<Arc<RateLimiter>>,
    commands: Option<CommandOptions>,
    dispatcher: Option<Arc<dyn CommandDispatch>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            owner_id: None,
            credential_token: None,
            bucket: BucketConfig::default(),
            resend: ResendPolicy::default(),
            retry: ReconnectConfig::default(),
            keepalive_interval: DEFAULT_KEEPALIVE,
            raise_on_limit: false,
            use_test_server: false,
            transport: None,
            keepalive: None,
            limiter: None,
            commands: None,
            dispatcher: None,
        }
    }
}

impl ClientBuilder {
    /// Empty builder with the default port, bucket and resend cadence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration. The heartbeat is installed as the
    /// keepalive; transport defaults to TCP.
    pub fn from_config(config: &Config) -> Self {
        let limits = &config.limits;
        let refill_interval = Duration::try_from_secs_f64(limits.refill_interval_secs)
            .ok()
            .filter(|interval| !interval.is_zero())
            .unwrap_or(Duration::from_secs(1));

        let mut builder = Self::new()
            .port(config.server.port)
            .bucket(BucketConfig::new(
                limits.capacity,
                limits.refill_amount,
                refill_interval,
            ))
            .raise_on_limit(limits.raise_on_limit)
            .resend_policy(ResendPolicy::from(&config.requests))
            .retry(ReconnectConfig::fixed(
                Duration::from_secs(config.connection.retry_delay_secs),
                config.connection.retries,
            ))
            .keepalive_interval(Duration::from_secs(config.connection.keepalive_secs))
            .use_test_server(config.connection.use_test_server)
            .keepalive(Arc::new(Heartbeat::new()));

        if !config.server.host.is_empty() {
            builder = builder.host(config.server.host.clone());
        }
        if let Some(owner_id) = config.server.owner_id {
            builder = builder.owner_id(owner_id);
        }
        if let Some(token) = config.server.credential_token {
            builder = builder.credential_token(token);
        }
        if let Some(commands) = &config.commands {
            builder = builder.commands(CommandOptions::from(commands));
        }
        builder
    }

    /// Server address. Required.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Companion port, 28082 unless set.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Steam id of the credential owner. Required.
    pub fn owner_id(mut self, owner_id: u64) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    /// Pairing token. Required.
    pub fn credential_token(mut self, token: i32) -> Self {
        self.credential_token = Some(token);
        self
    }

    /// Token bucket installed for this client's identity.
    pub fn bucket(mut self, bucket: BucketConfig) -> Self {
        self.bucket = bucket;
        self
    }

    /// Resend cadence for unanswered requests.
    pub fn resend_policy(mut self, policy: ResendPolicy) -> Self {
        self.resend = policy;
        self
    }

    /// Default retry behaviour for [`CompanionClient::connect`].
    pub fn retry(mut self, retry: ReconnectConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Idle time after which the keepalive sends a wakeup.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Fail with [`ClientError::AdmissionRejected`] instead of waiting for tokens.
    pub fn raise_on_limit(mut self, raise: bool) -> Self {
        self.raise_on_limit = raise;
        self
    }

    /// Pin the client to its endpoint; [`CompanionClient::switch_endpoint`] is refused.
    pub fn use_test_server(mut self, fixed: bool) -> Self {
        self.use_test_server = fixed;
        self
    }

    /// Replace the TCP transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Keepalive started on every connect. Required.
    pub fn keepalive(mut self, keepalive: Arc<dyn Keepalive>) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    /// Share a limiter between clients. A bucket for this client's identity
    /// is added at build time.
    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Prefix that marks team messages as commands.
    pub fn commands(mut self, options: CommandOptions) -> Self {
        self.commands = Some(options);
        self
    }

    /// Receiver for team messages matching the command prefix.
    pub fn command_dispatch(mut self, dispatcher: Arc<dyn CommandDispatch>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Validate the identity fields and assemble the client. Nothing is
    /// connected yet.
    pub fn build(self) -> Result<CompanionClient, ClientError> {
        let host = self
            .host
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ClientError::Configuration("host is required".into()))?;
        let owner_id = self
            .owner_id
            .ok_or_else(|| ClientError::Configuration("owner id is required".into()))?;
        let token = self
            .credential_token
            .ok_or_else(|| ClientError::Configuration("credential token is required".into()))?;
        let keepalive = self
            .keepalive
            .ok_or_else(|| ClientError::Configuration("keepalive is required".into()))?;

        let identity = ServerIdentity::new(host, self.port, owner_id, token)?;
        let limiter = self.limiter.unwrap_or_default();
        limiter.add_bucket(&identity, &self.bucket);

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TcpTransport::default()));
        let connection = Arc::new(Connection::new(transport));
        let correlator =
            RequestCorrelator::new(Arc::clone(&connection), Arc::clone(&limiter), self.resend);

        let (frames_tx, frames_rx) = mpsc::channel(DISPATCH_BUFFER);
        let (control_tx, control_rx) = mpsc::channel(DISPATCH_BUFFER);

        tracing::debug!(%identity, "client built");
        Ok(CompanionClient {
            inner: Arc::new(ClientInner {
                identity: RwLock::new(identity),
                seq: AtomicU32::new(1),
                limiter,
                connection,
                correlator,
                registries: EventRegistries::default(),
                subscriptions: SubscriptionQueue::default(),
                camera: Mutex::new(None),
                camera_lock: tokio::sync::Mutex::new(()),
                markers: MarkerWatcher::default(),
                conversations: RwLock::new(ConversationFactory::new()),
                keepalive,
                commands: Mutex::new(self.commands),
                dispatcher: self.dispatcher,
                settings: Settings {
                    bucket: self.bucket,
                    retry: self.retry,
                    keepalive_interval: self.keepalive_interval,
                    use_test_server: self.use_test_server,
                },
                raise_on_limit: AtomicBool::new(self.raise_on_limit),
                frames_tx,
                control_tx,
                dispatch_rx: Mutex::new(Some((frames_rx, control_rx))),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Retry behaviour for one [`CompanionClient::connect_with`] call.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Retries after the first attempt. `None` retries forever.
    pub retries: Option<u32>,
    pub delay: Duration,
    pub on_failure: Option<FailureCallback>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retries: None,
            delay: Duration::from_secs(20),
            on_failure: None,
        }
    }
}

/// New endpoint for [`CompanionClient::switch_endpoint`].
#[derive(Debug, Clone)]
pub struct SwitchTarget {
    pub host: String,
    pub port: u16,
    pub owner_id: u64,
    pub credential_token: i32,
    /// Replaces the command options when set.
    pub commands: Option<CommandOptions>,
    pub raise_on_limit: bool,
    /// Connect to the new endpoint before returning.
    pub connect: bool,
}

impl SwitchTarget {
    pub fn new(host: impl Into<String>, port: u16, owner_id: u64, credential_token: i32) -> Self {
        Self {
            host: host.into(),
            port,
            owner_id,
            credential_token,
            commands: None,
            raise_on_limit: true,
            connect: false,
        }
    }

    /// Command options to install after the switch.
    pub fn commands(mut self, options: CommandOptions) -> Self {
        self.commands = Some(options);
        self
    }

    /// Raise-on-limit policy for the new endpoint.
    pub fn raise_on_limit(mut self, raise: bool) -> Self {
        self.raise_on_limit = raise;
        self
    }

    /// Connect to the new endpoint before the switch returns.
    pub fn reconnect(mut self, connect: bool) -> Self {
        self.connect = connect;
        self
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Settings {
    bucket: BucketConfig,
    retry: ReconnectConfig,
    keepalive_interval: Duration,
    use_test_server: bool,
}

type DispatchReceivers = (mpsc::Receiver<Vec<u8>>, mpsc::Receiver<Control>);

pub(crate) struct ClientInner {
    identity: RwLock<ServerIdentity>,
    seq: AtomicU32,
    limiter: Arc<RateLimiter>,
    pub(crate) connection: Arc<Connection>,
    pub(crate) correlator: RequestCorrelator,
    pub(crate) registries: EventRegistries,
    subscriptions: SubscriptionQueue,
    pub(crate) camera: Mutex<Option<Arc<CameraSession>>>,
    /// Serializes camera session replacement.
    camera_lock: tokio::sync::Mutex<()>,
    markers: MarkerWatcher,
    pub(crate) conversations: RwLock<Arc<ConversationFactory>>,
    keepalive: Arc<dyn Keepalive>,
    pub(crate) commands: Mutex<Option<CommandOptions>>,
    pub(crate) dispatcher: Option<Arc<dyn CommandDispatch>>,
    settings: Settings,
    raise_on_limit: AtomicBool,
    frames_tx: mpsc::Sender<Vec<u8>>,
    control_tx: mpsc::Sender<Control>,
    dispatch_rx: Mutex<Option<DispatchReceivers>>,
}

impl ClientInner {
    pub(crate) fn identity(&self) -> ServerIdentity {
        self.identity.read().clone()
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn envelope(
        &self,
        identity: &ServerIdentity,
        body: RequestBody,
        entity_id: Option<u32>,
    ) -> AppRequest {
        AppRequest {
            seq: self.next_seq(),
            player_id: identity.caller_id(),
            player_token: identity.credential_token(),
            entity_id,
            body,
        }
    }

    /// Take `cost` tokens, waiting or failing per the raise-on-limit policy.
    async fn admit(&self, identity: &ServerIdentity, cost: u32) -> Result<(), ClientError> {
        let policy = if self.raise_on_limit.load(Ordering::Relaxed) {
            AdmissionPolicy::Reject
        } else {
            AdmissionPolicy::Wait
        };
        self.limiter.acquire(identity, cost, policy).await?;
        self.keepalive.reset_rhythm();
        Ok(())
    }

    /// Admit, stamp and send `body`, then wait for its reply.
    pub(crate) async fn request(
        &self,
        body: RequestBody,
        entity_id: Option<u32>,
        check: ErrorCheck,
    ) -> Result<AppResponse, ClientError> {
        if !self.connection.is_open() {
            return Err(ClientError::NotConnected);
        }
        let identity = self.identity();
        self.admit(&identity, body.cost()).await?;
        let request = self.envelope(&identity, body, entity_id);
        self.correlator.call(&identity, &request, check).await
    }

    /// Admit, stamp and send `body` without waiting for the reply.
    pub(crate) async fn send_detached(
        &self,
        body: RequestBody,
        entity_id: Option<u32>,
    ) -> Result<(), ClientError> {
        if !self.connection.is_open() {
            return Err(ClientError::NotConnected);
        }
        let identity = self.identity();
        self.admit(&identity, body.cost()).await?;
        let request = self.envelope(&identity, body, entity_id);
        self.correlator.send_detached(&request).await
    }

    async fn send_wakeup(&self) -> Result<(), ClientError> {
        self.send_detached(RequestBody::GetTime, None).await
    }

    /// Resolve the entity type, then hand registration to the dispatch task.
    async fn resolve_entity(
        &self,
        subscription: PendingSubscription,
    ) -> Result<ListenerHandle, ClientError> {
        let identity = self.identity();
        let entity_id = subscription.entity_id;
        let reply = self
            .request(
                RequestBody::GetEntityInfo,
                Some(entity_id),
                ErrorCheck::Disabled,
            )
            .await?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.control_tx
            .send(Control::EntityResolved {
                identity,
                subscription,
                reply,
                ack: ack_tx,
            })
            .await
            .map_err(|_| ClientError::NotConnected)?;
        ack_rx.await.map_err(|_| ClientError::NotConnected)?
    }
}

/// Weak handle used by the keepalive to send wakeup requests.
#[derive(Clone)]
pub struct WakeupHandle(Weak<ClientInner>);

impl WakeupHandle {
    pub async fn send(&self) -> Result<(), ClientError> {
        let inner = self.0.upgrade().ok_or(ClientError::NotConnected)?;
        inner.send_wakeup().await
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// Client for one companion endpoint. Cheap to clone.
#[derive(Clone)]
pub struct CompanionClient {
    inner: Arc<ClientInner>,
}

impl CompanionClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn identity(&self) -> ServerIdentity {
        self.inner.identity()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state().subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.inner.connection.is_open()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.connection.is_pending()
    }

    /// Connect with the retry settings the client was built with.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let retry = &self.inner.settings.retry;
        self.connect_with(ConnectOptions {
            retries: retry.max_retries,
            delay: retry.initial_delay,
            on_failure: None,
        })
        .await
    }

    /// Open the connection, start the keepalive and replay subscriptions
    /// queued while disconnected.
    pub async fn connect_with(&self, options: ConnectOptions) -> Result<(), ClientError> {
        self.ensure_dispatch();
        if self.is_open() {
            return Ok(());
        }

        let identity = self.identity();
        let retry = ReconnectConfig::fixed(options.delay, options.retries);
        self.inner
            .connection
            .connect(
                &identity.address(),
                &retry,
                options.on_failure,
                self.inner.frames_tx.clone(),
            )
            .await?;
        // Replies to detached sends from the previous link will never arrive.
        self.inner.correlator.forget_detached();

        self.inner.keepalive.start(
            self.inner.settings.keepalive_interval,
            WakeupHandle(Arc::downgrade(&self.inner)),
        );

        for subscription in self.inner.subscriptions.take_pending() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let entity_id = subscription.entity_id;
                if let Err(err) = inner.resolve_entity(subscription).await {
                    tracing::warn!(entity_id, error = %err, "queued subscription failed");
                }
            });
        }
        Ok(())
    }

    fn ensure_dispatch(&self) {
        if let Some((frames, control)) = self.inner.dispatch_rx.lock().take() {
            tokio::spawn(dispatch::run(Arc::downgrade(&self.inner), frames, control));
        }
    }

    /// Close the connection. Calls already waiting observe the failure on
    /// their next resend.
    pub async fn disconnect(&self) {
        self.inner.keepalive.stop();
        self.inner.connection.close().await;
        tracing::info!(identity = %self.identity(), "disconnected");
    }

    /// Send `body` and wait for its reply; server errors fail the call.
    pub async fn send(&self, body: RequestBody) -> Result<AppResponse, ClientError> {
        self.inner.request(body, None, ErrorCheck::Enabled).await
    }

    /// Send with explicit entity id and error-check policy.
    pub async fn send_with(
        &self,
        body: RequestBody,
        entity_id: Option<u32>,
        check: ErrorCheck,
    ) -> Result<AppResponse, ClientError> {
        self.inner.request(body, entity_id, check).await
    }

    /// Nudge the server into resuming broadcasts. The reply is ignored.
    pub async fn send_wakeup_request(&self) -> Result<(), ClientError> {
        self.inner.send_wakeup().await
    }

    // -- listeners ---------------------------------------------------------

    pub fn on_team_event<H>(&self, handler: H) -> ListenerHandle
    where
        H: EventHandler<TeamEvent> + 'static,
    {
        let id = self
            .inner
            .registries
            .team
            .register(&self.identity(), (), Arc::new(handler));
        ListenerHandle::Team(id)
    }

    pub fn on_chat_message<H>(&self, handler: H) -> ListenerHandle
    where
        H: EventHandler<ChatEvent> + 'static,
    {
        let id = self
            .inner
            .registries
            .chat
            .register(&self.identity(), (), Arc::new(handler));
        ListenerHandle::Chat(id)
    }

    /// Every raw inbound frame, before decoding.
    pub fn on_protobuf<H>(&self, handler: H) -> ListenerHandle
    where
        H: EventHandler<ProtobufEvent> + 'static,
    {
        let id = self
            .inner
            .registries
            .protobuf
            .register(&self.identity(), (), Arc::new(handler));
        ListenerHandle::Protobuf(id)
    }

    /// New map markers; see [`CompanionClient::start_marker_listener`].
    pub fn on_marker_event<H>(&self, handler: H) -> ListenerHandle
    where
        H: EventHandler<MarkerEvent> + 'static,
    {
        let id = self
            .inner
            .registries
            .markers
            .register(&self.identity(), (), Arc::new(handler));
        ListenerHandle::Marker(id)
    }

    /// Listen for state changes of `entity_id`.
    ///
    /// While disconnected the subscription is queued and resolved on the next
    /// connect. Otherwise the entity type is queried first; an error reply
    /// fails with [`ClientError::SubscriptionFailed`] and registers nothing.
    pub async fn subscribe_entity<H>(
        &self,
        entity_id: u32,
        handler: H,
    ) -> Result<ListenerHandle, ClientError>
    where
        H: EventHandler<EntityEvent> + 'static,
    {
        let subscription = PendingSubscription {
            entity_id,
            id: ListenerId::next(),
            handler: Arc::new(handler),
        };
        if !self.is_open() {
            let handle = ListenerHandle::Entity {
                entity_id,
                id: subscription.id,
            };
            self.inner.subscriptions.queue(subscription);
            return Ok(handle);
        }
        self.inner.resolve_entity(subscription).await
    }

    /// Unregister whatever `handle` names. Returns whether anything was removed.
    pub fn remove_listener(&self, handle: &ListenerHandle) -> bool {
        if self.inner.registries.remove(&self.identity(), handle) {
            return true;
        }
        match handle {
            ListenerHandle::Entity { id, .. } => self.inner.subscriptions.remove(*id),
            _ => false,
        }
    }

    pub fn has_listener(&self, handle: &ListenerHandle) -> bool {
        if self.inner.registries.contains(&self.identity(), handle) {
            return true;
        }
        match handle {
            ListenerHandle::Entity { id, .. } => self.inner.subscriptions.contains(*id),
            _ => false,
        }
    }

    /// Subscriptions waiting for the connection to open.
    pub fn pending_subscriptions(&self) -> usize {
        self.inner.subscriptions.len()
    }

    // -- endpoint switch ---------------------------------------------------

    /// Disconnect and move to another endpoint.
    ///
    /// Resets the sequence counter and limiter bucket, drops entity listeners
    /// and queued subscriptions, forgets marker history, aborts open
    /// conversations and fails in-flight calls.
    pub async fn switch_endpoint(&self, target: SwitchTarget) -> Result<(), ClientError> {
        let inner = &self.inner;
        if inner.settings.use_test_server {
            return Err(ClientError::EndpointSwitchDisallowed);
        }
        let identity = ServerIdentity::new(
            target.host,
            target.port,
            target.owner_id,
            target.credential_token,
        )?;

        self.disconnect().await;

        let previous = std::mem::replace(&mut *inner.identity.write(), identity.clone());
        inner.seq.store(1, Ordering::SeqCst);
        if let Some(options) = target.commands {
            *inner.commands.lock() = Some(options);
        }
        inner
            .raise_on_limit
            .store(target.raise_on_limit, Ordering::Relaxed);

        inner.subscriptions.clear();
        inner.limiter.remove(&previous);
        inner.limiter.remove(&identity);
        inner.limiter.add_bucket(&identity, &inner.settings.bucket);
        inner.correlator.clear();

        let conversations =
            std::mem::replace(&mut *inner.conversations.write(), ConversationFactory::new());
        conversations.abort_all();

        inner.registries.entity.unregister_all(&previous);
        inner.registries.entity.unregister_all(&identity);
        inner.markers.reset();
        inner.camera.lock().take();

        tracing::info!(from = %previous, to = %identity, "switched endpoint");

        if target.connect {
            self.connect().await?;
        }
        Ok(())
    }

    // -- camera ------------------------------------------------------------

    /// Session for `camera_id`, reusing the live one when it targets the same
    /// camera.
    pub async fn camera_session(&self, camera_id: &str) -> Result<Arc<CameraSession>, ClientError> {
        let _serial = self.inner.camera_lock.lock().await;

        let current = self.inner.camera.lock().clone();
        if let Some(current) = current {
            if current.camera_id() == camera_id {
                return Ok(current);
            }
            if let Err(err) = current.unsubscribe().await {
                tracing::warn!(camera_id = current.camera_id(), error = %err, "camera unsubscribe failed");
            }
        }

        let reply = self
            .send(RequestBody::CameraSubscribe {
                camera_id: camera_id.to_string(),
            })
            .await?;
        let ResponseBody::CameraSubscribeInfo(info) = reply.body else {
            return Err(ClientError::UnexpectedResponse(reply.seq));
        };

        let session = Arc::new(CameraSession::new(
            camera_id.to_string(),
            info,
            Arc::downgrade(&self.inner),
        ));
        *self.inner.camera.lock() = Some(Arc::clone(&session));
        tracing::debug!(camera_id, "camera session ready");
        Ok(session)
    }

    // -- markers -----------------------------------------------------------

    /// Poll markers every `delay` and emit [`MarkerEvent`]s for new ones.
    /// Restarting replaces the previous poller.
    pub fn start_marker_listener(&self, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let reply = inner
                    .request(RequestBody::GetMapMarkers, None, ErrorCheck::Enabled)
                    .await;
                match reply.map(|reply| reply.body) {
                    Ok(ResponseBody::MapMarkers(markers)) => {
                        let identity = inner.identity();
                        for event in inner.markers.process(markers) {
                            inner.registries.markers.emit(&identity, event);
                        }
                    }
                    Ok(_) => tracing::warn!("unexpected reply to marker poll"),
                    Err(err) => tracing::debug!(error = %err, "marker poll failed"),
                }
            }
        });
        self.inner.markers.replace_task(handle);
    }

    pub fn marker_watcher(&self) -> &MarkerWatcher {
        &self.inner.markers
    }

    // -- conversations -----------------------------------------------------

    /// Send each prompt as a team message and wait for `target`'s answer.
    pub async fn converse(&self, target: u64, prompts: &[&str]) -> Result<Vec<String>, ClientError> {
        let factory = Arc::clone(&*self.inner.conversations.read());
        let mut conversation = factory.open(target);
        let mut answers = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            self.send_team_message(prompt).await?;
            let answer = conversation
                .next_answer()
                .await
                .ok_or(ClientError::ConversationAborted(target))?;
            answers.push(answer.message);
        }
        Ok(answers)
    }

    // -- typed operations --------------------------------------------------

    /// In-game clock.
    pub async fn get_time(&self) -> Result<GameTime, ClientError> {
        let reply = self.send(RequestBody::GetTime).await?;
        match reply.body {
            ResponseBody::Time(time) => Ok(time),
            _ => Err(ClientError::UnexpectedResponse(reply.seq)),
        }
    }

    /// Server name, map and player counts.
    pub async fn get_info(&self) -> Result<ServerInfo, ClientError> {
        let reply = self.send(RequestBody::GetInfo).await?;
        match reply.body {
            ResponseBody::Info(info) => Ok(info),
            _ => Err(ClientError::UnexpectedResponse(reply.seq)),
        }
    }

    /// Leader and members of the caller's team.
    pub async fn get_team_info(&self) -> Result<TeamInfo, ClientError> {
        let reply = self.send(RequestBody::GetTeamInfo).await?;
        match reply.body {
            ResponseBody::TeamInfo(team) => Ok(team),
            _ => Err(ClientError::UnexpectedResponse(reply.seq)),
        }
    }

    /// Recent team chat history.
    pub async fn get_team_chat(&self) -> Result<Vec<ChatMessage>, ClientError> {
        let reply = self.send(RequestBody::GetTeamChat).await?;
        match reply.body {
            ResponseBody::TeamChat(messages) => Ok(messages),
            _ => Err(ClientError::UnexpectedResponse(reply.seq)),
        }
    }

    /// Every live map marker.
    pub async fn get_markers(&self) -> Result<Vec<MapMarker>, ClientError> {
        let reply = self.send(RequestBody::GetMapMarkers).await?;
        match reply.body {
            ResponseBody::MapMarkers(markers) => Ok(markers),
            _ => Err(ClientError::UnexpectedResponse(reply.seq)),
        }
    }

    /// Markers of ongoing events such as cargo ships and patrol helicopters.
    pub async fn get_current_events(&self) -> Result<Vec<MapMarker>, ClientError> {
        let mut markers = self.get_markers().await?;
        markers.retain(MapMarker::is_event);
        Ok(markers)
    }

    /// Map image and dimensions as sent by the server.
    pub async fn get_raw_map_data(&self) -> Result<MapData, ClientError> {
        let reply = self.send(RequestBody::GetMap).await?;
        match reply.body {
            ResponseBody::Map(map) => Ok(map),
            _ => Err(ClientError::UnexpectedResponse(reply.seq)),
        }
    }

    /// Type and state of a paired smart entity.
    pub async fn get_entity_info(&self, entity_id: u32) -> Result<EntityInfo, ClientError> {
        let reply = self
            .send_with(RequestBody::GetEntityInfo, Some(entity_id), ErrorCheck::Enabled)
            .await?;
        match reply.body {
            ResponseBody::EntityInfo(info) => Ok(info),
            _ => Err(ClientError::UnexpectedResponse(reply.seq)),
        }
    }

    /// Contents of the container behind storage monitor `entity_id`,
    /// optionally with identical stacks merged.
    pub async fn get_contents(
        &self,
        entity_id: u32,
        combine_stacks: bool,
    ) -> Result<StorageContents, ClientError> {
        let reply = self
            .send_with(RequestBody::GetContents, Some(entity_id), ErrorCheck::Enabled)
            .await?;
        match reply.body {
            ResponseBody::Contents(contents) if combine_stacks => Ok(contents.combine_stacks()),
            ResponseBody::Contents(contents) => Ok(contents),
            _ => Err(ClientError::UnexpectedResponse(reply.seq)),
        }
    }

    /// Set the on/off value of a smart entity.
    pub async fn set_entity_value(&self, entity_id: u32, value: bool) -> Result<(), ClientError> {
        self.send_with(
            RequestBody::SetEntityValue { value },
            Some(entity_id),
            ErrorCheck::Enabled,
        )
        .await?;
        Ok(())
    }

    pub async fn turn_on_smart_switch(&self, entity_id: u32) -> Result<(), ClientError> {
        self.set_entity_value(entity_id, true).await
    }

    pub async fn turn_off_smart_switch(&self, entity_id: u32) -> Result<(), ClientError> {
        self.set_entity_value(entity_id, false).await
    }

    /// Hand team leadership to `steam_id`.
    pub async fn promote_to_team_leader(&self, steam_id: u64) -> Result<(), ClientError> {
        self.send(RequestBody::PromoteToLeader { steam_id }).await?;
        Ok(())
    }

    /// Post `message` to team chat.
    pub async fn send_team_message(&self, message: &str) -> Result<(), ClientError> {
        self.send(RequestBody::SendTeamMessage {
            message: message.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Wait forever.
    pub async fn hang(&self) {
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use companion_config::CommandConfig;
    use tokio::sync::mpsc as channel;

    use crate::messages::{AppBroadcast, EntityItem, EntityPayload, EntityType, marker_type};
    use crate::testing::{CountingKeepalive, MockTransport, auto_responder, client_builder};

    async fn connected(transport: &Arc<MockTransport>) -> CompanionClient {
        transport.respond_with(auto_responder);
        let client = client_builder(Arc::clone(transport)).build().unwrap();
        client.connect().await.unwrap();
        client
    }

    #[test]
    fn test_missing_required_fields_fail_build() {
        let transport = MockTransport::new();
        let err = client_builder(transport.clone())
            .keepalive(Arc::new(CountingKeepalive::default()))
            .host("")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Configuration(_)));

        let no_keepalive = ClientBuilder::new()
            .host("10.0.0.1")
            .owner_id(1)
            .credential_token(1)
            .build();
        assert!(matches!(no_keepalive, Err(ClientError::Configuration(_))));

        let no_token = ClientBuilder::new()
            .host("10.0.0.1")
            .owner_id(1)
            .keepalive(Arc::new(CountingKeepalive::default()))
            .build();
        assert!(matches!(no_token, Err(ClientError::Configuration(_))));
    }

    #[test]
    fn test_from_config_maps_settings() {
        let mut config = Config::default();
        config.server.host = "1.2.3.4".into();
        config.server.port = 28083;
        config.server.owner_id = Some(99);
        config.server.credential_token = Some(-5);
        config.commands = Some(CommandConfig {
            prefix: "?".into(),
        });

        let client = ClientBuilder::from_config(&config).build().unwrap();
        let identity = client.identity();
        assert_eq!(identity.address(), "1.2.3.4:28083");
        assert_eq!(identity.caller_id(), 99);
        assert_eq!(client.limiter().tokens(&identity).unwrap(), 25);
        assert_eq!(
            *client.inner.commands.lock(),
            Some(CommandOptions::new("?"))
        );
    }

    #[test]
    fn test_from_config_without_credentials_fails() {
        let result = ClientBuilder::from_config(&Config::default()).build();
        assert!(matches!(result, Err(ClientError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_without_transmitting() {
        let transport = MockTransport::new();
        let client = client_builder(transport.clone()).build().unwrap();

        assert!(matches!(
            client.get_time().await,
            Err(ClientError::NotConnected)
        ));
        assert!(transport.sent_frames().is_empty());
        // No tokens were spent either.
        assert_eq!(client.limiter().tokens(&client.identity()).unwrap(), 25);
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase_and_reset_on_switch() {
        let transport = MockTransport::new();
        let client = connected(&transport).await;

        for _ in 0..4 {
            client.get_time().await.unwrap();
        }
        let seqs: Vec<_> = transport.requests().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        client
            .switch_endpoint(SwitchTarget::new("10.0.0.9", 28082, 1, 1).reconnect(true))
            .await
            .unwrap();
        client.get_time().await.unwrap();
        assert_eq!(transport.requests().last().unwrap().seq, 1);
        assert_eq!(client.identity().host(), "10.0.0.9");
    }

    #[tokio::test]
    async fn test_admitted_send_resets_keepalive() {
        let transport = MockTransport::new();
        transport.respond_with(auto_responder);
        let keepalive = Arc::new(CountingKeepalive::default());
        let client = client_builder(transport.clone())
            .keepalive(keepalive.clone())
            .build()
            .unwrap();
        client.connect().await.unwrap();
        assert_eq!(keepalive.starts.load(Ordering::SeqCst), 1);

        client.get_info().await.unwrap();
        client.send_team_message("hi").await.unwrap();
        assert_eq!(keepalive.resets.load(Ordering::SeqCst), 2);

        let identity = client.identity();
        // get_info costs 1, team message 2.
        assert_eq!(client.limiter().tokens(&identity).unwrap(), 22);

        client.disconnect().await;
        assert_eq!(keepalive.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_raise_on_limit_rejects_when_empty() {
        let transport = MockTransport::new();
        transport.respond_with(auto_responder);
        let client = client_builder(transport.clone())
            .bucket(BucketConfig::new(2, 1, Duration::from_secs(60)))
            .raise_on_limit(true)
            .build()
            .unwrap();
        client.connect().await.unwrap();

        client.get_time().await.unwrap();
        client.get_time().await.unwrap();
        assert!(matches!(
            client.get_time().await,
            Err(ClientError::AdmissionRejected)
        ));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_queued_subscriptions_resolve_once_each_after_connect() {
        let transport = MockTransport::new();
        transport.respond_with(auto_responder);
        let client = client_builder(transport.clone()).build().unwrap();

        let a = client
            .subscribe_entity(10, |_: EntityEvent| async {})
            .await
            .unwrap();
        let b = client
            .subscribe_entity(20, |_: EntityEvent| async {})
            .await
            .unwrap();
        assert_eq!(client.pending_subscriptions(), 2);
        assert!(transport.requests().is_empty());

        client.connect().await.unwrap();
        transport.wait_for_sent(2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut queried: Vec<_> = transport
            .requests()
            .iter()
            .filter(|r| r.body == RequestBody::GetEntityInfo)
            .filter_map(|r| r.entity_id)
            .collect();
        queried.sort_unstable();
        assert_eq!(queried, vec![10, 20]);
        assert_eq!(client.pending_subscriptions(), 0);
        assert!(client.has_listener(&a));
        assert!(client.has_listener(&b));
    }

    #[tokio::test]
    async fn test_failed_resolution_registers_nothing() {
        let transport = MockTransport::new();
        transport.respond_with(|req| match req.body {
            RequestBody::GetEntityInfo => Some(AppResponse::failed(req.seq, "not_found")),
            _ => auto_responder(req),
        });
        let client = client_builder(transport.clone()).build().unwrap();
        client.connect().await.unwrap();

        let err = client
            .subscribe_entity(77, |_: EntityEvent| async {})
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::SubscriptionFailed(77)));
        assert!(
            client
                .inner
                .registries
                .entity
                .is_empty(&client.identity())
        );
    }

    #[tokio::test]
    async fn test_entity_events_reach_subscriber_with_resolved_type() {
        let transport = MockTransport::new();
        let client = connected(&transport).await;
        let (tx, mut rx) = channel::unbounded_channel();

        client
            .subscribe_entity(10, move |event: EntityEvent| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                }
            })
            .await
            .unwrap();

        transport.broadcast(AppBroadcast::EntityChanged {
            entity_id: 11,
            payload: EntityPayload::default(),
        });
        transport.broadcast(AppBroadcast::EntityChanged {
            entity_id: 10,
            payload: EntityPayload {
                value: true,
                ..EntityPayload::default()
            },
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity_id, 10);
        assert_eq!(event.entity_type, EntityType::Switch);
        assert!(event.payload.value);
    }

    #[tokio::test]
    async fn test_switch_clears_entity_listeners() {
        let transport = MockTransport::new();
        let client = connected(&transport).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let handle = client
            .subscribe_entity(10, move |_: EntityEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {}
            })
            .await
            .unwrap();
        assert!(client.has_listener(&handle));

        client
            .switch_endpoint(SwitchTarget::new("10.0.0.9", 28082, 1, 1).reconnect(true))
            .await
            .unwrap();
        assert!(!client.has_listener(&handle));

        transport.broadcast(AppBroadcast::EntityChanged {
            entity_id: 10,
            payload: EntityPayload::default(),
        });
        client.get_time().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_switch_clears_pending_subscriptions_and_markers() {
        let transport = MockTransport::new();
        let client = client_builder(transport.clone()).build().unwrap();
        client
            .subscribe_entity(10, |_: EntityEvent| async {})
            .await
            .unwrap();
        client.marker_watcher().process(vec![MapMarker {
            id: 4,
            ..MapMarker::default()
        }]);

        client
            .switch_endpoint(SwitchTarget::new("10.0.0.9", 28082, 1, 1))
            .await
            .unwrap();
        assert_eq!(client.pending_subscriptions(), 0);
        assert_eq!(client.marker_watcher().highest_id(), 0);
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_switch_refused_on_test_server() {
        let transport = MockTransport::new();
        let client = client_builder(transport)
            .use_test_server(true)
            .build()
            .unwrap();
        let err = client
            .switch_endpoint(SwitchTarget::new("10.0.0.9", 28082, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::EndpointSwitchDisallowed));
    }

    #[tokio::test]
    async fn test_remove_listener_by_handle() {
        let transport = MockTransport::new();
        let client = client_builder(transport).build().unwrap();

        let chat = client.on_chat_message(|_: ChatEvent| async {});
        let queued = client
            .subscribe_entity(3, |_: EntityEvent| async {})
            .await
            .unwrap();

        assert!(client.remove_listener(&chat));
        assert!(!client.remove_listener(&chat));
        assert!(client.remove_listener(&queued));
        assert_eq!(client.pending_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_wakeup_reply_is_not_delivered_anywhere() {
        let transport = MockTransport::new();
        let client = connected(&transport).await;

        client.send_wakeup_request().await.unwrap();
        client.get_time().await.unwrap();
        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].body, RequestBody::GetTime);
        assert_eq!(client.inner.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_forgets_unanswered_wakeups() {
        let transport = MockTransport::new();
        transport.respond_with(|req| match req.body {
            RequestBody::GetTime => None,
            _ => auto_responder(req),
        });
        let client = client_builder(transport.clone()).build().unwrap();
        client.connect().await.unwrap();

        client.send_wakeup_request().await.unwrap();
        assert_eq!(client.inner.correlator.detached_count(), 1);

        client.disconnect().await;
        client.connect().await.unwrap();
        assert_eq!(client.inner.correlator.detached_count(), 0);
    }

    #[tokio::test]
    async fn test_get_contents_combines_stacks_on_request() {
        let transport = MockTransport::new();
        let item = |item_id, quantity| EntityItem {
            item_id,
            quantity,
            item_is_blueprint: false,
        };
        let stored = StorageContents {
            protection_expiry: 120,
            has_protection: true,
            items: vec![item(317, 10), item(69, 1), item(317, 5)],
        };
        let reply = stored.clone();
        transport.respond_with(move |req| match req.body {
            RequestBody::GetContents => {
                assert_eq!(req.entity_id, Some(77));
                Some(AppResponse::ok(req.seq, ResponseBody::Contents(reply.clone())))
            }
            _ => auto_responder(req),
        });
        let client = client_builder(transport.clone()).build().unwrap();
        client.connect().await.unwrap();

        assert_eq!(client.get_contents(77, false).await.unwrap(), stored);
        let combined = client.get_contents(77, true).await.unwrap();
        assert_eq!(combined.items, vec![item(317, 15), item(69, 1)]);
        assert!(combined.has_protection);
    }

    #[tokio::test]
    async fn test_current_events_keeps_event_markers() {
        let transport = MockTransport::new();
        let marker = |id, marker_type| MapMarker {
            id,
            marker_type,
            ..MapMarker::default()
        };
        let markers = vec![
            marker(1, marker_type::PLAYER),
            marker(2, marker_type::CARGO_SHIP),
            marker(3, marker_type::VENDING_MACHINE),
            marker(4, marker_type::EXPLOSION),
            marker(5, marker_type::CRATE),
        ];
        transport.respond_with(move |req| match req.body {
            RequestBody::GetMapMarkers => Some(AppResponse::ok(
                req.seq,
                ResponseBody::MapMarkers(markers.clone()),
            )),
            _ => auto_responder(req),
        });
        let client = client_builder(transport.clone()).build().unwrap();
        client.connect().await.unwrap();

        let ids: Vec<_> = client
            .get_current_events()
            .await
            .unwrap()
            .iter()
            .map(|marker| marker.id)
            .collect();
        assert_eq!(ids, vec![2, 4, 5]);
    }

    #[tokio::test]
    async fn test_converse_collects_answers() {
        let transport = MockTransport::new();
        let client = connected(&transport).await;

        let replier = Arc::clone(&transport);
        let talk = tokio::spawn({
            let client = client.clone();
            async move { client.converse(42, &["ready?", "sure?"]).await }
        });
        for (sent, answer) in [(1, "yes"), (2, "very")] {
            replier.wait_for_sent(sent).await;
            replier.broadcast(AppBroadcast::NewTeamMessage(ChatMessage {
                steam_id: 42,
                message: answer.into(),
                ..ChatMessage::default()
            }));
        }

        assert_eq!(talk.await.unwrap().unwrap(), vec!["yes", "very"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_listener_emits_new_markers() {
        let transport = MockTransport::new();
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        transport.respond_with(move |req| match req.body {
            RequestBody::GetMapMarkers => {
                let n = counter.fetch_add(1, Ordering::SeqCst) as u32;
                let markers = (1..=n + 1)
                    .map(|id| MapMarker {
                        id,
                        ..MapMarker::default()
                    })
                    .collect();
                Some(AppResponse::ok(req.seq, ResponseBody::MapMarkers(markers)))
            }
            _ => auto_responder(req),
        });
        let client = client_builder(transport.clone()).build().unwrap();
        client.connect().await.unwrap();

        let (tx, mut rx) = channel::unbounded_channel();
        client.on_marker_event(move |event: MarkerEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.marker.id);
            }
        });
        client.start_marker_listener(Duration::from_secs(5));

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        assert!(client.marker_watcher().is_running());
        client.marker_watcher().stop();
    }
}
