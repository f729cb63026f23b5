use super::action::AmiAction;
use super::calls::{Call, CallTable, CallTableRef};
use super::codec::{AmiCodec, AmiFrame, AmiMessage, AmiResponse};
use super::correlator::{wait_for, ActionCorrelator, ActionCorrelatorRef};
use super::dispatcher::EventDispatcher;
use super::error::{AmiError, AmiResult};
use super::extension::{ExtensionState, ExtensionStatus, ExtensionTracker};
use super::sipconfig::{build_sip_config, SipClientConfig};
use crate::config::{AmiConfig, IceServerItem, SipWebConfig};
use crate::event::{create_event_sender, EventReceiver, EventSender, PbxEvent};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Q.850 cause sent when rejecting a ringing call.
const CAUSE_CALL_REJECTED: u32 = 21;

type AmiWriter = FramedWrite<OwnedWriteHalf, AmiCodec>;
type AmiReader = FramedRead<OwnedReadHalf, AmiCodec>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OriginateOptions {
    pub context: Option<String>,
    pub caller_id: Option<String>,
    /// How long the originating extension rings, in seconds
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

/// Outcome of a successful control action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionReply {
    pub action_id: String,
    pub message: Option<String>,
}

impl From<AmiResponse> for ActionReply {
    fn from(response: AmiResponse) -> Self {
        Self {
            action_id: response.action_id().unwrap_or_default().to_string(),
            message: response.message().map(|m| m.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub host: String,
    pub port: u16,
    pub server_version: Option<String>,
    pub active_calls: usize,
    pub extensions: usize,
    pub pending_actions: usize,
    pub reconnects: u64,
}

pub struct AmiClientInner {
    config: Arc<AmiConfig>,
    sip: SipWebConfig,
    ice_servers: Option<Vec<IceServerItem>>,
    state: Mutex<ConnectionState>,
    writer: tokio::sync::Mutex<Option<AmiWriter>>,
    connection_token: Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
    correlator: ActionCorrelatorRef,
    calls: CallTableRef,
    extensions: Arc<ExtensionTracker>,
    dispatcher: EventDispatcher,
    event_sender: EventSender,
    manually_closed: AtomicBool,
    reconnecting: AtomicBool,
    reconnects: AtomicU64,
    server_version: Mutex<Option<String>>,
    cancel_token: CancellationToken,
}

/// Client for the switch's manager interface. Cheap to clone; every clone
/// shares the same connection, call table and extension cache.
#[derive(Clone)]
pub struct AmiClient {
    inner: Arc<AmiClientInner>,
}

pub struct AmiClientBuilder {
    config: Option<AmiConfig>,
    sip: Option<SipWebConfig>,
    ice_servers: Option<Vec<IceServerItem>>,
    event_sender: Option<EventSender>,
    cancel_token: Option<CancellationToken>,
}

impl AmiClientBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            sip: None,
            ice_servers: None,
            event_sender: None,
            cancel_token: None,
        }
    }

    pub fn with_config(mut self, config: AmiConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_sip_config(mut self, sip: SipWebConfig) -> Self {
        self.sip = Some(sip);
        self
    }

    pub fn with_ice_servers(mut self, ice_servers: Option<Vec<IceServerItem>>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn with_event_sender(mut self, event_sender: EventSender) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn build(self) -> AmiClient {
        let config = Arc::new(self.config.unwrap_or_default());
        let event_sender = self.event_sender.unwrap_or_else(create_event_sender);
        let calls = CallTable::new(config.clone(), event_sender.clone());
        let extensions = Arc::new(ExtensionTracker::new(config.extension_cache_ttl()));
        let dispatcher = EventDispatcher::new(calls.clone(), extensions.clone(), event_sender.clone());

        AmiClient {
            inner: Arc::new(AmiClientInner {
                config,
                sip: self.sip.unwrap_or_default(),
                ice_servers: self.ice_servers,
                state: Mutex::new(ConnectionState::Disconnected),
                writer: tokio::sync::Mutex::new(None),
                connection_token: Mutex::new(None),
                generation: AtomicU64::new(0),
                correlator: ActionCorrelator::new(),
                calls,
                extensions,
                dispatcher,
                event_sender,
                manually_closed: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                reconnects: AtomicU64::new(0),
                server_version: Mutex::new(None),
                cancel_token: self.cancel_token.unwrap_or_default(),
            }),
        }
    }
}

impl AmiClientInner {
    fn set_state(&self, state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.state.lock().unwrap(), state)
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn emit(&self, event: PbxEvent) {
        self.event_sender.send(event).ok();
    }

    async fn connect(self: &Arc<Self>) -> AmiResult<()> {
        let addr = self.config.addr();
        let login_timeout = self.config.login_timeout();
        self.set_state(ConnectionState::Connecting);
        info!(addr, "connecting to manager interface");

        let stream = match timeout(login_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.connect_failed(AmiError::connection(e))),
            Err(_) => return Err(self.connect_failed(AmiError::connection("connect timed out"))),
        };
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        let token = self.cancel_token.child_token();
        let generation = {
            let mut writer = self.writer.lock().await;
            *writer = Some(FramedWrite::new(write_half, AmiCodec::new()));
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        if let Some(previous) = self.connection_token.lock().unwrap().replace(token.clone()) {
            previous.cancel();
        }

        let (greeting_tx, greeting_rx) = oneshot::channel();
        let reader = FramedRead::new(read_half, AmiCodec::new());
        tokio::spawn(reader_loop(
            self.clone(),
            reader,
            greeting_tx,
            token.clone(),
            generation,
        ));

        let greeting = match timeout(login_timeout, greeting_rx).await {
            Ok(Ok(greeting)) => greeting,
            Ok(Err(_)) => {
                return Err(self
                    .abort_connect(
                        &token,
                        generation,
                        AmiError::connection("connection closed before greeting"),
                    )
                    .await);
            }
            Err(_) => {
                let error = AmiError::connection(format!(
                    "no greeting within {}s",
                    login_timeout.as_secs()
                ));
                return Err(self.abort_connect(&token, generation, error).await);
            }
        };
        info!(addr, greeting, "manager greeting received");
        *self.server_version.lock().unwrap() = Some(greeting);
        self.set_state(ConnectionState::Authenticating);

        let login = AmiAction::login(&self.config.username, &self.config.secret);
        let login_result = select! {
            result = self.send_action(login, login_timeout) => result,
            _ = token.cancelled() => Err(AmiError::connection("connection closed during login")),
        };
        if let Err(e) = login_result {
            let e = match e {
                AmiError::ActionRejected { message, .. } => AmiError::Authentication { message },
                other => other,
            };
            return Err(self.abort_connect(&token, generation, e).await);
        }

        let subscribe = AmiAction::events(&self.config.event_mask);
        let subscribe_result = select! {
            result = self.send_action(subscribe, self.config.action_timeout()) => result,
            _ = token.cancelled() => Err(AmiError::connection("connection closed during subscription")),
        };
        if let Err(e) = subscribe_result {
            if token.is_cancelled() {
                return Err(self.abort_connect(&token, generation, e).await);
            }
            warn!(error = %e, "event subscription failed");
        }

        // on_connection_closed reads the state under the same lock
        let alive = {
            let writer = self.writer.lock().await;
            let alive = writer.is_some()
                && !token.is_cancelled()
                && self.generation.load(Ordering::SeqCst) == generation;
            if alive {
                self.set_state(ConnectionState::Connected);
            }
            alive
        };
        if !alive {
            let error = AmiError::connection("connection closed during subscription");
            return Err(self.abort_connect(&token, generation, error).await);
        }
        info!(addr, username = %self.config.username, "manager interface connected");
        if generation > 1 {
            let purged = self.calls.purge_stale(self.config.stale_call_age());
            if purged > 0 {
                info!(purged, "stale calls purged after reconnect");
            }
        }
        Ok(())
    }

    fn connect_failed(&self, error: AmiError) -> AmiError {
        warn!(error = %error, "manager connect failed");
        self.set_state(ConnectionState::Disconnected);
        self.emit(PbxEvent::ConnectionError {
            error: error.to_string(),
        });
        error
    }

    /// Tear down a half-open connection. A newer connection, if any, is
    /// left untouched.
    async fn abort_connect(
        &self,
        token: &CancellationToken,
        generation: u64,
        error: AmiError,
    ) -> AmiError {
        warn!(error = %error, "manager connect aborted");
        token.cancel();
        let mut writer = self.writer.lock().await;
        if self.generation.load(Ordering::SeqCst) == generation {
            writer.take();
            self.set_state(ConnectionState::Disconnected);
        }
        error
    }

    async fn on_connection_closed(self: &Arc<Self>, generation: u64, token: CancellationToken) {
        token.cancel();
        let previous = {
            let mut writer = self.writer.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            writer.take();
            self.set_state(ConnectionState::Disconnected)
        };
        self.emit(PbxEvent::Disconnected);

        let manually_closed = self.manually_closed.load(Ordering::SeqCst);
        info!(?previous, manually_closed, "manager connection closed");
        if previous == ConnectionState::Connected && !manually_closed {
            self.schedule_reconnect();
        }
    }

    /// Start the reconnect loop unless one is already running. The loop
    /// retries at a fixed interval until a connect succeeds.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reconnect already scheduled");
            return;
        }
        let inner = self.clone();
        let interval = self.config.reconnect_interval();
        info!(interval = interval.as_secs(), "scheduling reconnect");

        tokio::spawn(async move {
            loop {
                select! {
                    _ = sleep(interval) => {}
                    _ = inner.cancel_token.cancelled() => break,
                }
                if inner.manually_closed.load(Ordering::SeqCst) {
                    break;
                }
                let attempt = inner.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
                info!(attempt, "reconnecting to manager interface");
                match inner.connect().await {
                    Ok(()) => break,
                    Err(e) => warn!(attempt, error = %e, "reconnect failed"),
                }
            }
            inner.reconnecting.store(false, Ordering::SeqCst);
            // the new connection may have dropped before the flag was cleared
            if inner.state() == ConnectionState::Disconnected
                && !inner.manually_closed.load(Ordering::SeqCst)
                && !inner.cancel_token.is_cancelled()
            {
                inner.schedule_reconnect();
            }
        });
    }

    async fn send_action(&self, mut action: AmiAction, timeout: Duration) -> AmiResult<AmiResponse> {
        let action_id = action.ensure_id();
        let name = action.name().to_string();
        let receiver = {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(AmiError::NotConnected);
            };
            let receiver = self.correlator.register(&action_id, &name, timeout);
            debug!(action = %name, action_id, "sending action");
            if let Err(e) = writer.send(action).await {
                self.correlator.discard(&action_id);
                return Err(AmiError::connection(e));
            }
            receiver
        };
        wait_for(receiver).await
    }

    fn tracked_call(&self, call_id: &str) -> AmiResult<Call> {
        self.calls
            .get(call_id)
            .ok_or_else(|| AmiError::call_not_found(call_id))
    }
}

async fn reader_loop(
    inner: Arc<AmiClientInner>,
    mut reader: AmiReader,
    greeting_tx: oneshot::Sender<String>,
    token: CancellationToken,
    generation: u64,
) {
    let mut greeting_tx = Some(greeting_tx);
    loop {
        let frame = select! {
            _ = token.cancelled() => break,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(AmiFrame::Greeting(greeting))) => {
                if let Some(tx) = greeting_tx.take() {
                    tx.send(greeting).ok();
                }
            }
            Some(Ok(AmiFrame::Message(AmiMessage::Response(response)))) => {
                inner.correlator.resolve(response);
            }
            Some(Ok(AmiFrame::Message(AmiMessage::Event(event)))) => {
                inner.dispatcher.dispatch(&event);
            }
            Some(Err(e)) => {
                warn!(error = %e, "manager socket error");
                inner.emit(PbxEvent::ConnectionError {
                    error: e.to_string(),
                });
                break;
            }
            None => {
                debug!("manager socket closed by peer");
                break;
            }
        }
    }
    inner.on_connection_closed(generation, token).await;
}

impl AmiClient {
    pub fn builder() -> AmiClientBuilder {
        AmiClientBuilder::new()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.event_sender.subscribe()
    }

    /// Connect, wait for the greeting, log in and subscribe to events.
    pub async fn initialize(&self) -> AmiResult<()> {
        self.inner.manually_closed.store(false, Ordering::SeqCst);
        self.inner.connect().await
    }

    /// Keep retrying in the background until connected.
    pub fn start_reconnect(&self) {
        self.inner.manually_closed.store(false, Ordering::SeqCst);
        self.inner.schedule_reconnect();
    }

    pub async fn disconnect(&self) {
        self.inner.manually_closed.store(true, Ordering::SeqCst);
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let mut logoff = AmiAction::logoff();
            logoff.ensure_id();
            writer.send(logoff).await.ok();
            writer.close().await.ok();
        }
        if let Some(token) = self.inner.connection_token.lock().unwrap().take() {
            token.cancel();
        }
        info!("manager interface disconnect requested");
    }

    /// Stop the reconnect loop and the reader for good.
    pub fn shutdown(&self) {
        self.inner.manually_closed.store(true, Ordering::SeqCst);
        self.inner.cancel_token.cancel();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Send any action and wait for its response within the default timeout.
    pub async fn send_action(&self, action: AmiAction) -> AmiResult<AmiResponse> {
        self.inner
            .send_action(action, self.inner.config.action_timeout())
            .await
    }

    pub async fn originate(
        &self,
        from_extension: &str,
        to_number: &str,
        options: OriginateOptions,
    ) -> AmiResult<ActionReply> {
        let config = &self.inner.config;
        let ring_timeout = options
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.originate_timeout());
        let mut action = AmiAction::new("Originate")
            .field("Channel", format!("{}/{}", config.channel_tech, from_extension))
            .field("Exten", to_number)
            .field(
                "Context",
                options
                    .context
                    .unwrap_or_else(|| config.default_context.clone()),
            )
            .field("Priority", "1")
            .field(
                "CallerID",
                options.caller_id.unwrap_or_else(|| from_extension.to_string()),
            )
            .field("Timeout", ring_timeout.as_millis().to_string())
            .field("Async", "true");
        let mut variables: Vec<_> = options.variables.into_iter().collect();
        variables.sort();
        for (key, value) in variables {
            action = action.field("Variable", format!("{}={}", key, value));
        }

        info!(from_extension, to_number, "originate");
        self.inner
            .send_action(action, config.originate_timeout())
            .await
            .map(ActionReply::from)
    }

    /// Answer a ringing call by redirecting it to `target_extension`.
    pub async fn answer(&self, call_id: &str, target_extension: &str) -> AmiResult<ActionReply> {
        let call = self.inner.tracked_call(call_id)?;
        info!(call_id, target_extension, "answer");
        self.redirect(&call, target_extension).await
    }

    pub async fn reject(&self, call_id: &str) -> AmiResult<ActionReply> {
        let call = self.inner.tracked_call(call_id)?;
        info!(call_id, "reject");
        self.send_action(AmiAction::hangup(&call.channel, Some(CAUSE_CALL_REJECTED)))
            .await
            .map(ActionReply::from)
    }

    pub async fn hang_up(&self, call_id: &str) -> AmiResult<ActionReply> {
        let call = self.inner.tracked_call(call_id)?;
        info!(call_id, "hang up");
        self.send_action(AmiAction::hangup(&call.channel, None))
            .await
            .map(ActionReply::from)
    }

    pub async fn transfer(&self, call_id: &str, target_extension: &str) -> AmiResult<ActionReply> {
        let call = self.inner.tracked_call(call_id)?;
        info!(call_id, target_extension, "transfer");
        self.redirect(&call, target_extension).await
    }

    /// Placeholder: no park/unpark action is sent.
    pub async fn hold(&self, call_id: &str, hold: bool) -> AmiResult<ActionReply> {
        self.inner.tracked_call(call_id)?;
        warn!(call_id, hold, "hold requested but not implemented");
        Err(AmiError::NotImplemented {
            operation: "hold".to_string(),
        })
    }

    async fn redirect(&self, call: &Call, target_extension: &str) -> AmiResult<ActionReply> {
        let action = AmiAction::redirect(
            &call.channel,
            target_extension,
            &self.inner.config.default_context,
        );
        self.send_action(action).await.map(ActionReply::from)
    }

    pub async fn get_extension_status(&self, extension: &str) -> AmiResult<ExtensionState> {
        if let Some(state) = self.inner.extensions.get_fresh(extension) {
            return Ok(state);
        }
        let response = self
            .send_action(AmiAction::extension_state(
                extension,
                &self.inner.config.default_context,
            ))
            .await?;
        let (status, code) = ExtensionStatus::from_field(response.fields.get("Status"));
        debug!(extension, ?status, code, "extension state refreshed");
        Ok(self.inner.extensions.update(extension, code))
    }

    pub fn get_sip_config(&self, extension: &str) -> SipClientConfig {
        build_sip_config(&self.inner.sip, self.inner.ice_servers.as_ref(), extension)
    }

    pub fn get_active_calls(&self) -> Vec<Call> {
        self.inner.calls.list()
    }

    pub fn get_call(&self, call_id: &str) -> Option<Call> {
        self.inner.calls.get(call_id)
    }

    pub fn get_extensions(&self) -> Vec<ExtensionState> {
        self.inner.extensions.list()
    }

    pub fn get_status(&self) -> ClientStatus {
        let inner = &self.inner;
        let state = inner.state();
        ClientStatus {
            connected: state == ConnectionState::Connected,
            state,
            host: inner.config.host.clone(),
            port: inner.config.port,
            server_version: inner.server_version.lock().unwrap().clone(),
            active_calls: inner.calls.count(),
            extensions: inner.extensions.count(),
            pending_actions: inner.correlator.pending_count(),
            reconnects: inner.reconnects.load(Ordering::SeqCst),
        }
    }
}
