use super::retry::BackoffPolicy;
use crate::error::Result;
use crate::identity::TokenStore;
use crate::messaging::{EventBus, EventMessage, EventType, Subscription};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// Connection status of the push channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts exhausted; only an explicit connect restarts it
    PermanentlyDisconnected,
}

/// One open push connection
#[async_trait]
pub trait RealtimeConnection: Send {
    /// Next text frame. `None` means the peer closed the connection.
    async fn next_message(&mut self) -> Option<Result<String>>;
    async fn close(&mut self) -> Result<()>;
}

/// Opens push connections; the seam tests replace
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self, token: Option<&str>) -> Result<Box<dyn RealtimeConnection>>;
}

/// WebSocket connector for the store's realtime endpoint
pub struct WebSocketConnector {
    url: String,
    api_key: String,
}

impl WebSocketConnector {
    pub fn new(url: &str, api_key: &str) -> Self {
        Self {
            url: url.to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn endpoint(&self, token: Option<&str>) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.url)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("apikey", &self.api_key);
            if let Some(token) = token {
                query.append_pair("access_token", token);
            }
        }
        Ok(url)
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeConnection for WebSocketConnection {
    async fn next_message(&mut self) -> Option<Result<String>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

#[async_trait]
impl RealtimeConnector for WebSocketConnector {
    async fn connect(&self, token: Option<&str>) -> Result<Box<dyn RealtimeConnection>> {
        let url = self.endpoint(token)?;
        let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct Listeners {
    alert: EventBus<EventMessage>,
    camera_status: EventBus<EventMessage>,
    system_update: EventBus<EventMessage>,
    generic: EventBus<EventMessage>,
    status: EventBus<RealtimeStatus>,
}

impl Listeners {
    fn dispatch(&self, message: &EventMessage) {
        let bus = match message.event_type {
            EventType::Alert => &self.alert,
            EventType::CameraStatus => &self.camera_status,
            EventType::SystemUpdate => &self.system_update,
            EventType::Generic(_) => &self.generic,
        };
        bus.publish(message);
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Reconnecting push channel with per-type listeners
pub struct RealtimeChannel {
    connector: Arc<dyn RealtimeConnector>,
    tokens: Arc<TokenStore>,
    policy: BackoffPolicy,
    listeners: Arc<Listeners>,
    connected: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
}

impl RealtimeChannel {
    pub fn new(connector: Arc<dyn RealtimeConnector>, tokens: Arc<TokenStore>, policy: BackoffPolicy) -> Self {
        Self {
            connector,
            tokens,
            policy,
            listeners: Arc::new(Listeners {
                alert: EventBus::new(),
                camera_status: EventBus::new(),
                system_update: EventBus::new(),
                generic: EventBus::new(),
                status: EventBus::new(),
            }),
            connected: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether a connect loop is running, connected or backing off
    pub fn is_active(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |w| !w.handle.is_finished())
    }

    /// Start the connect loop. A running loop is left alone; a loop that gave
    /// up is replaced.
    pub fn connect(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = worker.as_ref() {
            if !existing.handle.is_finished() {
                debug!("Realtime channel already running");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_channel(
            self.connector.clone(),
            self.tokens.clone(),
            self.policy,
            self.listeners.clone(),
            self.connected.clone(),
            cancel.clone(),
        ));
        *worker = Some(Worker { cancel, handle });
    }

    /// Cancel the channel and any pending reconnect, then wait for the loop.
    pub async fn disconnect(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                warn!("Realtime task ended abnormally: {}", e);
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn on_alert<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.listeners.alert.subscribe(callback)
    }

    pub fn on_camera_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.listeners.camera_status.subscribe(callback)
    }

    pub fn on_system_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.listeners.system_update.subscribe(callback)
    }

    /// Messages whose tag has no dedicated listener type
    pub fn on_generic<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.listeners.generic.subscribe(callback)
    }

    pub fn on_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RealtimeStatus) + Send + Sync + 'static,
    {
        self.listeners.status.subscribe(callback)
    }
}

async fn run_channel(
    connector: Arc<dyn RealtimeConnector>,
    tokens: Arc<TokenStore>,
    policy: BackoffPolicy,
    listeners: Arc<Listeners>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        listeners.status.publish(&RealtimeStatus::Connecting);
        let token = tokens.token();
        let connection = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connector.connect(token.as_deref()) => result,
        };

        match connection {
            Ok(mut connection) => {
                info!("Realtime channel connected");
                attempt = 0;
                connected.store(true, Ordering::SeqCst);
                listeners.status.publish(&RealtimeStatus::Connected);

                let cancelled = pump_messages(connection.as_mut(), &listeners, &cancel).await;

                connected.store(false, Ordering::SeqCst);
                if cancelled {
                    if let Err(e) = connection.close().await {
                        debug!("Error closing realtime connection: {}", e);
                    }
                    break;
                }
                listeners.status.publish(&RealtimeStatus::Disconnected);
            }
            Err(e) => {
                warn!("Realtime connect failed: {}", e);
            }
        }

        if !policy.allows(attempt) {
            error!(
                "Realtime channel gave up after {} reconnect attempts",
                policy.max_attempts
            );
            listeners.status.publish(&RealtimeStatus::PermanentlyDisconnected);
            return;
        }

        let delay = policy.delay_for(attempt);
        attempt += 1;
        info!(
            "Reconnecting realtime channel in {:?} (attempt {}/{})",
            delay, attempt, policy.max_attempts
        );
        listeners
            .status
            .publish(&RealtimeStatus::Reconnecting { attempt, delay });

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    connected.store(false, Ordering::SeqCst);
    listeners.status.publish(&RealtimeStatus::Disconnected);
}

/// Read until the peer closes or the channel is cancelled. Returns true on cancel.
async fn pump_messages(
    connection: &mut dyn RealtimeConnection,
    listeners: &Listeners,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return true,
            frame = connection.next_message() => frame,
        };

        match frame {
            Some(Ok(text)) => match EventMessage::from_wire(&text) {
                Ok(message) => listeners.dispatch(&message),
                Err(e) => warn!("Dropping malformed realtime message: {}", e),
            },
            Some(Err(e)) => {
                warn!("Realtime connection error: {}", e);
                return false;
            }
            None => {
                info!("Realtime connection closed by peer");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedConnector, ScriptedSession};

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 10)
    }

    fn collect_status(channel: &RealtimeChannel) -> Arc<Mutex<Vec<RealtimeStatus>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = channel.on_status(move |s| seen_clone.lock().unwrap().push(s.clone()));
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_by_type() {
        let connector = Arc::new(ScriptedConnector::new(vec![ScriptedSession::messages(vec![
            r#"{"type":"alert","payload":{"id":"a1"}}"#,
            r#"{"table":"cameras","type":"UPDATE","record":{"device_id":"cam"}}"#,
            r#"{"type":"system_update","payload":{}}"#,
            r#"{"type":"heartbeat"}"#,
            "not json",
        ])]));
        let channel = RealtimeChannel::new(connector.clone(), Arc::new(TokenStore::new()), policy());

        let counts = Arc::new(Mutex::new([0usize; 4]));
        let c = counts.clone();
        let _a = channel.on_alert(move |_| c.lock().unwrap()[0] += 1);
        let c = counts.clone();
        let _b = channel.on_camera_status(move |_| c.lock().unwrap()[1] += 1);
        let c = counts.clone();
        let _s = channel.on_system_update(move |_| c.lock().unwrap()[2] += 1);
        let c = counts.clone();
        let _g = channel.on_generic(move |_| c.lock().unwrap()[3] += 1);

        channel.connect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.disconnect().await;

        assert_eq!(*counts.lock().unwrap(), [1, 1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let connector = Arc::new(ScriptedConnector::always_failing());
        let channel = RealtimeChannel::new(connector.clone(), Arc::new(TokenStore::new()), policy());
        let seen = collect_status(&channel);

        channel.connect();
        // 1+2+4+8+16+30*5 seconds of backoff
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert_eq!(connector.connect_calls(), 11);
        assert_eq!(
            seen.lock().unwrap().last(),
            Some(&RealtimeStatus::PermanentlyDisconnected)
        );
        let delays: Vec<Duration> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| match s {
                RealtimeStatus::Reconnecting { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(delays.len(), 10);
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[5], Duration::from_secs(30));
        assert!(!channel.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_reset_after_successful_connect() {
        // fail, fail, connect then peer closes, fail ...
        let connector = Arc::new(ScriptedConnector::new(vec![
            ScriptedSession::Fail,
            ScriptedSession::Fail,
            ScriptedSession::messages(vec![]),
        ]));
        let channel = RealtimeChannel::new(connector.clone(), Arc::new(TokenStore::new()), policy());
        let seen = collect_status(&channel);

        channel.connect();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let reconnects: Vec<u32> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| match s {
                RealtimeStatus::Reconnecting { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        // two failures, then the successful session restarts numbering at 1
        assert_eq!(reconnects, vec![1, 2, 1]);
        channel.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let connector = Arc::new(ScriptedConnector::always_failing());
        let channel = RealtimeChannel::new(connector.clone(), Arc::new(TokenStore::new()), policy());

        channel.connect();
        tokio::time::sleep(Duration::from_millis(500)).await;
        channel.disconnect().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.connect_calls(), 1);
        assert!(!channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_is_passed_to_connector() {
        let connector = Arc::new(ScriptedConnector::new(vec![ScriptedSession::messages(vec![])]));
        let tokens = Arc::new(TokenStore::new());
        tokens.set_token("jwt");
        let channel = RealtimeChannel::new(connector.clone(), tokens, policy());

        channel.connect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.disconnect().await;

        assert_eq!(connector.tokens_seen()[0].as_deref(), Some("jwt"));
    }

    #[test]
    fn test_websocket_endpoint_carries_credentials() {
        let connector = WebSocketConnector::new("wss://demo.example.co/realtime/v1/websocket", "anon");
        let url = connector.endpoint(Some("jwt")).unwrap();
        assert_eq!(url.query(), Some("apikey=anon&access_token=jwt"));
    }
}
