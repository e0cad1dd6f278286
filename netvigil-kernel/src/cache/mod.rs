/*!
 * CACHE MANAGER - Cache clé/valeur + pub/sub à dégradation silencieuse
 *
 * RÔLE :
 * Point d'accès unique au tier cache (Redis ou mémoire). Aucune opération ne
 * remonte d'erreur : si le cache est indisponible, on renvoie une valeur
 * neutre (None / false / vide) et l'ingestion continue.
 *
 * FONCTIONNEMENT :
 * - Machine d'états explicite : idle → connecting → ready ⇄ reconnecting(n) → failed
 * - Notifications typées via `watch` (`subscribe_state`), chaque transition
 *   est loggée une seule fois
 * - Backoff borné : délai = min(tentative × base, max), abandon après N tentatives
 * - `failed` est terminal : indisponible jusqu'au redémarrage du process
 * - Chaque commande est bornée par un timeout ; une erreur de transport en
 *   état ready déclenche une seule tâche de reconnexion
 */

pub mod backend;
pub mod memory;
pub mod redis_backend;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CacheConf;
pub use backend::CacheBackend;
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache disconnected")]
    Disconnected,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache command timed out")]
    Timeout,
    #[error("invalid cache url {0}")]
    InvalidUrl(String),
    #[error("invalid key pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

impl CacheError {
    /// Erreur de transport : la connexion elle-même est en cause
    pub fn is_transport(&self) -> bool {
        match self {
            CacheError::Disconnected | CacheError::Timeout => true,
            CacheError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            CacheError::Serialization(_) | CacheError::InvalidUrl(_) | CacheError::Pattern(_) => false,
        }
    }
}

/// Message reçu sur un canal pub/sub (payload JSON brut)
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    Reconnecting { attempt: u32 },
    Failed,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_conf(conf: &CacheConf) -> Self {
        Self { base_delay: conf.base_delay(), max_delay: conf.max_delay(), max_attempts: conf.max_attempts.max(1) }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHealth {
    pub connected: bool,
    pub state: &'static str,
    pub latency_ms: Option<f64>,
    pub reconnects: u32,
    pub backend: String,
}

struct Inner {
    backend: Arc<dyn CacheBackend>,
    policy: ReconnectPolicy,
    command_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    reconnects: AtomicU32,
    connect_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

/// `memory://` => backend in-process, sinon Redis
pub fn backend_from_url(url: &str) -> Result<Arc<dyn CacheBackend>, CacheError> {
    if url.starts_with("memory://") {
        Ok(Arc::new(MemoryBackend::new()))
    } else {
        Ok(Arc::new(RedisBackend::new(url)?))
    }
}

impl CacheManager {
    pub fn new(backend: Arc<dyn CacheBackend>, policy: ReconnectPolicy, command_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                backend,
                policy,
                command_timeout,
                state,
                reconnects: AtomicU32::new(0),
                connect_task: Mutex::new(None),
            }),
        }
    }

    pub fn from_conf(backend: Arc<dyn CacheBackend>, conf: &CacheConf) -> Self {
        Self::new(backend, ReconnectPolicy::from_conf(conf), conf.command_timeout())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_available(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    fn transition(&self, next: ConnectionState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if !changed {
            return;
        }
        let target = self.inner.backend.describe();
        match next {
            ConnectionState::Ready => info!("[cache] connected to {target}"),
            ConnectionState::Connecting => info!("[cache] connecting to {target}"),
            ConnectionState::Reconnecting { attempt } => warn!("[cache] reconnecting to {target} (attempt {attempt})"),
            ConnectionState::Failed => {
                error!("[cache] giving up on {target}, cache disabled until restart")
            }
            ConnectionState::Idle => debug!("[cache] idle"),
        }
    }

    async fn try_open(&self) -> Result<(), CacheError> {
        let backend = &self.inner.backend;
        let probe = async {
            backend.connect().await?;
            backend.ping().await
        };
        tokio::time::timeout(self.inner.command_timeout, probe).await.map_err(|_| CacheError::Timeout)?
    }

    async fn run_connect_loop(&self, reconnecting: bool) -> bool {
        let policy = self.inner.policy;
        for attempt in 1..=policy.max_attempts {
            self.transition(if reconnecting {
                ConnectionState::Reconnecting { attempt }
            } else {
                ConnectionState::Connecting
            });
            match self.try_open().await {
                Ok(()) => {
                    self.transition(ConnectionState::Ready);
                    return true;
                }
                Err(e) => {
                    debug!("[cache] attempt {attempt}/{} failed: {e}", policy.max_attempts);
                    if attempt < policy.max_attempts {
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                    }
                }
            }
        }
        self.transition(ConnectionState::Failed);
        false
    }

    /// Connexion initiale avec backoff ; `true` une fois la sonde PING passée
    pub async fn connect(&self) -> bool {
        if self.is_available() {
            return true;
        }
        self.run_connect_loop(false).await
    }

    /// Connexion initiale en tâche de fond (le démarrage n'attend pas le cache)
    pub fn spawn_connect(&self) {
        let mut task = self.inner.connect_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let manager = self.clone();
        *task = Some(tokio::spawn(async move {
            manager.run_connect_loop(false).await;
        }));
    }

    fn begin_reconnect(&self) {
        let moved = self.inner.state.send_if_modified(|current| {
            if *current != ConnectionState::Ready {
                return false;
            }
            *current = ConnectionState::Reconnecting { attempt: 0 };
            true
        });
        if !moved {
            return;
        }
        self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
        warn!("[cache] connection to {} lost", self.inner.backend.describe());

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.run_connect_loop(true).await;
        });
        if let Some(previous) = self.inner.connect_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Exécute une commande si le cache est disponible, bornée par le timeout
    async fn guarded<T, Fut>(&self, op: &'static str, command: Fut) -> Option<T>
    where
        Fut: Future<Output = Result<T, CacheError>>,
    {
        if !self.is_available() {
            return None;
        }
        let result = match tokio::time::timeout(self.inner.command_timeout, command).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout),
        };
        match result {
            Ok(value) => Some(value),
            Err(e) if e.is_transport() => {
                debug!("[cache] {op} failed: {e}");
                self.begin_reconnect();
                None
            }
            Err(e) => {
                warn!("[cache] {op} failed: {e}");
                None
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.guarded("get", self.inner.backend.get(key)).await.flatten()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("[cache] undecodable value at {key}: {e}");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        let Some(raw) = encode(key, value) else { return false };
        self.guarded("set", self.inner.backend.set(key, raw, ttl)).await.is_some()
    }

    pub async fn del(&self, key: &str) -> bool {
        self.guarded("del", self.inner.backend.del(key)).await.unwrap_or(false)
    }

    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let Some(raw) = self.guarded("mget", self.inner.backend.mget(keys)).await else {
            return Vec::new();
        };
        raw.into_iter()
            .map(|value| value.and_then(|v| serde_json::from_str(&v).ok()))
            .collect()
    }

    pub async fn mset<T: Serialize>(&self, entries: &[(String, T)], ttl: Option<Duration>) -> bool {
        if entries.is_empty() {
            return true;
        }
        let encoded: Option<Vec<(String, String)>> =
            entries.iter().map(|(key, value)| encode(key, value).map(|raw| (key.clone(), raw))).collect();
        let Some(encoded) = encoded else { return false };
        self.guarded("mset", self.inner.backend.mset(encoded, ttl)).await.is_some()
    }

    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        self.guarded("keys", self.inner.backend.keys(pattern)).await.unwrap_or_default()
    }

    /// Publie un message JSON ; `false` si le tier cache n'a pas pu le prendre
    pub async fn publish<T: Serialize>(&self, channel: &str, message: &T) -> bool {
        let Some(raw) = encode(channel, message) else { return false };
        self.guarded("publish", self.inner.backend.publish(channel, raw)).await.is_some()
    }

    pub async fn subscribe(&self, channels: &[&str]) -> Option<mpsc::Receiver<ChannelMessage>> {
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        self.guarded("subscribe", self.inner.backend.subscribe(&channels)).await
    }

    pub async fn health_check(&self) -> CacheHealth {
        let started = Instant::now();
        let probe = self.guarded("ping", self.inner.backend.ping()).await;
        let latency_ms = probe.map(|_| started.elapsed().as_secs_f64() * 1000.0);
        CacheHealth {
            connected: latency_ms.is_some(),
            state: self.state().label(),
            latency_ms,
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            backend: self.inner.backend.describe(),
        }
    }

    /// Annule toute tentative de (re)connexion en cours
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.connect_task.lock().take() {
            task.abort();
        }
        debug!("[cache] shut down");
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(raw) => Some(raw),
        Err(e) => {
            warn!("[cache] cannot serialize value for {key}: {e}");
            None
        }
    }
}
