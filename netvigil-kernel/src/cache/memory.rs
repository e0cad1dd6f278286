/*!
 * BACKEND MÉMOIRE - Cache in-process (`memory://`)
 *
 * Sert aux déploiements mono-instance et de double de test : la connectivité
 * se pilote avec `set_online`. Seul un backend créé par `recording()` garde
 * les dernières publications (`RECORD_CAPACITY` au plus) pour inspection.
 */

use super::backend::CacheBackend;
use super::{CacheError, ChannelMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};

const BUS_CAPACITY: usize = 1024;
pub const RECORD_CAPACITY: usize = BUS_CAPACITY;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    online: watch::Sender<bool>,
    bus: broadcast::Sender<ChannelMessage>,
    published: Option<Mutex<VecDeque<ChannelMessage>>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        let (online, _) = watch::channel(true);
        Self { entries: Mutex::new(HashMap::new()), online, bus, published: None }
    }

    /// Variante qui conserve les `RECORD_CAPACITY` dernières publications
    pub fn recording() -> Self {
        Self { published: Some(Mutex::new(VecDeque::with_capacity(RECORD_CAPACITY))), ..Self::new() }
    }

    /// Simule une coupure / un retour du serveur ; les abonnements se ferment à la coupure
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn published(&self) -> Vec<ChannelMessage> {
        self.published.as_ref().map(|log| log.lock().iter().cloned().collect()).unwrap_or_default()
    }

    pub fn published_on(&self, channel: &str) -> Vec<ChannelMessage> {
        self.published().into_iter().filter(|m| m.channel == channel).collect()
    }

    fn record(&self, message: &ChannelMessage) {
        if let Some(log) = &self.published {
            let mut log = log.lock();
            if log.len() == RECORD_CAPACITY {
                log.pop_front();
            }
            log.push_back(message.clone());
        }
    }

    fn ensure_online(&self) -> Result<(), CacheError> {
        if *self.online.borrow() {
            Ok(())
        } else {
            Err(CacheError::Disconnected)
        }
    }

    fn read(&self, key: &str, now: Instant) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn connect(&self) -> Result<(), CacheError> {
        self.ensure_online()
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.ensure_online()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.ensure_online()?;
        Ok(self.read(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.ensure_online()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, CacheError> {
        self.ensure_online()?;
        let now = Instant::now();
        Ok(self.entries.lock().remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        self.ensure_online()?;
        let now = Instant::now();
        Ok(keys.iter().map(|k| self.read(k, now)).collect())
    }

    async fn mset(&self, entries: Vec<(String, String)>, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.ensure_online()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut map = self.entries.lock();
        for (key, value) in entries {
            map.insert(key, Entry { value, expires_at });
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.ensure_online()?;
        let now = Instant::now();
        let matcher = glob::Pattern::new(pattern)?;
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = entries.keys().filter(|k| matcher.matches(k)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, CacheError> {
        self.ensure_online()?;
        let message = ChannelMessage { channel: channel.to_string(), payload };
        self.record(&message);
        Ok(self.bus.send(message).unwrap_or(0))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::Receiver<ChannelMessage>, CacheError> {
        self.ensure_online()?;
        let mut bus = self.bus.subscribe();
        let mut online = self.online.subscribe();
        let channels = channels.to_vec();
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = online.changed() => {
                        if changed.is_err() || !*online.borrow() {
                            break;
                        }
                    }
                    received = bus.recv() => match received {
                        Ok(message) => {
                            if channels.contains(&message.channel) && tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        Ok(rx)
    }

    fn describe(&self) -> String {
        "memory://".into()
    }
}
