use super::{CacheError, ChannelMessage};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Transport brut du cache : valeurs déjà sérialisées en JSON.
///
/// Le `CacheManager` est seul responsable de la disponibilité, des timeouts et
/// de la reconnexion ; une implémentation se contente de remonter ses erreurs.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// (Re)ouvre la connexion, remplace l'éventuelle connexion précédente
    async fn connect(&self) -> Result<(), CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn del(&self, key: &str) -> Result<bool, CacheError>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;
    async fn mset(&self, entries: Vec<(String, String)>, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Retourne le nombre d'abonnés ayant reçu le message
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, CacheError>;
    /// Flux de messages ; il se ferme quand la connexion d'abonnement tombe
    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::Receiver<ChannelMessage>, CacheError>;

    fn describe(&self) -> String;
}
