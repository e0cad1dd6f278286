use crate::models::{Device, Thresholds};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub cache: CacheConf,
    pub writer: WriterConf,
    pub flapping: FlappingConf,
    pub thresholds: Thresholds,
    pub health: HealthConf,
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    pub max_body_bytes: usize,
    /// Clé `x-api-key` exigée hors `/health` ; absente = API ouverte
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConf {
    /// `redis://host:port` ou `memory://` (instance unique)
    pub url: String,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub command_timeout_ms: u64,
    pub status_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConf {
    pub database_url: String,
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
    pub continuation_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlappingConf {
    pub window_secs: u64,
    pub capacity: usize,
    /// Nombre de transitions à dépasser dans la fenêtre
    pub threshold: usize,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConf {
    pub publish_interval_secs: u64,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into(), max_body_bytes: 8 * 1024 * 1024, api_key: None }
    }
}

impl Default for CacheConf {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            max_attempts: 10,
            command_timeout_ms: 1_000,
            status_ttl_secs: 300,
        }
    }
}

impl Default for WriterConf {
    fn default() -> Self {
        Self {
            database_url: "sqlite://netvigil.db".into(),
            max_batch_size: 100,
            flush_interval_ms: 1_000,
            continuation_delay_ms: 100,
        }
    }
}

impl Default for FlappingConf {
    fn default() -> Self {
        Self { window_secs: 600, capacity: 32, threshold: 3, sweep_interval_secs: 60 }
    }
}

impl Default for HealthConf {
    fn default() -> Self {
        Self { publish_interval_secs: 30 }
    }
}

impl CacheConf {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }
}

impl WriterConf {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
    pub fn continuation_delay(&self) -> Duration {
        Duration::from_millis(self.continuation_delay_ms)
    }
}

impl FlappingConf {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl KernelConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: KernelConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.writer.max_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "writer.max_batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.flapping.capacity < 2 {
            return Err(ConfigError::Invalid {
                field: "flapping.capacity",
                reason: "needs room for at least two samples".into(),
            });
        }
        let t = &self.thresholds;
        if t.good.latency_ms > t.degraded.latency_ms || t.good.packet_loss > t.degraded.packet_loss {
            return Err(ConfigError::Invalid {
                field: "thresholds",
                reason: "good tier must not exceed degraded tier".into(),
            });
        }
        Ok(())
    }

    /// Variables d'environnement prioritaires sur le fichier
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("NETVIGIL_BIND") {
            self.http.bind = bind;
        }
        if let Ok(url) = std::env::var("NETVIGIL_CACHE_URL") {
            self.cache.url = url;
        }
        if let Ok(url) = std::env::var("NETVIGIL_DATABASE_URL") {
            self.writer.database_url = url;
        }
        if let Ok(key) = std::env::var("NETVIGIL_API_KEY") {
            self.http.api_key = Some(key).filter(|k| !k.is_empty());
        }
    }
}

pub async fn read_config(path: &Path) -> Result<KernelConfig, ConfigError> {
    let txt = fs::read_to_string(path).await?;
    KernelConfig::from_yaml(&txt)
}

/// Charge la config depuis un fichier ; fichier absent, illisible ou invalide => défauts
pub async fn load_config_from(path: &Path) -> KernelConfig {
    if !path.exists() {
        warn!("[kernel] no config at {}, using defaults", path.display());
        return KernelConfig::default();
    }
    read_config(path).await.unwrap_or_else(|e| {
        error!("[kernel] config {} unusable, using defaults: {e}", path.display());
        KernelConfig::default()
    })
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("NETVIGIL_CONFIG").unwrap_or_else(|_| "netvigil.yaml".into());
    let mut cfg = load_config_from(Path::new(&path)).await;
    cfg.apply_env_overrides();
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
http:
  bind: "127.0.0.1:9000"
writer:
  max_batch_size: 50
thresholds:
  good: { latency_ms: 30, packet_loss: 0.5 }
  degraded: { latency_ms: 120, packet_loss: 4 }
devices:
  - id: core-1
    ip: 10.0.0.1
    area_id: dc1
  - id: edge-7
    ip: 10.0.7.1
    thresholds:
      good: { latency_ms: 80 }
"#;

    #[test]
    fn test_parse_yaml_keeps_defaults_for_missing_sections() {
        let cfg = KernelConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.http.bind, "127.0.0.1:9000");
        assert_eq!(cfg.writer.max_batch_size, 50);
        assert_eq!(cfg.writer.flush_interval_ms, 1_000);
        assert_eq!(cfg.cache.max_attempts, 10);
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[0].area_id.as_deref(), Some("dc1"));
        let edge = cfg.devices[1].thresholds.unwrap();
        assert_eq!(edge.good.unwrap().latency_ms, Some(80.0));
        assert_eq!(edge.good.unwrap().packet_loss, None);
    }

    #[test]
    fn test_empty_document_is_default() {
        let cfg = KernelConfig::from_yaml("  \n").unwrap();
        assert_eq!(cfg.writer.max_batch_size, 100);
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let err = KernelConfig::from_yaml("writer:\n  max_batch_size: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "writer.max_batch_size", .. }));
    }

    #[test]
    fn test_validation_rejects_inverted_tiers() {
        let yaml = "thresholds:\n  good: { latency_ms: 200, packet_loss: 1 }\n  degraded: { latency_ms: 100, packet_loss: 5 }\n";
        assert!(KernelConfig::from_yaml(yaml).is_err());
    }

    #[tokio::test]
    async fn test_load_config_from_file_and_fallbacks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = load_config_from(file.path()).await;
        assert_eq!(cfg.devices.len(), 2);

        let missing = load_config_from(Path::new("/nonexistent/netvigil.yaml")).await;
        assert_eq!(missing.http.bind, "0.0.0.0:8080");

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        broken.write_all(b"writer: [not, a, map").unwrap();
        let fallback = load_config_from(broken.path()).await;
        assert_eq!(fallback.writer.max_batch_size, 100);
    }

    #[tokio::test]
    async fn test_unreadable_config_is_reported_then_defaulted() {
        // un répertoire existe mais ne se lit pas comme un fichier
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(read_config(dir.path()).await, Err(ConfigError::Io(_))));

        let cfg = load_config_from(dir.path()).await;
        assert_eq!(cfg.writer.max_batch_size, 100);
    }
}
