use crate::cache::CacheHealth;
use crate::http::AppState;
use crate::ingest::IngestCounters;
use crate::schedule::PeriodicTask;
use crate::writer::WriterStats;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const CHANNEL_KERNEL_HEALTH: &str = "kernel:health";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub cache: CacheHealth,
    pub writer: WriterStats,
    pub ingest: IngestCounters,
    pub observers: usize,
    pub devices_tracked: usize,
    pub interfaces_tracked: usize,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub async fn collect(&self, app: &AppState) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.uptime().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            cache: app.cache.health_check().await,
            writer: app.writer.stats(),
            ingest: app.ingestor.counters(),
            observers: app.hub.client_count(),
            devices_tracked: app.ingestor.tracked_devices(),
            interfaces_tracked: app.ingestor.flapping().tracked(),
        }
    }

    /// Démarre la publication périodique du health kernel sur `kernel:health`
    pub fn spawn_health_publisher(&self, app: AppState, period: Duration) -> PeriodicTask {
        let tracker = self.clone();
        PeriodicTask::start("health-publisher", period, move || {
            let tracker = tracker.clone();
            let app = app.clone();
            async move {
                let health = tracker.collect(&app).await;
                if app.cache.publish(CHANNEL_KERNEL_HEALTH, &health).await {
                    info!(
                        "[health] published kernel health (uptime: {}s, devices: {})",
                        health.uptime_seconds, health.devices_tracked
                    );
                } else {
                    debug!("[health] cache unavailable, health not published");
                }
            }
        })
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::test_support::app_state;

    #[tokio::test]
    async fn test_collect_reports_components() {
        let (app, _pipeline) = app_state(true).await;
        let (_id, _rx) = app.hub.register();

        let health = app.health_tracker.collect(&app).await;
        assert!(health.cache.connected);
        assert_eq!(health.observers, 1);
        assert_eq!(health.writer.queue_len, 0);
        assert_eq!(health.devices_tracked, 0);

        let json = serde_json::to_value(&health).unwrap();
        assert!(json.get("uptimeSeconds").is_some());
        assert_eq!(json["cache"]["state"], "ready");
    }

    #[tokio::test]
    async fn test_publisher_emits_on_kernel_health() {
        let (app, pipeline) = app_state(true).await;
        let mut task = app.health_tracker.spawn_health_publisher(app.clone(), Duration::from_millis(10));

        let published = netvigil_devkit::wait_until(Duration::from_secs(2), || {
            !pipeline.backend.published_on(CHANNEL_KERNEL_HEALTH).is_empty()
        })
        .await;
        assert!(published);
        task.stop().await;
    }
}
