/*!
 * METRIC INGESTOR - Entrée du pipeline de télémétrie
 *
 * RÔLE :
 * Reçoit les lots postés par le collecteur (`/ping`, `/snmp`), résout chaque
 * adresse vers un équipement configuré, classe / normalise les mesures puis
 * alimente le BatchWriter, le FlappingDetector et le pub/sub.
 *
 * FONCTIONNEMENT :
 * - Chaque enregistrement est traité indépendamment et dans l'ordre du lot ;
 *   un enregistrement invalide ou inconnu n'interrompt jamais le lot
 * - Une mesure ping = une écriture `ping_history` ; l'état courant des
 *   équipements vit dans le cache (`device:status:{id}`, mset en fin de lot)
 * - Si le cache ne prend pas une publication, le message est remis
 *   directement au hub local
 */

pub mod classify;
pub mod fields;

use crate::cache::CacheManager;
use crate::directory::DeviceDirectory;
use crate::flapping::{FlappingDetector, LinkSample};
use crate::hub::{Hub, CHANNEL_ALERT_FLAPPING, CHANNEL_DEVICE_UPDATE, CHANNEL_INTERFACE_UPDATE, CHANNEL_WIRELESS_UPDATE};
use crate::models::{rfc3339, Device, DeviceSnapshot, FlappingEvent, InterfaceReading, PingReading, WirelessReading};
use crate::state::{new_state, Shared};
use crate::writer::{BatchWriter, WriteOp};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use fields::{IngestError, RawMetric};

const STATUS_KEY_PATTERN: &str = "device:status:*";

pub fn status_key(device_id: &str) -> String {
    format!("device:status:{device_id}")
}

pub fn flapping_key(device_id: &str, if_index: u32) -> String {
    format!("flapping:{device_id}:{if_index}")
}

/// Bilan d'un lot (renvoyé en en-têtes HTTP)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Default)]
struct IngestStats {
    batches: AtomicU64,
    processed: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    flapping_events: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestCounters {
    pub batches: u64,
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub flapping_events: u64,
}

pub struct MetricIngestor {
    directory: Arc<DeviceDirectory>,
    writer: BatchWriter,
    cache: CacheManager,
    flapping: Arc<FlappingDetector>,
    hub: Hub,
    snapshots: Shared<HashMap<String, DeviceSnapshot>>,
    stats: IngestStats,
    status_ttl: Duration,
}

impl MetricIngestor {
    pub fn new(
        directory: Arc<DeviceDirectory>,
        writer: BatchWriter,
        cache: CacheManager,
        flapping: Arc<FlappingDetector>,
        hub: Hub,
        status_ttl: Duration,
    ) -> Self {
        Self {
            directory,
            writer,
            cache,
            flapping,
            hub,
            snapshots: new_state(HashMap::new()),
            stats: IngestStats::default(),
            status_ttl,
        }
    }

    pub async fn ingest_ping_batch(&self, records: &[Value]) -> IngestReport {
        let mut report = IngestReport::default();
        let mut touched: Vec<DeviceSnapshot> = Vec::new();

        for record in records {
            match self.ingest_ping(record).await {
                Ok(Some(snapshot)) => {
                    report.processed += 1;
                    match touched.iter_mut().find(|s| s.device_id == snapshot.device_id) {
                        Some(slot) => *slot = snapshot,
                        None => touched.push(snapshot),
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    debug!("[ingest] ping record rejected: {e}");
                }
            }
        }

        if !touched.is_empty() {
            let entries: Vec<(String, DeviceSnapshot)> =
                touched.into_iter().map(|s| (status_key(&s.device_id), s)).collect();
            if !self.cache.mset(&entries, Some(self.status_ttl)).await {
                debug!("[ingest] device status not cached ({} devices)", entries.len());
            }
        }

        self.record("ping", report);
        report
    }

    pub async fn ingest_snmp_batch(&self, records: &[Value]) -> IngestReport {
        let mut report = IngestReport::default();
        for record in records {
            match self.ingest_snmp(record).await {
                Ok(true) => report.processed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    debug!("[ingest] snmp record rejected: {e}");
                }
            }
        }
        self.record("snmp", report);
        report
    }

    fn record(&self, kind: &str, report: IngestReport) {
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats.processed.fetch_add(report.processed as u64, Ordering::Relaxed);
        self.stats.skipped.fetch_add(report.skipped as u64, Ordering::Relaxed);
        self.stats.errors.fetch_add(report.errors as u64, Ordering::Relaxed);
        let IngestReport { processed, skipped, errors } = report;
        if skipped > 0 || errors > 0 {
            info!("[ingest] {kind} batch: {processed} processed, {skipped} skipped, {errors} errors");
        } else {
            debug!("[ingest] {kind} batch: {processed} processed");
        }
    }

    fn resolve(&self, metric: &RawMetric, tags: &[&str]) -> Result<Option<&Device>, IngestError> {
        let address = tags.iter().find_map(|t| metric.tag(t)).ok_or(IngestError::MissingField("address tag"))?;
        let device = self.directory.resolve(&address);
        if device.is_none() {
            debug!("[ingest] no device configured for {address}, skipped");
        }
        Ok(device)
    }

    async fn ingest_ping(&self, record: &Value) -> Result<Option<DeviceSnapshot>, IngestError> {
        let metric = RawMetric::from_value(record)?;
        let Some(device) = self.resolve(&metric, &["url", "host", "source"])? else {
            return Ok(None);
        };
        let thresholds = self.directory.thresholds_for(device);
        let reading = fields::ping_reading(&metric, &device.id, &thresholds)?;

        self.writer.queue_write(WriteOp::Insert, "ping_history", ping_row(&reading), None);
        let snapshot = self.update_snapshot(device, &reading);
        if snapshot.changed {
            debug!("[ingest] {} is now {}", snapshot.device_id, snapshot.status);
        }
        self.publish(CHANNEL_DEVICE_UPDATE, &snapshot).await;
        Ok(Some(snapshot))
    }

    fn update_snapshot(&self, device: &Device, reading: &PingReading) -> DeviceSnapshot {
        let mut snapshots = self.snapshots.lock();
        let previous_status = snapshots.get(&device.id).map(|s| s.status);
        let snapshot = DeviceSnapshot {
            device_id: device.id.clone(),
            name: device.name.clone(),
            area_id: device.area_id.clone(),
            status: reading.status,
            previous_status,
            changed: previous_status != Some(reading.status),
            latency: reading.latency,
            packet_loss: reading.packet_loss,
            last_seen: reading.timestamp,
        };
        snapshots.insert(device.id.clone(), snapshot.clone());
        snapshot
    }

    async fn ingest_snmp(&self, record: &Value) -> Result<bool, IngestError> {
        let metric = RawMetric::from_value(record)?;
        if !matches!(metric.name.as_str(), "interface" | "ubiquiti_wireless") {
            return Err(IngestError::UnexpectedMetric(metric.name));
        }
        let Some(device) = self.resolve(&metric, &["agent_host", "source", "host"])? else {
            return Ok(false);
        };
        if metric.name == "interface" {
            let reading = fields::interface_reading(&metric, &device.id)?;
            self.handle_interface(reading).await;
        } else {
            let reading = fields::wireless_reading(&metric, &device.id)?;
            self.writer.queue_write(WriteOp::Insert, "wireless_history", wireless_row(&reading), None);
            self.publish(CHANNEL_WIRELESS_UPDATE, &reading).await;
        }
        Ok(true)
    }

    async fn handle_interface(&self, reading: InterfaceReading) {
        let (history, status) = interface_rows(&reading);
        self.writer.queue_write(WriteOp::Insert, "interface_history", history, None);
        self.writer.queue_write(WriteOp::Upsert, "interface_status", status, None);
        self.publish(CHANNEL_INTERFACE_UPDATE, &reading).await;

        let was_flapping = self.flapping.is_flapping(&reading.device_id, reading.if_index);
        let sample = LinkSample {
            status: reading.oper_status,
            speed_mbps: reading.speed_mbps,
            observed_at: reading.timestamp,
        };
        let key = flapping_key(&reading.device_id, reading.if_index);

        match self.flapping.check(&reading.device_id, reading.if_index, &reading.if_name, sample) {
            Some(event) => {
                self.stats.flapping_events.fetch_add(1, Ordering::Relaxed);
                self.writer.queue_write(WriteOp::Insert, "flapping_events", flapping_row(&event), None);
                self.cache.set(&key, &event, Some(self.flapping.config().window())).await;
                self.publish(CHANNEL_ALERT_FLAPPING, &event).await;
            }
            None if was_flapping && !self.flapping.is_flapping(&reading.device_id, reading.if_index) => {
                self.cache.del(&key).await;
            }
            None => {}
        }
    }

    /// Publie via le cache ; à défaut, livraison directe aux observateurs locaux
    async fn publish<T: Serialize>(&self, channel: &str, message: &T) {
        if self.cache.publish(channel, message).await {
            return;
        }
        match serde_json::to_value(message) {
            Ok(payload) => self.hub.dispatch(channel, &payload),
            Err(e) => warn!("[ingest] cannot encode {channel} message: {e}"),
        }
    }

    pub fn local_snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.snapshots.lock().get(device_id).cloned()
    }

    /// Instantané local, sinon celui publié dans le cache par une autre instance
    pub async fn device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        if let Some(snapshot) = self.local_snapshot(device_id) {
            return Some(snapshot);
        }
        self.cache.get(&status_key(device_id)).await
    }

    /// Vue de tous les équipements (cache si disponible, instance locale sinon)
    pub async fn devices(&self) -> Vec<DeviceSnapshot> {
        let keys = self.cache.keys(STATUS_KEY_PATTERN).await;
        let mut devices: Vec<DeviceSnapshot> = if keys.is_empty() {
            self.snapshots.lock().values().cloned().collect()
        } else {
            self.cache.mget::<DeviceSnapshot>(&keys).await.into_iter().flatten().collect()
        };
        if devices.is_empty() {
            devices = self.snapshots.lock().values().cloned().collect();
        }
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub fn counters(&self) -> IngestCounters {
        IngestCounters {
            batches: self.stats.batches.load(Ordering::Relaxed),
            processed: self.stats.processed.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            flapping_events: self.stats.flapping_events.load(Ordering::Relaxed),
        }
    }

    pub fn tracked_devices(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn flapping(&self) -> &FlappingDetector {
        &self.flapping
    }
}

fn ping_row(reading: &PingReading) -> Value {
    json!({
        "device_id": reading.device_id,
        "status": reading.status.as_str(),
        "latency": reading.latency,
        "packet_loss": reading.packet_loss,
        "timestamp": rfc3339(reading.timestamp),
    })
}

fn interface_rows(reading: &InterfaceReading) -> (Value, Value) {
    let history = json!({
        "device_id": reading.device_id,
        "if_index": reading.if_index,
        "if_name": reading.if_name,
        "oper_status": reading.oper_status.as_str(),
        "admin_status": reading.admin_status.map(|s| s.as_str()),
        "speed_mbps": reading.speed_mbps,
        "in_octets": reading.in_octets,
        "out_octets": reading.out_octets,
        "in_errors": reading.in_errors,
        "out_errors": reading.out_errors,
        "in_discards": reading.in_discards,
        "out_discards": reading.out_discards,
        "timestamp": rfc3339(reading.timestamp),
    });
    let status = json!({
        "device_id": reading.device_id,
        "if_index": reading.if_index,
        "if_name": reading.if_name,
        "oper_status": reading.oper_status.as_str(),
        "speed_mbps": reading.speed_mbps,
        "updated_at": rfc3339(reading.timestamp),
    });
    (history, status)
}

fn wireless_row(reading: &WirelessReading) -> Value {
    json!({
        "device_id": reading.device_id,
        "interface": reading.interface,
        "signal": reading.signal,
        "noise_floor": reading.noise_floor,
        "tx_rate": reading.tx_rate,
        "rx_rate": reading.rx_rate,
        "timestamp": rfc3339(reading.timestamp),
    })
}

fn flapping_row(event: &FlappingEvent) -> Value {
    json!({
        "device_id": event.device_id,
        "if_index": event.if_index,
        "if_name": event.if_name,
        "from_status": event.from.status.as_str(),
        "to_status": event.to.status.as_str(),
        "from_speed": event.from.speed_mbps,
        "to_speed": event.to.speed_mbps,
        "transitions": event.transitions,
        "timestamp": rfc3339(event.timestamp),
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::pipeline;
    use super::*;
    use crate::models::DeviceStatus;
    use netvigil_devkit::collector::{interface_metric, ping_metric, wireless_metric};

    #[tokio::test]
    async fn test_150_pings_flush_as_100_then_50() {
        let p = pipeline(100, true).await;
        let records: Vec<Value> = (0..150)
            .map(|i| {
                let host = ["10.0.0.1", "10.0.0.2:161", "udp://10.0.0.3"][i % 3];
                ping_metric(host, Some(10.0 + (i % 7) as f64 * 30.0), 0.0)
            })
            .collect();

        let report = p.ingestor.ingest_ping_batch(&records).await;
        assert_eq!(report, IngestReport { processed: 150, skipped: 0, errors: 0 });

        let drained = netvigil_devkit::wait_until(Duration::from_secs(3), || p.store.batch_sizes().len() == 2).await;
        assert!(drained);
        assert_eq!(p.store.batch_sizes(), vec![100, 50]);
        assert_eq!(p.store.rows_for("ping_history").len(), 150);

        let updates = p.backend.published_on(CHANNEL_DEVICE_UPDATE);
        assert_eq!(updates.len(), 150);
        assert!(updates.iter().any(|m| m.payload.contains("\"changed\":true")));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_records_do_not_abort_batch() {
        let p = pipeline(100, true).await;
        let records = vec![
            ping_metric("10.0.0.1", Some(20.0), 0.0),
            ping_metric("192.168.99.99", Some(20.0), 0.0),
            json!("garbage"),
            json!({"name": "ping", "tags": {}, "fields": {"avg": 3}}),
            ping_metric("10.0.0.2", None, 100.0),
        ];
        let report = p.ingestor.ingest_ping_batch(&records).await;
        assert_eq!(report, IngestReport { processed: 2, skipped: 1, errors: 2 });
        assert_eq!(p.ingestor.local_snapshot("sw1").map(|s| s.status), Some(DeviceStatus::Down));

        let counters = p.ingestor.counters();
        assert_eq!((counters.processed, counters.skipped, counters.errors), (2, 1, 2));
    }

    #[tokio::test]
    async fn test_status_cached_and_change_flag() {
        let p = pipeline(100, true).await;
        p.ingestor.ingest_ping_batch(&[ping_metric("10.0.0.1", Some(20.0), 0.0)]).await;
        p.ingestor.ingest_ping_batch(&[ping_metric("10.0.0.1", Some(20.0), 0.0)]).await;
        let unchanged = p.ingestor.local_snapshot("core-1").unwrap();
        assert!(!unchanged.changed);

        p.ingestor.ingest_ping_batch(&[ping_metric("10.0.0.1", Some(120.0), 0.0)]).await;
        let changed = p.ingestor.local_snapshot("core-1").unwrap();
        assert!(changed.changed);
        assert_eq!(changed.previous_status, Some(DeviceStatus::Up));
        assert_eq!(changed.area_id.as_deref(), Some("dc1"));

        let cached: DeviceSnapshot = p.cache.get(&status_key("core-1")).await.unwrap();
        assert_eq!(cached.status, DeviceStatus::Degraded);
        let all = p.ingestor.devices().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].device_id, "core-1");
    }

    #[tokio::test]
    async fn test_unavailable_cache_falls_back_to_local_hub() {
        let p = pipeline(100, false).await;
        let (client, mut rx) = p.hub.register();
        p.hub.handle_client_message(&client, r#"{"type":"subscribe","deviceId":"core-1"}"#);
        while rx.try_recv().is_ok() {}

        let report = p.ingestor.ingest_ping_batch(&[ping_metric("10.0.0.1", Some(20.0), 0.0)]).await;
        assert_eq!(report.processed, 1);
        assert_eq!(p.writer.queue_len(), 1);

        let mut events = Vec::new();
        while let Ok(message) = rx.try_recv() {
            events.push((message.event, message.room));
        }
        assert!(events.contains(&("status:update".to_string(), Some("device:core-1".to_string()))));
        assert!(events.contains(&("area:update".to_string(), None)));
        assert!(p.backend.published().is_empty());

        // vue locale quand le cache est absent
        assert_eq!(p.ingestor.devices().await.len(), 1);
        assert!(p.ingestor.device("core-1").await.is_some());
    }

    #[tokio::test]
    async fn test_interface_flapping_alerts_once() {
        let p = pipeline(100, true).await;
        let records: Vec<Value> = (0..8)
            .map(|i| {
                let status = if i % 2 == 0 { "up" } else { "down" };
                interface_metric("10.0.0.2", 3, "ge-0/0/3", status, Some(1000.0))
            })
            .collect();
        let report = p.ingestor.ingest_snmp_batch(&records).await;
        assert_eq!(report.processed, 8);

        assert_eq!(p.backend.published_on(CHANNEL_INTERFACE_UPDATE).len(), 8);
        let alerts = p.backend.published_on(CHANNEL_ALERT_FLAPPING);
        assert_eq!(alerts.len(), 1);
        let alert: Value = serde_json::from_str(&alerts[0].payload).unwrap();
        assert_eq!(alert["deviceId"], "sw1");
        assert_eq!(alert["ifIndex"], 3);
        assert!(p.cache.get::<Value>(&flapping_key("sw1", 3)).await.is_some());
        assert_eq!(p.ingestor.counters().flapping_events, 1);

        p.writer.flush().await;
        assert_eq!(p.store.rows_for("interface_history").len(), 8);
        assert_eq!(p.store.rows_for("interface_status").len(), 8);
        let flaps = p.store.rows_for("flapping_events");
        assert_eq!(flaps.len(), 1);
        assert_eq!(flaps[0]["transitions"], 4);
    }

    #[tokio::test]
    async fn test_wireless_and_unexpected_metrics() {
        let p = pipeline(100, true).await;
        let records = vec![
            wireless_metric("10.0.0.3", -58.0, -96.0),
            json!({"name": "cpu", "tags": {"agent_host": "10.0.0.3"}, "fields": {"load": 1}}),
            interface_metric("10.9.9.9", 1, "eth0", "up", None),
        ];
        let report = p.ingestor.ingest_snmp_batch(&records).await;
        assert_eq!(report, IngestReport { processed: 1, skipped: 1, errors: 1 });

        let wireless = p.backend.published_on(CHANNEL_WIRELESS_UPDATE);
        assert_eq!(wireless.len(), 1);
        p.writer.flush().await;
        let rows = p.store.rows_for("wireless_history");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["signal"], -58.0);
        assert_eq!(rows[0]["device_id"], "ap1");
    }
}
