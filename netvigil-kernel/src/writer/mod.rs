/*!
 * BATCH WRITER - Écritures durables groupées
 *
 * RÔLE :
 * Accumule les écritures produites par l'ingestion et les applique au store
 * par lots, sur déclenchement temporel (timer) ou de taille (max_batch_size).
 *
 * FONCTIONNEMENT :
 * - `queue_write` ne bloque jamais : push en queue + éventuel flush lancé en tâche
 * - `flush` est single-flight (un seul flush à la fois, les autres sont des no-op)
 * - un flush prend au plus max_batch_size écritures, les groupe par (table, op)
 *   dans l'ordre d'arrivée et committe le tout dans une transaction
 * - échec : callbacks en erreur puis remise en tête de queue, sauf si la queue
 *   dépasserait 3 × max_batch_size (lot abandonné + compteur)
 * - queue déjà à 2 × max_batch_size : flush forcé + compteur d'overflow ;
 *   si un flush est déjà en vol, c'est lui qui, en sortie de commit réussi,
 *   relance aussitôt un flush tant que la queue reste ≥ 2 × max_batch_size
 *   (sinon continuation après `continuation_delay`). Après un échec, seul le
 *   timer relance.
 *
 * UTILISATION :
 * ```ignore
 * let writer = BatchWriter::new(store, cfg.writer.clone());
 * writer.start();
 * writer.queue_write(WriteOp::Insert, "ping_history", row, None);
 * writer.shutdown().await; // flush final
 * ```
 */

pub mod store;

use crate::config::WriterConf;
use crate::models::rfc3339;
use crate::schedule::PeriodicTask;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

pub use store::{SqliteStore, StoreError, WriteGroup, WriteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOp {
    Insert,
    Upsert,
}

pub type WriteResult = Result<(), Arc<StoreError>>;
pub type WriteCallback = Box<dyn FnOnce(WriteResult) + Send + 'static>;

struct WriteRequest {
    op: WriteOp,
    table: String,
    payload: Value,
    callback: Option<WriteCallback>,
    enqueued_at: Instant,
}

/// Résultat d'un appel à `flush`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Un autre flush tourne déjà
    InProgress,
    Empty,
    Committed(usize),
    Failed { size: usize, requeued: bool },
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterStats {
    pub total_writes: u64,
    pub total_batches: u64,
    pub avg_batch_size: f64,
    pub last_flush: Option<String>,
    pub failed_batches: u64,
    pub dropped_writes: u64,
    pub overflow_events: u64,
    pub queue_len: usize,
}

struct Inner {
    queue: Mutex<VecDeque<WriteRequest>>,
    flushing: AtomicBool,
    store: Arc<dyn WriteStore>,
    conf: WriterConf,
    stats: Mutex<WriterStats>,
    timer: Mutex<Option<PeriodicTask>>,
}

#[derive(Clone)]
pub struct BatchWriter {
    inner: Arc<Inner>,
}

/// Relâche le drapeau single-flight même si le flush est annulé
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BatchWriter {
    pub fn new(store: Arc<dyn WriteStore>, conf: WriterConf) -> Self {
        let conf = WriterConf { max_batch_size: conf.max_batch_size.max(1), ..conf };
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                flushing: AtomicBool::new(false),
                store,
                conf,
                stats: Mutex::new(WriterStats::default()),
                timer: Mutex::new(None),
            }),
        }
    }

    fn max_batch(&self) -> usize {
        self.inner.conf.max_batch_size
    }

    /// Enfile une écriture et rend la main immédiatement
    pub fn queue_write(&self, op: WriteOp, table: &str, payload: Value, callback: Option<WriteCallback>) {
        let max = self.max_batch();
        let request = WriteRequest { op, table: table.to_string(), payload, callback, enqueued_at: Instant::now() };

        let (overflow, size_trigger) = {
            let mut queue = self.inner.queue.lock();
            let overflow = queue.len() >= 2 * max;
            queue.push_back(request);
            (overflow, queue.len() == max)
        };

        if overflow {
            self.inner.stats.lock().overflow_events += 1;
            warn!("[writer] queue above {} pending writes, forcing flush", 2 * max);
            self.spawn_flush(Duration::ZERO);
        } else if size_trigger {
            self.spawn_flush(Duration::ZERO);
        }
    }

    fn spawn_flush(&self, delay: Duration) {
        let writer = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            writer.flush().await;
        });
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub async fn flush(&self) -> FlushOutcome {
        if self
            .inner
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[writer] flush already running, skipped");
            return FlushOutcome::InProgress;
        }
        let guard = FlushGuard(&self.inner.flushing);
        let outcome = self.flush_batch().await;
        drop(guard);

        if matches!(outcome, FlushOutcome::Committed(_)) {
            let pending = self.queue_len();
            if pending >= 2 * self.max_batch() {
                self.spawn_flush(Duration::ZERO);
            } else if pending > 0 {
                self.spawn_flush(self.inner.conf.continuation_delay());
            }
        }
        outcome
    }

    async fn flush_batch(&self) -> FlushOutcome {
        let max = self.max_batch();
        let mut batch: Vec<WriteRequest> = {
            let mut queue = self.inner.queue.lock();
            let take = queue.len().min(max);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let size = batch.len();
        let oldest = batch.iter().map(|r| r.enqueued_at).min().map(|t| t.elapsed()).unwrap_or_default();
        let groups = group_batch(&batch);
        let callbacks: Vec<WriteCallback> = batch.iter_mut().filter_map(|r| r.callback.take()).collect();

        match self.inner.store.commit(&groups).await {
            Ok(()) => {
                for callback in callbacks {
                    callback(Ok(()));
                }
                let mut stats = self.inner.stats.lock();
                stats.total_writes += size as u64;
                stats.total_batches += 1;
                stats.avg_batch_size = stats.total_writes as f64 / stats.total_batches as f64;
                stats.last_flush = Some(rfc3339(OffsetDateTime::now_utc()));
                debug!("[writer] flushed {size} writes in {} groups (oldest waited {oldest:?})", groups.len());
                FlushOutcome::Committed(size)
            }
            Err(e) => {
                let err = Arc::new(e);
                for callback in callbacks {
                    callback(Err(err.clone()));
                }
                self.inner.stats.lock().failed_batches += 1;

                let mut queue = self.inner.queue.lock();
                if queue.len() + size > 3 * max {
                    drop(queue);
                    self.inner.stats.lock().dropped_writes += size as u64;
                    error!("[writer] flush of {size} writes failed ({err}), queue full: batch dropped");
                    FlushOutcome::Failed { size, requeued: false }
                } else {
                    for request in batch.into_iter().rev() {
                        queue.push_front(request);
                    }
                    warn!("[writer] flush of {size} writes failed ({err}), batch requeued");
                    FlushOutcome::Failed { size, requeued: true }
                }
            }
        }
    }

    /// Démarre le flush périodique
    pub fn start(&self) {
        let mut timer = self.inner.timer.lock();
        if timer.as_ref().is_some_and(PeriodicTask::is_running) {
            return;
        }
        let writer = self.clone();
        *timer = Some(PeriodicTask::start("writer-flush", self.inner.conf.flush_interval(), move || {
            let writer = writer.clone();
            async move {
                writer.flush().await;
            }
        }));
        info!(
            "[writer] started (max_batch_size={}, flush_interval={:?})",
            self.max_batch(),
            self.inner.conf.flush_interval()
        );
    }

    /// Arrête le timer puis vide la queue
    pub async fn shutdown(&self) {
        let timer = self.inner.timer.lock().take();
        if let Some(mut timer) = timer {
            timer.stop().await;
        }

        loop {
            match self.flush().await {
                FlushOutcome::Empty => break,
                FlushOutcome::Committed(_) => continue,
                FlushOutcome::InProgress => tokio::time::sleep(Duration::from_millis(10)).await,
                FlushOutcome::Failed { .. } => {
                    let left = self.queue_len();
                    error!("[writer] final flush failed, {left} writes not persisted");
                    break;
                }
            }
        }
        info!("[writer] shut down");
    }

    pub fn stats(&self) -> WriterStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.queue_len = self.queue_len();
        stats
    }
}

fn group_batch(batch: &[WriteRequest]) -> Vec<WriteGroup> {
    let mut groups: Vec<WriteGroup> = Vec::new();
    for request in batch {
        match groups.iter_mut().find(|g| g.table == request.table && g.op == request.op) {
            Some(group) => group.rows.push(request.payload.clone()),
            None => groups.push(WriteGroup {
                table: request.table.clone(),
                op: request.op,
                rows: vec![request.payload.clone()],
            }),
        }
    }
    groups
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingStore;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn conf(max_batch_size: usize) -> WriterConf {
        WriterConf {
            database_url: "sqlite::memory:".into(),
            max_batch_size,
            flush_interval_ms: 20,
            continuation_delay_ms: 10,
        }
    }

    fn counting_callback(ok: &Arc<AtomicUsize>, failed: &Arc<AtomicUsize>) -> WriteCallback {
        let ok = ok.clone();
        let failed = failed.clone();
        Box::new(move |res| {
            let counter = if res.is_ok() { &ok } else { &failed };
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_every_callback_fires_after_one_flush() {
        let store = Arc::new(RecordingStore::default());
        let writer = BatchWriter::new(store.clone(), conf(10));
        let (ok, failed) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));

        for i in 0..7 {
            writer.queue_write(WriteOp::Insert, "ping_history", json!({"n": i}), Some(counting_callback(&ok, &failed)));
        }
        assert_eq!(writer.flush().await, FlushOutcome::Committed(7));
        assert_eq!(ok.load(Ordering::SeqCst), 7);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
        assert_eq!(writer.flush().await, FlushOutcome::Empty);

        let stats = writer.stats();
        assert_eq!(stats.total_writes, 7);
        assert_eq!(stats.total_batches, 1);
        assert!(stats.last_flush.is_some());
    }

    #[tokio::test]
    async fn test_groups_by_table_and_op_in_arrival_order() {
        let store = Arc::new(RecordingStore::default());
        let writer = BatchWriter::new(store.clone(), conf(10));
        writer.queue_write(WriteOp::Insert, "interface_history", json!({"n": 1}), None);
        writer.queue_write(WriteOp::Upsert, "interface_status", json!({"n": 2}), None);
        writer.queue_write(WriteOp::Insert, "interface_history", json!({"n": 3}), None);
        writer.flush().await;

        let batches = store.batches.lock();
        let groups = &batches[0];
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].table, "interface_history");
        assert_eq!(groups[0].rows, vec![json!({"n": 1}), json!({"n": 3})]);
        assert_eq!(groups[1].op, WriteOp::Upsert);
    }

    #[tokio::test]
    async fn test_concurrent_flush_is_single_flight() {
        let store = Arc::new(RecordingStore::slow(Duration::from_millis(50)));
        let writer = BatchWriter::new(store.clone(), conf(10));
        for i in 0..3 {
            writer.queue_write(WriteOp::Insert, "ping_history", json!({"n": i}), None);
        }

        let (first, second) = tokio::join!(writer.flush(), writer.flush());
        assert_eq!(first, FlushOutcome::Committed(3));
        assert_eq!(second, FlushOutcome::InProgress);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_is_requeued_at_head() {
        let store = Arc::new(RecordingStore::default());
        store.fail_next.store(1, Ordering::SeqCst);
        let writer = BatchWriter::new(store.clone(), conf(10));
        let (ok, failed) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));

        for i in 0..3 {
            writer.queue_write(WriteOp::Insert, "ping_history", json!({"n": i}), Some(counting_callback(&ok, &failed)));
        }
        assert_eq!(writer.flush().await, FlushOutcome::Failed { size: 3, requeued: true });
        assert_eq!(failed.load(Ordering::SeqCst), 3);
        assert_eq!(writer.queue_len(), 3);

        writer.queue_write(WriteOp::Insert, "ping_history", json!({"n": 3}), None);
        assert_eq!(writer.flush().await, FlushOutcome::Committed(4));
        let rows = store.rows_for("ping_history");
        assert_eq!(rows.first(), Some(&json!({"n": 0})));
        assert_eq!(rows.last(), Some(&json!({"n": 3})));
        assert_eq!(writer.stats().failed_batches, 1);
    }

    #[tokio::test]
    async fn test_failed_batch_dropped_past_requeue_cap() {
        let store = Arc::new(RecordingStore::default());
        store.fail_next.store(usize::MAX, Ordering::SeqCst);
        let writer = BatchWriter::new(store.clone(), conf(2));
        for i in 0..8 {
            writer.queue_write(WriteOp::Insert, "ping_history", json!({"n": i}), None);
        }

        // 6 restantes + 2 remises en tête > 3 × 2
        assert_eq!(writer.flush().await, FlushOutcome::Failed { size: 2, requeued: false });
        assert_eq!(writer.stats().dropped_writes, 2);
    }

    #[tokio::test]
    async fn test_overflow_forces_flush_and_counts() {
        let store = Arc::new(RecordingStore::default());
        let writer = BatchWriter::new(store.clone(), conf(2));
        for i in 0..5 {
            writer.queue_write(WriteOp::Insert, "ping_history", json!({"n": i}), None);
        }
        assert_eq!(writer.stats().overflow_events, 1);

        let drained = netvigil_devkit::wait_until(Duration::from_secs(2), || writer.queue_len() == 0).await;
        assert!(drained);
        assert_eq!(store.batch_sizes().iter().sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn test_overflow_during_inflight_flush_is_handled_on_exit() {
        let store = Arc::new(RecordingStore::slow(Duration::from_millis(50)));
        let writer = BatchWriter::new(store.clone(), WriterConf { continuation_delay_ms: 10_000, ..conf(10) });
        for i in 0..10 {
            writer.queue_write(WriteOp::Insert, "ping_history", json!({"n": i}), None);
        }
        let started = netvigil_devkit::wait_until(Duration::from_secs(1), || store.attempts.load(Ordering::SeqCst) == 1).await;
        assert!(started);

        // flush en vol : les flushs forcés par l'overflow sont des no-op
        for i in 10..35 {
            writer.queue_write(WriteOp::Insert, "ping_history", json!({"n": i}), None);
        }
        assert_eq!(writer.stats().overflow_events, 5);

        // relance immédiate, sans attendre la continuation
        let relaunched = netvigil_devkit::wait_until(Duration::from_secs(1), || store.batch_sizes().len() == 2).await;
        assert!(relaunched);
        assert_eq!(store.batch_sizes(), vec![10, 10]);
        assert_eq!(writer.queue_len(), 15);
    }

    #[tokio::test]
    async fn test_size_trigger_and_continuation_drain_large_queue() {
        let store = Arc::new(RecordingStore::default());
        let writer = BatchWriter::new(store.clone(), conf(100));
        for i in 0..150 {
            writer.queue_write(WriteOp::Insert, "ping_history", json!({"n": i}), None);
        }

        let done = netvigil_devkit::wait_until(Duration::from_secs(2), || store.batch_sizes().len() == 2).await;
        assert!(done);
        assert_eq!(store.batch_sizes(), vec![100, 50]);
        assert_eq!(writer.stats().overflow_events, 0);
    }

    #[tokio::test]
    async fn test_timer_flushes_small_queue() {
        let store = Arc::new(RecordingStore::default());
        let writer = BatchWriter::new(store.clone(), conf(100));
        writer.start();
        writer.queue_write(WriteOp::Insert, "ping_history", json!({"n": 1}), None);

        let flushed = netvigil_devkit::wait_until(Duration::from_secs(2), || store.batch_sizes() == vec![1]).await;
        assert!(flushed);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_everything() {
        let store = Arc::new(RecordingStore::default());
        let writer = BatchWriter::new(store.clone(), WriterConf { flush_interval_ms: 60_000, ..conf(10) });
        writer.start();
        for i in 0..25 {
            writer.queue_write(WriteOp::Insert, "ping_history", json!({"n": i}), None);
        }
        writer.shutdown().await;

        assert_eq!(writer.queue_len(), 0);
        assert_eq!(store.batch_sizes().iter().sum::<usize>(), 25);
        assert_eq!(writer.stats().total_writes, 25);
    }
}
