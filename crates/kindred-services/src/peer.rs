//! Peer connection: per-friend state and execution context.
//!
//! Every connection runs one worker task. Inbound item handling, sync
//! cycles and other scheduled work are posted to that worker, so no two
//! operations for the same peer ever run at the same time while different
//! peers proceed in parallel. Scheduled tasks are tracked and aborted
//! together when the connection closes.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kindred_core::{PeerId, RawItem, ServiceType};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::transport::{Transport, WriteError, WriteHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Typed per-connection slots.
#[derive(Debug, Default)]
pub struct PeerSlots {
    /// Inbound bandwidth the peer advertised, bytes/sec. 0 = unknown.
    bandwidth: AtomicU32,
    /// Next outgoing transaction id, per service. Starts at 1.
    transaction_ids: Mutex<HashMap<ServiceType, u32>>,
}

impl PeerSlots {
    pub fn bandwidth(&self) -> u32 {
        self.bandwidth.load(Ordering::Relaxed)
    }

    pub fn set_bandwidth(&self, bytes_per_sec: u32) {
        self.bandwidth.store(bytes_per_sec, Ordering::Relaxed);
    }

    pub fn next_transaction_id(&self, service: ServiceType) -> u32 {
        let mut ids = self
            .transaction_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let next = ids.entry(service).or_insert(1);
        let id = *next;
        *next = next.wrapping_add(1).max(1);
        id
    }
}

/// One live friend session.
pub struct PeerConnection {
    id: PeerId,
    transport: Arc<dyn Transport>,
    services: HashSet<ServiceType>,
    slots: PeerSlots,
    context: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frame_errors: AtomicU32,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("services", &self.services)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerConnection {
    /// Create the connection and start its worker. Needs a tokio runtime.
    pub fn new(
        id: PeerId,
        transport: Arc<dyn Transport>,
        services: impl IntoIterator<Item = ServiceType>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let closed = Arc::new(AtomicBool::new(false));

        let worker_closed = closed.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if worker_closed.load(Ordering::Acquire) {
                    break;
                }
                job();
            }
        });

        Arc::new(Self {
            id,
            transport,
            services: services.into_iter().collect(),
            slots: PeerSlots::default(),
            context: Mutex::new(Some(tx)),
            tasks: Mutex::new(vec![worker]),
            closed,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frame_errors: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn supports(&self, service: ServiceType) -> bool {
        self.services.contains(&service)
    }

    pub fn services(&self) -> impl Iterator<Item = ServiceType> + '_ {
        self.services.iter().copied()
    }

    pub fn slots(&self) -> &PeerSlots {
        &self.slots
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ── Traffic ───────────────────────────────────────────────────────────────

    /// Hand a frame to the transport and count it.
    pub fn send(&self, item: RawItem) -> WriteHandle {
        if self.is_closed() {
            return WriteHandle::failed(WriteError::Closed);
        }
        self.bytes_sent
            .fetch_add(item.declared_size() as u64, Ordering::Relaxed);
        self.transport.send(item)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frame_errors.store(0, Ordering::Relaxed);
    }

    /// Count a discarded frame. Returns the number of consecutive errors.
    pub(crate) fn record_frame_error(&self) -> u32 {
        self.frame_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Consecutive frame errors since the last good frame.
    pub fn frame_errors(&self) -> u32 {
        self.frame_errors.load(Ordering::Relaxed)
    }

    // ── Execution context ─────────────────────────────────────────────────────

    /// Run `job` on this peer's worker, after everything posted before it.
    /// Returns false once the connection is closed.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match self.sender() {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Run `task` once after `delay`.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let Some(tx) = self.sender() else { return };
        self.track(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Box::new(task));
        }));
    }

    /// Run `task` after `initial`, then every `period` regardless of how
    /// long each run takes.
    pub fn schedule_at_fixed_rate(
        &self,
        initial: Duration,
        period: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) {
        let Some(tx) = self.sender() else { return };
        let task = Arc::new(task);
        let period = period.max(Duration::from_millis(1));
        self.track(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + initial;
            let mut ticks = tokio::time::interval_at(start, period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let task = task.clone();
                if tx.send(Box::new(move || task())).is_err() {
                    break;
                }
            }
        }));
    }

    /// Run `task` after `initial`, then `delay` after each run finishes.
    pub fn schedule_with_fixed_delay(
        &self,
        initial: Duration,
        delay: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) {
        let Some(tx) = self.sender() else { return };
        let task = Arc::new(task);
        self.track(tokio::spawn(async move {
            tokio::time::sleep(initial).await;
            loop {
                let (done_tx, done_rx) = oneshot::channel::<()>();
                let task = task.clone();
                let job: Job = Box::new(move || {
                    task();
                    let _ = done_tx.send(());
                });
                if tx.send(job).is_err() || done_rx.await.is_err() {
                    break;
                }
                tokio::time::sleep(delay).await;
            }
        }));
    }

    /// Number of live scheduled tasks, the worker included.
    pub fn scheduled(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.len()
    }

    /// Stop the worker, cancel every scheduled task and close the transport.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        self.transport.close();
        tracing::debug!(peer = %self.id.short(), "peer connection closed");
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Job>> {
        if self.is_closed() {
            return None;
        }
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            task.abort();
            return;
        }
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use kindred_core::codec::{Item, ItemBody, ItemWriter};
    use kindred_core::declared_fields;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Marker {
        n: u8,
    }
    declared_fields!(Marker { n });

    impl Item for Marker {
        fn sub_type(&self) -> u8 {
            1
        }
        fn body(&self) -> ItemBody<'_> {
            ItemBody::Declared(self)
        }
    }

    fn peer() -> Arc<PeerConnection> {
        let (transport, _rx) = ChannelTransport::new();
        PeerConnection::new(PeerId([3; 32]), Arc::new(transport), [0x0215])
    }

    #[test]
    fn transaction_ids_start_at_one_per_service() {
        let slots = PeerSlots::default();
        assert_eq!(slots.next_transaction_id(0x0215), 1);
        assert_eq!(slots.next_transaction_id(0x0215), 2);
        assert_eq!(slots.next_transaction_id(0x0217), 1);
    }

    #[tokio::test]
    async fn posted_jobs_run_in_order() {
        let peer = peer();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = log.clone();
            assert!(peer.post(move || log.lock().unwrap().push(i)));
        }
        let (tx, rx) = oneshot::channel();
        peer.post(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_rate_runs_until_closed() {
        let peer = peer();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        peer.schedule_at_fixed_rate(Duration::from_secs(10), Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        peer.close();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_delay_waits_for_each_run() {
        let peer = peer();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        peer.schedule_with_fixed_delay(Duration::ZERO, Duration::from_secs(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn close_cancels_tasks_and_refuses_work() {
        let peer = peer();
        peer.schedule(Duration::from_secs(3600), || {});
        assert_eq!(peer.scheduled(), 2);

        peer.close();
        assert!(peer.is_closed());
        assert_eq!(peer.scheduled(), 0);
        assert!(!peer.post(|| {}));
        let raw = ItemWriter::new().write(0x0215, &Marker { n: 1 }).unwrap();
        assert!(peer.send(raw).is_failed());
    }
}
