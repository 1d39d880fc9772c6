//! Fan-out of encoded frames to every registered subscriber.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::channel::FrameReceiver;
use super::registry::SubscriberRegistry;
use super::stats::RelayStats;
use super::subscriber::{FrameSink, Subscriber, SubscriberId};
use crate::error::SinkError;

/// Outcome of delivering one frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub removed: Vec<SubscriberId>,
}

/// Drains the distribution channel and delivers each frame to all subscribers.
pub struct Broadcaster<S> {
    registry: Arc<SubscriberRegistry<S>>,
    write_timeout: Duration,
    frame_interval: Option<Duration>,
    stats: Arc<RelayStats>,
}

impl<S: FrameSink> Broadcaster<S> {
    /// Create a broadcaster.
    ///
    /// # Arguments
    /// * `registry` - Shared subscriber set
    /// * `write_timeout` - Deadline for a single write to one subscriber
    /// * `stats` - Pipeline counters
    pub fn new(registry: Arc<SubscriberRegistry<S>>, write_timeout: Duration, stats: Arc<RelayStats>) -> Self {
        Self { registry, write_timeout, frame_interval: None, stats }
    }

    /// Warn when a delivery cycle takes longer than one capture interval.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Run until the channel closes or `cancel` fires.
    pub async fn run(self, mut frames: FrameReceiver, cancel: CancellationToken) {
        info!("Broadcaster started");

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Broadcaster cancelled");
                    break;
                }
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => {
                        debug!("Distribution channel closed");
                        break;
                    }
                },
            };

            self.deliver(frame).await;
        }

        let stats = self.stats.snapshot();
        info!("Broadcaster stopped after {} frame(s), {} subscriber(s) removed", stats.frames_broadcast, stats.subscribers_removed);
    }

    /// Deliver one frame to every subscriber in a registry snapshot.
    ///
    /// Writes run concurrently, each bounded by the write timeout. Any
    /// subscriber whose write fails is removed and closed in the background;
    /// the others still receive the frame.
    pub async fn deliver(&self, frame: Bytes) -> DeliveryReport {
        let started = Instant::now();
        let subscribers = self.registry.snapshot();

        let writes = subscribers.iter().map(|subscriber| {
            let frame = frame.clone();
            async move { (subscriber, self.write(subscriber, frame).await) }
        });
        let results = futures::future::join_all(writes).await;

        let mut report = DeliveryReport::default();
        let mut failed = Vec::new();
        for (subscriber, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Failed to send frame to subscriber {}, closing connection: {}", subscriber, e);
                    failed.push(subscriber.id());
                }
            }
        }
        if !failed.is_empty() {
            // Closing a stalled peer can stall again; it happens off this cycle
            report.removed = self.registry.evict(&failed);
        }

        self.stats.record_broadcast();
        if !report.removed.is_empty() {
            self.stats.record_removed(report.removed.len() as u64);
        }

        let elapsed = started.elapsed();
        if let Some(interval) = self.frame_interval
            && elapsed > interval
        {
            warn!("Delivery to {} subscriber(s) took {:?}, longer than the {:?} frame interval", subscribers.len(), elapsed, interval);
        }
        trace!("📤 Frame of {} bytes sent to {} subscriber(s) in {:?}", frame.len(), report.delivered, elapsed);

        report
    }

    async fn write(&self, subscriber: &Subscriber<S>, frame: Bytes) -> Result<(), SinkError> {
        match tokio::time::timeout(self.write_timeout, subscriber.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(self.write_timeout.as_millis() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::super::channel::{OverflowPolicy, frame_channel};
    use super::super::subscriber::testing::{MemorySink, SinkBehavior};
    use super::*;

    fn setup() -> (Arc<SubscriberRegistry<MemorySink>>, Broadcaster<MemorySink>, Arc<RelayStats>) {
        let registry = Arc::new(SubscriberRegistry::new());
        let stats = RelayStats::shared();
        let broadcaster = Broadcaster::new(registry.clone(), Duration::from_millis(50), stats.clone());
        (registry, broadcaster, stats)
    }

    fn frame(n: u8) -> Bytes {
        Bytes::from(vec![n, n + 1])
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_identical_frame() {
        let (registry, broadcaster, _) = setup();
        let mut logs = Vec::new();
        for _ in 0..3 {
            let sink = MemorySink::new(SinkBehavior::Accept);
            logs.push(sink.probes().0);
            registry.add(Arc::new(Subscriber::new(sink, None)));
        }

        let report = broadcaster.deliver(frame(7)).await;
        assert_eq!(report.delivered, 3);
        assert!(report.removed.is_empty());
        for log in &logs {
            assert_eq!(*log.lock(), vec![frame(7)]);
        }
    }

    #[tokio::test]
    async fn test_failed_subscriber_removed_others_still_served() {
        let (registry, broadcaster, stats) = setup();

        let healthy = MemorySink::new(SinkBehavior::Accept);
        let (healthy_log, _, _) = healthy.probes();
        registry.add(Arc::new(Subscriber::new(healthy, None)));

        let broken = MemorySink::new(SinkBehavior::Fail);
        let (_, broken_closed, _) = broken.probes();
        let broken = Arc::new(Subscriber::new(broken, None));
        registry.add(broken.clone());

        let report = broadcaster.deliver(frame(1)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, vec![broken.id()]);
        assert!(!registry.contains(broken.id()));
        tokio::time::timeout(Duration::from_secs(1), async {
            while !broken_closed.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let report = broadcaster.deliver(frame(2)).await;
        assert_eq!(report.delivered, 1);
        assert!(report.removed.is_empty());
        assert_eq!(*healthy_log.lock(), vec![frame(1), frame(2)]);
        assert_eq!(stats.snapshot().subscribers_removed, 1);
    }

    #[tokio::test]
    async fn test_hanging_subscriber_times_out() {
        let (registry, broadcaster, _) = setup();

        let healthy = MemorySink::new(SinkBehavior::Accept);
        let (healthy_log, _, _) = healthy.probes();
        registry.add(Arc::new(Subscriber::new(healthy, None)));

        let stuck = Arc::new(Subscriber::new(MemorySink::new(SinkBehavior::Hang), None));
        registry.add(stuck.clone());

        let report = tokio::time::timeout(Duration::from_secs(2), broadcaster.deliver(frame(3))).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, vec![stuck.id()]);
        assert_eq!(healthy_log.lock().len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_preserves_order_until_channel_closes() {
        let (registry, broadcaster, stats) = setup();
        let sink = MemorySink::new(SinkBehavior::Accept);
        let (log, _, _) = sink.probes();
        registry.add(Arc::new(Subscriber::new(sink, None)));

        let (tx, rx) = frame_channel(4, OverflowPolicy::Block, stats.clone());
        let task = tokio::spawn(broadcaster.run(rx, CancellationToken::new()));

        let sender = tokio::task::spawn_blocking(move || {
            for n in 0..20u8 {
                tx.send(frame(n)).unwrap();
            }
        });
        tokio::time::timeout(Duration::from_secs(5), sender).await.unwrap().unwrap();

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        let expected: Vec<_> = (0..20u8).map(frame).collect();
        assert_eq!(*log.lock(), expected);
        assert_eq!(stats.snapshot().frames_broadcast, 20);
    }

    #[tokio::test]
    async fn test_stuck_subscribers_do_not_stretch_the_cycle() {
        let (registry, broadcaster, stats) = setup();

        let healthy = MemorySink::new(SinkBehavior::Accept);
        let (healthy_log, _, _) = healthy.probes();
        registry.add(Arc::new(Subscriber::new(healthy, None)));

        // Both the write and the close handshake stall
        let stuck: Vec<_> = (0..6).map(|_| Arc::new(Subscriber::new(MemorySink::new(SinkBehavior::Hang), None))).collect();
        for s in &stuck {
            registry.add(s.clone());
        }

        let started = Instant::now();
        let report = broadcaster.deliver(frame(4)).await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(400), "cycle took {:?}", elapsed);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed.len(), 6);
        assert_eq!(registry.len(), 1);
        assert!(stuck.iter().all(|s| s.cancelled_token().is_cancelled()));
        assert_eq!(stats.snapshot().subscribers_removed, 6);

        let report = broadcaster.deliver(frame(5)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(*healthy_log.lock(), vec![frame(4), frame(5)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delivery_during_registry_churn() {
        let (registry, broadcaster, _) = setup();

        let mut steady_logs = Vec::new();
        for _ in 0..3 {
            let sink = MemorySink::new(SinkBehavior::Accept);
            steady_logs.push(sink.probes().0);
            registry.add(Arc::new(Subscriber::new(sink, None)));
        }

        let delivery = tokio::spawn(async move {
            for n in 0..200u8 {
                let report = broadcaster.deliver(frame(n)).await;
                assert!(report.removed.is_empty());
                tokio::task::yield_now().await;
            }
        });

        let mut churn = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            churn.push(tokio::spawn(async move {
                let mut logs = Vec::new();
                for _ in 0..50 {
                    let sink = MemorySink::new(SinkBehavior::Accept);
                    logs.push(sink.probes().0);
                    let s = Arc::new(Subscriber::new(sink, None));
                    registry.add(s.clone());
                    tokio::task::yield_now().await;
                    registry.remove(s.id()).await;
                }
                logs
            }));
        }

        let mut churn_logs = Vec::new();
        for task in churn {
            churn_logs.extend(task.await.unwrap());
        }
        delivery.await.unwrap();

        // A short-lived subscriber sees a gap-free run of frames, each exactly once
        for log in &churn_logs {
            let seen: Vec<u8> = log.lock().iter().map(|f| f[0]).collect();
            assert!(seen.windows(2).all(|w| w[1] == w[0] + 1), "out of order or duplicated: {:?}", seen);
        }
        let expected: Vec<_> = (0..200u8).map(frame).collect();
        for log in &steady_logs {
            assert_eq!(*log.lock(), expected);
        }
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_registry, broadcaster, _) = setup();
        let (_tx, rx) = frame_channel(4, OverflowPolicy::Block, RelayStats::shared());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(broadcaster.run(rx, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_late_subscriber_only_sees_later_frames() {
        let (registry, broadcaster, _) = setup();
        broadcaster.deliver(frame(1)).await;

        let sink = MemorySink::new(SinkBehavior::Accept);
        let (log, _, _) = sink.probes();
        registry.add(Arc::new(Subscriber::new(sink, None)));
        broadcaster.deliver(frame(2)).await;

        assert_eq!(*log.lock(), vec![frame(2)]);
    }
}
