use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::core::{Error, Result};
use crate::util::lock;

/// Sends one liveness probe and resolves once the peer has answered
pub type ProbeFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Called once when a probe fails
pub type FailureFn = Arc<dyn Fn(&Error) + Send + Sync>;

/// State shared with the probing task
struct Shared {
    interval: Duration,
    send_probe: ProbeFn,
    on_failure: FailureFn,
    running: AtomicBool,
    last_seen: Mutex<Instant>,
}

/// Periodic liveness probe for one connection
pub struct KeepaliveMonitor {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KeepaliveMonitor {
    /// Creates a disarmed monitor probing after `interval` of silence
    pub fn new(interval: Duration, send_probe: ProbeFn, on_failure: FailureFn) -> Self {
        KeepaliveMonitor {
            shared: Arc::new(Shared {
                interval,
                send_probe,
                on_failure,
                running: AtomicBool::new(false),
                last_seen: Mutex::new(Instant::now()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Arms the periodic probe; must be called from within a runtime
    pub fn start(&self) {
        let mut task = lock(&self.task);
        if let Some(previous) = task.take() {
            previous.abort();
        }

        self.observe_liveness();
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(probe_loop(shared)));
        debug!(interval = ?self.shared.interval, "keepalive armed");
    }

    /// Disarms the probe
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
            debug!("keepalive disarmed");
        }
    }

    /// Records traffic from the peer, postponing the next probe
    pub fn observe_liveness(&self) {
        *lock(&self.shared.last_seen) = Instant::now();
    }

    /// Returns true while the probe is armed
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Drop for KeepaliveMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn probe_loop(shared: Arc<Shared>) {
    let period = shared.interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }

        let silent_for = lock(&shared.last_seen).elapsed();
        if silent_for < period {
            trace!(?silent_for, "peer recently active, probe skipped");
            continue;
        }

        match (shared.send_probe)().await {
            Ok(()) => {
                trace!("keepalive probe answered");
                *lock(&shared.last_seen) = Instant::now();
            }
            Err(e) => {
                shared.running.store(false, Ordering::SeqCst);
                warn!(error = %e, "keepalive probe failed");
                let lost = Error::liveness_lost(format!("no answer to probe after {:?} of silence: {}", silent_for, e));
                (shared.on_failure)(&lost);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn probe(count: Arc<AtomicUsize>, answer: bool) -> ProbeFn {
        Arc::new(move || {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                if answer {
                    Ok(())
                } else {
                    Err(Error::timeout("no reply"))
                }
            }
            .boxed()
        })
    }

    fn failures(count: Arc<AtomicUsize>) -> FailureFn {
        Arc::new(move |err| {
            assert!(matches!(err, Error::LivenessLost(_)));
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_probed_once_per_interval() {
        let probes = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let monitor = KeepaliveMonitor::new(
            Duration::from_secs(1),
            probe(Arc::clone(&probes), true),
            failures(Arc::clone(&failed)),
        );

        monitor.start();
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 2);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
        assert!(monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_link_not_probed() {
        let probes = Arc::new(AtomicUsize::new(0));
        let monitor = KeepaliveMonitor::new(
            Duration::from_secs(1),
            probe(Arc::clone(&probes), true),
            failures(Arc::new(AtomicUsize::new(0))),
        );

        monitor.start();
        for _ in 0..10 {
            sleep(Duration::from_millis(300)).await;
            monitor.observe_liveness();
        }
        assert_eq!(probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_fires_once_and_stops() {
        let probes = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let monitor = KeepaliveMonitor::new(
            Duration::from_secs(1),
            probe(Arc::clone(&probes), false),
            failures(Arc::clone(&failed)),
        );

        monitor.start();
        sleep(Duration::from_secs(5)).await;

        assert_eq!(probes.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_disarms() {
        let probes = Arc::new(AtomicUsize::new(0));
        let monitor = KeepaliveMonitor::new(
            Duration::from_secs(1),
            probe(Arc::clone(&probes), true),
            failures(Arc::new(AtomicUsize::new(0))),
        );

        monitor.start();
        monitor.stop();
        sleep(Duration::from_secs(3)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_running());

        // Re-arming works after a stop
        monitor.start();
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }
}
