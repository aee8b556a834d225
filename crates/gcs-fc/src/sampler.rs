use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::link::LinkConnection;
use crate::state::VehicleSnapshot;

/// Latest published snapshot; `None` until the first successful read.
pub type Telemetry = watch::Receiver<Option<Arc<VehicleSnapshot>>>;

struct Running {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Polls the link at a fixed cadence and publishes immutable snapshots.
pub struct TelemetrySampler {
    link: Arc<LinkConnection>,
    interval: Duration,
    tx: Arc<watch::Sender<Option<Arc<VehicleSnapshot>>>>,
    task: Mutex<Option<Running>>,
}

impl TelemetrySampler {
    pub fn new(link: Arc<LinkConnection>, interval: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        Self { link, interval, tx: Arc::new(tx), task: Mutex::new(None) }
    }

    pub fn subscribe(&self) -> Telemetry {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<VehicleSnapshot>> {
        self.tx.borrow().clone()
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Spawn the sampling loop. No-op if already running.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(sample_loop(self.link.clone(), self.tx.clone(), self.interval, stop_rx));
        *task = Some(Running { stop, handle });
        info!("sampler: started ({} ms)", self.interval.as_millis());
    }

    /// Stop sampling. Returns only after the loop has exited, so nothing is
    /// published once this resolves. No-op if not running.
    pub async fn stop(&self) {
        let Some(running) = self.task.lock().await.take() else {
            return;
        };
        let _ = running.stop.send(());
        if let Err(e) = running.handle.await {
            warn!("sampler: loop ended abnormally: {}", e);
        }
        info!("sampler: stopped");
    }
}

async fn sample_loop(
    link: Arc<LinkConnection>,
    tx: Arc<watch::Sender<Option<Arc<VehicleSnapshot>>>>,
    interval: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut seq = tx.borrow().as_ref().map_or(0, |s| s.seq);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        match link.read_state() {
            Ok(state) => {
                if failures > 0 {
                    info!("sampler: telemetry back after {} failed reads", failures);
                    failures = 0;
                }
                seq += 1;
                tx.send_replace(Some(Arc::new(VehicleSnapshot::capture(seq, state))));
            }
            Err(e) => {
                // keep the last snapshot; one bad poll is not fatal
                failures += 1;
                if failures == 1 || failures % 50 == 0 {
                    warn!("sampler: read failed ({} in a row): {}", failures, e);
                }
            }
        }
    }
    debug!("sampler: loop exited");
}
