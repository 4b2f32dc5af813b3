use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use tracing::{debug, info};

use crate::config::EstimatorConfig;
use crate::estimator::{EstimatorEvent, HostBindings, LinkBandwidthEstimator};
use crate::host::BandwidthSink;
use crate::publisher::BandwidthUpdate;

/// Longest the worker sleeps with no timer armed.
const IDLE_WAIT: Duration = Duration::from_millis(500);
/// How long [`EstimatorRuntime::dump`] waits for the worker.
const DUMP_TIMEOUT: Duration = Duration::from_secs(1);

/// Control messages sent via crossbeam channel.
enum ControlMessage {
    Dump(Sender<String>),
    Shutdown,
}

enum Wake {
    Event(EstimatorEvent),
    Dump(Sender<String>),
    Timer,
    Stop,
}

type Subscribers = Arc<Mutex<Vec<Sender<BandwidthUpdate>>>>;

/// Forwards every update to the host's sink and to all live subscribers.
struct FanOutSink {
    primary: Box<dyn BandwidthSink>,
    subscribers: Subscribers,
}

impl BandwidthSink for FanOutSink {
    fn on_bandwidth_changed(&mut self, update: BandwidthUpdate) {
        {
            let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subs.retain(|tx| tx.send(update).is_ok());
        }
        self.primary.on_bandwidth_changed(update);
    }
}

/// Thread-safe handle to the estimator worker.
///
/// Owns a background thread that runs the [`LinkBandwidthEstimator`]:
/// platform notifications and modem activity completions arrive as
/// [`EstimatorEvent`]s, and between events the worker sleeps until the
/// next counter tick or activity watchdog is due.
///
/// Dropping the runtime triggers a graceful shutdown of the worker thread.
pub struct EstimatorRuntime {
    events_tx: Sender<EstimatorEvent>,
    control_tx: Sender<ControlMessage>,
    subscribers: Subscribers,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EstimatorRuntime {
    /// Wires the estimator to `host` and starts the worker.
    pub fn start(config: EstimatorConfig, mut host: HostBindings) -> Self {
        let (events_tx, events_rx) = unbounded();
        let (control_tx, control_rx) = bounded(64);
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let primary = std::mem::replace(&mut host.sink, Box::new(Vec::new()));
        host.sink = Box::new(FanOutSink {
            primary,
            subscribers: subscribers.clone(),
        });
        let estimator = LinkBandwidthEstimator::new(config, host, events_tx.clone());

        let handle = thread::Builder::new()
            .name("linkbw-worker".into())
            .spawn(move || estimator_worker(estimator, events_rx, control_rx, shutdown_clone))
            .expect("failed to spawn link bandwidth estimator worker");

        Self {
            events_tx,
            control_tx,
            subscribers,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Queues a notification. Returns immediately.
    pub fn notify(&self, event: EstimatorEvent) -> anyhow::Result<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(anyhow::anyhow!("Failed to notify estimator: runtime shut down"));
        }
        self.events_tx
            .send(event)
            .map_err(|e| anyhow::anyhow!("Failed to notify estimator: {}", e))
    }

    /// Sender for host callbacks that want to post events directly.
    pub fn event_sender(&self) -> Sender<EstimatorEvent> {
        self.events_tx.clone()
    }

    /// Registers a consumer of published estimates. The receiver sees every
    /// update published after this call; dropping it unsubscribes.
    pub fn subscribe(&self) -> Receiver<BandwidthUpdate> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Renders the estimator state on the worker thread.
    pub fn dump(&self) -> anyhow::Result<String> {
        let (tx, rx) = bounded(1);
        self.control_tx
            .send(ControlMessage::Dump(tx))
            .map_err(|e| anyhow::anyhow!("Failed to request dump: {}", e))?;
        rx.recv_timeout(DUMP_TIMEOUT)
            .map_err(|e| anyhow::anyhow!("Failed to receive dump: {}", e))
    }

    /// Gracefully shuts down the worker thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.control_tx.send(ControlMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EstimatorRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn estimator_worker(
    mut estimator: LinkBandwidthEstimator,
    events_rx: Receiver<EstimatorEvent>,
    control_rx: Receiver<ControlMessage>,
    shutdown: Arc<AtomicBool>,
) {
    info!("link bandwidth estimator started");

    while !shutdown.load(Ordering::Relaxed) {
        estimator.run_timers();

        let wait = match estimator.next_deadline_ms() {
            Some(deadline) => {
                let ms = deadline.saturating_sub(estimator.now_ms()).max(1);
                Duration::from_millis(ms).min(IDLE_WAIT)
            }
            None => IDLE_WAIT,
        };

        let wake = select! {
            recv(events_rx) -> msg => msg.map_or(Wake::Stop, Wake::Event),
            recv(control_rx) -> msg => match msg {
                Ok(ControlMessage::Dump(reply)) => Wake::Dump(reply),
                Ok(ControlMessage::Shutdown) | Err(_) => Wake::Stop,
            },
            default(wait) => Wake::Timer,
        };

        match wake {
            Wake::Event(event) => estimator.handle(event),
            Wake::Dump(reply) => {
                let _ = reply.send(estimator.dump());
            }
            Wake::Timer => {}
            Wake::Stop => break,
        }
    }

    // Late activity replies land in the dropped queue.
    drop(events_rx);
    debug!(published = estimator.published_count(), "estimator worker exiting");
    info!("link bandwidth estimator stopped");
}
