//! # Scenario Replay
//!
//! A scripted host for the estimator. A scenario is a TOML file with an
//! optional `[config]` table and a list of timed `[[step]]`s; the runner
//! drives the estimator on a [`ManualClock`], integrating the configured
//! traffic load into byte counters and modem activity as time advances.
//!
//! ```toml
//! tail_ms = 10000
//!
//! [[step]]
//! at_ms = 0
//! kind = "serving"
//! plmn = "310260"
//! rat = "LTE"
//! tac = 7
//!
//! [[step]]
//! at_ms = 0
//! kind = "load"
//! rx_kbps = 20000
//! rx_active_permille = 800
//! ```
//!
//! Modem activity requests are answered immediately with the integrated
//! totals unless a `modem_fails` or `modem_silent` step armed a failure
//! for the next request.

use std::mem;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver};
use serde::{Deserialize, Serialize};

use crate::activity::ModemActivityReport;
use crate::config::EstimatorConfigInput;
use crate::error::{ActivityError, ScenarioError};
use crate::estimator::{DefaultNetwork, EstimatorEvent, HostBindings, LinkBandwidthEstimator};
use crate::host::{
    ActivityReply, BandwidthSink, Clock, ManualClock, ModemActivitySource, ServiceStateSource,
    TrafficCounters,
};
use crate::identity::{CellIdentity, Rat, ServiceState, SignalStrength};
use crate::publisher::BandwidthUpdate;
use crate::stats::{LinkDirection, NetworkStatsStore};

fn default_subscription_id() -> i32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default = "default_subscription_id")]
    pub subscription_id: i32,
    #[serde(default)]
    pub config: EstimatorConfigInput,
    /// Timers keep running this long after the last step.
    #[serde(default)]
    pub tail_ms: u64,
    #[serde(default, rename = "step")]
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn from_toml_str(input: &str) -> Result<Self, ScenarioError> {
        Ok(toml::from_str(input)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioStep {
    pub at_ms: u64,
    #[serde(flatten)]
    pub action: StepAction,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Screen {
        on: bool,
    },
    DefaultNetwork {
        cellular: bool,
        #[serde(default)]
        reported_tx_kbps: i32,
        #[serde(default)]
        reported_rx_kbps: i32,
    },
    NoDefaultNetwork,
    ActiveData {
        sub_id: i32,
    },
    /// Replaces the service state the host reports. No notification is
    /// sent; the estimator picks it up on its next identity refresh.
    Serving {
        plmn: Option<String>,
        rat: Option<Rat>,
        tac: Option<i32>,
        #[serde(default)]
        nr_connected: bool,
        #[serde(default)]
        nr_mmwave: bool,
    },
    Signal {
        dbm: i32,
        level: u8,
    },
    NrStateChanged,
    RegistrationChanged,
    /// Sustained traffic from now on.
    Load {
        #[serde(default)]
        tx_kbps: i64,
        #[serde(default)]
        rx_kbps: i64,
        /// Modem transmit time per second of wall time, in permille.
        #[serde(default)]
        tx_active_permille: u64,
        #[serde(default)]
        rx_active_permille: u64,
    },
    /// Overwrites the absolute byte counters.
    Counters {
        tx_bytes: i64,
        rx_bytes: i64,
    },
    /// The next activity request fails.
    ModemFails {
        reason: String,
    },
    /// The next activity request is never answered.
    ModemSilent,
}

/// One published update and when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimedUpdate {
    pub at_ms: u64,
    #[serde(flatten)]
    pub update: BandwidthUpdate,
}

#[derive(Debug)]
pub struct ReplayOutcome {
    pub updates: Vec<TimedUpdate>,
    /// Final filter estimates, `(tx, rx)`.
    pub filtered_kbps: (i32, i32),
    pub dump: String,
}

// ─── Scripted world ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Load {
    tx_kbps: i64,
    rx_kbps: i64,
    tx_active_permille: u64,
    rx_active_permille: u64,
}

#[derive(Debug, Default)]
enum NextAnswer {
    #[default]
    Report,
    Fail(String),
    Silent,
}

#[derive(Default)]
struct World {
    tx_bytes: i64,
    rx_bytes: i64,
    tx_time_ms: u64,
    rx_time_ms: u64,
    load: Load,
    state: ServiceState,
    pending: Vec<ActivityReply>,
    next_answer: NextAnswer,
}

impl World {
    fn integrate(&mut self, dt_ms: u64) {
        let dt = dt_ms as i64;
        self.tx_bytes += self.load.tx_kbps * dt / 8;
        self.rx_bytes += self.load.rx_kbps * dt / 8;
        self.tx_time_ms += dt_ms * self.load.tx_active_permille / 1000;
        self.rx_time_ms += dt_ms * self.load.rx_active_permille / 1000;
    }

    fn report(&self, now_ms: u64) -> ModemActivityReport {
        ModemActivityReport {
            timestamp_ms: now_ms,
            tx_time_ms: [self.tx_time_ms, 0, 0, 0, 0],
            rx_time_ms: self.rx_time_ms,
        }
    }
}

type SharedWorld = Arc<Mutex<World>>;

fn lock(world: &SharedWorld) -> std::sync::MutexGuard<'_, World> {
    world.lock().unwrap_or_else(|e| e.into_inner())
}

struct ScriptedCounters(SharedWorld);

impl TrafficCounters for ScriptedCounters {
    fn read(&mut self) -> (i64, i64) {
        let world = lock(&self.0);
        (world.tx_bytes, world.rx_bytes)
    }
}

struct ScriptedModem(SharedWorld);

impl ModemActivitySource for ScriptedModem {
    fn request(&mut self, reply: ActivityReply) {
        lock(&self.0).pending.push(reply);
    }
}

struct ScriptedServiceState(SharedWorld);

impl ServiceStateSource for ScriptedServiceState {
    fn service_state(&self) -> ServiceState {
        lock(&self.0).state.clone()
    }
}

struct RecordingSink {
    clock: ManualClock,
    updates: Arc<Mutex<Vec<TimedUpdate>>>,
}

impl BandwidthSink for RecordingSink {
    fn on_bandwidth_changed(&mut self, update: BandwidthUpdate) {
        tracing::info!(
            at_ms = self.clock.now_ms(),
            tx_kbps = update.tx_kbps,
            rx_kbps = update.rx_kbps,
            "bandwidth update"
        );
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TimedUpdate {
                at_ms: self.clock.now_ms(),
                update,
            });
    }
}

// ─── Runner ─────────────────────────────────────────────────────────────────

pub struct ScenarioRunner {
    estimator: LinkBandwidthEstimator,
    events: Receiver<EstimatorEvent>,
    clock: ManualClock,
    world: SharedWorld,
    updates: Arc<Mutex<Vec<TimedUpdate>>>,
    steps: Vec<ScenarioStep>,
    tail_ms: u64,
}

impl ScenarioRunner {
    pub fn new(scenario: Scenario, store: Box<dyn NetworkStatsStore>) -> Result<Self, ScenarioError> {
        let config = scenario.config.resolve()?;
        let clock = ManualClock::new(0);
        let world: SharedWorld = Arc::new(Mutex::new(World::default()));
        let updates = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, events) = unbounded();

        let host = HostBindings {
            subscription_id: scenario.subscription_id,
            clock: Box::new(clock.clone()),
            counters: Box::new(ScriptedCounters(world.clone())),
            activity: Box::new(ScriptedModem(world.clone())),
            service_state: Box::new(ScriptedServiceState(world.clone())),
            sink: Box::new(RecordingSink {
                clock: clock.clone(),
                updates: updates.clone(),
            }),
            store,
        };

        let mut steps = scenario.steps;
        steps.sort_by_key(|s| s.at_ms);

        Ok(ScenarioRunner {
            estimator: LinkBandwidthEstimator::new(config, host, events_tx),
            events,
            clock,
            world,
            updates,
            steps,
            tail_ms: scenario.tail_ms,
        })
    }

    pub fn run(mut self) -> ReplayOutcome {
        let steps = mem::take(&mut self.steps);
        let mut end_ms = 0;
        for step in steps {
            self.advance_to(step.at_ms);
            self.apply(step.action);
            self.settle();
            end_ms = step.at_ms;
        }
        self.advance_to(end_ms + self.tail_ms);

        let updates = mem::take(&mut *self.updates.lock().unwrap_or_else(|e| e.into_inner()));
        ReplayOutcome {
            updates,
            filtered_kbps: (
                self.estimator.filter(LinkDirection::Tx).filtered_kbps(),
                self.estimator.filter(LinkDirection::Rx).filtered_kbps(),
            ),
            dump: self.estimator.dump(),
        }
    }

    fn set_time(&mut self, ms: u64) {
        let now = self.clock.now_ms();
        if ms > now {
            lock(&self.world).integrate(ms - now);
            self.clock.set(ms);
        }
    }

    /// Fires every timer due up to `target_ms`, then moves the clock there.
    fn advance_to(&mut self, target_ms: u64) {
        while let Some(deadline) = self.estimator.next_deadline_ms() {
            if deadline > target_ms {
                break;
            }
            self.set_time(deadline);
            self.estimator.run_timers();
            self.settle();
        }
        self.set_time(target_ms);
    }

    fn apply(&mut self, action: StepAction) {
        let event = match action {
            StepAction::Screen { on } => EstimatorEvent::ScreenStateChanged(on),
            StepAction::DefaultNetwork {
                cellular,
                reported_tx_kbps,
                reported_rx_kbps,
            } => EstimatorEvent::DefaultNetworkChanged(Some(DefaultNetwork {
                cellular,
                reported_tx_kbps,
                reported_rx_kbps,
            })),
            StepAction::NoDefaultNetwork => EstimatorEvent::DefaultNetworkChanged(None),
            StepAction::ActiveData { sub_id } => EstimatorEvent::ActiveDataSubscriptionChanged(sub_id),
            StepAction::Signal { dbm, level } => {
                EstimatorEvent::SignalStrengthChanged(SignalStrength { dbm, level })
            }
            StepAction::NrStateChanged => EstimatorEvent::NrStateChanged,
            StepAction::RegistrationChanged => EstimatorEvent::DataRegStateOrRatChanged,
            StepAction::Serving {
                plmn,
                rat,
                tac,
                nr_connected,
                nr_mmwave,
            } => {
                lock(&self.world).state = ServiceState {
                    operator_numeric: plmn,
                    cell: CellIdentity { plmn: None, tac },
                    data_rat: rat,
                    nr_connected,
                    nr_mmwave,
                };
                return;
            }
            StepAction::Load {
                tx_kbps,
                rx_kbps,
                tx_active_permille,
                rx_active_permille,
            } => {
                lock(&self.world).load = Load {
                    tx_kbps,
                    rx_kbps,
                    tx_active_permille,
                    rx_active_permille,
                };
                return;
            }
            StepAction::Counters { tx_bytes, rx_bytes } => {
                let mut world = lock(&self.world);
                world.tx_bytes = tx_bytes;
                world.rx_bytes = rx_bytes;
                return;
            }
            StepAction::ModemFails { reason } => {
                lock(&self.world).next_answer = NextAnswer::Fail(reason);
                return;
            }
            StepAction::ModemSilent => {
                lock(&self.world).next_answer = NextAnswer::Silent;
                return;
            }
        };
        self.estimator.handle(event);
    }

    /// Answers outstanding modem requests and feeds the replies back until
    /// nothing is pending.
    fn settle(&mut self) {
        loop {
            let now = self.clock.now_ms();
            let answered: Vec<(ActivityReply, Option<Result<ModemActivityReport, ActivityError>>)> = {
                let mut world = lock(&self.world);
                let pending = mem::take(&mut world.pending);
                pending
                    .into_iter()
                    .map(|reply| {
                        let result = match mem::take(&mut world.next_answer) {
                            NextAnswer::Report => Some(Ok(world.report(now))),
                            NextAnswer::Fail(reason) => Some(Err(ActivityError::Unavailable(reason))),
                            NextAnswer::Silent => None,
                        };
                        (reply, result)
                    })
                    .collect()
            };
            for (reply, result) in answered {
                if let Some(result) = result {
                    reply.complete(result);
                }
            }

            let mut handled = false;
            while let Ok(event) = self.events.try_recv() {
                self.estimator.handle(event);
                handled = true;
            }
            if !handled && lock(&self.world).pending.is_empty() {
                break;
            }
        }
    }
}
