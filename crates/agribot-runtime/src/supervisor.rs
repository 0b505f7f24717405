//! [`Coordinator`] – wires the mission to its concurrent helpers.
//!
//! | Task | Lane | Job |
//! |---|---|---|
//! | mission | normal | target servicing, see [`crate::mission`] |
//! | arbiter | priority | polls `US_GET_DIST`, runs each avoidance manoeuvre as one uninterrupted batch |
//! | liveness | priority | `PING`s a quiet link, reports heartbeat loss |
//! | intake | none | pulls frames from a [`DetectionSource`] into the frame watch |
//!
//! The arbiter and the intake only act while the mission is not idle.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agribot_kernel::{ArbiterConfig, HealthChange, ObstacleArbiter, Reaction, Watchdog};
use agribot_middleware::{EventBus, ProtocolClient, Topic};
use agribot_perception::{DetectionSource, RawDetection};
use agribot_types::{
    ActuatorAck, AgriError, CalibrationProfile, ControlMode, Event, EventPayload, MissionState,
    MissionStatus, MotionCommand,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::dispatch::Dispatcher;
use crate::mission::{Mission, MissionHandle, ObstacleSignal};

const SOURCE: &str = "agribot-runtime::supervisor";
const LINK_COMPONENT: &str = "actuator_link";
const FEED_COMPONENT: &str = "detections";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub arbiter_period: Duration,
    pub liveness_period: Duration,
    /// Silence after which the actuator link is reported dead.  Must cover
    /// the longest single transaction, during which no other reply can
    /// arrive.
    pub link_deadline: Duration,
    pub frame_period: Duration,
    /// Silence after which the detection feed is reported frozen.
    pub feed_deadline: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            arbiter_period: Duration::from_millis(100),
            liveness_period: Duration::from_secs(1),
            link_deadline: Duration::from_secs(20),
            frame_period: Duration::from_millis(100),
            feed_deadline: Duration::from_secs(2),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_profile(profile: &CalibrationProfile, response_timeout: Duration) -> Self {
        let longest_s = (profile.max_extend_s + profile.retract_buffer_s)
            .max(profile.max_travel_s)
            .max(profile.spray_s)
            .max(0.0);
        let mut link_deadline = response_timeout + Duration::from_secs_f32(longest_s);
        if profile.arm_control == ControlMode::ClosedLoop {
            link_deadline += Duration::from_secs_f32(profile.closed_loop_timeout_s.max(0.0));
        }
        Self {
            arbiter_period: Duration::from_millis(profile.arbiter_period_ms.max(1)),
            link_deadline,
            ..Self::default()
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Coordinator
// ────────────────────────────────────────────────────────────────────────────

pub struct Coordinator {
    handle: MissionHandle,
    dispatcher: Dispatcher,
    bus: EventBus,
    frames: Arc<watch::Sender<Vec<RawDetection>>>,
    watchdog: Arc<Mutex<Watchdog>>,
    config: CoordinatorConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Validate `profile` and start the mission, arbiter and liveness tasks.
    pub fn spawn(
        profile: CalibrationProfile,
        client: ProtocolClient,
        bus: EventBus,
        config: CoordinatorConfig,
    ) -> Result<Self, AgriError> {
        profile.validate()?;
        let profile = Arc::new(profile);
        let dispatcher = Dispatcher::from_profile(&profile, client);

        let (frames_tx, frames_rx) = watch::channel(Vec::new());
        let (obstacle_tx, obstacle_rx) = watch::channel(ObstacleSignal::default());
        let (handle, mission) = Mission::spawn(
            profile.clone(),
            dispatcher.clone(),
            bus.clone(),
            frames_rx,
            obstacle_rx,
        );

        let arbiter = ArbiterTask {
            arbiter: ObstacleArbiter::new(ArbiterConfig::from_profile(&profile)),
            dispatcher: dispatcher.clone(),
            bus: bus.clone(),
            handle: handle.clone(),
            status: handle.subscribe_status(),
            obstacle: obstacle_tx,
        };
        let arbiter = tokio::spawn(
            arbiter
                .run(config.arbiter_period)
                .instrument(info_span!("arbiter")),
        );

        let watchdog = Arc::new(Mutex::new(Watchdog::new()));
        let liveness = LivenessTask {
            client: dispatcher.client().clone(),
            bus: bus.clone(),
            watchdog: watchdog.clone(),
        };
        let liveness = tokio::spawn(
            liveness
                .run(config.liveness_period, config.link_deadline)
                .instrument(info_span!("liveness")),
        );

        info!(
            arbiter_ms = config.arbiter_period.as_millis() as u64,
            link_deadline_s = config.link_deadline.as_secs_f32(),
            "coordinator started"
        );
        Ok(Self {
            handle,
            dispatcher,
            bus,
            frames: Arc::new(frames_tx),
            watchdog,
            config,
            tasks: vec![mission, arbiter, liveness],
        })
    }

    pub fn handle(&self) -> MissionHandle {
        self.handle.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Replace the latest detection frame.
    pub fn publish_frame(&self, frame: Vec<RawDetection>) {
        self.frames.send_replace(frame);
    }

    /// Pull frames from `source` every `frame_period` while a mission is
    /// active.  An exhausted source stops the mission.
    pub fn attach_source(&mut self, source: Box<dyn DetectionSource>) {
        self.watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(FEED_COMPONENT, self.config.feed_deadline);
        let intake = IntakeTask {
            source,
            frames: self.frames.clone(),
            watchdog: self.watchdog.clone(),
            handle: self.handle.clone(),
        };
        let period = self.config.frame_period;
        self.tasks
            .push(tokio::spawn(intake.run(period).instrument(info_span!("intake"))));
    }

    /// Stop-all on the priority lane, then unwind the mission.
    pub async fn emergency_stop(&self, reason: &str) -> Result<(), AgriError> {
        warn!(%reason, "emergency stop");
        let sent = self.dispatcher.send_priority(MotionCommand::StopAll).await;
        self.handle.stop(reason);
        sent.map(|_| ())
    }

    /// Abort every background task.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        debug!(tasks = self.tasks.len(), "coordinator shut down");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Arbiter task
// ────────────────────────────────────────────────────────────────────────────

struct ArbiterTask {
    arbiter: ObstacleArbiter,
    dispatcher: Dispatcher,
    bus: EventBus,
    handle: MissionHandle,
    status: watch::Receiver<MissionStatus>,
    obstacle: watch::Sender<ObstacleSignal>,
}

impl ArbiterTask {
    async fn run(self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.state() == MissionState::Idle {
                continue;
            }
            let readings = match self.dispatcher.send_priority(MotionCommand::ReadProximity).await {
                Ok(ActuatorAck::Distances(readings)) => readings,
                Ok(other) => {
                    warn!(ack = %other, "unexpected proximity reply");
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "proximity read failed");
                    continue;
                }
            };
            let reaction = self.arbiter.evaluate(&readings);
            if reaction == Reaction::None {
                continue;
            }
            if reaction == Reaction::EmergencyStop {
                self.obstacle.send_modify(|signal| signal.reactions += 1);
                error!(
                    front_cm = readings.front_cm,
                    left_cm = readings.left_cm,
                    right_cm = readings.right_cm,
                    "fully blocked"
                );
                if let Err(e) = self.dispatcher.send_priority(MotionCommand::StopAll).await {
                    error!(error = %e, "stop-all failed");
                }
                self.bus.emit(
                    Topic::SystemAlerts,
                    Event::new(SOURCE, EventPayload::FullyBlocked { readings }),
                );
                self.handle.stop("fully blocked");
                continue;
            }

            warn!(
                action = reaction.label(),
                front_cm = readings.front_cm,
                left_cm = readings.left_cm,
                right_cm = readings.right_cm,
                "obstacle"
            );
            self.obstacle.send_modify(|signal| {
                signal.reactions += 1;
                signal.manoeuvring = true;
            });
            if let Err(e) = self
                .dispatcher
                .send_plan_priority(self.arbiter.plan(reaction))
                .await
            {
                warn!(error = %e, "avoidance manoeuvre interrupted");
            }
            self.obstacle.send_modify(|signal| signal.manoeuvring = false);
            self.bus.emit(
                Topic::SystemAlerts,
                Event::new(
                    SOURCE,
                    EventPayload::ObstacleAvoided {
                        readings,
                        action: reaction.label().to_string(),
                    },
                ),
            );
        }
    }

    fn state(&self) -> MissionState {
        self.status.borrow().state
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Liveness task
// ────────────────────────────────────────────────────────────────────────────

struct LivenessTask {
    client: ProtocolClient,
    bus: EventBus,
    watchdog: Arc<Mutex<Watchdog>>,
}

impl LivenessTask {
    /// Any acknowledgement counts as a heartbeat; a `PING` is only sent when
    /// the link has been quiet for a whole period.
    async fn run(self, period: Duration, deadline: Duration) {
        self.with_watchdog(|wd| wd.register(LINK_COMPONENT, deadline));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_acked = self.client.stats().acknowledged;

        loop {
            ticker.tick().await;
            let acked = self.client.stats().acknowledged;
            if acked != last_acked || self.client.ping().await.is_ok() {
                self.with_watchdog(|wd| wd.heartbeat(LINK_COMPONENT));
            }
            last_acked = self.client.stats().acknowledged;

            for change in self.with_watchdog(Watchdog::poll) {
                match change {
                    HealthChange::Lost(component) => {
                        warn!(%component, "heartbeat lost");
                        if component == LINK_COMPONENT {
                            self.report_link(false);
                        }
                    }
                    HealthChange::Restored(component) => {
                        info!(%component, "heartbeat restored");
                        if component == LINK_COMPONENT {
                            self.report_link(true);
                        }
                    }
                }
            }
        }
    }

    fn report_link(&self, alive: bool) {
        let event = Event::new(SOURCE, EventPayload::LinkHealth { alive });
        if !alive {
            self.bus.emit(Topic::SystemAlerts, event.clone());
        }
        self.bus.emit(Topic::Telemetry, event);
    }

    fn with_watchdog<T>(&self, f: impl FnOnce(&mut Watchdog) -> T) -> T {
        f(&mut self.watchdog.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Frame intake
// ────────────────────────────────────────────────────────────────────────────

struct IntakeTask {
    source: Box<dyn DetectionSource>,
    frames: Arc<watch::Sender<Vec<RawDetection>>>,
    watchdog: Arc<Mutex<Watchdog>>,
    handle: MissionHandle,
}

impl IntakeTask {
    async fn run(mut self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status = self.handle.subscribe_status();
        loop {
            ticker.tick().await;
            if status.borrow_and_update().state == MissionState::Idle {
                // Keep the feed deadline from expiring while parked.
                self.heartbeat();
                continue;
            }
            match self.source.next_frame() {
                Ok(Some(frame)) => {
                    self.heartbeat();
                    self.frames.send_replace(frame);
                }
                Ok(None) => {
                    info!(source = self.source.id(), "detection source exhausted");
                    self.handle.stop("detection feed exhausted");
                    break;
                }
                Err(e) => warn!(source = self.source.id(), error = %e, "frame dropped"),
            }
        }
    }

    fn heartbeat(&self) {
        self.watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heartbeat(FEED_COMPONENT);
    }
}
