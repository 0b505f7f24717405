//! [`Mission`] – the target-servicing state machine.
//!
//! ```text
//! Idle ─start─▶ Searching ─target─▶ Aligning ─▶ Computing ─▶ Compensating
//!                  ▲                                              │
//!                  │                                              ▼
//!              Resetting ◀─ Retracting ◀─ Raising ◀─ Treating ◀─ Lowering ◀─ Extending
//! ```
//!
//! Each stage issues one [`MotionCommand`] and awaits its acknowledgement
//! before the next one starts.  Three things can cut a cycle short:
//!
//! - **Stop** ([`MissionHandle::stop`]) is observed at every await.  A
//!   stop-all goes out on the priority lane and the mission returns to
//!   [`MissionState::Idle`].
//! - **Fault**: any protocol or actuator error.  Same unwinding, plus a
//!   [`EventPayload::MissionFault`] alert and `last_error` in the status.
//!   Nothing is retried.
//! - **Obstacle pre-emption**: an arbiter intervention while the arm is being
//!   brought to a target (Aligning through Treating) abandons that target.
//!   The arm is reset and the mission goes back to searching without marking
//!   the target.  Once the spray is on the wire the treatment is seen
//!   through, so a sprayed target is always marked.  Raising and retracting
//!   always run to completion.
//!
//! A command still queued when its wait is abandoned is never sent; one
//! already on the wire completes its transaction.
//!
//! While the arbiter is manoeuvring the mission issues no motion of its own.
//! Forward travel is resumed by the mission, never by the arbiter, and only
//! once the manoeuvre is over.

use std::future::Future;
use std::sync::Arc;

use agribot_middleware::{EventBus, Topic};
use agribot_perception::{RawDetection, TargetSelector, TrackedObject, Tracker, TrackerConfig, TransformEngine};
use agribot_types::{
    ActuatorAck, AgriError, CalibrationProfile, ControlMode, Event, EventPayload, MissionState,
    MissionStatus, MotionCommand, UnreachablePolicy,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::dispatch::Dispatcher;

const SOURCE: &str = "agribot-runtime::mission";

// ────────────────────────────────────────────────────────────────────────────
// Handle
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Start,
    Reset,
}

/// Latest stop request.  Every request bumps `epoch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopSignal {
    pub epoch: u64,
    pub reason: String,
}

/// Management interface to a running [`Mission`] task.  Cheap to clone.
#[derive(Clone)]
pub struct MissionHandle {
    control: mpsc::Sender<Control>,
    stop: Arc<watch::Sender<StopSignal>>,
    status: watch::Receiver<MissionStatus>,
}

impl MissionHandle {
    /// Leave `Idle` and start searching.  Ignored while a mission is active.
    pub async fn start(&self) -> Result<(), AgriError> {
        if self.status.borrow().state != MissionState::Idle {
            debug!("start ignored, mission already active");
            return Ok(());
        }
        self.send(Control::Start).await
    }

    /// Unwind to `Idle` from any state.  A stop-all is always sent, even
    /// when the mission is already idle.
    pub fn stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.stop.send_modify(|signal| {
            signal.epoch += 1;
            signal.reason = reason;
        });
    }

    /// Stop, then forget every track and zero the counters.
    pub async fn reset(&self) -> Result<(), AgriError> {
        self.stop("reset");
        self.send(Control::Reset).await
    }

    pub fn status(&self) -> MissionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<MissionStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<MissionStatus, AgriError>
    where
        F: FnMut(&MissionStatus) -> bool,
    {
        let mut status = self.status.clone();
        let seen = status
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| AgriError::Channel("mission task has exited".to_string()))?;
        Ok(seen.clone())
    }

    async fn send(&self, control: Control) -> Result<(), AgriError> {
        self.control
            .send(control)
            .await
            .map_err(|_| AgriError::Channel("mission task has exited".to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Interruptions
// ────────────────────────────────────────────────────────────────────────────

/// Published by the obstacle arbiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObstacleSignal {
    /// Bumped once per intervention.
    pub reactions: u64,
    /// An avoidance manoeuvre is being executed.
    pub manoeuvring: bool,
}

/// Why a cycle ended early.
#[derive(Debug)]
enum Abort {
    Stopped(String),
    Preempted,
    Failed { command: String, error: AgriError },
}

/// The mission's view of the outside world: the stop and obstacle signals it
/// observes around every await, and the status it publishes.
struct Signals {
    stop: watch::Receiver<StopSignal>,
    obstacle: watch::Receiver<ObstacleSignal>,
    obstacle_base: u64,
    /// Reactions already acted upon or absorbed.
    seen_reactions: u64,
    status_tx: watch::Sender<MissionStatus>,
}

impl Signals {
    /// Drive `fut` unless a stop (or, when `preemptible`, an obstacle
    /// reaction) arrives first.  Reactions that do not pre-empt still update
    /// the published obstacle count.
    async fn guard<T, F>(&mut self, preemptible: bool, label: &str, fut: F) -> Result<T, Abort>
    where
        F: Future<Output = Result<T, AgriError>>,
    {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                changed = self.stop.changed() => return Err(self.stopped(changed)),
                Ok(()) = self.obstacle.changed() => {
                    if !self.absorb_reaction() {
                        continue;
                    }
                    if preemptible {
                        return Err(Abort::Preempted);
                    }
                }
                result = &mut fut => {
                    return result.map_err(|error| Abort::Failed {
                        command: label.to_string(),
                        error,
                    });
                }
            }
        }
    }

    /// Wait out an avoidance manoeuvre.  Returns at once when none is
    /// running, or when the arbiter has gone away.
    async fn settle(&mut self) -> Result<(), Abort> {
        loop {
            self.absorb_reaction();
            if !self.obstacle.borrow().manoeuvring {
                return Ok(());
            }
            tokio::select! {
                biased;
                changed = self.stop.changed() => return Err(self.stopped(changed)),
                changed = self.obstacle.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Record the latest reaction count.  `true` when it is new.
    fn absorb_reaction(&mut self) -> bool {
        let reactions = self.obstacle.borrow_and_update().reactions;
        if reactions == self.seen_reactions {
            return false;
        }
        self.seen_reactions = reactions;
        let events = self.obstacle_events();
        self.status_tx
            .send_modify(|status| status.obstacle_events = events);
        true
    }

    fn stopped(&mut self, changed: Result<(), watch::error::RecvError>) -> Abort {
        Abort::Stopped(match changed {
            Ok(()) => self.stop.borrow_and_update().reason.clone(),
            Err(_) => "mission handle dropped".to_string(),
        })
    }

    fn obstacle_events(&self) -> u32 {
        let reactions = self.obstacle.borrow().reactions;
        u32::try_from(reactions.saturating_sub(self.obstacle_base)).unwrap_or(u32::MAX)
    }
}

/// What the arm has been told to do so far in the current cycle.
#[derive(Debug, Clone, Copy, Default)]
struct ArmPose {
    extended_s: f32,
    extended: bool,
    lowered: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Mission
// ────────────────────────────────────────────────────────────────────────────

pub struct Mission {
    profile: Arc<CalibrationProfile>,
    engine: TransformEngine,
    selector: TargetSelector,
    tracker: Tracker,
    dispatcher: Dispatcher,
    bus: EventBus,
    frames: watch::Receiver<Vec<RawDetection>>,
    signals: Signals,
    status: MissionStatus,
    pose: ArmPose,
    distance_base: f32,
}

impl Mission {
    /// Start the mission task.
    ///
    /// `frames` carries the latest detection frame; `obstacle` is published
    /// by the arbiter.
    pub fn spawn(
        profile: Arc<CalibrationProfile>,
        dispatcher: Dispatcher,
        bus: EventBus,
        frames: watch::Receiver<Vec<RawDetection>>,
        obstacle: watch::Receiver<ObstacleSignal>,
    ) -> (MissionHandle, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(StopSignal::default());
        let (status_tx, status_rx) = watch::channel(MissionStatus::default());

        let obstacle_base = obstacle.borrow().reactions;
        let mission = Self {
            engine: TransformEngine::new(profile.clone()),
            selector: TargetSelector::from_profile(&profile),
            tracker: Tracker::new(TrackerConfig::from_profile(&profile)),
            distance_base: dispatcher.distance_cm(),
            profile,
            dispatcher,
            bus,
            frames,
            signals: Signals {
                stop: stop_rx,
                obstacle,
                obstacle_base,
                seen_reactions: obstacle_base,
                status_tx,
            },
            status: MissionStatus::default(),
            pose: ArmPose::default(),
        };
        let task = tokio::spawn(mission.run(control_rx).instrument(info_span!("mission")));
        let handle = MissionHandle {
            control: control_tx,
            stop: Arc::new(stop_tx),
            status: status_rx,
        };
        (handle, task)
    }

    async fn run(mut self, mut control: mpsc::Receiver<Control>) {
        self.publish();
        loop {
            tokio::select! {
                biased;
                changed = self.signals.stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let reason = self.signals.stop.borrow_and_update().reason.clone();
                    self.finish(Abort::Stopped(reason)).await;
                }
                request = control.recv() => match request {
                    Some(Control::Start) => self.run_mission().await,
                    Some(Control::Reset) => self.reset(),
                    None => break,
                },
            }
        }
        debug!("mission task finished");
    }

    async fn run_mission(&mut self) {
        self.signals.stop.borrow_and_update();
        self.status.last_error = None;
        info!("mission started");
        self.transition(MissionState::Searching);
        let abort = match self.prepare().await {
            Ok(()) => self.patrol().await,
            Err(abort) => abort,
        };
        self.finish(abort).await;
    }

    /// Put the unit in the configured arm mode and arm its local reflex.
    async fn prepare(&mut self) -> Result<(), Abort> {
        let closed_loop = self.profile.arm_control == ControlMode::ClosedLoop;
        self.command(MotionCommand::SetClosedLoop(closed_loop), false)
            .await?;
        let cm = self.profile.obstacle_threshold_cm.round().max(0.0) as u32;
        self.command(MotionCommand::SetAvoidanceThreshold { cm }, false)
            .await?;
        self.command(MotionCommand::Avoidance(true), false).await?;
        Ok(())
    }

    /// Search and service targets until something ends the mission.
    async fn patrol(&mut self) -> Abort {
        loop {
            let target = match self.search().await {
                Ok(target) => target,
                Err(abort) => return abort,
            };
            match self.service(target).await {
                Ok(()) => {}
                Err(Abort::Preempted) => {
                    if let Err(abort) = self.recover().await {
                        return abort;
                    }
                }
                Err(abort) => return abort,
            }
        }
    }

    /// Drive forward until a fresh frame yields an unsprayed target.  An
    /// obstacle reaction suspends the search; forward travel resumes once
    /// the manoeuvre is over.
    async fn search(&mut self) -> Result<TrackedObject, Abort> {
        self.transition(MissionState::Searching);
        loop {
            self.signals.settle().await?;
            let scanned = match self
                .command(MotionCommand::MoveForward { seconds: None }, true)
                .await
            {
                Ok(_) => self.scan().await,
                Err(abort) => Err(abort),
            };
            match scanned {
                Err(Abort::Preempted) => debug!("search interrupted by obstacle reaction"),
                other => return other,
            }
        }
    }

    async fn scan(&mut self) -> Result<TrackedObject, Abort> {
        loop {
            self.next_frame(true).await?;
            if let Some(target) = self.tracker.next_target(self.profile.min_forward_px) {
                self.command(MotionCommand::MoveStop, true).await?;
                info!(
                    track_id = target.id,
                    label = %target.detection.label,
                    offset_px = target.offset_x(),
                    "target acquired"
                );
                return Ok(target);
            }
        }
    }

    async fn service(&mut self, target: TrackedObject) -> Result<(), Abort> {
        let id = target.id;
        self.tracker.pin(Some(id));
        self.status.current_target = Some(id);
        let result = self.treat(target).await;
        self.tracker.pin(None);
        self.status.current_target = None;
        self.publish();
        result
    }

    async fn treat(&mut self, target: TrackedObject) -> Result<(), Abort> {
        let id = target.id;

        self.transition(MissionState::Aligning);
        let target = self.align(target).await?;

        self.transition(MissionState::Computing);
        let (x, y) = target.detection.center();
        let mut plan = self.engine.plan_extension(x, y);
        debug!(
            track_id = id,
            edge_px = plan.edge_px,
            extension_cm = plan.extension_cm,
            extension_s = plan.extension_s,
            "extension planned"
        );
        if !plan.reachable {
            let limit_cm = self.profile.arm_travel_limit_cm;
            match self.profile.on_unreachable {
                UnreachablePolicy::Alert => {
                    return Err(Abort::Failed {
                        command: MissionState::Computing.to_string(),
                        error: AgriError::Unreachable {
                            requested_cm: plan.extension_cm,
                            limit_cm,
                        },
                    });
                }
                UnreachablePolicy::Skip => {
                    self.skip(
                        id,
                        format!("needs {:.2} cm, arm reaches {limit_cm:.2} cm", plan.extension_cm),
                    );
                    return Ok(());
                }
                UnreachablePolicy::Nearest => {
                    warn!(
                        track_id = id,
                        requested_cm = plan.extension_cm,
                        limit_cm,
                        "target out of reach, extending to the limit"
                    );
                    plan.extension_cm = limit_cm;
                    plan.extension_s = self.engine.arm_duration(limit_cm);
                }
            }
        }

        self.transition(MissionState::Compensating);
        if plan.travel_s > 0.0 {
            self.command(
                MotionCommand::MoveForward {
                    seconds: Some(plan.travel_s),
                },
                true,
            )
            .await?;
        }

        self.transition(MissionState::Extending);
        let extend = match self.profile.arm_control {
            ControlMode::Timed => MotionCommand::ExtendFor {
                seconds: plan.extension_s,
            },
            ControlMode::ClosedLoop => MotionCommand::ExtendTo {
                cm: plan.extension_cm,
            },
        };
        self.pose.extended = true;
        self.pose.extended_s = plan.extension_s;
        self.command(extend, true).await?;

        self.transition(MissionState::Lowering);
        self.pose.lowered = true;
        self.command(MotionCommand::Lower, true).await?;

        self.transition(MissionState::Treating);
        self.spray(self.profile.spray_s).await?;

        self.transition(MissionState::Raising);
        self.command(MotionCommand::Raise, false).await?;
        self.pose.lowered = false;

        self.transition(MissionState::Retracting);
        self.command(self.retract_command(), false).await?;
        self.pose = ArmPose::default();

        self.transition(MissionState::Resetting);
        self.command(MotionCommand::PumpOff, false).await?;
        if self.tracker.mark_sprayed(id) {
            self.status.treated += 1;
            info!(track_id = id, treated = self.status.treated, "target treated");
            self.bus.emit(
                Topic::MissionEvents,
                Event::new(SOURCE, EventPayload::TargetTreated { track_id: id }),
            );
        }
        Ok(())
    }

    /// The spray can be abandoned until it reaches the link.  From then on it
    /// is seen through, whatever the arbiter does.
    async fn spray(&mut self, seconds: f32) -> Result<(), Abort> {
        let command = MotionCommand::Spray { seconds };
        let label = command.to_string();
        let mut pending = self
            .signals
            .guard(true, &label, self.dispatcher.submit(command))
            .await?;
        let sent = self.signals.guard(true, &label, pending.transmitted()).await;
        match sent {
            Ok(()) => {}
            Err(Abort::Preempted) if !pending.withdraw() => {
                debug!("spray already on the wire, finishing the treatment");
            }
            Err(abort) => return Err(abort),
        }
        self.signals.guard(false, &label, pending.outcome()).await?;
        self.publish();
        Ok(())
    }

    /// Centre the target on the arm axis: move, re-observe, repeat up to the
    /// configured retry count, then carry on regardless.
    async fn align(&mut self, mut target: TrackedObject) -> Result<TrackedObject, Abort> {
        for attempt in 0..=self.profile.alignment_retries {
            let (x, y) = target.detection.center();
            let plan = self.engine.plan_alignment(x, y);
            let Some(command) = plan.command() else {
                debug!(track_id = target.id, offset_px = plan.offset_px, "aligned");
                return Ok(target);
            };
            debug!(
                track_id = target.id,
                attempt,
                offset_px = plan.offset_px,
                travel_cm = plan.travel_cm,
                "alignment correction"
            );
            self.command(command, true).await?;
            self.next_frame(true).await?;
            match self.tracker.missing_for(target.id) {
                Some(0) => {
                    if let Some(seen) = self.tracker.get(target.id) {
                        target = seen.clone();
                    }
                }
                _ => {
                    debug!(track_id = target.id, "target not re-observed, assuming aligned");
                    return Ok(target);
                }
            }
        }
        warn!(
            track_id = target.id,
            offset_px = target.offset_x(),
            "alignment retries exhausted, proceeding"
        );
        Ok(target)
    }

    /// Bring the arm home after a pre-empted cycle.
    async fn recover(&mut self) -> Result<(), Abort> {
        warn!("treatment pre-empted by obstacle reaction, resetting arm");
        self.transition(MissionState::Resetting);
        self.command(MotionCommand::PumpOff, false).await?;
        if self.pose.lowered {
            self.command(MotionCommand::Raise, false).await?;
            self.pose.lowered = false;
        }
        if self.pose.extended {
            self.command(self.retract_command(), false).await?;
        }
        self.pose = ArmPose::default();
        Ok(())
    }

    fn retract_command(&self) -> MotionCommand {
        match self.profile.arm_control {
            ControlMode::Timed => MotionCommand::RetractFor {
                seconds: self.pose.extended_s + self.profile.retract_buffer_s,
            },
            ControlMode::ClosedLoop => MotionCommand::ArmHome,
        }
    }

    fn skip(&mut self, id: u64, reason: String) {
        warn!(track_id = id, %reason, "target skipped");
        self.tracker.skip(id);
        self.status.skipped += 1;
        self.bus.emit(
            Topic::MissionEvents,
            Event::new(SOURCE, EventPayload::TargetSkipped { track_id: id, reason }),
        );
    }

    /// Unwind to `Idle`.  The stop-all is sent unguarded so it completes even
    /// when a second stop arrives.
    async fn finish(&mut self, abort: Abort) {
        if let Err(e) = self.dispatcher.send_priority(MotionCommand::StopAll).await {
            error!(error = %e, "stop-all failed");
        }
        match abort {
            Abort::Stopped(reason) => {
                warn!(%reason, state = %self.status.state, "mission stopped");
                self.bus.emit(
                    Topic::SystemAlerts,
                    Event::new(SOURCE, EventPayload::EmergencyStop { reason }),
                );
            }
            Abort::Failed { command, error } => {
                error!(%command, %error, state = %self.status.state, "mission aborted");
                self.status.last_error = Some(format!("{command}: {error}"));
                self.bus.emit(
                    Topic::SystemAlerts,
                    Event::new(
                        SOURCE,
                        EventPayload::MissionFault {
                            command,
                            message: error.to_string(),
                        },
                    ),
                );
            }
            Abort::Preempted => {
                warn!(state = %self.status.state, "mission pre-empted outside a treatment");
            }
        }
        self.pose = ArmPose::default();
        self.tracker.pin(None);
        self.status.current_target = None;
        self.transition(MissionState::Idle);
        self.publish();
    }

    fn reset(&mut self) {
        self.tracker.reset();
        self.pose = ArmPose::default();
        self.status = MissionStatus::default();
        self.distance_base = self.dispatcher.distance_cm();
        self.signals.obstacle_base = self.signals.obstacle.borrow().reactions;
        info!("mission reset");
        self.publish();
    }

    async fn command(
        &mut self,
        command: MotionCommand,
        preemptible: bool,
    ) -> Result<ActuatorAck, Abort> {
        let label = command.to_string();
        let ack = self
            .signals
            .guard(preemptible, &label, self.dispatcher.send(command))
            .await?;
        self.publish();
        Ok(ack)
    }

    /// Wait for the next detection frame and feed it to the tracker.
    async fn next_frame(&mut self, preemptible: bool) -> Result<(), Abort> {
        let frames = &mut self.frames;
        self.signals
            .guard(preemptible, "detections", async {
                frames
                    .changed()
                    .await
                    .map_err(|_| AgriError::Perception("detection feed closed".to_string()))
            })
            .await?;
        let raw = self.frames.borrow_and_update().clone();
        let detections = self.selector.classify_frame(&raw);
        self.tracker.update(&detections);
        self.status.avoided = self.tracker.non_targets_seen();
        self.publish();
        Ok(())
    }

    fn transition(&mut self, to: MissionState) {
        let from = self.status.state;
        if from == to {
            return;
        }
        debug!(%from, %to, "transition");
        self.status.state = to;
        self.publish();
        self.bus.emit(
            Topic::MissionEvents,
            Event::new(SOURCE, EventPayload::MissionTransition { from, to }),
        );
    }

    fn publish(&mut self) {
        self.status.distance_cm = (self.dispatcher.distance_cm() - self.distance_base).max(0.0);
        self.status.obstacle_events = self.signals.obstacle_events();
        self.signals.status_tx.send_replace(self.status.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agribot_hal::sim::{SimProbe, SimUnit};
    use agribot_middleware::{ProtocolClient, ProtocolConfig, StreamLink};

    struct Rig {
        handle: MissionHandle,
        frames: watch::Sender<Vec<RawDetection>>,
        _obstacle: watch::Sender<ObstacleSignal>,
        probe: SimProbe,
        bus: EventBus,
    }

    fn rig(profile: CalibrationProfile) -> Rig {
        let (stream, probe) = SimUnit::new().spawn();
        let (client, _transport) =
            ProtocolClient::spawn(StreamLink::new(stream, "sim"), ProtocolConfig::default());
        let dispatcher = Dispatcher::from_profile(&profile, client);
        let bus = EventBus::default();
        let (frames_tx, frames_rx) = watch::channel(Vec::new());
        let (obstacle_tx, obstacle_rx) = watch::channel(ObstacleSignal::default());
        let (handle, _task) = Mission::spawn(
            Arc::new(profile),
            dispatcher,
            bus.clone(),
            frames_rx,
            obstacle_rx,
        );
        Rig {
            handle,
            frames: frames_tx,
            _obstacle: obstacle_tx,
            probe,
            bus,
        }
    }

    fn weed(cx: f32, cy: f32) -> RawDetection {
        RawDetection {
            label: "weed".to_string(),
            confidence: 0.9,
            x1: cx - 100.0,
            y1: cy - 50.0,
            x2: cx + 100.0,
            y2: cy + 50.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_enters_searching_and_drives_forward() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(CalibrationProfile::default());
        rig.handle.start().await?;
        rig.handle
            .wait_for(|s| s.state == MissionState::Searching)
            .await?;

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(rig.probe.odometer_cm() > 5.0, "base should be rolling");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stop_returns_to_idle_and_halts_base() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(CalibrationProfile::default());
        let mut alerts = rig.bus.subscribe_to(Topic::SystemAlerts);
        rig.handle.start().await?;
        rig.handle
            .wait_for(|s| s.state == MissionState::Searching)
            .await?;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        rig.handle.stop("operator");
        rig.handle.wait_for(|s| s.state == MissionState::Idle).await?;

        let parked = rig.probe.odometer_cm();
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!((rig.probe.odometer_cm() - parked).abs() < f32::EPSILON);

        let event = alerts.next().await.ok_or("no alert")?;
        assert!(matches!(event.payload, EventPayload::EmergencyStop { ref reason } if reason == "operator"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_target_is_skipped_under_skip_policy() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(CalibrationProfile {
            on_unreachable: UnreachablePolicy::Skip,
            ..CalibrationProfile::default()
        });
        let mut events = rig.bus.subscribe_to(Topic::MissionEvents);
        rig.handle.start().await?;
        rig.handle
            .wait_for(|s| s.state == MissionState::Searching)
            .await?;

        // Centred but far up the image: (480 - 100) px * 0.05 = 19 cm > 15.5 cm.
        rig.frames.send_replace(vec![weed(320.0, 100.0)]);
        let status = rig.handle.wait_for(|s| s.skipped == 1).await?;
        assert_eq!(status.treated, 0);
        assert!(rig.probe.arm.position_cm().abs() < f32::EPSILON, "arm never moved");

        let mut skipped = false;
        while let Ok(event) = events.recv().await {
            if let EventPayload::TargetSkipped { .. } = event.payload {
                skipped = true;
                break;
            }
        }
        assert!(skipped);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_target_faults_under_alert_policy() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(CalibrationProfile::default());
        rig.handle.start().await?;
        rig.handle
            .wait_for(|s| s.state == MissionState::Searching)
            .await?;

        rig.frames.send_replace(vec![weed(320.0, 100.0)]);
        let status = rig
            .handle
            .wait_for(|s| s.state == MissionState::Idle && s.last_error.is_some())
            .await?;
        let message = status.last_error.unwrap_or_default();
        assert!(message.contains("outside the reachable range"), "{message}");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn nearest_policy_extends_to_the_limit() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(CalibrationProfile {
            on_unreachable: UnreachablePolicy::Nearest,
            ..CalibrationProfile::default()
        });
        let mut status = rig.handle.subscribe_status();
        rig.handle.start().await?;
        rig.handle
            .wait_for(|s| s.state == MissionState::Searching)
            .await?;

        rig.frames.send_replace(vec![weed(320.0, 100.0)]);
        status
            .wait_for(|s| s.state == MissionState::Lowering)
            .await?;
        assert!((rig.probe.arm.position_cm() - 15.5).abs() < 0.05);

        rig.handle.wait_for(|s| s.treated == 1).await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_counters() -> Result<(), Box<dyn std::error::Error>> {
        let rig = rig(CalibrationProfile {
            on_unreachable: UnreachablePolicy::Skip,
            ..CalibrationProfile::default()
        });
        rig.handle.start().await?;
        rig.handle
            .wait_for(|s| s.state == MissionState::Searching)
            .await?;
        rig.frames
            .send_replace(vec![weed(320.0, 100.0), RawDetection {
                label: "crop".to_string(),
                ..weed(600.0, 400.0)
            }]);
        rig.handle.wait_for(|s| s.skipped == 1).await?;
        assert_eq!(rig.handle.status().avoided, 1);

        rig.handle.reset().await?;
        let status = rig
            .handle
            .wait_for(|s| s.state == MissionState::Idle && s.skipped == 0)
            .await?;
        assert_eq!(status.avoided, 0);
        assert_eq!(status.distance_cm, 0.0);
        Ok(())
    }
}
