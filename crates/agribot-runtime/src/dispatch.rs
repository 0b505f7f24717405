//! [`Dispatcher`] – the single path from a command producer to the link.
//!
//! Every [`MotionCommand`] is first admitted by the [`CommandGate`] (which
//! clamps it into the calibrated envelope), then handed to the
//! [`ProtocolClient`].  Acknowledged drive commands feed the [`Odometer`].

use std::sync::{Arc, Mutex, PoisonError};

use agribot_kernel::CommandGate;
use agribot_middleware::{ProtocolClient, Submission};
use agribot_types::{ActuatorAck, AgriError, CalibrationProfile, MotionCommand};
use tokio::time::Instant;

// ────────────────────────────────────────────────────────────────────────────
// Odometer
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct OdometerState {
    total_cm: f32,
    /// Set while an untimed forward or backward run is in progress.
    rolling_since: Option<Instant>,
}

/// Distance estimate built from commanded travel.  Timed moves count their
/// full duration; untimed moves count until the next drive command.  Turns
/// rotate in place and are not counted.
#[derive(Debug)]
pub struct Odometer {
    speed_cm_s: f32,
    state: Mutex<OdometerState>,
}

impl Odometer {
    pub fn new(speed_cm_s: f32) -> Self {
        Self {
            speed_cm_s,
            state: Mutex::new(OdometerState::default()),
        }
    }

    /// Account for a command acknowledged just now.
    pub fn record(&self, command: &MotionCommand) {
        self.record_at(command, Instant::now());
    }

    /// Account for a command acknowledged at `now`.  Calls must be made in
    /// acknowledgement order.
    pub fn record_at(&self, command: &MotionCommand, now: Instant) {
        if !command.is_drive() && *command != MotionCommand::StopAll {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(since) = state.rolling_since.take() {
            state.total_cm += now.saturating_duration_since(since).as_secs_f32() * self.speed_cm_s;
        }
        match *command {
            MotionCommand::MoveForward { seconds: Some(s) }
            | MotionCommand::MoveBackward { seconds: Some(s) } => {
                state.total_cm += s.max(0.0) * self.speed_cm_s;
            }
            MotionCommand::MoveForward { seconds: None }
            | MotionCommand::MoveBackward { seconds: None } => {
                state.rolling_since = Some(now);
            }
            _ => {}
        }
    }

    /// Total distance so far, including an untimed run still in progress.
    pub fn distance_cm(&self) -> f32 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let rolling = state
            .rolling_since
            .map(|since| since.elapsed().as_secs_f32() * self.speed_cm_s)
            .unwrap_or(0.0);
        state.total_cm + rolling
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable; every clone shares the gate, the client and the odometer.
#[derive(Clone)]
pub struct Dispatcher {
    gate: Arc<CommandGate>,
    client: ProtocolClient,
    odometer: Arc<Odometer>,
}

impl Dispatcher {
    pub fn new(gate: CommandGate, client: ProtocolClient, odometer: Odometer) -> Self {
        Self {
            gate: Arc::new(gate),
            client,
            odometer: Arc::new(odometer),
        }
    }

    /// The standard gate and an odometer at the profile's wheel speed.
    pub fn from_profile(profile: &CalibrationProfile, client: ProtocolClient) -> Self {
        Self::new(
            CommandGate::from_profile(profile),
            client,
            Odometer::new(profile.wheel_speed_cm_s),
        )
    }

    /// Send on the normal lane.
    pub async fn send(&self, command: MotionCommand) -> Result<ActuatorAck, AgriError> {
        let command = self.gate.admit(command)?;
        let ack = self.client.send(command.clone()).await?;
        self.odometer.record(&command);
        Ok(ack)
    }

    /// Send on the priority lane.
    pub async fn send_priority(&self, command: MotionCommand) -> Result<ActuatorAck, AgriError> {
        let command = self.gate.admit(command)?;
        let ack = self.client.send_priority(command.clone()).await?;
        self.odometer.record(&command);
        Ok(ack)
    }

    /// Run an avoidance plan on the priority lane with nothing interleaved.
    /// Every command is admitted before any is sent.
    pub async fn send_plan_priority(
        &self,
        plan: Vec<MotionCommand>,
    ) -> Result<Vec<ActuatorAck>, AgriError> {
        let plan = plan
            .into_iter()
            .map(|command| self.gate.admit(command))
            .collect::<Result<Vec<_>, _>>()?;
        let report = self.client.send_batch_priority(plan.clone()).await;
        for (command, acked) in plan.iter().zip(&report.acked) {
            self.odometer.record_at(command, acked.at);
        }
        match report.failure {
            Some(error) => Err(error),
            None => Ok(report.acked.into_iter().map(|acked| acked.ack).collect()),
        }
    }

    /// Queue `command` on the normal lane; see [`Pending`].
    pub async fn submit(&self, command: MotionCommand) -> Result<Pending, AgriError> {
        let command = self.gate.admit(command)?;
        let submission = self.client.submit(command.clone()).await?;
        Ok(Pending {
            command,
            submission,
            odometer: self.odometer.clone(),
        })
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    pub fn distance_cm(&self) -> f32 {
        self.odometer.distance_cm()
    }
}

/// A normal-lane command that can still be taken back until it reaches the
/// link.  Dropping it takes it back.
pub struct Pending {
    command: MotionCommand,
    submission: Submission,
    odometer: Arc<Odometer>,
}

impl Pending {
    pub async fn transmitted(&mut self) -> Result<(), AgriError> {
        self.submission.transmitted().await
    }

    /// `true` if the command will never be sent.
    pub fn withdraw(&self) -> bool {
        self.submission.withdraw()
    }

    pub async fn outcome(mut self) -> Result<ActuatorAck, AgriError> {
        let ack = self.submission.outcome().await?;
        self.odometer.record(&self.command);
        Ok(ack)
    }
}
