//! Shared rig for the cross-crate scenario tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use agribot_hal::sim::{SimProbe, SimUnit};
use agribot_middleware::{EventBus, Link, ProtocolClient, ProtocolConfig, StreamLink};
use agribot_perception::RawDetection;
use agribot_runtime::{Coordinator, CoordinatorConfig, MissionHandle};
use agribot_types::{AgriError, CalibrationProfile, MotionCommand};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

/// Every line the core put on the wire, in order.
#[derive(Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<String>>>);

impl Transcript {
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Mission and arbiter commands, without the periodic proximity polls
    /// and liveness pings.
    pub fn commands(&self) -> Vec<MotionCommand> {
        self.lines()
            .iter()
            .map(|line| line.parse::<MotionCommand>().unwrap())
            .filter(|c| !matches!(c, MotionCommand::Ping | MotionCommand::ReadProximity))
            .collect()
    }
}

pub struct RecordingLink<L> {
    inner: L,
    transcript: Transcript,
}

#[async_trait]
impl<L: Link> Link for RecordingLink<L> {
    async fn send_line(&mut self, line: &str) -> Result<(), AgriError> {
        self.transcript.0.lock().unwrap().push(line.to_string());
        self.inner.send_line(line).await
    }

    async fn recv_line(&mut self) -> Result<String, AgriError> {
        self.inner.recv_line().await
    }

    async fn clear_input(&mut self) {
        self.inner.clear_input().await
    }
}

pub struct Rig {
    pub coordinator: Coordinator,
    pub handle: MissionHandle,
    pub transcript: Transcript,
    pub probe: Option<SimProbe>,
}

fn start<S>(stream: S, profile: CalibrationProfile, probe: Option<SimProbe>) -> Rig
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let transcript = Transcript::default();
    let link = RecordingLink {
        inner: StreamLink::new(stream, "scenario"),
        transcript: transcript.clone(),
    };
    let (client, _transport) = ProtocolClient::spawn(link, ProtocolConfig::default());
    let coordinator =
        Coordinator::spawn(profile, client, EventBus::default(), CoordinatorConfig::default())
            .unwrap();
    Rig {
        handle: coordinator.handle(),
        coordinator,
        transcript,
        probe,
    }
}

/// Full stack against the simulated actuator unit.
pub fn sim_rig(profile: CalibrationProfile) -> Rig {
    let (stream, probe) = SimUnit::new().spawn();
    start(stream, profile, Some(probe))
}

/// Full stack against a unit that reads every line and never answers.
pub fn silent_rig(profile: CalibrationProfile) -> Rig {
    let (core_end, mut unit_end) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        let mut buf = [0u8; 256];
        while matches!(unit_end.read(&mut buf).await, Ok(n) if n > 0) {}
    });
    start(core_end, profile, None)
}

/// A weed whose box is large enough to keep its identity across an
/// alignment correction.
pub fn weed(cx: f32, cy: f32) -> RawDetection {
    RawDetection {
        label: "weed".to_string(),
        confidence: 0.9,
        x1: cx - 100.0,
        y1: cy - 50.0,
        x2: cx + 100.0,
        y2: cy + 50.0,
    }
}

pub fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 0.006
}
