//! End-to-end scenarios: mission, arbiter and liveness tasks driving the
//! simulated actuator unit over the real line protocol.

mod common;

use std::time::Duration;

use agribot_middleware::Topic;
use agribot_types::{
    CalibrationProfile, CompensationMode, ControlMode, EventPayload, MissionState,
    MotionCommand as C, ProximityReadings,
};
use common::{close, silent_rig, sim_rig, weed};

const CLEAR: ProximityReadings = ProximityReadings {
    front_cm: 200.0,
    left_cm: 200.0,
    right_cm: 200.0,
};

#[tokio::test(start_paused = true)]
async fn straight_treatment() -> Result<(), Box<dyn std::error::Error>> {
    let rig = sim_rig(CalibrationProfile::default());
    let probe = rig.probe.clone().ok_or("sim probe")?;
    let mut events = rig.coordinator.bus().subscribe_to(Topic::MissionEvents);

    rig.handle.start().await?;
    rig.handle
        .wait_for(|s| s.state == MissionState::Searching)
        .await?;

    // 80 px ahead of the arm axis, 130 px above the sensing edge.
    rig.coordinator.publish_frame(vec![weed(400.0, 350.0)]);
    rig.handle
        .wait_for(|s| s.state == MissionState::Aligning)
        .await?;
    // After the 4 cm correction the weed sits on the axis.
    rig.coordinator.publish_frame(vec![weed(320.0, 350.0)]);

    let status = rig
        .handle
        .wait_for(|s| s.treated == 1 && s.state == MissionState::Searching)
        .await?;
    assert_eq!(status.current_target, None);
    assert!(status.last_error.is_none());
    assert!(status.distance_cm >= 12.49, "4 cm alignment + 8.5 cm offset travel");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let commands = rig.transcript.commands();
    assert_eq!(
        commands[..3],
        [
            C::SetClosedLoop(false),
            C::SetAvoidanceThreshold { cm: 30 },
            C::Avoidance(true),
        ]
    );
    let extension_s = 6.5 / 2.17;
    assert!(
        matches!(
            &commands[3..],
            [
                C::MoveForward { seconds: None },
                C::MoveStop,
                C::MoveForward { seconds: Some(align) },
                C::MoveForward { seconds: Some(offset) },
                C::ExtendFor { seconds: extend },
                C::Lower,
                C::Spray { seconds: spray },
                C::Raise,
                C::RetractFor { seconds: retract },
                C::PumpOff,
                C::MoveForward { seconds: None },
            ] if close(*align, 0.40)
                && close(*offset, 0.85)
                && close(*extend, extension_s)
                && close(*spray, 2.0)
                && close(*retract, extension_s + 0.5)
        ),
        "unexpected command sequence: {commands:?}"
    );

    assert!(probe.arm.position_cm().abs() < 0.01, "arm back home");
    assert!(probe.lift.position_cm().abs() < 0.01, "nozzle raised");
    assert!(!agribot_hal::Relay::state(&probe.pump));

    // The same weed seen again is never offered twice.
    rig.coordinator.publish_frame(vec![weed(320.0, 350.0)]);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let status = rig.handle.status();
    assert_eq!(status.treated, 1);
    assert_eq!(status.state, MissionState::Searching);

    let mut treated = 0;
    let mut stages = Vec::new();
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(10), events.recv()).await
    {
        match event.payload {
            EventPayload::TargetTreated { .. } => treated += 1,
            EventPayload::MissionTransition { to, .. } => stages.push(to),
            _ => {}
        }
    }
    assert_eq!(treated, 1);
    assert_eq!(
        stages,
        [
            MissionState::Searching,
            MissionState::Aligning,
            MissionState::Computing,
            MissionState::Compensating,
            MissionState::Extending,
            MissionState::Lowering,
            MissionState::Treating,
            MissionState::Raising,
            MissionState::Retracting,
            MissionState::Resetting,
            MissionState::Searching,
        ]
    );
    rig.coordinator.shutdown();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn closed_loop_treatment_uses_position_commands() -> Result<(), Box<dyn std::error::Error>> {
    let rig = sim_rig(CalibrationProfile {
        arm_control: ControlMode::ClosedLoop,
        ..CalibrationProfile::default()
    });
    let probe = rig.probe.clone().ok_or("sim probe")?;
    let mut status = rig.handle.subscribe_status();

    rig.handle.start().await?;
    rig.handle
        .wait_for(|s| s.state == MissionState::Searching)
        .await?;
    rig.coordinator.publish_frame(vec![weed(320.0, 350.0)]);

    status
        .wait_for(|s| s.state == MissionState::Lowering)
        .await?;
    assert!((probe.arm.position_cm() - 6.5).abs() <= 0.2, "within tolerance");

    rig.handle
        .wait_for(|s| s.treated == 1 && s.state == MissionState::Searching)
        .await?;
    let commands = rig.transcript.commands();
    assert_eq!(commands[0], C::SetClosedLoop(true));
    assert!(commands.iter().any(|c| matches!(c, C::ExtendTo { cm } if close(*cm, 6.5))));
    assert!(commands.contains(&C::ArmHome));
    assert!(!commands.iter().any(|c| matches!(c, C::ExtendFor { .. } | C::RetractFor { .. })));
    assert!(probe.arm.position_cm().abs() <= 0.2);
    rig.coordinator.shutdown();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_actuator_times_out_to_idle() -> Result<(), Box<dyn std::error::Error>> {
    let rig = silent_rig(CalibrationProfile::default());
    let mut alerts = rig.coordinator.bus().subscribe_to(Topic::SystemAlerts);

    rig.handle.start().await?;
    let status = rig
        .handle
        .wait_for(|s| s.state == MissionState::Idle && s.last_error.is_some())
        .await?;
    let message = status.last_error.unwrap_or_default();
    assert!(message.starts_with("Z_ENC_OFF"), "{message}");
    assert!(message.contains("no response"), "{message}");

    // Nothing is retried and nothing follows the stop-all.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        rig.transcript.commands(),
        [C::SetClosedLoop(false), C::StopAll]
    );
    assert!(rig.coordinator.dispatcher().client().stats().timeouts >= 2);

    let mut fault = false;
    let mut link_lost = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(10), alerts.next()).await
    {
        match event.payload {
            EventPayload::MissionFault { command, .. } => {
                assert_eq!(command, "Z_ENC_OFF");
                fault = true;
            }
            EventPayload::LinkHealth { alive: false } => link_lost = true,
            _ => {}
        }
    }
    assert!(fault, "mission fault reported");
    assert!(link_lost, "liveness monitor noticed the silence");
    rig.coordinator.shutdown();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn obstacle_preempts_extension() -> Result<(), Box<dyn std::error::Error>> {
    let rig = sim_rig(CalibrationProfile::default());
    let probe = rig.probe.clone().ok_or("sim probe")?;
    let mut alerts = rig.coordinator.bus().subscribe_to(Topic::SystemAlerts);

    rig.handle.start().await?;
    rig.handle
        .wait_for(|s| s.state == MissionState::Searching)
        .await?;
    rig.coordinator.publish_frame(vec![weed(320.0, 350.0)]);
    rig.handle
        .wait_for(|s| s.state == MissionState::Extending)
        .await?;

    probe.set_readings(ProximityReadings::new(10.0, 200.0, 200.0));
    loop {
        let event = alerts.next().await.ok_or("bus closed")?;
        if let EventPayload::ObstacleAvoided { action, .. } = event.payload {
            assert_eq!(action, "back_off_turn_left");
            break;
        }
    }
    probe.set_readings(CLEAR);

    let status = rig
        .handle
        .wait_for(|s| s.state == MissionState::Searching && s.obstacle_events >= 1)
        .await?;
    assert_eq!(status.treated, 0, "abandoned target is not marked");
    assert_eq!(status.current_target, None);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let commands = rig.transcript.commands();
    let position = |wanted: &dyn Fn(&C) -> bool| commands.iter().position(|c| wanted(c));
    let extend = position(&|c| matches!(c, C::ExtendFor { .. })).ok_or("no extension")?;
    let back_off = position(&|c| matches!(c, C::MoveBackward { seconds: Some(s) } if close(*s, 0.3)))
        .ok_or("no back-off")?;
    let turn = position(&|c| matches!(c, C::TurnLeft { seconds: Some(s) } if close(*s, 0.5)))
        .ok_or("no turn")?;
    let pump_off = position(&|c| *c == C::PumpOff).ok_or("no pump off")?;
    let retract = position(&|c| matches!(c, C::RetractFor { .. })).ok_or("no retract")?;

    assert!(extend < back_off && back_off < turn, "{commands:?}");
    assert!(extend < pump_off && pump_off < retract, "{commands:?}");
    assert_eq!(
        commands.iter().filter(|c| matches!(c, C::ExtendFor { .. })).count(),
        1
    );
    assert!(!commands.iter().any(|c| matches!(c, C::Spray { .. })), "{commands:?}");
    assert_eq!(commands.last(), Some(&C::MoveForward { seconds: None }));

    // Every transaction got its own reply; at most a poll is still in flight.
    let stats = rig.coordinator.dispatcher().client().stats();
    assert_eq!(stats.timeouts, 0);
    assert_eq!(stats.malformed, 0);
    assert_eq!(stats.refused, 0);
    assert!(stats.sent - stats.acknowledged <= 1, "{stats:?}");

    assert!(probe.arm.position_cm().abs() < 0.01, "arm reset after pre-emption");
    rig.coordinator.shutdown();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_during_treatment_parks_everything() -> Result<(), Box<dyn std::error::Error>> {
    let rig = sim_rig(CalibrationProfile::default());
    let probe = rig.probe.clone().ok_or("sim probe")?;

    rig.handle.start().await?;
    rig.handle
        .wait_for(|s| s.state == MissionState::Searching)
        .await?;
    rig.coordinator.publish_frame(vec![weed(320.0, 350.0)]);
    rig.handle
        .wait_for(|s| s.state == MissionState::Treating)
        .await?;

    rig.handle.stop("operator");
    let status = rig
        .handle
        .wait_for(|s| s.state == MissionState::Idle)
        .await?;
    assert_eq!(status.treated, 0);
    assert!(status.last_error.is_none());

    let commands = rig.transcript.commands();
    assert_eq!(commands.last(), Some(&C::StopAll));
    assert!(!agribot_hal::Relay::state(&probe.pump));

    // Idle means idle: no further mission traffic.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.transcript.commands().len(), commands.len());
    rig.coordinator.shutdown();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn base_stays_parked_through_treatment_after_avoidance() -> Result<(), Box<dyn std::error::Error>>
{
    let rig = sim_rig(CalibrationProfile {
        compensation: CompensationMode::Reach,
        ..CalibrationProfile::default()
    });
    let probe = rig.probe.clone().ok_or("sim probe")?;

    rig.handle.start().await?;
    rig.handle
        .wait_for(|s| s.state == MissionState::Searching)
        .await?;

    // Obstacle on the left: stop and turn right.  The weed shows up while
    // the turn is still running.
    probe.set_readings(ProximityReadings::new(200.0, 12.0, 200.0));
    rig.handle.wait_for(|s| s.obstacle_events >= 1).await?;
    probe.set_readings(CLEAR);
    rig.coordinator.publish_frame(vec![weed(320.0, 100.0)]);

    rig.handle
        .wait_for(|s| s.state == MissionState::Extending)
        .await?;
    let parked_at = probe.odometer_cm();
    rig.handle
        .wait_for(|s| s.state == MissionState::Treating)
        .await?;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(
        (probe.odometer_cm() - parked_at).abs() < 0.01,
        "base moved {:.2} cm during the treatment",
        probe.odometer_cm() - parked_at
    );

    rig.handle.wait_for(|s| s.treated == 1).await?;
    let commands = rig.transcript.commands();
    let extend = commands
        .iter()
        .position(|c| matches!(c, C::ExtendFor { .. }))
        .ok_or("no extension")?;
    let stop = commands[..extend]
        .iter()
        .rposition(|c| *c == C::MoveStop)
        .ok_or("no stop before the extension")?;
    let pump_off = extend
        + commands[extend..]
            .iter()
            .position(|c| *c == C::PumpOff)
            .ok_or("no pump off")?;
    assert!(
        !commands[stop + 1..pump_off].iter().any(C::is_drive),
        "drive command during the treatment: {commands:?}"
    );
    assert!(
        matches!(commands[extend], C::ExtendFor { seconds } if close(seconds, 10.5 / 2.17)),
        "{commands:?}"
    );
    assert!(
        commands[..stop]
            .iter()
            .any(|c| matches!(c, C::TurnRight { seconds: Some(s) } if close(*s, 0.5))),
        "{commands:?}"
    );
    rig.coordinator.shutdown();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn spray_abandoned_by_avoidance_is_sprayed_once() -> Result<(), Box<dyn std::error::Error>> {
    let rig = sim_rig(CalibrationProfile::default());
    let probe = rig.probe.clone().ok_or("sim probe")?;
    let mut alerts = rig.coordinator.bus().subscribe_to(Topic::SystemAlerts);

    rig.handle.start().await?;
    rig.handle
        .wait_for(|s| s.state == MissionState::Searching)
        .await?;
    rig.coordinator.publish_frame(vec![weed(320.0, 350.0)]);
    rig.handle
        .wait_for(|s| s.state == MissionState::Lowering)
        .await?;

    probe.set_readings(ProximityReadings::new(10.0, 200.0, 200.0));
    loop {
        let event = alerts.next().await.ok_or("bus closed")?;
        if matches!(event.payload, EventPayload::ObstacleAvoided { .. }) {
            break;
        }
    }
    probe.set_readings(CLEAR);
    rig.handle
        .wait_for(|s| s.state == MissionState::Searching && s.obstacle_events >= 1)
        .await?;

    // Whether or not the spray got out before the reaction, showing the weed
    // again ends with exactly one treatment.
    rig.coordinator.publish_frame(vec![weed(320.0, 350.0)]);
    rig.handle
        .wait_for(|s| s.treated == 1 && s.state == MissionState::Searching)
        .await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(rig.handle.status().treated, 1);

    let commands = rig.transcript.commands();
    let sprays: Vec<usize> = commands
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, C::Spray { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(sprays.len(), 1, "{commands:?}");

    // The manoeuvre went out as one uninterrupted batch.
    let back_off = commands
        .iter()
        .position(|c| matches!(c, C::MoveBackward { seconds: Some(s) } if close(*s, 0.3)))
        .ok_or("no back-off")?;
    assert_eq!(commands[back_off - 1], C::MoveStop, "{commands:?}");
    assert!(
        matches!(commands[back_off + 1], C::TurnLeft { seconds: Some(s) } if close(s, 0.5)),
        "{commands:?}"
    );

    // Nothing resumed travel while the nozzle was down.
    let spray = sprays[0];
    let pump_off = spray
        + commands[spray..]
            .iter()
            .position(|c| *c == C::PumpOff)
            .ok_or("no pump off")?;
    assert!(
        !commands[spray..pump_off]
            .iter()
            .any(|c| *c == C::MoveForward { seconds: None }),
        "{commands:?}"
    );
    assert!(!agribot_hal::Relay::state(&probe.pump));
    rig.coordinator.shutdown();
    Ok(())
}
