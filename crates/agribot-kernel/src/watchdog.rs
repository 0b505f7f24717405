//! Heartbeat deadlines for the coordination core's inputs.
//!
//! The liveness task beats `"actuator_link"` whenever the unit acknowledges
//! anything, and the frame intake beats `"detections"` for every frame.
//! [`Watchdog::poll`] turns missed deadlines into edge-triggered
//! [`HealthChange`]s so callers report a loss once, not on every tick.
//!
//! Time comes from the tokio clock so a paused test runtime controls it.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Healthy,
    TimedOut,
}

/// A component crossed its deadline in one direction since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthChange {
    Lost(String),
    Restored(String),
}

struct Deadline {
    last_beat: Instant,
    allowance: Duration,
    /// Health as of the previous [`Watchdog::poll`].
    reported: ComponentHealth,
}

impl Deadline {
    fn current(&self) -> ComponentHealth {
        if self.last_beat.elapsed() <= self.allowance {
            ComponentHealth::Healthy
        } else {
            ComponentHealth::TimedOut
        }
    }
}

/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use std::time::Duration;
/// use agribot_kernel::watchdog::{ComponentHealth, Watchdog};
///
/// let mut wd = Watchdog::new();
/// wd.register("actuator_link", Duration::from_secs(3));
/// wd.heartbeat("actuator_link");
/// assert_eq!(wd.health("actuator_link"), ComponentHealth::Healthy);
/// assert!(wd.poll().is_empty());
/// # }
/// ```
#[derive(Default)]
pub struct Watchdog {
    deadlines: BTreeMap<String, Deadline>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `component`, or restart it with a new allowance.
    /// It counts as having just beaten.
    pub fn register(&mut self, component: &str, allowance: Duration) {
        let reported = self
            .deadlines
            .get(component)
            .map_or(ComponentHealth::Healthy, |d| d.reported);
        self.deadlines.insert(
            component.to_string(),
            Deadline {
                last_beat: Instant::now(),
                allowance,
                reported,
            },
        );
    }

    /// Ignored for components that were never registered.
    pub fn heartbeat(&mut self, component: &str) {
        if let Some(deadline) = self.deadlines.get_mut(component) {
            deadline.last_beat = Instant::now();
        }
    }

    /// Unregistered components are [`ComponentHealth::TimedOut`].
    pub fn health(&self, component: &str) -> ComponentHealth {
        self.deadlines
            .get(component)
            .map_or(ComponentHealth::TimedOut, Deadline::current)
    }

    pub fn silence(&self, component: &str) -> Option<Duration> {
        self.deadlines.get(component).map(|d| d.last_beat.elapsed())
    }

    /// Components currently past their deadline, in name order.
    pub fn frozen(&self) -> Vec<String> {
        self.deadlines
            .iter()
            .filter(|(_, d)| d.current() == ComponentHealth::TimedOut)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Health transitions since the previous call, in name order.
    pub fn poll(&mut self) -> Vec<HealthChange> {
        let mut changes = Vec::new();
        for (name, deadline) in &mut self.deadlines {
            let now = deadline.current();
            if now == deadline.reported {
                continue;
            }
            deadline.reported = now;
            changes.push(match now {
                ComponentHealth::TimedOut => HealthChange::Lost(name.clone()),
                ComponentHealth::Healthy => HealthChange::Restored(name.clone()),
            });
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn beat_within_allowance_keeps_component_healthy() {
        let mut wd = Watchdog::new();
        wd.register("actuator_link", Duration::from_millis(20));
        assert_eq!(wd.health("actuator_link"), ComponentHealth::Healthy);

        advance(Duration::from_millis(10)).await;
        wd.heartbeat("actuator_link");
        advance(Duration::from_millis(15)).await;
        assert_eq!(wd.health("actuator_link"), ComponentHealth::Healthy);
        assert!(wd.poll().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_allowance_freezes_component() {
        let mut wd = Watchdog::new();
        wd.register("detections", Duration::from_millis(20));
        wd.register("actuator_link", Duration::from_secs(60));
        advance(Duration::from_millis(30)).await;

        assert_eq!(wd.health("detections"), ComponentHealth::TimedOut);
        assert_eq!(wd.frozen(), vec!["detections".to_string()]);
        assert!(wd.silence("detections").unwrap() >= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_reports_each_edge_once() {
        let mut wd = Watchdog::new();
        wd.register("actuator_link", Duration::from_millis(20));

        advance(Duration::from_millis(30)).await;
        assert_eq!(wd.poll(), vec![HealthChange::Lost("actuator_link".into())]);
        advance(Duration::from_millis(30)).await;
        assert!(wd.poll().is_empty(), "loss must not repeat");

        wd.heartbeat("actuator_link");
        assert_eq!(wd.poll(), vec![HealthChange::Restored("actuator_link".into())]);
        assert!(wd.poll().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reregistering_restarts_the_deadline() {
        let mut wd = Watchdog::new();
        wd.register("detections", Duration::from_millis(20));
        advance(Duration::from_millis(30)).await;
        assert_eq!(wd.poll(), vec![HealthChange::Lost("detections".into())]);

        wd.register("detections", Duration::from_secs(60));
        assert_eq!(wd.health("detections"), ComponentHealth::Healthy);
        assert_eq!(wd.poll(), vec![HealthChange::Restored("detections".into())]);
    }

    #[test]
    fn unknown_component_is_timed_out() {
        let mut wd = Watchdog::new();
        wd.heartbeat("ghost");
        assert_eq!(wd.health("ghost"), ComponentHealth::TimedOut);
        assert!(wd.silence("ghost").is_none());
        assert!(wd.poll().is_empty());
    }
}
