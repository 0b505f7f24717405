//! In-process event bus between the coordination tasks and whoever is
//! watching them (the operator shell, a management UI, tests).
//!
//! One [`tokio::sync::broadcast`] channel per [`Topic`]: every subscriber
//! sees every event, and a slow subscriber loses the oldest events instead
//! of holding up the mission.
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Telemetry`] | Link health changes |
//! | [`Topic::MissionEvents`] | State transitions, treated and skipped targets |
//! | [`Topic::SystemAlerts`] | Obstacle reactions, faults, emergency stops, link loss |

use std::fmt;

use agribot_types::{AgriError, Event};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Events buffered per topic before a lagging subscriber starts losing them.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Telemetry,
    MissionEvents,
    SystemAlerts,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Telemetry, Topic::MissionEvents, Topic::SystemAlerts];

    fn index(self) -> usize {
        match self {
            Topic::Telemetry => 0,
            Topic::MissionEvents => 1,
            Topic::SystemAlerts => 2,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Topic::Telemetry => "telemetry",
            Topic::MissionEvents => "mission_events",
            Topic::SystemAlerts => "system_alerts",
        })
    }
}

/// Cheap to clone; clones publish into the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    channels: [broadcast::Sender<Event>; 3],
}

impl EventBus {
    /// `capacity` applies to each topic separately.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Topic::ALL.map(|_| broadcast::channel(capacity).0),
        }
    }

    /// Hand `event` to every current subscriber of `topic` and return how
    /// many there were.
    ///
    /// # Errors
    ///
    /// [`AgriError::Channel`] when the topic has no subscribers.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, AgriError> {
        self.channels[topic.index()]
            .send(event)
            .map_err(|_| AgriError::Channel(format!("no subscribers on {topic}")))
    }

    /// [`publish_to`][Self::publish_to] for producers that carry on whether
    /// or not anyone is listening.
    pub fn emit(&self, topic: Topic, event: Event) {
        if self.publish_to(topic, event).is_err() {
            trace!(%topic, "event dropped, no subscribers");
        }
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.channels[topic.index()].subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.channels[topic.index()].receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Subscription to one [`Topic`], from [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Next event, surfacing lag as `RecvError::Lagged(n)`.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Next event, logging and skipping over lag.  `None` once every bus
    /// handle has been dropped.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, lagged_by = n, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agribot_types::{EventPayload, MissionState, ProximityReadings};

    fn transition(to: MissionState) -> Event {
        Event::new(
            "agribot-runtime::mission",
            EventPayload::MissionTransition {
                from: MissionState::Idle,
                to,
            },
        )
    }

    fn link_lost() -> Event {
        Event::new(
            "agribot-runtime::supervisor",
            EventPayload::LinkHealth { alive: false },
        )
    }

    #[test]
    fn publishing_into_an_empty_topic_is_an_error() {
        let bus = EventBus::default();
        let result = bus.publish_to(Topic::Telemetry, link_lost());
        match result {
            Err(AgriError::Channel(msg)) => assert!(msg.contains("telemetry"), "{msg}"),
            other => panic!("expected a channel error, got {other:?}"),
        }
        bus.emit(Topic::SystemAlerts, link_lost());
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut shell = bus.subscribe_to(Topic::MissionEvents);
        let mut recorder = bus.subscribe_to(Topic::MissionEvents);
        assert_eq!(bus.subscriber_count(Topic::MissionEvents), 2);

        let first = transition(MissionState::Searching);
        let second = transition(MissionState::Aligning);
        assert_eq!(bus.publish_to(Topic::MissionEvents, first.clone())?, 2);
        bus.emit(Topic::MissionEvents, second.clone());

        for sub in [&mut shell, &mut recorder] {
            assert_eq!(sub.recv().await?.id, first.id);
            assert_eq!(sub.recv().await?.id, second.id);
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn topics_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        let _telemetry = bus.subscribe_to(Topic::Telemetry);

        bus.publish_to(Topic::Telemetry, link_lost())?;
        let leaked =
            tokio::time::timeout(std::time::Duration::from_millis(50), alerts.recv()).await;
        assert!(leaked.is_err(), "telemetry event reached the alerts topic");

        let blocked = Event::new(
            "agribot-runtime::supervisor",
            EventPayload::FullyBlocked {
                readings: ProximityReadings::new(10.0, 10.0, 10.0),
            },
        );
        bus.publish_to(Topic::SystemAlerts, blocked)?;
        let event = alerts.next().await.ok_or("bus closed")?;
        assert!(matches!(event.payload, EventPayload::FullyBlocked { .. }));
        assert_eq!(alerts.topic(), Topic::SystemAlerts);
        Ok(())
    }

    #[tokio::test]
    async fn slow_subscriber_loses_the_oldest_events() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::MissionEvents);

        for _ in 0..100 {
            bus.emit(Topic::MissionEvents, transition(MissionState::Searching));
        }
        let last = transition(MissionState::Idle);
        bus.emit(Topic::MissionEvents, last.clone());

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let mut seen = 0;
        let mut tail = None;
        while let Ok(event) = slow.receiver.try_recv() {
            seen += 1;
            tail = Some(event.id);
        }
        assert_eq!(seen, 16);
        assert_eq!(tail, Some(last.id));
    }

    #[tokio::test]
    async fn next_ends_when_the_bus_is_dropped() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_to(Topic::Telemetry);
        drop(bus);
        assert!(sub.next().await.is_none());
    }
}
