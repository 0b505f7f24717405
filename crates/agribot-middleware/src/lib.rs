//! `agribot-middleware` – the wiring between the coordination core and the
//! actuator unit.
//!
//! # Modules
//!
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels.
//! - [`link`] – The [`Link`] transport trait and its stream implementation.
//! - [`protocol`] – [`ProtocolClient`], the one-in-flight request/acknowledge
//!   client with a priority lane.

pub mod bus;
pub mod link;
pub mod protocol;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use link::{Link, StreamLink, connect};
pub use protocol::{Acked, BatchReport, LinkStats, ProtocolClient, ProtocolConfig, Submission};
