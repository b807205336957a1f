//! `perch-middleware` – message plumbing for the perch front-end.
//!
//! # Modules
//!
//! - [`adapter`] – [`FrameSource`] adapters that feed sensor frames onto the
//!   bus.
//! - [`bus`] – Typed, topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`goal_server`] – Single-slot server for preemptible "localize these
//!   objects" goals.

pub mod adapter;
pub mod bus;
pub mod goal_server;

pub use adapter::{FrameSource, JsonLinesIngest};
pub use bus::{EventBus, Topic, TopicReceiver};
pub use goal_server::{AcceptedGoal, GoalHandle, GoalOutcome, GoalServer};
