//! `lablink-middleware` – status distribution.
//!
//! Carries status-change and fault notifications from device loops to any
//! number of observers without caring about the payload's meaning.
//!
//! # Modules
//!
//! - [`bus`] – Topic-based publish/subscribe bus built on Tokio broadcast
//!   channels.

pub mod bus;

pub use bus::{StatusBus, Topic, TopicReceiver};
