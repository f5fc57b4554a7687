//! `vigil-middleware` – The Nervous System
//!
//! Decouples the supervision components from each other without caring about
//! the data's meaning.
//!
//! # Modules
//!
//! - [`bus`] – Synchronous, kind-routed publish/subscribe event bus.  Handlers
//!   run on the publisher's thread, in subscription order, with failure
//!   isolation between handlers.

pub mod bus;

pub use bus::{DispatchSummary, EventBus, HandlerError, SubscriptionId};
