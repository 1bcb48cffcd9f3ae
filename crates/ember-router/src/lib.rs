//! # ember-router
//!
//! In-process event bus connecting the node's subsystems to each other and to
//! remote peers. Every message travels as a typed payload under a stable
//! numeric typecode; endpoints ("stations") are plain names. Local stations
//! are created per subsystem, remote stations represent network peers.
//!
//! This crate provides:
//! - Stable message typecodes and typed payloads
//! - Per-station subscriptions with RAII unsubscription
//! - Unicast send, destination-less publish and remote broadcast

mod bus;
mod message;

pub use bus::{Event, Router, StationFilter, Subscription};
pub use message::{HashRequest, HeaderAnchor, HeaderRequest, MessageType, Payload};

/// Buffered events per subscription before the bus starts dropping.
pub const SUBSCRIPTION_BUFFER: usize = 256;
