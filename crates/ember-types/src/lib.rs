//! # ember-types
//!
//! Block primitives shared by the ember node subsystems: hashes, headers,
//! bodies, full blocks and the head announcements gossiped between peers.

mod block;
mod hash;

pub use block::{Block, Body, HeadAnnounce, Header, Td, Transaction};
pub use hash::Hash;
