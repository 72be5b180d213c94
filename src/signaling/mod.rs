//! Signaling Module - synchronized store used as a call relay
//!
//! No media ever transits the store. It carries:
//! - the pair-keyed call record (caller, media kind, offer, answer)
//! - append-only candidate lists, one per participant
//! - deletion of the record as the hang-up signal

mod client;
mod memory;
mod messages;
mod store;

pub use client::{RelayStatus, RelayStore};
pub use memory::MemoryStore;
pub use messages::*;
pub use store::{with_retry, SignalingStore, Subscription, TransportError};
