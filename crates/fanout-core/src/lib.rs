//! # fanout-core
//!
//! Shared types for the fanout workspace.
//!
//! - [`ids`]: connection identifiers and the allocator that hands them out
//! - [`events`]: the `ValueChangeEvent` record and its wire envelope
//! - [`errors`]: the error taxonomy shared by the registry, engine and server

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;

pub use errors::{FanoutError, HandshakeFailure, Result, SendFailure};
pub use events::{ValueChangeEvent, WireMessage};
pub use ids::{ConnectionId, ConnectionIdAllocator};
