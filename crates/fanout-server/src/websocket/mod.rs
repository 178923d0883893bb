//! WebSocket connection management: registry, fan-out, lifecycle and heartbeat.

pub mod broadcast;
pub mod connection;
pub mod heartbeat;
pub mod ingest;
pub mod lifecycle;
pub mod registry;
pub mod supervisor;
