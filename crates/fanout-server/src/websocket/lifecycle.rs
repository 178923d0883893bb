//! Connection lifecycle state machine.
//!
//! ```text
//! Connecting ──► Open ──► Closing ──► Closed
//!      │                                 ▲
//!      └─────────────────────────────────┘  (handshake aborted)
//! ```
//!
//! `Closed` is terminal. Only `Open` connections accept outbound frames.

use std::fmt;

use thiserror::Error;

/// Where a connection is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Upgrade accepted, not yet registered.
    Connecting,
    /// Registered and receiving broadcasts.
    Open,
    /// Close handshake in progress; no new frames are accepted.
    Closing,
    /// Fully closed and removed from the registry.
    Closed,
}

impl LifecycleState {
    /// Whether moving from `self` to `next` is a legal edge.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open | Self::Closed)
                | (Self::Open, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    /// Whether outbound frames may be queued in this state.
    pub fn accepts_sends(self) -> bool {
        self == Self::Open
    }

    /// Whether this is the terminal state.
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }

    /// Lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An edge the state machine does not allow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State the connection was in.
    pub from: LifecycleState,
    /// State that was requested.
    pub to: LifecycleState,
}
