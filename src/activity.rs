//! Activity signals and the sources that deliver them.
//!
//! The watchdog never talks to an input device directly. It subscribes to an
//! [`ActivitySource`], which can be the in-process [`ActivityBus`] fed by an
//! [`ActivityFeed`](feed::ActivityFeed) or anything else that can deliver
//! [`ActivityKind`] signals.

mod bus;
pub mod feed;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use bus::ActivityBus;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Kind of user input treated as evidence the user is present.
///
/// Serialized names follow the DOM events the signals originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActivityKind {
    #[serde(rename = "mousemove", alias = "pointermove")]
    PointerMove,
    #[serde(rename = "mousedown", alias = "pointerdown")]
    PointerDown,
    #[serde(rename = "keypress", alias = "keydown")]
    KeyPress,
    #[serde(rename = "scroll")]
    Scroll,
    #[serde(rename = "touchstart")]
    TouchStart,
}

impl ActivityKind {
    /// Every kind, in the order they are subscribed by default.
    pub const ALL: [ActivityKind; 5] = [
        Self::PointerMove,
        Self::PointerDown,
        Self::KeyPress,
        Self::Scroll,
        Self::TouchStart,
    ];

    /// Wire name of the signal.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PointerMove => "mousemove",
            Self::PointerDown => "mousedown",
            Self::KeyPress => "keypress",
            Self::Scroll => "scroll",
            Self::TouchStart => "touchstart",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityKind {
    type Err = ActivityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mousemove" | "pointermove" => Ok(Self::PointerMove),
            "mousedown" | "pointerdown" => Ok(Self::PointerDown),
            "keypress" | "keydown" => Ok(Self::KeyPress),
            "scroll" => Ok(Self::Scroll),
            "touchstart" => Ok(Self::TouchStart),
            other => Err(ActivityError::UnknownKind(other.to_string())),
        }
    }
}

/// Handler invoked with the kind of each delivered signal.
pub type ActivityHandler = Arc<dyn Fn(ActivityKind) + Send + Sync>;

/// Opaque handle for one registered handler, used to unsubscribe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
    /// Create a token from a source-specific id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id.
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Capability to observe activity signals of a given kind.
pub trait ActivitySource: Send + Sync {
    /// Register `handler` for signals of `kind`.
    fn subscribe(
        &self,
        kind: ActivityKind,
        handler: ActivityHandler,
    ) -> Result<SubscriptionToken, ActivityError>;

    /// Remove a previously registered handler.
    ///
    /// Unknown or already removed tokens are ignored.
    fn unsubscribe(&self, token: SubscriptionToken);
}

/// Errors raised by activity sources.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivityError {
    #[error("Activity source is closed")]
    Closed,

    #[error("Activity kind not supported by this source: {0}")]
    Unsupported(ActivityKind),

    #[error("Unknown activity kind: {0}")]
    UnknownKind(String),
}
