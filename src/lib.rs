//! idle-watchdog - fire a callback once a session has seen no user activity
//! for a configured period.
//!
//! The [`IdleWatchdog`] observes activity signals on an injected
//! [`ActivitySource`] and resets a single countdown on each one. The
//! `idle-watchdogd` binary feeds signals from stdin or a Unix socket and runs
//! an [`IdleAction`] when the session goes idle.

pub mod action;
pub mod activity;
pub mod config;
pub mod daemon;
pub mod watchdog;

pub use action::IdleAction;
pub use activity::ActivityBus;
pub use activity::ActivityKind;
pub use activity::ActivitySource;
pub use config::Config;
pub use watchdog::IdleWatchdog;
pub use watchdog::WatchdogError;
