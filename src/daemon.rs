//! Daemon event loop.
//!
//! Forwards feed signals onto an [`ActivityBus`], runs the watchdog over it,
//! and ends the session with the configured [`IdleAction`] once idle.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::action::IdleAction;
use crate::activity::ActivityBus;
use crate::activity::ActivitySource;
use crate::activity::feed::ActivityFeed;
use crate::config::Config;
use crate::watchdog::IdleWatchdog;

/// How a daemon run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The session went idle and the idle action ran.
    Idle,
    /// `shutdown` resolved first; the idle action did not run.
    Interrupted,
}

/// Watch the session until it goes idle or `shutdown` resolves.
///
/// The watchdog is disposed and `bus` closed before returning, so later
/// activity cannot re-arm an already handled idle event.
pub async fn run<S>(
    config: &Config,
    feed: ActivityFeed,
    bus: Arc<ActivityBus>,
    print_events: bool,
    shutdown: S,
) -> Result<Outcome>
where
    S: Future<Output = ()>,
{
    let action = IdleAction::from_config(config).context("Failed to initialize idle action")?;
    let idle = Arc::new(Notify::new());

    let source: Arc<dyn ActivitySource> = bus.clone();
    let notify = idle.clone();
    let watchdog = IdleWatchdog::builder(source, move || notify.notify_one())
        .timeout(config.timeout())
        .kinds(config.activity_kinds.iter().copied())
        .activate()
        .context("Failed to start idle watchdog")?;

    let feed_task = spawn_feed(feed, bus.clone(), print_events);

    let outcome = tokio::select! {
        () = idle.notified() => {
            info!("Session idle, ending it");
            Outcome::Idle
        }
        () = shutdown => {
            info!("Interrupted, shutting down");
            Outcome::Interrupted
        }
    };

    watchdog.dispose();
    feed_task.abort();
    bus.close();

    if outcome == Outcome::Idle
        && let Err(e) = action.run().await
    {
        error!("Idle command failed: {:#}", e);
    }

    Ok(outcome)
}

/// Forward feed signals onto the bus until the feed ends.
///
/// An ended feed is not idleness by itself; the watchdog keeps counting.
fn spawn_feed(mut feed: ActivityFeed, bus: Arc<ActivityBus>, print_events: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match feed.next_signal().await {
                Ok(Some(kind)) => {
                    if print_events {
                        println!("[ACTIVITY] | kind={kind}");
                    }
                    let delivered = bus.emit(kind);
                    debug!("Activity {} delivered to {} observer(s)", kind, delivered);
                }
                Ok(None) => {
                    info!("Activity feed closed; waiting for idle timeout");
                    break;
                }
                Err(e) => {
                    warn!("Activity feed failed: {}; waiting for idle timeout", e);
                    break;
                }
            }
        }
    })
}
