//! Idle watchdog.
//!
//! Fires a callback once after a period without user activity. Every activity
//! signal observed on the injected [`ActivitySource`] cancels the pending
//! countdown and arms a fresh one.
//!
//! All state transitions go through one lock. Each armed countdown carries a
//! generation number, and a countdown only fires if its generation is still
//! current when it wakes. A reset or disposal therefore cancels the previous
//! countdown as soon as it returns, even if the timer task already woke up.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::activity::ActivityHandler;
use crate::activity::ActivityKind;
use crate::activity::ActivitySource;
use crate::activity::SubscriptionToken;

/// Default idle period: 15 minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Action run when the idle period elapses.
pub type IdleCallback = Arc<dyn Fn() + Send + Sync>;

/// Errors that can occur while activating a watchdog.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchdogError {
    #[error("No tokio runtime available to schedule the idle countdown")]
    NoRuntime,

    #[error("Tokio runtime has timers disabled; build it with `enable_time`")]
    TimersDisabled,

    #[error("At least one activity kind must be observed")]
    NoActivityKinds,
}

/// Watchdog that detects user inactivity.
///
/// Dropping the watchdog disposes it.
pub struct IdleWatchdog {
    shared: Arc<Shared>,
    source: Arc<dyn ActivitySource>,

    /// Subscriptions held on `source`, removed on disposal.
    tokens: Mutex<Vec<SubscriptionToken>>,
}

struct Shared {
    state: Mutex<State>,
    runtime: Handle,
}

struct State {
    timeout: Duration,
    on_idle: IdleCallback,

    /// Identifies the live countdown. Bumped on every arm and on disposal.
    generation: u64,

    /// Task for the live countdown, if one is armed.
    pending: Option<JoinHandle<()>>,

    disposed: bool,
    fire_count: u64,
}

/// Builder for [`IdleWatchdog`].
pub struct IdleWatchdogBuilder {
    source: Arc<dyn ActivitySource>,
    on_idle: IdleCallback,
    timeout: Duration,
    kinds: Vec<ActivityKind>,
}

impl IdleWatchdogBuilder {
    /// Set the idle period (default 15 minutes).
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Restrict the observed activity kinds (default: all).
    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = ActivityKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self.kinds.sort_unstable();
        self.kinds.dedup();
        self
    }

    /// Subscribe to the source and arm the first countdown.
    ///
    /// Must be called within a tokio runtime that has timers enabled
    /// (`enable_time` or `enable_all`).
    pub fn activate(self) -> Result<IdleWatchdog, WatchdogError> {
        if self.kinds.is_empty() {
            return Err(WatchdogError::NoActivityKinds);
        }
        let runtime = Handle::try_current().map_err(|_| WatchdogError::NoRuntime)?;
        if !timers_enabled(&runtime) {
            return Err(WatchdogError::TimersDisabled);
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                timeout: self.timeout,
                on_idle: self.on_idle,
                generation: 0,
                pending: None,
                disposed: false,
                fire_count: 0,
            }),
            runtime,
        });

        let mut tokens = Vec::with_capacity(self.kinds.len());
        for kind in &self.kinds {
            let weak = Arc::downgrade(&shared);
            let handler: ActivityHandler = Arc::new(move |kind: ActivityKind| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_activity(kind);
                }
            });

            match self.source.subscribe(*kind, handler) {
                Ok(token) => tokens.push(token),
                Err(e) => warn!("Failed to observe {} activity: {}", kind, e),
            }
        }

        if tokens.is_empty() {
            warn!("No activity kinds observed; idle countdown cannot be reset");
        }

        {
            let mut state = shared.lock();
            shared.arm(&mut state);
        }

        info!(
            "Idle watchdog armed: timeout {:?}, observing {} of {} activity kind(s)",
            self.timeout,
            tokens.len(),
            self.kinds.len()
        );

        Ok(IdleWatchdog {
            shared,
            source: self.source,
            tokens: Mutex::new(tokens),
        })
    }
}

impl IdleWatchdog {
    /// Start building a watchdog observing `source`.
    pub fn builder<F>(source: Arc<dyn ActivitySource>, on_idle: F) -> IdleWatchdogBuilder
    where
        F: Fn() + Send + Sync + 'static,
    {
        IdleWatchdogBuilder {
            source,
            on_idle: Arc::new(on_idle),
            timeout: DEFAULT_TIMEOUT,
            kinds: ActivityKind::ALL.to_vec(),
        }
    }

    /// Activate a watchdog observing every activity kind.
    ///
    /// See [`IdleWatchdogBuilder::activate`] for the runtime requirements.
    pub fn activate<F>(
        source: Arc<dyn ActivitySource>,
        on_idle: F,
        timeout: Duration,
    ) -> Result<Self, WatchdogError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::builder(source, on_idle).timeout(timeout).activate()
    }

    /// Restart the countdown as if activity had been observed.
    pub fn reset(&self) {
        self.shared.reset();
    }

    /// Replace the idle callback without touching the countdown.
    pub fn set_on_idle<F>(&self, on_idle: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.lock().on_idle = Arc::new(on_idle);
        trace!("Idle callback replaced");
    }

    /// Change the idle period and restart the countdown with it.
    pub fn set_timeout(&self, timeout: Duration) {
        let mut state = self.shared.lock();
        state.timeout = timeout;
        if state.disposed {
            return;
        }
        self.shared.arm(&mut state);
        debug!("Idle timeout changed to {:?}", timeout);
    }

    /// Re-bind both parameters and restart the countdown.
    ///
    /// Only `on_idle` can fire afterwards. Has no effect once disposed.
    pub fn reactivate<F>(&self, on_idle: F, timeout: Duration)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self.shared.lock();
        if state.disposed {
            warn!("Ignoring reactivation of a disposed idle watchdog");
            return;
        }
        state.on_idle = Arc::new(on_idle);
        state.timeout = timeout;
        self.shared.arm(&mut state);
        debug!("Idle watchdog reactivated: timeout {:?}", timeout);
    }

    /// Cancel the countdown and stop observing activity.
    ///
    /// Safe to call repeatedly, and whether or not a countdown is armed.
    pub fn dispose(&self) {
        {
            let mut state = self.shared.lock();
            if !state.disposed {
                state.disposed = true;
                state.generation = state.generation.wrapping_add(1);
                if let Some(pending) = state.pending.take() {
                    pending.abort();
                }
                debug!("Idle watchdog disposed");
            }
        }

        let tokens = std::mem::take(&mut *lock(&self.tokens));
        for token in tokens {
            self.source.unsubscribe(token);
        }
    }

    /// Whether a countdown is currently pending.
    pub fn is_armed(&self) -> bool {
        self.shared.lock().pending.is_some()
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }

    /// Current idle period.
    pub fn timeout(&self) -> Duration {
        self.shared.lock().timeout
    }

    /// Number of times the idle callback has been invoked.
    pub fn fire_count(&self) -> u64 {
        self.shared.lock().fire_count
    }
}

impl Drop for IdleWatchdog {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for IdleWatchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("IdleWatchdog")
            .field("timeout", &state.timeout)
            .field("armed", &state.pending.is_some())
            .field("disposed", &state.disposed)
            .field("fire_count", &state.fire_count)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Cancel the live countdown and arm a new one.
    fn arm(self: &Arc<Self>, state: &mut State) {
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }

        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;
        let weak: Weak<Self> = Arc::downgrade(self);

        // Resets may come from threads outside the runtime; read the
        // runtime's clock, which is virtual when paused.
        let _guard = self.runtime.enter();
        let deadline = Instant::now().checked_add(state.timeout);

        state.pending = Some(self.runtime.spawn(async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
            if let Some(shared) = weak.upgrade() {
                shared.fire(generation);
            }
        }));
    }

    fn on_activity(self: &Arc<Self>, kind: ActivityKind) {
        trace!("Activity observed: {}", kind);
        self.reset();
    }

    fn reset(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        self.arm(&mut state);
    }

    fn fire(&self, generation: u64) {
        let on_idle = {
            let mut state = self.lock();
            if state.disposed || state.generation != generation {
                trace!("Discarding superseded idle countdown #{}", generation);
                return;
            }
            // This task is the live countdown; detach rather than abort it.
            state.pending = None;
            state.fire_count += 1;
            info!("No activity for {:?}; session is idle", state.timeout);
            state.on_idle.clone()
        };

        // Outside the lock so the callback may dispose or rebind the watchdog.
        on_idle();
    }
}

/// Whether `runtime` has a time driver.
///
/// Tokio exposes no query for this; creating a timer panics without one.
fn timers_enabled(runtime: &Handle) -> bool {
    let _guard = runtime.enter();
    std::panic::catch_unwind(|| drop(tokio::time::sleep(Duration::ZERO))).is_ok()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::activity::ActivityBus;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    async fn elapse(millis: u64) {
        tokio::time::sleep(ms(millis)).await;
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn hits(counter: &Arc<AtomicUsize>) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn bus() -> (Arc<ActivityBus>, Arc<dyn ActivitySource>) {
        let bus = Arc::new(ActivityBus::new());
        let source: Arc<dyn ActivitySource> = bus.clone();
        (bus, source)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_timeout() {
        let (_bus, source) = bus();
        let idle = counter();
        let watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();

        elapse(999).await;
        assert_eq!(hits(&idle), 0);
        assert!(watchdog.is_armed());

        elapse(2).await;
        assert_eq!(hits(&idle), 1);
        assert!(!watchdog.is_armed());

        // Does not re-arm on its own
        elapse(5000).await;
        assert_eq!(hits(&idle), 1);
        assert_eq!(watchdog.fire_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_restarts_countdown() {
        let (bus, source) = bus();
        let idle = counter();
        let _watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();

        elapse(500).await;
        assert_eq!(bus.emit(ActivityKind::PointerMove), 1);

        // 1000ms since activation, 500ms since the signal
        elapse(500).await;
        assert_eq!(hits(&idle), 0);

        elapse(499).await;
        assert_eq!(hits(&idle), 0);

        elapse(2).await;
        assert_eq!(hits(&idle), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_activity_never_fires() {
        let (bus, source) = bus();
        let idle = counter();
        let _watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();

        for kind in ActivityKind::ALL.iter().cycle().take(40) {
            elapse(900).await;
            bus.emit(*kind);
        }
        assert_eq!(hits(&idle), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_resets_leave_single_countdown() {
        let (bus, source) = bus();
        let idle = counter();
        let watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();

        for _ in 0..1000 {
            bus.emit(ActivityKind::KeyPress);
        }
        assert_eq!(hits(&idle), 0);
        assert!(watchdog.is_armed());

        elapse(1001).await;
        assert_eq!(hits(&idle), 1);

        elapse(5000).await;
        assert_eq!(hits(&idle), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_last_of_spaced_resets() {
        let (bus, source) = bus();
        let idle = counter();
        let watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();

        // 30 resets 100ms apart span 3000ms, well past every superseded
        // countdown's deadline
        for _ in 0..30 {
            elapse(100).await;
            bus.emit(ActivityKind::PointerMove);
            assert_eq!(hits(&idle), 0);
        }

        elapse(999).await;
        assert_eq!(hits(&idle), 0);

        elapse(2).await;
        assert_eq!(hits(&idle), 1);

        elapse(10_000).await;
        assert_eq!(hits(&idle), 1);
        assert_eq!(watchdog.fire_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_before_timeout() {
        let (bus, source) = bus();
        let idle = counter();
        let watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();
        assert_eq!(bus.subscriber_count(), ActivityKind::ALL.len());

        watchdog.dispose();
        assert!(watchdog.is_disposed());
        assert!(!watchdog.is_armed());
        assert_eq!(bus.subscriber_count(), 0);

        elapse(2000).await;
        assert_eq!(bus.emit(ActivityKind::Scroll), 0);
        elapse(2000).await;
        assert_eq!(hits(&idle), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_is_idempotent() {
        let (bus, source) = bus();
        let idle = counter();
        let watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();

        elapse(1001).await;
        assert_eq!(hits(&idle), 1);

        // Nothing armed any more
        watchdog.dispose();
        watchdog.dispose();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_disposes() {
        let (bus, source) = bus();
        let idle = counter();
        let watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();

        drop(watchdog);
        assert_eq!(bus.subscriber_count(), 0);

        elapse(2000).await;
        assert_eq!(hits(&idle), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivate_replaces_callback() {
        let (_bus, source) = bus();
        let a = counter();
        let b = counter();
        let watchdog = IdleWatchdog::activate(source, counting(&a), ms(1000)).unwrap();

        elapse(600).await;
        watchdog.reactivate(counting(&b), ms(1000));

        // A's original deadline passes without a firing
        elapse(500).await;
        assert_eq!(hits(&a), 0);
        assert_eq!(hits(&b), 0);

        elapse(501).await;
        assert_eq!(hits(&a), 0);
        assert_eq!(hits(&b), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_churn_keeps_deadline() {
        let (_bus, source) = bus();
        let idle = counter();
        let watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();

        // Re-supply an equivalent callback every 100ms
        for _ in 0..9 {
            elapse(100).await;
            watchdog.set_on_idle(counting(&idle));
        }

        // 900ms elapsed; the deadline is still 1000ms after activation
        elapse(101).await;
        assert_eq!(hits(&idle), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_timeout_rearms() {
        let (_bus, source) = bus();
        let idle = counter();
        let watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();

        elapse(800).await;
        watchdog.set_timeout(ms(3000));
        assert_eq!(watchdog.timeout(), ms(3000));

        elapse(2999).await;
        assert_eq!(hits(&idle), 0);

        elapse(2).await;
        assert_eq!(hits(&idle), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unobserved_kind_does_not_reset() {
        let (bus, source) = bus();
        let idle = counter();
        let _watchdog = IdleWatchdog::builder(source, counting(&idle))
            .timeout(ms(1000))
            .kinds([ActivityKind::KeyPress])
            .activate()
            .unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        elapse(900).await;
        assert_eq!(bus.emit(ActivityKind::PointerMove), 0);

        elapse(101).await;
        assert_eq!(hits(&idle), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_subscription_still_armed() {
        let bus = Arc::new(ActivityBus::with_supported([ActivityKind::Scroll]));
        let source: Arc<dyn ActivitySource> = bus.clone();
        let idle = counter();
        let watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        elapse(900).await;
        bus.emit(ActivityKind::Scroll);
        elapse(900).await;
        assert_eq!(hits(&idle), 0);

        watchdog.dispose();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_source_fires_without_activity() {
        let bus = Arc::new(ActivityBus::new());
        bus.close();
        let source: Arc<dyn ActivitySource> = bus.clone();
        let idle = counter();
        let _watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();

        elapse(1001).await;
        assert_eq!(hits(&idle), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_may_dispose_watchdog() {
        let (bus, source) = bus();
        let idle = counter();
        let watchdog = Arc::new(Mutex::new(None::<IdleWatchdog>));

        let slot = watchdog.clone();
        let on_idle = {
            let idle = idle.clone();
            move || {
                idle.fetch_add(1, Ordering::SeqCst);
                if let Some(w) = slot.lock().unwrap().as_ref() {
                    w.dispose();
                }
            }
        };
        *watchdog.lock().unwrap() =
            Some(IdleWatchdog::activate(source, on_idle, ms(1000)).unwrap());

        elapse(1001).await;
        assert_eq!(hits(&idle), 1);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(watchdog.lock().unwrap().as_ref().unwrap().is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_after_firing_rearms() {
        let (bus, source) = bus();
        let idle = counter();
        let watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();

        elapse(1001).await;
        assert_eq!(hits(&idle), 1);

        bus.emit(ActivityKind::TouchStart);
        assert!(watchdog.is_armed());
        elapse(1001).await;
        assert_eq!(hits(&idle), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_from_foreign_thread() {
        let (bus, source) = bus();
        let idle = counter();
        let _watchdog = IdleWatchdog::activate(source, counting(&idle), ms(1000)).unwrap();

        elapse(900).await;
        let emitter = bus.clone();
        std::thread::spawn(move || emitter.emit(ActivityKind::Scroll))
            .join()
            .unwrap();

        elapse(900).await;
        assert_eq!(hits(&idle), 0);
        elapse(101).await;
        assert_eq!(hits(&idle), 1);
    }

    #[tokio::test]
    async fn test_empty_kinds_rejected() {
        let (_bus, source) = bus();
        let result = IdleWatchdog::builder(source, || {})
            .kinds(Vec::new())
            .activate();
        assert_eq!(result.unwrap_err(), WatchdogError::NoActivityKinds);
    }

    #[test]
    fn test_requires_runtime() {
        let (_bus, source) = bus();
        let result = IdleWatchdog::activate(source, || {}, ms(1000));
        assert_eq!(result.unwrap_err(), WatchdogError::NoRuntime);
    }

    #[test]
    fn test_requires_time_driver() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let (bus, source) = bus();

        let result = runtime.block_on(async { IdleWatchdog::activate(source, || {}, ms(1000)) });
        assert_eq!(result.unwrap_err(), WatchdogError::TimersDisabled);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_default_timeout() {
        assert_eq!(DEFAULT_TIMEOUT, ms(900_000));
    }
}
