//! In-process activity source.
//!
//! Producers call [`ActivityBus::emit`]; subscribers registered for the
//! emitted kind are invoked synchronously, in subscription order.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tracing::debug;
use tracing::trace;

use super::ActivityError;
use super::ActivityHandler;
use super::ActivityKind;
use super::ActivitySource;
use super::SubscriptionToken;

/// Broadcast registry of activity handlers.
pub struct ActivityBus {
    inner: Mutex<BusInner>,
}

struct BusInner {
    /// Next token id to hand out.
    next_id: u64,

    /// Registered handlers keyed by token, so delivery order is stable.
    handlers: BTreeMap<SubscriptionToken, (ActivityKind, ActivityHandler)>,

    /// Kinds this bus accepts subscriptions for. `None` accepts all.
    supported: Option<Vec<ActivityKind>>,

    /// Closed buses reject new subscriptions and deliver nothing.
    closed: bool,
}

impl ActivityBus {
    /// Create a bus accepting every activity kind.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_id: 0,
                handlers: BTreeMap::new(),
                supported: None,
                closed: false,
            }),
        }
    }

    /// Create a bus that only accepts subscriptions for `kinds`.
    pub fn with_supported(kinds: impl IntoIterator<Item = ActivityKind>) -> Self {
        let bus = Self::new();
        bus.lock().supported = Some(kinds.into_iter().collect());
        bus
    }

    /// Deliver a signal to every handler subscribed to `kind`.
    ///
    /// Returns the number of handlers invoked.
    pub fn emit(&self, kind: ActivityKind) -> usize {
        // Handlers run outside the lock so they may (un)subscribe.
        let handlers: Vec<ActivityHandler> = {
            let inner = self.lock();
            if inner.closed {
                trace!("Dropping {} signal: bus closed", kind);
                return 0;
            }
            inner
                .handlers
                .values()
                .filter(|(k, _)| *k == kind)
                .map(|(_, h)| h.clone())
                .collect()
        };

        trace!("Delivering {} to {} handler(s)", kind, handlers.len());
        for handler in &handlers {
            handler(kind);
        }
        handlers.len()
    }

    /// Close the bus, dropping every handler.
    pub fn close(&self) {
        let mut inner = self.lock();
        if !inner.closed {
            debug!(
                "Closing activity bus with {} handler(s)",
                inner.handlers.len()
            );
            inner.closed = true;
            inner.handlers.clear();
        }
    }

    /// Number of currently registered handlers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().handlers.len()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ActivityBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivitySource for ActivityBus {
    fn subscribe(
        &self,
        kind: ActivityKind,
        handler: ActivityHandler,
    ) -> Result<SubscriptionToken, ActivityError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ActivityError::Closed);
        }
        if let Some(ref supported) = inner.supported
            && !supported.contains(&kind)
        {
            return Err(ActivityError::Unsupported(kind));
        }

        let token = SubscriptionToken::new(inner.next_id);
        inner.next_id += 1;
        inner.handlers.insert(token, (kind, handler));
        trace!("Subscribed {:?} to {}", token, kind);
        Ok(token)
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        if self.lock().handlers.remove(&token).is_some() {
            trace!("Unsubscribed {:?}", token);
        }
    }
}
