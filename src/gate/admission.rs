//! Core admission gate implementation.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use super::action::Action;
use super::counter::{TimeUnit, WindowCounter};
use super::ticker::{ScheduledTask, Scheduler, TokioScheduler};
use crate::error::{CallgateError, GateError, Result};

/// When an admitted call gives its slot back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// The slot is held until the action finishes. At most `limit` actions
    /// run at once; window resets only roll statistics.
    #[default]
    OnCompletion,
    /// The slot is held until the window resets. At most `limit` actions
    /// start per window; finishing an action frees nothing.
    AtWindowEnd,
}

impl ReleasePolicy {
    /// Slots currently taken according to this policy.
    fn occupied(&self, counter: &WindowCounter) -> u64 {
        match self {
            ReleasePolicy::OnCompletion => counter.in_flight(),
            ReleasePolicy::AtWindowEnd => counter.admitted(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ReleasePolicy::OnCompletion => "on_completion",
            ReleasePolicy::AtWindowEnd => "at_window_end",
        }
    }
}

impl fmt::Display for ReleasePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleasePolicy {
    type Err = CallgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.replace('-', "_").as_str() {
            "on_completion" => Ok(ReleasePolicy::OnCompletion),
            "at_window_end" => Ok(ReleasePolicy::AtWindowEnd),
            other => Err(CallgateError::InvalidConfig(format!(
                "unknown release policy '{}' (expected on_completion or at_window_end)",
                other
            ))),
        }
    }
}

/// Immutable limits for one gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    window: Duration,
    limit: u64,
    release: ReleasePolicy,
}

impl RateLimitConfig {
    /// Allow `limit` admissions per `window`.
    ///
    /// Returns `CallgateError::InvalidConfig` if either value is zero.
    pub fn new(window: Duration, limit: u64) -> Result<Self> {
        if window.is_zero() {
            return Err(CallgateError::InvalidConfig(
                "window duration must be greater than 0".to_string(),
            ));
        }
        if limit == 0 {
            return Err(CallgateError::InvalidConfig(
                "limit must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            window,
            limit,
            release: ReleasePolicy::default(),
        })
    }

    /// Allow `limit` admissions per one `unit` of time.
    pub fn per_unit(unit: TimeUnit, limit: u64) -> Result<Self> {
        Self::new(unit.duration(), limit)
    }

    /// Set the release policy.
    pub fn with_release(mut self, release: ReleasePolicy) -> Self {
        self.release = release;
        self
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Maximum admissions per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Release policy.
    pub fn release(&self) -> ReleasePolicy {
        self.release
    }
}

/// Point-in-time view of a gate.
#[derive(Debug, Clone, Serialize)]
pub struct GateStats {
    pub limit: u64,
    pub release: ReleasePolicy,
    pub in_flight: u64,
    pub admitted_in_window: u64,
    pub total_admitted: u64,
    pub waiting: usize,
    pub windows_elapsed: u64,
    pub until_reset_ms: u64,
    pub closed: bool,
}

#[derive(Debug)]
struct GateState {
    counter: WindowCounter,
    /// Callers suspended in `acquire`
    waiting: usize,
    closed: bool,
}

struct Shared {
    config: RateLimitConfig,
    state: Mutex<GateState>,
    /// Broadcast on every release, reset and shutdown.
    notify: Notify,
}

impl Shared {
    fn has_capacity(&self, state: &GateState) -> bool {
        self.config.release.occupied(&state.counter) < self.config.limit
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.counter.release();
            trace!(
                in_flight = state.counter.in_flight(),
                waiting = state.waiting,
                "Slot released"
            );
        }
        self.notify.notify_waiters();
    }

    fn reset_window(&self) {
        {
            let mut state = self.state.lock();
            let admitted = state.counter.reset();
            trace!(
                admitted,
                in_flight = state.counter.in_flight(),
                waiting = state.waiting,
                window = state.counter.windows_elapsed(),
                "Window reset"
            );
        }
        self.notify.notify_waiters();
    }
}

/// Tracks whether a caller is counted in `GateState::waiting`.
///
/// The drop impl covers callers whose future is dropped mid-wait.
struct Waiter<'a> {
    shared: &'a Shared,
    registered: bool,
}

impl Waiter<'_> {
    fn register(&mut self, state: &mut GateState) {
        if !self.registered {
            state.waiting += 1;
            self.registered = true;
        }
    }

    fn deregister(&mut self, state: &mut GateState) {
        if self.registered {
            state.waiting -= 1;
            self.registered = false;
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.registered {
            self.shared.state.lock().waiting -= 1;
            trace!("Waiting caller cancelled");
        }
    }
}

/// An admission slot. The slot is released when the permit is dropped.
#[must_use = "dropping a permit releases its slot immediately"]
pub struct Permit<'a> {
    shared: &'a Shared,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("limit", &self.shared.config.limit)
            .finish()
    }
}

/// Blocking front door for calls to one downstream service.
///
/// The gate admits at most `limit` callers according to its
/// [`ReleasePolicy`] and suspends the rest until capacity frees up. A
/// background task resets the window every `window`.
///
/// Shutting the gate down (explicitly or by dropping it) stops the
/// background task and fails every waiting and future caller with
/// [`GateError::Closed`].
pub struct AdmissionGate {
    shared: Arc<Shared>,
    resetter: Mutex<Option<ScheduledTask>>,
}

impl AdmissionGate {
    /// Create a gate allowing `limit` calls per `window`, releasing on completion.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(window: Duration, limit: u64) -> Result<Self> {
        Self::with_config(RateLimitConfig::new(window, limit)?)
    }

    /// Create a gate allowing `limit` calls per one `unit` of time.
    pub fn per_unit(unit: TimeUnit, limit: u64) -> Result<Self> {
        Self::with_config(RateLimitConfig::per_unit(unit, limit)?)
    }

    /// Create a gate on the current tokio runtime.
    pub fn with_config(config: RateLimitConfig) -> Result<Self> {
        let scheduler = TokioScheduler::current()?;
        Ok(Self::with_scheduler(config, &scheduler))
    }

    /// Create a gate whose window resets are driven by `scheduler`.
    pub fn with_scheduler(config: RateLimitConfig, scheduler: &dyn Scheduler) -> Self {
        let window = config.window;

        info!(
            limit = config.limit,
            window_ms = window.as_millis() as u64,
            release = %config.release,
            "Starting admission gate"
        );

        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(GateState {
                counter: WindowCounter::new(),
                waiting: 0,
                closed: false,
            }),
            notify: Notify::new(),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let resetter = scheduler.schedule_repeating(
            window,
            Box::new(move || match weak.upgrade() {
                Some(shared) => {
                    shared.reset_window();
                    ControlFlow::Continue(())
                }
                None => ControlFlow::Break(()),
            }),
        );

        Self {
            shared,
            resetter: Mutex::new(Some(resetter)),
        }
    }

    /// Wait for a slot.
    ///
    /// Dropping the returned future while it waits leaves the gate as if
    /// the call was never made.
    pub async fn acquire(&self) -> std::result::Result<Permit<'_>, GateError> {
        let shared = &*self.shared;
        let mut waiter = Waiter {
            shared,
            registered: false,
        };

        loop {
            // Enabled before the check so a wake between check and await is kept.
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.state.lock();

                if state.closed {
                    waiter.deregister(&mut state);
                    return Err(GateError::Closed);
                }

                if shared.has_capacity(&state) {
                    waiter.deregister(&mut state);
                    state.counter.admit();
                    trace!(
                        admitted = state.counter.admitted(),
                        in_flight = state.counter.in_flight(),
                        "Caller admitted"
                    );
                    return Ok(Permit { shared });
                }

                if !waiter.registered {
                    waiter.register(&mut state);
                    debug!(
                        limit = shared.config.limit,
                        waiting = state.waiting,
                        "Gate full, waiting for capacity"
                    );
                }
            }

            notified.await;
        }
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> std::result::Result<Option<Permit<'_>>, GateError> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        if state.closed {
            return Err(GateError::Closed);
        }
        if !shared.has_capacity(&state) {
            return Ok(None);
        }

        state.counter.admit();
        Ok(Some(Permit { shared }))
    }

    /// Wait for a slot, run `action`, then release the slot.
    ///
    /// The action runs outside the gate's lock, so admitted actions run
    /// concurrently. Its error is returned as [`GateError::Action`]. The
    /// slot is released on every exit path, including when this future is
    /// dropped mid-action.
    pub async fn acquire_and_run<F, Fut, T, E>(
        &self,
        action: F,
    ) -> std::result::Result<T, GateError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let _permit = self
            .acquire()
            .await
            .map_err(GateError::<Infallible>::widen)?;
        action().await.map_err(GateError::Action)
    }

    /// Run an [`Action`] collaborator through the gate.
    pub async fn run<A>(&self, action: &A) -> std::result::Result<A::Output, GateError<A::Error>>
    where
        A: Action + ?Sized,
    {
        self.acquire_and_run(|| action.invoke()).await
    }

    /// Close the gate.
    ///
    /// Stops the window resetter and wakes every waiting caller, which then
    /// fails with [`GateError::Closed`]. Calls already admitted run to
    /// completion. Safe to call more than once.
    pub fn shutdown(&self) {
        let first = {
            let mut state = self.shared.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };

        if let Some(mut resetter) = self.resetter.lock().take() {
            resetter.cancel();
        }
        self.shared.notify.notify_waiters();

        if first {
            let state = self.shared.state.lock();
            info!(
                in_flight = state.counter.in_flight(),
                waiting = state.waiting,
                total_admitted = state.counter.total_admitted(),
                "Admission gate shut down"
            );
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// The limits this gate enforces.
    pub fn config(&self) -> &RateLimitConfig {
        &self.shared.config
    }

    /// Current counters.
    pub fn stats(&self) -> GateStats {
        let config = &self.shared.config;
        let state = self.shared.state.lock();

        GateStats {
            limit: config.limit,
            release: config.release,
            in_flight: state.counter.in_flight(),
            admitted_in_window: state.counter.admitted(),
            total_admitted: state.counter.total_admitted(),
            waiting: state.waiting,
            windows_elapsed: state.counter.windows_elapsed(),
            until_reset_ms: state.counter.duration_until_reset(config.window).as_millis() as u64,
            closed: state.closed,
        }
    }
}

impl Drop for AdmissionGate {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("config", &self.shared.config)
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}
