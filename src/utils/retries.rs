// src/utils/retries.rs
//! Fixed-interval polling for flaky remote exchanges.
//!
//! [`poll_until_condition_met`] is the single retry primitive of the crate.
//! The caller's predicate decides when a result is final, which covers both
//! success and terminal (non-retryable) failure; the engine only counts
//! attempts, waits, and gives up.

use log::{debug, warn};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Wait between two attempts when no interval is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Attempt budget when none is configured.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Interval and attempt budget of a polling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Receiving side of a cancellation request.
///
/// Cheap to clone; every clone observes the same [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Sending side of a cancellation request.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Creates a linked handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    /// Cancels every operation observing the paired signal.
    pub fn cancel(&self) {
        // No receivers left means nothing to cancel.
        let _ = self.tx.send(true);
    }
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    ///
    /// Never resolves if the handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Why a polling run ended without an acceptable result.
pub enum RetryError<T> {
    /// Every attempt produced a result the predicate rejected.
    RetriesExhausted {
        action: String,
        attempts: u32,
        /// Result of the final attempt; `None` when no attempt was made.
        last: Option<T>,
    },
    /// The caller cancelled the run.
    Cancelled { action: String, attempts: u32 },
}

impl<T> RetryError<T> {
    /// Number of times the action was invoked.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::RetriesExhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RetryError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::RetriesExhausted { action, attempts, last } => f
                .debug_struct("RetriesExhausted")
                .field("action", action)
                .field("attempts", attempts)
                .field("last", last)
                .finish(),
            RetryError::Cancelled { action, attempts } => f
                .debug_struct("Cancelled")
                .field("action", action)
                .field("attempts", attempts)
                .finish(),
        }
    }
}

impl<T> fmt::Display for RetryError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::RetriesExhausted { action, attempts, .. } => {
                write!(f, "all retries used calling {} ({} attempts)", action, attempts)
            }
            RetryError::Cancelled { action, attempts } => {
                write!(f, "{} cancelled after {} attempts", action, attempts)
            }
        }
    }
}

impl<T: fmt::Debug> std::error::Error for RetryError<T> {}

/// Runs `action` until `is_acceptable` accepts its result.
///
/// # Arguments
/// * `action_name` - Label used in logs and errors
/// * `action` - Produces one attempt; failures must be folded into `T` so the
///   predicate can inspect them
/// * `is_acceptable` - Returns `true` for results that end the run
/// * `config` - Fixed wait between attempts and the attempt budget
/// * `cancel` - Optional signal that aborts an in-flight attempt or a wait
///
/// # Errors
/// - [`RetryError::RetriesExhausted`] with the last result when the budget runs
///   out. A budget of zero fails without invoking `action`.
/// - [`RetryError::Cancelled`] when `cancel` fires.
pub async fn poll_until_condition_met<T, F, Fut, P>(
    action_name: &str,
    mut action: F,
    mut is_acceptable: P,
    config: PollConfig,
    cancel: Option<&CancelSignal>,
) -> Result<T, RetryError<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: FnMut(&T) -> bool,
{
    let mut signal = cancel.cloned();
    let mut attempts = 0;
    let mut last = None;

    while attempts < config.max_attempts {
        if signal.as_ref().map_or(false, CancelSignal::is_cancelled) {
            return Err(cancelled(action_name, attempts));
        }

        attempts += 1;
        let result = match signal.as_mut() {
            Some(signal) => tokio::select! {
                result = action() => result,
                _ = signal.cancelled() => return Err(cancelled(action_name, attempts)),
            },
            None => action().await,
        };

        if is_acceptable(&result) {
            return Ok(result);
        }
        last = Some(result);

        if attempts == config.max_attempts {
            break;
        }

        debug!(
            "Waiting {}ms before running {} again (attempt {}/{})",
            config.interval.as_millis(),
            action_name,
            attempts,
            config.max_attempts
        );
        match signal.as_mut() {
            Some(signal) => tokio::select! {
                _ = tokio::time::sleep(config.interval) => {}
                _ = signal.cancelled() => return Err(cancelled(action_name, attempts)),
            },
            None => tokio::time::sleep(config.interval).await,
        }
    }

    warn!("{} - no more retries after {} attempts", action_name, attempts);
    Err(RetryError::RetriesExhausted {
        action: action_name.to_string(),
        attempts,
        last,
    })
}

fn cancelled<T>(action_name: &str, attempts: u32) -> RetryError<T> {
    debug!("{} cancelled after {} attempts", action_name, attempts);
    RetryError::Cancelled {
        action: action_name.to_string(),
        attempts,
    }
}
