//! Cancellable synchronous calls, grounded in `inc/cancellation.h` but
//! reimplemented per Design Notes §9: "a portable implementation uses an
//! explicit should-cancel flag polled at known yield points." The source's
//! SP-restore longjmp trick only works because the cancellable function is
//! pure compute and owns no resources; Rust has no safe equivalent, so the
//! flag-polling alternative the design notes call out directly is used
//! instead of attempting to unwind an arbitrary call stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};

/// Shared between a `CancelToken` and whoever calls `cancel_call` from
/// interrupt context (in this crate, any other execution context).
#[derive(Debug, Default, Clone)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cancel flag. Safe to call from interrupt context; idempotent.
    pub fn cancel_call(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    fn token(&self) -> CancelToken {
        CancelToken {
            flag: self.flag.clone(),
        }
    }
}

/// Polled from within the cancellable computation at its own yield points
/// (loop heads that would otherwise block on I/O or a ring buffer).
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Runs `f` to completion, handing it a [`CancelToken`] it must poll at its
/// own yield points. Returns `Err(BitstreamDesync)` (this crate's analogue
/// of the source's sentinel `-1`) the first time `f` observes
/// cancellation and bails out; `f` itself decides what "bail out" returns.
///
/// Invariant: only one cancellable call may be active on a given
/// `Cancellation` at a time; a fresh token is handed out per call so a
/// stale cancellation from a previous call can never bleed into this one.
pub fn call_cancellable_fn<T>(
    c: &Cancellation,
    f: impl FnOnce(&CancelToken) -> Option<T>,
) -> CoreResult<T> {
    c.flag.store(false, Ordering::SeqCst);
    let token = c.token();
    f(&token).ok_or(CoreError::BitstreamDesync)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_to_completion_when_not_cancelled() {
        let c = Cancellation::new();
        let result = call_cancellable_fn(&c, |token| {
            let mut sum = 0;
            for i in 0..10 {
                if token.is_cancelled() {
                    return None;
                }
                sum += i;
            }
            Some(sum)
        });
        assert_eq!(result, Ok(45));
    }

    #[test]
    fn cancel_before_call_is_observed_at_first_poll() {
        let c = Cancellation::new();
        c.cancel_call();
        // A fresh call clears the flag at entry, so a cancellation issued
        // before the call started does not leak into it.
        let result = call_cancellable_fn(&c, |token| Some(token.is_cancelled()));
        assert_eq!(result, Ok(false));
    }

    #[test]
    fn cancel_mid_loop_short_circuits() {
        let c = Cancellation::new();
        let c2 = c.clone();
        let result: CoreResult<i32> = call_cancellable_fn(&c, move |token| {
            let mut n = 0;
            loop {
                if token.is_cancelled() {
                    return None;
                }
                n += 1;
                if n == 3 {
                    c2.cancel_call();
                }
                if n > 1000 {
                    return Some(n);
                }
            }
        });
        assert_eq!(result, Err(CoreError::BitstreamDesync));
    }
}
