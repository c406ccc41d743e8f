// Long-delay timer built from chained sleeps
//
// Platform timers historically reject delays above 2^31 - 1 ms (about 24.8
// days). Delays beyond that cap are split into maximum-length chunks and the
// remainder carried between sleeps, so a listener can be armed months out.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Longest single sleep the timer arms; anything above is chained.
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

/// A cancelable timer that supports arbitrarily long delays.
///
/// One-shot ([`LongTimer::once`]) and repeating ([`LongTimer::repeating`])
/// variants share the same chaining loop. [`LongTimer::close`] cancels at any
/// stage of the chain; once it returns the listener can never start.
pub struct LongTimer {
    handle: JoinHandle<()>,
}

impl LongTimer {
    /// Arm a timer that fires `listener` exactly once after `delay`.
    pub fn once<F>(runtime: &Handle, delay: Duration, listener: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = runtime.spawn(async move {
            chained_sleep(delay).await;
            listener();
        });
        Self { handle }
    }

    /// Arm a timer that fires `listener` every `interval`, forever.
    pub fn repeating<F>(runtime: &Handle, interval: Duration, listener: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let handle = runtime.spawn(async move {
            loop {
                chained_sleep(interval).await;
                listener();
            }
        });
        Self { handle }
    }

    /// Cancel the timer at whatever stage of the chain it is in.
    pub fn close(&self) {
        self.handle.abort();
    }

    /// Whether the timer has fired (one-shot) or been closed.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for LongTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Sleep for `delay`, chaining maximum-length sleeps until the remainder
/// fits in one. The remainder is carried across chunks, so the total wait
/// equals the requested delay regardless of how many chunks it takes.
async fn chained_sleep(delay: Duration) {
    let mut remaining = delay;
    while remaining > MAX_TIMER_DELAY {
        sleep(MAX_TIMER_DELAY).await;
        remaining -= MAX_TIMER_DELAY;
    }
    sleep(remaining).await;
}
