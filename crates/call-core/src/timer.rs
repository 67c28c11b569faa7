//! One-shot timers as cancellable handles.
//!
//! A timer is a spawned task that sleeps and then pushes its payload onto a
//! channel. The returned handle aborts the task on [`TimerHandle::cancel`]
//! or on drop, so parking a handle inside the state it guards is enough to
//! tie the two lifetimes together.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle to a pending timer. Dropping it cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// True once the timer fired or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Deliver `payload` on `tx` after `delay`, unless cancelled first.
///
/// Delivery failures are ignored: if the receiver is gone the timer had
/// nothing left to wake.
pub fn schedule<T: Send + 'static>(
    delay: Duration,
    tx: mpsc::UnboundedSender<T>,
    payload: T,
) -> TimerHandle {
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(payload);
    });
    TimerHandle { task }
}
