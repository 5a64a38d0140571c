use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Cooperative cancellation flag shared between an agent and its caller.
/// Tripping it wakes every suspension point that is waiting on it.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is tripped.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Default)]
struct Queues {
    steer: VecDeque<String>,
    follow_up: VecDeque<String>,
}

/// Thread-safe interrupt/follow-up queues, consulted by the loop at safe
/// points. `steer` messages preempt the remainder of an in-flight tool
/// batch; `follow_up` messages fire only when the loop would otherwise
/// return. Queues drain one message per check, FIFO in enqueue order.
#[derive(Default)]
pub struct SteeringController {
    queues: Mutex<Queues>,
    cancel: CancelToken,
}

impl SteeringController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blank messages are ignored.
    pub fn steer(&self, message: impl Into<String>) {
        let message = message.into().trim().to_string();
        if message.is_empty() {
            return;
        }
        self.lock_queues().steer.push_back(message);
    }

    pub fn follow_up(&self, message: impl Into<String>) {
        let message = message.into().trim().to_string();
        if message.is_empty() {
            return;
        }
        self.lock_queues().follow_up.push_back(message);
    }

    pub fn pop_steering_message(&self) -> Option<String> {
        self.lock_queues().steer.pop_front()
    }

    pub fn pop_follow_up_message(&self) -> Option<String> {
        self.lock_queues().follow_up.pop_front()
    }

    pub fn clear_steering_queue(&self) {
        self.lock_queues().steer.clear();
    }

    pub fn clear_follow_up_queue(&self) {
        self.lock_queues().follow_up.clear();
    }

    pub fn clear_all_queues(&self) {
        let mut queues = self.lock_queues();
        queues.steer.clear();
        queues.follow_up.clear();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().expect("steering queue mutex poisoned")
    }
}
