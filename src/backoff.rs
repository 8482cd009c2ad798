use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::trace;

type Action = Arc<dyn Fn(&Arc<ExponentialBackoff>) + Send + Sync>;

struct BackoffState {
    max_wait: Duration,
    /// 0 means "retry until the wait saturates at `max_wait`"; the saturation
    /// transition in `next` then converts this into a concrete bound.
    max_num_retries: usize,
    total_num_tries: usize,
    last_wait: Option<Duration>,
}

enum Step {
    InvokeNow,
    Terminal,
    Schedule(Duration),
}

/// Drives a retryable action with exponentially growing delays.
///
/// `next` is the only transition driver. The scheduler never inspects whether
/// the action succeeded: the action receives a handle to this instance and
/// continues the sequence by calling `next` again, or stops by not calling it.
/// The lock only guards state mutation; the action is always invoked outside
/// of it, so actions may re-enter `next` freely.
pub struct ExponentialBackoff {
    initial_wait: Duration,
    state: Mutex<BackoffState>,
    action: Mutex<Option<Action>>,
}

impl ExponentialBackoff {
    pub fn new<F>(
        initial_wait: Duration,
        max_wait: Duration,
        max_num_retries: usize,
        action: F,
    ) -> Arc<Self>
    where
        F: Fn(&Arc<ExponentialBackoff>) + Send + Sync + 'static,
    {
        Arc::new(Self {
            initial_wait,
            state: Mutex::new(BackoffState {
                max_wait,
                max_num_retries,
                total_num_tries: 0,
                last_wait: None,
            }),
            action: Mutex::new(Some(Arc::new(action))),
        })
    }

    /// Number of times the action has been invoked so far.
    pub fn total_num_tries(&self) -> usize {
        self.state.lock().total_num_tries
    }

    /// Advances the retry sequence. Returns `false` once the retry budget is
    /// exhausted; the action reference is released at that point and no
    /// further timers are armed.
    pub fn next(self: &Arc<Self>) -> bool {
        let step = {
            let mut state = self.state.lock();
            if state.total_num_tries == 0 {
                state.total_num_tries = 1;
                Step::InvokeNow
            } else if state.max_num_retries != 0
                && state.total_num_tries >= state.max_num_retries + 1
            {
                Step::Terminal
            } else {
                let next_wait = match state.last_wait {
                    None => self.initial_wait,
                    // A doubling that overflows is treated as having passed
                    // the cap.
                    Some(last) => last.checked_mul(2).unwrap_or(state.max_wait),
                };
                let clamped = next_wait.min(state.max_wait);
                if state.max_num_retries == 0 && clamped == state.max_wait {
                    // The wait has saturated at the cap: convert the
                    // unbounded policy into a bounded one so the sequence
                    // cannot retry forever at the plateau.
                    state.max_num_retries = state.total_num_tries + 2;
                }
                state.last_wait = Some(clamped);
                Step::Schedule(clamped)
            }
        };

        match step {
            Step::InvokeNow => {
                let action = self.action.lock().clone();
                if let Some(action) = action {
                    action(self);
                }
                true
            }
            Step::Terminal => {
                trace!("retry budget exhausted; releasing action");
                *self.action.lock() = None;
                false
            }
            Step::Schedule(wait) => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    sleep(wait).await;
                    {
                        this.state.lock().total_num_tries += 1;
                    }
                    let action = this.action.lock().clone();
                    if let Some(action) = action {
                        action(&this);
                    }
                });
                true
            }
        }
    }
}
