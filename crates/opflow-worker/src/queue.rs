use std::collections::BinaryHeap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

use crate::task::{Queued, Task};

#[derive(Debug, Default)]
struct State {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    closed: bool,
}

/// In-process priority queue shared by the workers.
///
/// The queue holds no state that is not also in a ledger; after a restart
/// the manager rebuilds it from persisted sagas and operations.
#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` once the queue is closed.
    pub fn push(&self, task: Task) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return false;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Queued { task, seq });
        }
        self.notify.notify_one();
        true
    }

    #[cfg(test)]
    fn pop(&self) -> Option<Task> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return None;
        }
        state.heap.pop().map(|queued| queued.task)
    }

    /// Wait for the highest-priority task. `None` once the queue is closed.
    pub async fn next(&self) -> Option<Task> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.closed {
                    return None;
                }
                if let Some(queued) = state.heap.pop() {
                    return Some(queued.task);
                }
            }
            notified.await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heap
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out tasks and wake every waiting worker.
    pub fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.notify.notify_waiters();
    }
}
