use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use opflow_core::{SagaId, TaskId};
use serde::{Deserialize, Serialize};

/// Scheduling priority. Higher levels are always drained first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Run the next unit of work of one saga.
    AdvanceSaga { saga_id: SagaId },
    /// Execute the idempotent operation recorded under `key`.
    IdempotentOperation { key: String },
}

impl TaskKind {
    /// Key of the exclusive claim a worker must hold to run this task.
    ///
    /// Every task of a saga shares one key, so a saga is advanced by at most
    /// one worker at a time.
    #[must_use]
    pub fn claim_key(&self) -> String {
        match self {
            Self::AdvanceSaga { saga_id } => format!("saga:{saga_id}"),
            Self::IdempotentOperation { key } => format!("operation:{key}"),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdvanceSaga { saga_id } => write!(f, "advance saga {saga_id}"),
            Self::IdempotentOperation { key } => write!(f, "operation {key}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    #[must_use]
    pub fn new(kind: TaskKind, priority: Priority, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            kind,
            priority,
            enqueued_at,
        }
    }
}

/// Heap entry: priority first, then insertion order within a level.
#[derive(Debug)]
pub(crate) struct Queued {
    pub(crate) task: Task,
    pub(crate) seq: u64,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use super::*;

    fn queued(priority: Priority, seq: u64) -> Queued {
        Queued {
            task: Task::new(
                TaskKind::IdempotentOperation {
                    key: format!("k{seq}"),
                },
                priority,
                DateTime::<Utc>::default(),
            ),
            seq,
        }
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn heap_pops_by_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(queued(Priority::Normal, 0));
        heap.push(queued(Priority::Low, 1));
        heap.push(queued(Priority::Critical, 2));
        heap.push(queued(Priority::Normal, 3));

        let order: Vec<_> = std::iter::from_fn(|| heap.pop()).map(|q| q.seq).collect();

        assert_eq!(order, [2, 0, 3, 1]);
    }

    #[test]
    fn saga_tasks_share_a_claim_key() {
        let saga_id = SagaId::new();
        let first = TaskKind::AdvanceSaga { saga_id };
        let second = TaskKind::AdvanceSaga { saga_id };

        assert_eq!(first.claim_key(), second.claim_key());
        assert_ne!(
            first.claim_key(),
            TaskKind::AdvanceSaga {
                saga_id: SagaId::new()
            }
            .claim_key()
        );
    }
}
