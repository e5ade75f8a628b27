//! Two-part view of the persisted version counter.
//!
//! A layer's `version` is a single forward-only integer. It is read as
//! `batch * TASKS_PER_BATCH + task`, so completing a task is a plain
//! increment and completing a batch jumps to the start of the next one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on tasks in one batch; also the counter stride between batches
pub const TASKS_PER_BATCH: u64 = 1_000;

/// Position of the next unit of work on a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Progress {
    /// Next batch to run
    pub batch: u64,
    /// Next task within that batch
    pub task: u64,
}

impl Progress {
    /// Absolute start: nothing deployed on the layer yet
    pub const START: Progress = Progress { batch: 0, task: 0 };

    /// Decode a persisted version counter
    pub fn from_version(version: u64) -> Self {
        Self {
            batch: version / TASKS_PER_BATCH,
            task: version % TASKS_PER_BATCH,
        }
    }

    /// First task of `batch`
    pub fn start_of(batch: u64) -> Self {
        Self { batch, task: 0 }
    }

    /// Encode back into a version counter
    pub fn to_version(self) -> u64 {
        self.batch * TASKS_PER_BATCH + self.task
    }

    /// Whether the layer has not completed any task yet
    pub fn is_start(&self) -> bool {
        *self == Self::START
    }

    /// Position right after the last task of the current batch
    pub fn next_batch(self) -> Self {
        Self::start_of(self.batch + 1)
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch {} task {}", self.batch, self.task)
    }
}
