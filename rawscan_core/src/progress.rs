/// Bytes-completed counter for one file.
///
/// `completed` never decreases and reaches `total` exactly at end of file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self {
            completed: 0,
            total,
        }
    }

    /// Move the counter forward to `completed`.
    ///
    /// Returns `true` when the value changed. A smaller value is ignored.
    pub fn advance(&mut self, completed: u64) -> bool {
        debug_assert!(
            completed >= self.completed,
            "progress moved backwards: {} -> {}",
            self.completed,
            completed
        );
        if completed <= self.completed {
            return false;
        }
        self.completed = completed;
        true
    }

    pub fn is_done(&self) -> bool {
        self.completed == self.total
    }

    /// Completed fraction in `[0.0, 1.0]`. Empty inputs count as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.completed as f64 / self.total as f64
    }
}
