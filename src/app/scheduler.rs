use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Host-wide gate around device-tool invocations.
///
/// adb misbehaves when several invocations run against the same host at once,
/// so the default limit is one permit for the whole host, regardless of which
/// device a call targets.
pub struct ToolGate {
    limit: usize,
    used: Mutex<usize>,
    cv: Condvar,
}

impl ToolGate {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.max(1),
            used: Mutex::new(0),
            cv: Condvar::new(),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Blocks the calling thread until a permit is free.
    pub fn acquire(self: &Arc<Self>) -> ToolPermit {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        while *used >= self.limit {
            used = self.cv.wait(used).unwrap_or_else(PoisonError::into_inner);
        }
        *used += 1;
        ToolPermit {
            gate: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        *used = used.saturating_sub(1);
        self.cv.notify_one();
    }
}

pub struct ToolPermit {
    gate: Arc<ToolGate>,
}

impl Drop for ToolPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
