//! Cooperative cancellation checked between node invocations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag; raising it stops a run before its next node starts.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    raised: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let signal = AbortSignal::new();
        let other = signal.clone();
        assert!(!other.is_raised());
        signal.raise();
        assert!(other.is_raised());
    }
}
