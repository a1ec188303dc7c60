//! Attempt budgets for the bounded retry loops inside each phase.

use std::fmt;

/// Upper bound on attempts a phase may spend on one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptBudget {
    limit: u32,
}

/// Returned when a phase has used every attempt it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetExhausted {
    pub used: u32,
    pub limit: u32,
}

impl fmt::Display for BudgetExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt budget exhausted ({}/{})", self.used, self.limit)
    }
}

impl AttemptBudget {
    /// A zero limit is treated as one attempt.
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    /// Attempts remaining after `used` rejected attempts, or the exhaustion.
    pub fn remaining(self, used: u32) -> Result<u32, BudgetExhausted> {
        if used >= self.limit {
            return Err(BudgetExhausted {
                used,
                limit: self.limit,
            });
        }
        Ok(self.limit - used)
    }
}
