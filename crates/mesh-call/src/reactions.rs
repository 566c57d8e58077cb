//! Ephemeral reaction budget.
//!
//! A leaky bucket: each ephemeral reaction takes one unit, and the session
//! restores one unit per decay tick while any are outstanding.

use crate::errors::CallError;

#[derive(Debug, Clone)]
pub struct ReactionBudget {
    limit: u32,
    outstanding: u32,
}

impl ReactionBudget {
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            outstanding: 0,
        }
    }

    /// Take one unit, or fail with `Throttled` when the budget is spent.
    pub fn try_acquire(&mut self) -> Result<(), CallError> {
        if self.outstanding >= self.limit {
            return Err(CallError::Throttled);
        }
        self.outstanding += 1;
        Ok(())
    }

    /// Restore one unit. Returns whether units are still outstanding.
    pub fn decay(&mut self) -> bool {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.outstanding > 0
    }

    #[must_use]
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhausts_at_limit() {
        let mut budget = ReactionBudget::new(10);
        for _ in 0..10 {
            budget.try_acquire().unwrap();
        }
        assert_eq!(budget.try_acquire(), Err(CallError::Throttled));
        assert_eq!(budget.outstanding(), 10);
    }

    #[test]
    fn test_decay_restores_one_unit() {
        let mut budget = ReactionBudget::new(2);
        budget.try_acquire().unwrap();
        budget.try_acquire().unwrap();
        assert!(budget.try_acquire().is_err());

        assert!(budget.decay());
        budget.try_acquire().unwrap();

        assert!(budget.decay());
        assert!(!budget.decay());
        assert!(!budget.decay());
        assert_eq!(budget.outstanding(), 0);
    }

    #[test]
    fn test_zero_limit_always_throttles() {
        let mut budget = ReactionBudget::new(0);
        assert_eq!(budget.try_acquire(), Err(CallError::Throttled));
    }
}
