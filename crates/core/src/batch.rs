//! Catch-up batch planning.
//!
//! Given how far the local cursor trails the remote head, decide how many
//! blocks one pass covers (`query_length`) and how many block numbers each
//! upstream call carries (`per_query`).
//!
//! | blocks behind | query_length | per_query |
//! |---------------|--------------|-----------|
//! | > 1000        | 1000         | 5         |
//! | 101..=1000    | 100          | 5         |
//! | 11..=100      | 10           | 5         |
//! | 1..=10        | 1            | 1         |

use std::ops::RangeInclusive;

use crate::constants::{
    BLOCKS_PER_QUERY, FAR_BEHIND_THRESHOLD, MID_BEHIND_THRESHOLD, NEAR_BEHIND_THRESHOLD,
};

/// Size of one sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    /// Blocks covered by the whole pass.
    pub query_length: u64,
    /// Blocks covered by each upstream call.
    pub per_query: u64,
}

impl BatchPlan {
    /// Plan a pass for a cursor that is `diff` blocks behind the remote head.
    ///
    /// Returns `None` when there is nothing to do.
    pub fn for_diff(diff: u64) -> Option<Self> {
        let plan = match diff {
            0 => return None,
            d if d > FAR_BEHIND_THRESHOLD => Self::new(FAR_BEHIND_THRESHOLD, BLOCKS_PER_QUERY),
            d if d > MID_BEHIND_THRESHOLD => Self::new(MID_BEHIND_THRESHOLD, BLOCKS_PER_QUERY),
            d if d > NEAR_BEHIND_THRESHOLD => Self::new(NEAR_BEHIND_THRESHOLD, BLOCKS_PER_QUERY),
            _ => Self::new(1, 1),
        };
        Some(plan)
    }

    const fn new(query_length: u64, per_query: u64) -> Self {
        Self {
            query_length,
            per_query,
        }
    }

    /// Number of upstream calls in the pass, `ceil(query_length / per_query)`.
    pub fn call_count(&self) -> u64 {
        self.query_length.div_ceil(self.per_query)
    }

    /// Block number the cursor lands on after a pass starting at `cursor`.
    pub fn target(&self, cursor: u64) -> u64 {
        cursor + self.query_length
    }

    /// Consecutive block ranges for each upstream call, starting right after `cursor`.
    ///
    /// The last range is clipped to the pass target.
    pub fn sub_batches(&self, cursor: u64) -> Vec<RangeInclusive<u64>> {
        let end = self.target(cursor);
        (0..self.call_count())
            .map(|i| {
                let start = cursor + 1 + i * self.per_query;
                start..=(start + self.per_query - 1).min(end)
            })
            .collect()
    }
}
