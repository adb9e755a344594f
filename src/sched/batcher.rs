//! Intention batching.
//!
//! Ready intentions are taken from the candidate users round-robin, so a
//! small batch still spreads over several users instead of draining the
//! first one.

use super::KindScope;
use crate::error::Result;
use crate::model::{Intention, UserId};
use chrono::Utc;
use std::collections::HashSet;

/// Batch size used by the steady-state tick.
pub const DEFAULT_BATCH_SIZE: usize = 1;

impl super::Scheduler {
    /// Ready intentions owned by `users`, at most `max` of them (`None` = no limit).
    pub async fn collect_intentions(
        &self,
        scope: &KindScope,
        users: &[UserId],
        max: Option<usize>,
    ) -> Result<Vec<Intention>> {
        if max == Some(0) {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut per_user = Vec::new();
        for user in users {
            if !seen.insert(*user) {
                continue;
            }
            let items = self
                .backlog
                .ready_items(&scope.kind, &[*user], scope.rule, max, now)
                .await?;
            if !items.is_empty() {
                per_user.push(items);
            }
        }

        Ok(round_robin(per_user, max))
    }
}

/// Take one element from each queue in turn until `max` or exhaustion.
pub fn round_robin<T>(queues: Vec<Vec<T>>, max: Option<usize>) -> Vec<T> {
    let limit = max.unwrap_or(usize::MAX);
    let mut iters: Vec<_> = queues.into_iter().map(Vec::into_iter).collect();
    let mut out = Vec::new();

    while out.len() < limit && !iters.is_empty() {
        iters.retain_mut(|it| {
            if out.len() >= limit {
                return true;
            }
            match it.next() {
                Some(item) => {
                    out.push(item);
                    true
                }
                None => false,
            }
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternates_between_queues() {
        let got = round_robin(vec![vec![1, 2, 3], vec![10, 20], vec![100]], None);
        assert_eq!(got, vec![1, 10, 100, 2, 20, 3]);
    }

    #[test]
    fn stops_at_max() {
        let got = round_robin(vec![vec![1, 2, 3], vec![10, 20]], Some(3));
        assert_eq!(got, vec![1, 10, 2]);
    }

    #[test]
    fn zero_max_and_empty_queues() {
        assert!(round_robin(vec![vec![1]], Some(0)).is_empty());
        assert!(round_robin::<u8>(vec![], Some(4)).is_empty());
        assert!(round_robin::<u8>(vec![vec![], vec![]], None).is_empty());
    }
}
