//! Fair user selection.
//!
//! Users are sampled uniformly among those with ready work. A user with one
//! ready intention is exactly as likely to be picked as a user with a
//! hundred, so deep backlogs cannot starve shallow ones.

use super::KindScope;
use crate::error::Result;
use crate::model::UserId;
use chrono::Utc;
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::debug;

impl super::Scheduler {
    /// Up to `max` distinct users with at least one ready intention of the
    /// scope's kind. Empty when nobody has ready work.
    pub async fn select_ready_users(
        &mut self,
        scope: &KindScope,
        max: usize,
    ) -> Result<Vec<UserId>> {
        let users = self
            .backlog
            .ready_users(&scope.kind, scope.rule, Utc::now())
            .await?;
        let selected = sample_users(&mut self.rng, users, max);
        debug!(kind = %scope.kind, selected = selected.len(), "selected ready users");
        Ok(selected)
    }
}

/// Draw `max` distinct users uniformly, or all of them when `max` covers the set.
pub fn sample_users<R: Rng + ?Sized>(rng: &mut R, users: Vec<UserId>, max: usize) -> Vec<UserId> {
    if max >= users.len() {
        return users;
    }
    users.choose_multiple(rng, max).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn returns_everyone_when_max_covers_the_set() {
        let mut rng = StdRng::seed_from_u64(7);
        let users: Vec<UserId> = (0..3).map(|_| UserId::new()).collect();
        let picked = sample_users(&mut rng, users.clone(), 5);
        assert_eq!(picked, users);
    }

    #[test]
    fn picks_distinct_users() {
        let mut rng = StdRng::seed_from_u64(7);
        let users: Vec<UserId> = (0..10).map(|_| UserId::new()).collect();
        for _ in 0..100 {
            let mut picked = sample_users(&mut rng, users.clone(), 4);
            assert_eq!(picked.len(), 4);
            picked.sort();
            picked.dedup();
            assert_eq!(picked.len(), 4);
            assert!(picked.iter().all(|u| users.contains(u)));
        }
    }

    #[test]
    fn zero_max_picks_nobody() {
        let mut rng = StdRng::seed_from_u64(7);
        let users: Vec<UserId> = (0..3).map(|_| UserId::new()).collect();
        assert!(sample_users(&mut rng, users, 0).is_empty());
    }
}
