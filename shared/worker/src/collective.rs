use async_trait::async_trait;
use kestrel_core::Rank;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tracing::{trace, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectiveError {
    #[error("timed out after {timeout:?} at step {step} waiting for {missing} rank(s)")]
    Timeout {
        step: u64,
        missing: usize,
        timeout: Duration,
    },

    #[error("collective group poisoned: {0}")]
    Poisoned(String),

    #[error("rank {0} is not a member of this group")]
    UnknownRank(Rank),
}

/// Cross-rank synchronization. Every rank must issue the same sequence of
/// calls; the n-th call of each rank joins the n-th round.
#[async_trait]
pub trait Collective: Send + Sync {
    fn world_size(&self) -> u32;

    /// Element-wise sum of every rank's `values`. Blocks until all ranks of
    /// the group have contributed or the group's timeout expires.
    async fn all_reduce(
        &self,
        rank: Rank,
        step: u64,
        values: Vec<f32>,
    ) -> Result<Vec<f32>, CollectiveError>;

    async fn barrier(&self, rank: Rank, step: u64) -> Result<(), CollectiveError> {
        self.all_reduce(rank, step, vec![]).await.map(|_| ())
    }

    /// Wakes every waiting peer with an error. Called by a rank that will
    /// never reach the next rendezvous.
    fn abort(&self, _rank: Rank, _reason: &str) {}
}

struct Round {
    step: u64,
    contributions: Vec<Option<Vec<f32>>>,
    arrived: usize,
    result: Option<Arc<Vec<f32>>>,
    departed: usize,
}

#[derive(Default)]
struct GroupState {
    rounds: HashMap<u64, Round>,
    next_round: Vec<u64>,
    poisoned: Option<String>,
}

/// In-process all-to-all rendezvous for ranks running as tasks of one
/// process.
///
/// Contributions are summed in rank order, so every rank receives the
/// bit-identical result regardless of arrival order.
pub struct LocalCollective {
    world_size: u32,
    timeout: Duration,
    state: Mutex<GroupState>,
    version: watch::Sender<u64>,
}

impl LocalCollective {
    pub fn new(world_size: u32, timeout: Duration) -> Self {
        Self {
            world_size,
            timeout,
            state: Mutex::new(GroupState {
                next_round: vec![0; world_size as usize],
                ..Default::default()
            }),
            version: watch::Sender::new(0),
        }
    }

    fn wake_all(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn poison(&self, state: &mut GroupState, reason: String) {
        if state.poisoned.is_none() {
            warn!(reason, "Poisoning collective group");
            state.poisoned = Some(reason);
        }
        self.wake_all();
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().unwrap().poisoned.is_some()
    }
}

fn sum_in_rank_order(contributions: &[Option<Vec<f32>>]) -> Result<Vec<f32>, String> {
    let mut iter = contributions.iter().flatten();
    let mut sum = iter.next().cloned().unwrap_or_default();
    for (rank, values) in iter.enumerate() {
        if values.len() != sum.len() {
            return Err(format!(
                "rank {} contributed {} values, rank 0 contributed {}",
                rank + 1,
                values.len(),
                sum.len()
            ));
        }
        for (acc, v) in sum.iter_mut().zip(values) {
            *acc += v;
        }
    }
    Ok(sum)
}

#[async_trait]
impl Collective for LocalCollective {
    fn world_size(&self) -> u32 {
        self.world_size
    }

    async fn all_reduce(
        &self,
        rank: Rank,
        step: u64,
        values: Vec<f32>,
    ) -> Result<Vec<f32>, CollectiveError> {
        if rank.0 >= self.world_size {
            return Err(CollectiveError::UnknownRank(rank));
        }
        let deadline = Instant::now() + self.timeout;
        // subscribe before inspecting state so no wake-up is missed
        let mut changes = self.version.subscribe();

        let round_id = {
            let mut state = self.state.lock().unwrap();
            if let Some(reason) = &state.poisoned {
                return Err(CollectiveError::Poisoned(reason.clone()));
            }
            let round_id = state.next_round[rank.index()];
            state.next_round[rank.index()] += 1;

            let world_size = self.world_size as usize;
            let round = state.rounds.entry(round_id).or_insert_with(|| Round {
                step,
                contributions: vec![None; world_size],
                arrived: 0,
                result: None,
                departed: 0,
            });
            if round.step != step {
                let reason = format!(
                    "rank {rank} joined round {round_id} at step {step}, peers are at step {}",
                    round.step
                );
                self.poison(&mut state, reason.clone());
                return Err(CollectiveError::Poisoned(reason));
            }
            round.contributions[rank.index()] = Some(values);
            round.arrived += 1;
            if round.arrived == world_size {
                match sum_in_rank_order(&round.contributions) {
                    Ok(sum) => {
                        round.result = Some(Arc::new(sum));
                        round.contributions.clear();
                        self.wake_all();
                    }
                    Err(reason) => {
                        self.poison(&mut state, reason.clone());
                        return Err(CollectiveError::Poisoned(reason));
                    }
                }
            }
            round_id
        };
        trace!(rank = %rank, step, round_id, "Joined collective round");

        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(reason) = &state.poisoned {
                    return Err(CollectiveError::Poisoned(reason.clone()));
                }
                if let Some(round) = state.rounds.get_mut(&round_id) {
                    if let Some(result) = round.result.clone() {
                        round.departed += 1;
                        if round.departed == self.world_size as usize {
                            state.rounds.remove(&round_id);
                        }
                        return Ok(result.as_ref().clone());
                    }
                }
            }

            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(CollectiveError::Poisoned("collective group dropped".into()));
                }
                Err(_) => {
                    let mut state = self.state.lock().unwrap();
                    let arrived = state
                        .rounds
                        .get(&round_id)
                        .map_or(0, |round| round.arrived);
                    if state
                        .rounds
                        .get(&round_id)
                        .is_some_and(|round| round.result.is_some())
                    {
                        // completed right at the deadline
                        continue;
                    }
                    let missing = self.world_size as usize - arrived;
                    self.poison(
                        &mut state,
                        format!("rank {rank} timed out at step {step} waiting for {missing} rank(s)"),
                    );
                    return Err(CollectiveError::Timeout {
                        step,
                        missing,
                        timeout: self.timeout,
                    });
                }
            }
        }
    }

    fn abort(&self, rank: Rank, reason: &str) {
        let mut state = self.state.lock().unwrap();
        self.poison(&mut state, format!("rank {rank} aborted: {reason}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_all_reduce_sums() {
        let group = Arc::new(LocalCollective::new(3, Duration::from_secs(5)));
        let tasks: Vec<_> = (0..3u32)
            .map(|r| {
                let group = group.clone();
                tokio::spawn(async move {
                    let first = group
                        .all_reduce(Rank(r), 0, vec![r as f32, 1.0])
                        .await
                        .unwrap();
                    group.barrier(Rank(r), 0).await.unwrap();
                    let second = group
                        .all_reduce(Rank(r), 1, vec![10.0 * r as f32])
                        .await
                        .unwrap();
                    (first, second)
                })
            })
            .collect();
        for task in tasks {
            let (first, second) = task.await.unwrap();
            assert_eq!(first, vec![3.0, 3.0]);
            assert_eq!(second, vec![30.0]);
        }
        assert!(group.state.lock().unwrap().rounds.is_empty());
    }

    #[tokio::test]
    async fn test_single_rank_returns_immediately() {
        let group = LocalCollective::new(1, Duration::from_millis(10));
        assert_eq!(
            group.all_reduce(Rank(0), 7, vec![1.5]).await.unwrap(),
            vec![1.5]
        );
    }

    #[tokio::test]
    async fn test_timeout_poisons_group() {
        let group = LocalCollective::new(2, Duration::from_millis(50));
        let err = group.all_reduce(Rank(0), 3, vec![1.0]).await.unwrap_err();
        assert_eq!(
            err,
            CollectiveError::Timeout {
                step: 3,
                missing: 1,
                timeout: Duration::from_millis(50),
            }
        );
        assert!(group.is_poisoned());
        assert!(matches!(
            group.all_reduce(Rank(1), 3, vec![1.0]).await,
            Err(CollectiveError::Poisoned(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_wakes_waiting_peer() {
        let group = Arc::new(LocalCollective::new(2, Duration::from_secs(30)));
        let waiter = tokio::spawn({
            let group = group.clone();
            async move { group.all_reduce(Rank(0), 0, vec![]).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        group.abort(Rank(1), "checksum mismatch");
        assert!(matches!(
            waiter.await.unwrap(),
            Err(CollectiveError::Poisoned(reason)) if reason.contains("checksum mismatch")
        ));
    }

    #[tokio::test]
    async fn test_mismatched_lengths_poison() {
        let group = Arc::new(LocalCollective::new(2, Duration::from_secs(5)));
        let other = tokio::spawn({
            let group = group.clone();
            async move { group.all_reduce(Rank(1), 0, vec![1.0, 2.0]).await }
        });
        let mine = group.all_reduce(Rank(0), 0, vec![1.0]).await;
        assert!(mine.is_err());
        assert!(other.await.unwrap().is_err());
    }

    #[test]
    fn test_rank_order_sum() {
        let sum = sum_in_rank_order(&[Some(vec![1.0, 2.0]), Some(vec![0.5, 0.25])]).unwrap();
        assert_eq!(sum, vec![1.5, 2.25]);
    }
}
