//! Map-reduce across the cluster: one call per peer plus one local call,
//! folded with an operation specific combiner.
//!
//! A peer that fails or times out contributes the combiner's identity, so the
//! aggregate always completes from whatever answered.

use crate::error::{Error, ErrorKind, Result};
use crate::reference_counted::{Checkout, ReferenceCounted};
use log::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How two partial results are merged, and what a failed peer contributes.
pub struct Combiner<R> {
    identity: fn() -> R,
    combine: fn(R, R) -> R,
}

impl<R> Combiner<R> {
    pub fn new(identity: fn() -> R, combine: fn(R, R) -> R) -> Self {
        Self { identity, combine }
    }

    pub fn identity(&self) -> R {
        (self.identity)()
    }

    pub fn combine(&self, left: R, right: R) -> R {
        (self.combine)(left, right)
    }
}

impl Combiner<usize> {
    pub fn sum() -> Self {
        Self::new(|| 0, |a, b| a + b)
    }
}

impl Combiner<bool> {
    pub fn or() -> Self {
        Self::new(|| false, |a, b| a || b)
    }
}

impl<T> Combiner<Option<T>> {
    pub fn first_non_null() -> Self {
        Self::new(|| None, |a, b| a.or(b))
    }
}

impl<T: PartialEq> Combiner<Vec<T>> {
    /// Set union preserving first-seen order.
    pub fn union() -> Self {
        Self::new(Vec::new, union::<T>)
    }

    pub fn concat() -> Self {
        Self::new(Vec::new, |mut a, b| {
            a.extend(b);
            a
        })
    }
}

fn union<T: PartialEq>(mut left: Vec<T>, right: Vec<T>) -> Vec<T> {
    for item in right {
        if !left.contains(&item) {
            left.push(item);
        }
    }
    left
}

#[derive(Debug, Clone, Copy)]
pub struct AggregateOptions {
    /// Upper bound on each remote call.
    pub call_timeout: Duration,
    /// Optional bound on the whole wait; peers still running at the deadline
    /// are dropped and what already arrived is folded.
    pub deadline: Option<Duration>,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(10_000),
            deadline: None,
        }
    }
}

/// Runs `remote` against every peer concurrently and `local` on this node,
/// then folds every result with `combiner`.
pub async fn map_reduce<P, R, F, Fut, L>(
    operation: &str,
    peers: &[Arc<P>],
    options: AggregateOptions,
    remote: F,
    local: L,
    combiner: &Combiner<R>,
) -> R
where
    P: ?Sized + Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(Arc<P>) -> Fut,
    Fut: Future<Output = Result<R>> + Send + 'static,
    L: FnOnce() -> R,
{
    let call_timeout = options.call_timeout;
    let handles: Vec<_> = peers
        .iter()
        .map(|peer| {
            let call = remote(Arc::clone(peer));
            tokio::spawn(async move {
                match tokio::time::timeout(call_timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::new(
                        ErrorKind::PeerUnreachable,
                        &format!("no answer within {call_timeout:?}"),
                    )),
                }
            })
        })
        .collect();

    let mut folded = local();

    let deadline = options.deadline.map(|d| Instant::now() + d);
    for (index, mut handle) in handles.into_iter().enumerate() {
        let joined = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    debug!("{operation}: peer {index} still running at deadline, skipped");
                    folded = combiner.combine(folded, combiner.identity());
                    continue;
                }
            },
            None => handle.await,
        };
        let contribution = match joined {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                debug!("{operation}: peer {index} failed: {e}");
                combiner.identity()
            }
            Err(e) => {
                debug!("{operation}: peer {index} task aborted: {e}");
                combiner.identity()
            }
        };
        folded = combiner.combine(folded, contribution);
    }
    folded
}

/// Checks out the current value of a swappable view. A view retired between
/// the read and the checkout is re-read; `None` once the source keeps
/// retiring.
pub fn checkout_current<T, G>(current: G) -> Option<Checkout<T>>
where
    G: Fn() -> Arc<ReferenceCounted<T>>,
{
    for _ in 0..3 {
        match current().open() {
            Ok(checkout) => return Some(checkout),
            Err(e) => trace!("Peer list swapped during checkout: {e}"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct Peer {
        answer: Option<usize>,
        delay: Duration,
    }

    async fn ask(peer: Arc<Peer>) -> Result<usize> {
        tokio::time::sleep(peer.delay).await;
        peer.answer
            .ok_or_else(|| Error::new(ErrorKind::PeerUnreachable, "refused"))
    }

    fn peer(answer: Option<usize>, delay_ms: u64) -> Arc<Peer> {
        Arc::new(Peer {
            answer,
            delay: Duration::from_millis(delay_ms),
        })
    }

    #[tokio::test]
    async fn failed_peer_contributes_identity() {
        let peers = vec![peer(Some(3), 0), peer(None, 0)];
        let total = map_reduce(
            "count",
            &peers,
            AggregateOptions::default(),
            ask,
            || 2,
            &Combiner::sum(),
        )
        .await;
        assert_eq!(total, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_peer_times_out_per_call() {
        let peers = vec![peer(Some(1), 10), peer(Some(100), 5_000)];
        let options = AggregateOptions {
            call_timeout: Duration::from_millis(100),
            deadline: None,
        };
        let total = map_reduce("count", &peers, options, ask, || 0, &Combiner::sum()).await;
        assert_eq!(total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_keeps_results_that_already_arrived() {
        let peers = vec![peer(Some(7), 10), peer(Some(100), 1_000)];
        let options = AggregateOptions {
            call_timeout: Duration::from_secs(60),
            deadline: Some(Duration::from_millis(200)),
        };
        let total = map_reduce("count", &peers, options, ask, || 1, &Combiner::sum()).await;
        assert_eq!(total, 8);
    }

    #[tokio::test]
    async fn no_peers_is_just_the_local_result() {
        let peers: Vec<Arc<Peer>> = Vec::new();
        let online = map_reduce(
            "online",
            &peers,
            AggregateOptions::default(),
            |_| async { Ok(true) },
            || false,
            &Combiner::or(),
        )
        .await;
        assert!(!online);
    }

    #[test]
    fn combiners_follow_their_algebra() {
        let union = Combiner::<Vec<&str>>::union();
        assert_eq!(union.combine(vec!["a", "b"], vec!["b", "c"]), vec!["a", "b", "c"]);
        let first = Combiner::<Option<u8>>::first_non_null();
        assert_eq!(first.combine(None, Some(2)), Some(2));
        assert_eq!(first.combine(Some(1), Some(2)), Some(1));
        assert!(Combiner::or().combine(false, true));
        assert_eq!(Combiner::<Vec<u8>>::concat().combine(vec![1], vec![1]), vec![1, 1]);
    }

    #[test]
    fn checkout_current_skips_retired_views() {
        let retired = Arc::new(ReferenceCounted::new(vec![1]));
        retired.destroy(|_| {});
        assert!(checkout_current(|| retired.clone()).is_none());

        let live = Arc::new(ReferenceCounted::new(vec![2]));
        let checkout = checkout_current(|| live.clone()).unwrap();
        assert_eq!(*checkout, vec![2]);
        assert_eq!(live.ref_cnt(), 1);
    }
}
