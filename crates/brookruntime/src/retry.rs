//! Per-chunk retry with capped exponential backoff.

use brookcore::{NodeContext, NodeError, RetryPolicy};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Delay before retrying after the failed `attempt` (0-based).
///
/// `min(base * 2^attempt, max)`; with jitter the result is drawn uniformly
/// from `[d/2, 3d/2)`.
pub fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let policy = policy.normalized();
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let delay_ms = policy
        .base_delay_ms
        .saturating_mul(factor)
        .min(policy.max_delay_ms);

    if !policy.jitter || delay_ms < 2 {
        return Duration::from_millis(delay_ms);
    }
    let half = delay_ms / 2;
    let jittered = half + rand::thread_rng().gen_range(0..delay_ms);
    Duration::from_millis(jittered)
}

/// Outcome of a retried operation: the final result and how many attempts ran.
pub struct RetryOutcome<T> {
    pub result: Result<T, NodeError>,
    pub attempts: u32,
}

/// Run `op` until it succeeds or `policy.max_retries` retries are spent.
///
/// The context is checked before every attempt, and both attempts and backoff
/// sleeps race the context so cancellation or an expired deadline fails the
/// chunk immediately with the context's error.
pub async fn retry_with_backoff<T, F, Fut>(
    ctx: &NodeContext,
    policy: &RetryPolicy,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NodeError>>,
{
    let policy = policy.normalized();
    let mut attempt: u32 = 0;

    loop {
        if let Err(e) = ctx.check() {
            return RetryOutcome {
                result: Err(e),
                attempts: attempt,
            };
        }

        let result = tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            res = op() => res,
        };
        attempt += 1;

        let err = match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) => e,
        };

        if let Err(ctx_err) = ctx.check() {
            return RetryOutcome {
                result: Err(ctx_err),
                attempts: attempt,
            };
        }
        if attempt > policy.max_retries {
            return RetryOutcome {
                result: Err(err),
                attempts: attempt,
            };
        }

        let delay = backoff(&policy, attempt - 1);
        tracing::warn!(
            node_id = %ctx.node.id,
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Chunk attempt failed, retrying"
        );
        tokio::select! {
            ctx_err = ctx.done() => {
                return RetryOutcome {
                    result: Err(ctx_err),
                    attempts: attempt,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: u64, max: u64, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            base_delay_ms: base,
            max_delay_ms: max,
            jitter,
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let p = policy(100, 1_000, false);
        assert_eq!(backoff(&p, 0), Duration::from_millis(100));
        assert_eq!(backoff(&p, 1), Duration::from_millis(200));
        assert_eq!(backoff(&p, 3), Duration::from_millis(800));
        assert_eq!(backoff(&p, 4), Duration::from_millis(1_000));
        assert_eq!(backoff(&p, 63), Duration::from_millis(1_000));
        assert_eq!(backoff(&p, 200), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_half_either_side() {
        let p = policy(400, 400, true);
        for _ in 0..200 {
            let d = backoff(&p, 0).as_millis();
            assert!((200..600).contains(&d), "delay {} out of range", d);
        }
    }
}
