//! Bounded-concurrency execution for batches of independent work: a
//! backfill plan's remaining partition keys (§4.9.4) or a workflow level's
//! ready steps (§4.7). Both need "run up to N of these at once, collect
//! every result even on failure" rather than all-or-nothing `join_all`.

use futures::stream::{self, StreamExt};

/// Split `items` into fixed-size chunks, preserving order. Purely
/// structural — callers that want bounded *concurrency* instead of bounded
/// *batch size* should use [`run_bounded`].
pub fn chunk<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    if size == 0 {
        return vec![items.to_vec()];
    }
    items.chunks(size).map(|c| c.to_vec()).collect()
}

/// Run `f` over every item in `items` with at most `concurrency` futures
/// in flight at once, returning results in the same order as `items`
/// regardless of completion order. One item failing does not cancel the
/// others — every item gets its `Result`.
pub async fn run_bounded<T, F, Fut, O, E>(items: Vec<T>, concurrency: usize, f: F) -> Vec<Result<O, E>>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<O, E>> + Send,
    O: Send,
    E: Send,
{
    let concurrency = concurrency.max(1);
    stream::iter(items)
        .map(|item| f(item))
        .buffered(concurrency)
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_splits_by_size_and_keeps_remainder() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(chunk(&items, 2), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn chunk_size_zero_is_one_batch() {
        let items = vec![1, 2, 3];
        assert_eq!(chunk(&items, 0), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn run_bounded_preserves_order_and_collects_every_result() {
        let items = vec![1, 2, 3, 4];
        let results = run_bounded(items, 2, |n| async move {
            if n == 3 {
                Err(format!("failed on {n}"))
            } else {
                Ok(n * 10)
            }
        })
        .await;
        assert_eq!(results, vec![Ok(10), Ok(20), Err("failed on 3".to_string()), Ok(40)]);
    }
}
