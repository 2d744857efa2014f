//! 有界并发的分批执行
//!
//! 把操作按固定大小分组，每组内部并发（`join_all`），组与组之间严格串行：
//! 限制峰值内存和对远端存储的并发连接数，同时在组内重叠 I/O 延迟。

use std::future::Future;

use futures::future::join_all;
use tracing::{debug, warn};

use super::context::AbortFlag;

/// 分批执行结果
#[derive(Debug)]
pub struct BatchOutcome<R> {
    /// 已执行项的结果（保持输入顺序）
    pub results: Vec<R>,
    /// 已执行的批次数
    pub batches: usize,
    /// 因中止标志而未调度的项数
    pub not_started: usize,
    /// 是否因中止标志提前停止
    pub halted: bool,
}

impl<R> BatchOutcome<R> {
    pub fn processed(&self) -> usize {
        self.results.len()
    }
}

/// 分批执行
///
/// 每个批次开始前检查 `abort`，一旦置位即停止调度剩余批次；
/// 已经开始的批次总会执行完毕。
pub async fn run_in_batches<T, R, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    abort: &AbortFlag,
    f: F,
) -> BatchOutcome<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let batch_size = batch_size.max(1);
    let total = items.len();
    let mut results = Vec::with_capacity(total);
    let mut batches = 0usize;
    let mut halted = false;
    let mut remaining = items.into_iter();

    loop {
        if abort.is_raised() {
            halted = true;
            break;
        }

        let batch: Vec<T> = remaining.by_ref().take(batch_size).collect();
        if batch.is_empty() {
            break;
        }

        let outputs = join_all(batch.into_iter().map(&f)).await;
        results.extend(outputs);
        batches += 1;
        debug!("[Batch] 批次 {} 完成 ({}/{})", batches, results.len(), total);
    }

    let not_started = total - results.len();
    if halted && not_started > 0 {
        warn!(
            "[Batch] 运行已中止，剩余 {} 项未调度（已完成 {} 批）",
            not_started, batches
        );
    }

    BatchOutcome {
        results,
        batches,
        not_started,
        halted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_batches_preserve_order_and_count() {
        let abort = AbortFlag::new();
        let outcome = run_in_batches((0..12).collect(), 5, &abort, |n: i32| async move { n * 2 }).await;

        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.processed(), 12);
        assert_eq!(outcome.results[11], 22);
        assert!(!outcome.halted);
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_batch_size() {
        let abort = AbortFlag::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        run_in_batches((0..20).collect::<Vec<i32>>(), 5, &abort, |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn test_abort_between_batches() {
        let abort = AbortFlag::new();
        let flag = abort.clone();

        // 第一批中的某项触发中止，后续批次不再调度
        let outcome = run_in_batches((0..10).collect(), 3, &abort, |n: i32| {
            let flag = flag.clone();
            async move {
                if n == 1 {
                    flag.raise();
                }
                n
            }
        })
        .await;

        assert!(outcome.halted);
        assert_eq!(outcome.processed(), 3);
        assert_eq!(outcome.not_started, 7);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let abort = AbortFlag::new();
        let outcome = run_in_batches(Vec::<i32>::new(), 5, &abort, |n| async move { n }).await;
        assert_eq!(outcome.batches, 0);
        assert!(!outcome.halted);
    }
}
