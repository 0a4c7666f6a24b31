//! 任务调度：阻塞工具的有界工作池
//!
//! 同步文件 / 库调用等阻塞工具经 spawn_blocking 移出 tokio 工作线程，Semaphore 限制同时占用的阻塞线程数，
//! 单个慢工具不会拖住其他会话的循环。

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::core::AgentError;

/// 任务调度器：克隆后共享同一个许可池
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    /// 阻塞工具并发限制（默认 4）
    blocking_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_blocking_tools: usize) -> Self {
        Self {
            blocking_semaphore: Arc::new(Semaphore::new(max_blocking_tools.max(1))),
        }
    }

    /// 在阻塞线程池中执行 f；先获取许可，线程结束（含 panic）时归还
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T, AgentError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.blocking_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AgentError::ToolExecutionFailed("blocking pool closed".to_string()))?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });

        handle.await.map_err(|e| {
            if e.is_panic() {
                AgentError::ToolPanicked("blocking tool panicked".to_string())
            } else {
                AgentError::Cancelled
            }
        })
    }

    /// 当前空闲许可数
    pub fn available_permits(&self) -> usize {
        self.blocking_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_blocking_returns_value() {
        let scheduler = TaskScheduler::new(2);
        let v = scheduler.run_blocking(|| 21 * 2).await.unwrap();
        assert_eq!(v, 42);
        assert_eq!(scheduler.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_run_blocking_contains_panic() {
        let scheduler = TaskScheduler::new(1);
        let err = scheduler
            .run_blocking(|| -> usize { panic!("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolPanicked(_)));
        // 许可已归还
        assert_eq!(scheduler.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_pool_is_bounded() {
        let scheduler = TaskScheduler::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let s = scheduler.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                s.run_blocking(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
