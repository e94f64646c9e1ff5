//! 完成通知原语。
//!
//! # 设计背景（Why）
//! - `bind`/`connect`/`write`/`flush`/`close` 一律异步：调用方拿到 future，
//!   实现方持有 promise 并在事件循环线程上解析。
//! - promise 采用共享句柄（可克隆）而非一次性移动值：写事件沿出站链路
//!   穿越多个 Handler，任何一环都可能需要在失败时就地解析，同时流水线
//!   边界还要保留兜底句柄。首个解析生效，其余为幂等空操作。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use parking_lot::Mutex;

use crate::error::{codes, CoreError, ErrorCategory};

/// 泛型完成通知的解析端。
pub struct OpPromise<T> {
    sender: Arc<Mutex<Option<oneshot::Sender<Result<T, CoreError>>>>>,
}

impl<T> Clone for OpPromise<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<T> std::fmt::Debug for OpPromise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpPromise")
            .field("resolved", &self.sender.lock().is_none())
            .finish()
    }
}

impl<T> OpPromise<T> {
    /// 以成功结果解析；重复解析为幂等空操作。
    pub fn succeed(&self, value: T) {
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(Ok(value));
        }
    }

    /// 以失败结果解析；重复解析为幂等空操作。
    pub fn fail(&self, error: CoreError) {
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(Err(error));
        }
    }

    /// 是否已被解析。
    pub fn is_resolved(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// 泛型完成通知的等待端。
pub struct OpFuture<T> {
    receiver: oneshot::Receiver<Result<T, CoreError>>,
}

impl<T> Future for OpFuture<T> {
    type Output = Result<T, CoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // 所有 promise 句柄都被丢弃而未解析：视为操作被放弃。
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(CoreError::new(
                codes::PROMISE_ABANDONED,
                "完成通知在解析前被丢弃",
            )
            .with_category(ErrorCategory::Cancelled))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// 构造一对泛型 promise/future。
pub fn op_pair<T>() -> (OpPromise<T>, OpFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (
        OpPromise {
            sender: Arc::new(Mutex::new(Some(tx))),
        },
        OpFuture { receiver: rx },
    )
}

/// 无返回值操作（write/flush/close/bind）的完成通知。
pub type CompletionPromise = OpPromise<()>;

/// 无返回值操作的等待端。
pub type CompletionFuture = OpFuture<()>;

/// 构造一对无返回值的 promise/future。
pub fn completion_pair() -> (CompletionPromise, CompletionFuture) {
    op_pair()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_resolution_wins() {
        let (promise, future) = completion_pair();
        let clone = promise.clone();
        clone.succeed(());
        promise.fail(CoreError::new("flint.test", "late"));
        assert!(promise.is_resolved());
        let result = futures::executor::block_on(future);
        assert!(result.is_ok(), "首个解析应当生效");
    }

    #[test]
    fn dropped_promise_surfaces_abandonment() {
        let (promise, future) = completion_pair();
        drop(promise);
        let err = futures::executor::block_on(future).unwrap_err();
        assert_eq!(err.code(), codes::PROMISE_ABANDONED);
    }
}
