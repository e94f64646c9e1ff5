use crate::channel::{CompletionPromise, WriteSignal};
use crate::error::CoreError;

use super::context::HandlerContext;
use super::message::{PipelineMessage, UserEvent};

/// 入站事件处理合约，面向从传输层到业务层的正向数据流。
///
/// # 契约说明（What）
/// - 所有回调在通道所属事件循环线程上串行执行，天然免锁；实现必须无阻塞，
///   耗时工作应转投执行器。
/// - 默认实现全部原样向后传递；不调用 `forward_*` 即停止传播。
/// - 回调返回 `Err` 会在流水线边界被捕获，转换为发往**后继**入站 Handler
///   的 `on_exception_caught` 事件，绝不静默丢弃。
///
/// # 风险提示（Trade-offs）
/// - 回调以 `&self` 进入以保持对象安全与跨事件复用；需要状态的实现（如
///   解码器）自行采用内部可变性。
pub trait InboundHandler: Send + Sync + 'static {
    /// 通道进入活跃态。
    fn on_channel_active(&self, ctx: &HandlerContext<'_>) -> Result<(), CoreError> {
        ctx.forward_channel_active();
        Ok(())
    }

    /// 收到一条入站消息（每个解码单元恰好一次）。
    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        ctx.forward_read(msg);
        Ok(())
    }

    /// 通道可写性翻转（写队列跨越高/低水位）。
    fn on_writability_changed(
        &self,
        ctx: &HandlerContext<'_>,
        is_writable: bool,
    ) -> Result<(), CoreError> {
        ctx.forward_writability_changed(is_writable);
        Ok(())
    }

    /// 用户自定义事件。
    fn on_user_event(&self, ctx: &HandlerContext<'_>, event: UserEvent) -> Result<(), CoreError> {
        ctx.forward_user_event(event);
        Ok(())
    }

    /// 链路上游抛出的异常；默认继续向后传递。
    fn on_exception_caught(&self, ctx: &HandlerContext<'_>, error: CoreError) {
        ctx.forward_exception(error);
    }

    /// 通道进入终态。
    fn on_channel_inactive(&self, ctx: &HandlerContext<'_>) -> Result<(), CoreError> {
        ctx.forward_channel_inactive();
        Ok(())
    }
}

/// 出站事件处理合约，负责从业务层到传输层的逆向数据流。
///
/// # 契约说明（What）
/// - `on_write` 返回 [`WriteSignal`] 背压反馈；`promise` 为共享句柄，失败
///   路径上任何一环都可就地 `fail`。
/// - 回调返回 `Err` 时流水线会 fail 该 promise 并以入站异常事件广播。
pub trait OutboundHandler: Send + Sync + 'static {
    /// 写入消息，向链路头部推进。
    fn on_write(
        &self,
        ctx: &HandlerContext<'_>,
        msg: PipelineMessage,
        promise: &CompletionPromise,
    ) -> Result<WriteSignal, CoreError> {
        Ok(ctx.forward_write(msg, promise))
    }

    /// 刷新写缓冲。
    fn on_flush(&self, ctx: &HandlerContext<'_>) {
        ctx.forward_flush();
    }

    /// 关闭通道。
    fn on_close(&self, ctx: &HandlerContext<'_>, promise: &CompletionPromise) {
        ctx.forward_close(promise);
    }
}

/// Handler 的注册形态：入站或出站。
///
/// 全双工逻辑按方向拆成两个实例注册，与控制器分别维护两条方向性链路的
/// 做法保持一致。
pub enum Handler {
    /// 入站 Handler。
    Inbound(Box<dyn InboundHandler>),
    /// 出站 Handler。
    Outbound(Box<dyn OutboundHandler>),
}

impl Handler {
    /// 包装入站实现。
    pub fn inbound(handler: impl InboundHandler) -> Self {
        Handler::Inbound(Box::new(handler))
    }

    /// 包装出站实现。
    pub fn outbound(handler: impl OutboundHandler) -> Self {
        Handler::Outbound(Box::new(handler))
    }

    /// 是否入站方向。
    pub fn is_inbound(&self) -> bool {
        matches!(self, Handler::Inbound(_))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Inbound(_) => f.write_str("Handler::Inbound"),
            Handler::Outbound(_) => f.write_str("Handler::Outbound"),
        }
    }
}
