use std::sync::Arc;

use crate::channel::{completion_pair, Channel, CompletionFuture, CompletionPromise, WriteSignal};
use crate::error::CoreError;

use super::chain::{HandlerNode, Pipeline};
use super::message::{PipelineMessage, UserEvent};

/// Handler 与流水线交互的统一入口。
///
/// # 设计背景（Why）
/// - 上下文绑定"当前节点"，`forward_*` 从该节点的位置继续传播；这让
///   Handler 无需知道自己在链路中的位置，移除/插入后语义自动跟随。
///
/// # 契约说明（What）
/// - 上下文仅在单次事件回调内有效，不得跨回调保存；需要长期持有的能力
///   （通道、流水线）应各自克隆 `Arc`。
/// - `forward_*` 面向入站事件（向尾部），`write`/`flush`/`close` 从当前
///   位置向头部发起出站操作。
pub struct HandlerContext<'a> {
    pipeline: &'a Pipeline,
    node: &'a Arc<HandlerNode>,
}

impl<'a> HandlerContext<'a> {
    pub(super) fn new(pipeline: &'a Pipeline, node: &'a Arc<HandlerNode>) -> Self {
        Self { pipeline, node }
    }

    /// 当前 Handler 的注册名。
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// 所属流水线。
    pub fn pipeline(&self) -> &Pipeline {
        self.pipeline
    }

    /// 所属通道；通道尚未绑定或已销毁时为 `None`。
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.pipeline.channel()
    }

    /// 把"通道活跃"事件传给后继入站 Handler。
    pub fn forward_channel_active(&self) {
        self.pipeline.dispatch_channel_active(Some(self.node.id()));
    }

    /// 把入站消息传给后继入站 Handler。
    pub fn forward_read(&self, msg: PipelineMessage) {
        self.pipeline.dispatch_read(Some(self.node.id()), msg);
    }

    /// 把可写性变化传给后继入站 Handler。
    pub fn forward_writability_changed(&self, is_writable: bool) {
        self.pipeline
            .dispatch_writability_changed(Some(self.node.id()), is_writable);
    }

    /// 把用户事件传给后继入站 Handler。
    pub fn forward_user_event(&self, event: UserEvent) {
        self.pipeline.dispatch_user_event(Some(self.node.id()), event);
    }

    /// 把异常传给后继入站 Handler。
    pub fn forward_exception(&self, error: CoreError) {
        self.pipeline.dispatch_exception(Some(self.node.id()), error);
    }

    /// 把"通道失活"事件传给后继入站 Handler。
    pub fn forward_channel_inactive(&self) {
        self.pipeline.dispatch_channel_inactive(Some(self.node.id()));
    }

    /// 在当前位置抛出异常，交由后继入站 Handler 处置。
    pub fn fire_exception(&self, error: CoreError) {
        self.pipeline.dispatch_exception(Some(self.node.id()), error);
    }

    /// 从当前位置向头部发起写操作。
    pub fn write(&self, msg: PipelineMessage) -> (WriteSignal, CompletionFuture) {
        let (promise, future) = completion_pair();
        let signal = self
            .pipeline
            .dispatch_write(Some(self.node.id()), msg, &promise);
        (signal, future)
    }

    /// 出站 Handler 把写事件继续向头部传递。
    pub fn forward_write(&self, msg: PipelineMessage, promise: &CompletionPromise) -> WriteSignal {
        self.pipeline
            .dispatch_write(Some(self.node.id()), msg, promise)
    }

    /// 从当前位置向头部发起刷新。
    pub fn flush(&self) {
        self.pipeline.dispatch_flush(Some(self.node.id()));
    }

    /// 出站 Handler 把刷新事件继续向头部传递。
    pub fn forward_flush(&self) {
        self.pipeline.dispatch_flush(Some(self.node.id()));
    }

    /// 从当前位置向头部发起关闭。
    pub fn close(&self) -> CompletionFuture {
        let (promise, future) = completion_pair();
        self.pipeline.dispatch_close(Some(self.node.id()), &promise);
        future
    }

    /// 出站 Handler 把关闭事件继续向头部传递。
    pub fn forward_close(&self, promise: &CompletionPromise) {
        self.pipeline.dispatch_close(Some(self.node.id()), promise);
    }
}
