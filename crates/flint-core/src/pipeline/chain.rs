use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::channel::{
    completion_pair, into_wire_bytes, Channel, CompletionFuture, CompletionPromise, WriteSignal,
};
use crate::error::{codes, CoreError};

use super::context::HandlerContext;
use super::handler::{Handler, InboundHandler, OutboundHandler};
use super::message::{PipelineMessage, UserEvent};

/// 链路中的一个 Handler 节点。
pub(super) struct HandlerNode {
    id: u64,
    name: String,
    handler: Handler,
}

impl HandlerNode {
    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    fn is_inbound(&self) -> bool {
        self.handler.is_inbound()
    }

    fn inbound(&self) -> &dyn InboundHandler {
        match &self.handler {
            Handler::Inbound(handler) => handler.as_ref(),
            Handler::Outbound(_) => unreachable!("方向过滤已保证节点为入站"),
        }
    }

    fn outbound(&self) -> &dyn OutboundHandler {
        match &self.handler {
            Handler::Outbound(handler) => handler.as_ref(),
            Handler::Inbound(_) => unreachable!("方向过滤已保证节点为出站"),
        }
    }
}

/// 节点移除时留下的遍历线索。
struct Tombstone {
    prev: Option<u64>,
    next: Option<u64>,
}

/// 插入位置。
enum Position<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

/// `Pipeline` 是挂在通道上的有序 Handler 链路。
///
/// # 设计背景（Why）
/// - 入站事件头→尾、出站事件尾→头，两条方向性链路共享同一份有序节点表。
/// - 链路在事件分发过程中允许结构性修改：每一步分发都从活表**现查**后继，
///   绝不跨越用户代码缓存陈旧指针；节点被移除时留下墓碑（移除瞬间的前驱
///   /后继 id），在途遍历沿墓碑恢复，链路不会断裂。
///
/// # 契约说明（What）
/// - 节点以唯一名字注册，同名注册被拒绝；
/// - 事件入口（`fire_*`）必须在通道所属事件循环线程调用，这是"Handler 免
///   锁"保证的来源；
/// - 入站回调返回 `Err` 时，错误被转换为发往后继入站 Handler 的
///   `on_exception_caught`；链尾兜底策略：要求关闭通道的分类触发关闭，
///   其余仅记录。
///
/// # 风险提示（Trade-offs）
/// - 后继现查让单步分发为 O(n)（n 为链长）；协议链路通常在个位数长度，
///   换取的是热改期间绝对的指针安全。
pub struct Pipeline {
    channel: OnceLock<Weak<dyn Channel>>,
    nodes: Mutex<Vec<Arc<HandlerNode>>>,
    tombstones: Mutex<HashMap<u64, Tombstone>>,
    next_id: AtomicU64,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// 创建空流水线。
    pub fn new() -> Self {
        Self {
            channel: OnceLock::new(),
            nodes: Mutex::new(Vec::new()),
            tombstones: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 绑定所属通道；只允许绑定一次，后续调用被忽略。
    pub fn bind_channel(&self, channel: Weak<dyn Channel>) {
        let _ = self.channel.set(channel);
    }

    /// 当前绑定的通道。
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.get().and_then(Weak::upgrade)
    }

    /// 追加到链尾。
    pub fn add_last(&self, name: impl Into<String>, handler: Handler) -> Result<(), CoreError> {
        self.insert(Position::Last, name.into(), handler)
    }

    /// 插入到链头。
    pub fn add_first(&self, name: impl Into<String>, handler: Handler) -> Result<(), CoreError> {
        self.insert(Position::First, name.into(), handler)
    }

    /// 插入到 `anchor` 之前。
    pub fn add_before(
        &self,
        anchor: &str,
        name: impl Into<String>,
        handler: Handler,
    ) -> Result<(), CoreError> {
        self.insert(Position::Before(anchor), name.into(), handler)
    }

    /// 插入到 `anchor` 之后。
    pub fn add_after(
        &self,
        anchor: &str,
        name: impl Into<String>,
        handler: Handler,
    ) -> Result<(), CoreError> {
        self.insert(Position::After(anchor), name.into(), handler)
    }

    fn insert(&self, position: Position<'_>, name: String, handler: Handler) -> Result<(), CoreError> {
        let mut nodes = self.nodes.lock();
        if nodes.iter().any(|node| node.name == name) {
            return Err(CoreError::new(
                codes::PIPELINE_DUPLICATE_NAME,
                format!("Handler 名称重复: {name}"),
            ));
        }
        let at = match position {
            Position::First => 0,
            Position::Last => nodes.len(),
            Position::Before(anchor) => Self::position_of(&nodes, anchor)?,
            Position::After(anchor) => Self::position_of(&nodes, anchor)? + 1,
        };
        let node = Arc::new(HandlerNode {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name,
            handler,
        });
        tracing::trace!(handler = %node.name, at, "流水线插入 Handler");
        nodes.insert(at, node);
        Ok(())
    }

    fn position_of(nodes: &[Arc<HandlerNode>], anchor: &str) -> Result<usize, CoreError> {
        nodes
            .iter()
            .position(|node| node.name == anchor)
            .ok_or_else(|| {
                CoreError::new(
                    codes::PIPELINE_HANDLER_MISSING,
                    format!("锚点 Handler 不存在: {anchor}"),
                )
            })
    }

    /// 按名字移除 Handler；允许在事件分发期间（包括被移除者自身的回调内）
    /// 调用。
    pub fn remove(&self, name: &str) -> Result<(), CoreError> {
        let mut nodes = self.nodes.lock();
        let at = Self::position_of(&nodes, name)?;
        let node = nodes.remove(at);
        let prev = at.checked_sub(1).map(|p| nodes[p].id);
        let next = nodes.get(at).map(|n| n.id);
        // 墓碑与移除同锁提交，在途遍历要么看到节点、要么看到墓碑。
        self.tombstones.lock().insert(node.id, Tombstone { prev, next });
        drop(nodes);
        tracing::trace!(handler = %node.name, "流水线移除 Handler");
        Ok(())
    }

    /// 链路中所有 Handler 的名字快照（头→尾）。
    pub fn names(&self) -> Vec<String> {
        self.nodes.lock().iter().map(|n| n.name.clone()).collect()
    }

    /// `from` 之后首个指定方向的节点；`from = None` 表示从链头起。
    ///
    /// 节点已被移除时沿墓碑记录的后继恢复，继而跳过同样被移除的节点。
    fn node_after(&self, mut from: Option<u64>, want_inbound: bool) -> Option<Arc<HandlerNode>> {
        loop {
            {
                let nodes = self.nodes.lock();
                match from {
                    None => return nodes.iter().find(|n| n.is_inbound() == want_inbound).cloned(),
                    Some(id) => {
                        if let Some(at) = nodes.iter().position(|n| n.id == id) {
                            return nodes[at + 1..]
                                .iter()
                                .find(|n| n.is_inbound() == want_inbound)
                                .cloned();
                        }
                    }
                }
            }
            let removed = from.expect("仅移除分支会走到这里");
            let successor = self.tombstones.lock().get(&removed).and_then(|t| t.next);
            match successor {
                None => return None,
                Some(next_id) => {
                    let nodes = self.nodes.lock();
                    if let Some(at) = nodes.iter().position(|n| n.id == next_id) {
                        return nodes[at..]
                            .iter()
                            .find(|n| n.is_inbound() == want_inbound)
                            .cloned();
                    }
                    drop(nodes);
                    from = Some(next_id);
                }
            }
        }
    }

    /// `from` 之前（更靠近链头）首个出站节点；`from = None` 表示从链尾起。
    fn node_before(&self, mut from: Option<u64>) -> Option<Arc<HandlerNode>> {
        loop {
            {
                let nodes = self.nodes.lock();
                match from {
                    None => return nodes.iter().rev().find(|n| !n.is_inbound()).cloned(),
                    Some(id) => {
                        if let Some(at) = nodes.iter().position(|n| n.id == id) {
                            return nodes[..at].iter().rev().find(|n| !n.is_inbound()).cloned();
                        }
                    }
                }
            }
            let removed = from.expect("仅移除分支会走到这里");
            let predecessor = self.tombstones.lock().get(&removed).and_then(|t| t.prev);
            match predecessor {
                None => return None,
                Some(prev_id) => {
                    let nodes = self.nodes.lock();
                    if let Some(at) = nodes.iter().position(|n| n.id == prev_id) {
                        return nodes[..=at].iter().rev().find(|n| !n.is_inbound()).cloned();
                    }
                    drop(nodes);
                    from = Some(prev_id);
                }
            }
        }
    }

    // ---- 入站事件 ----

    /// 广播"通道活跃"。
    pub fn fire_channel_active(&self) {
        self.dispatch_channel_active(None);
    }

    pub(super) fn dispatch_channel_active(&self, from: Option<u64>) {
        if let Some(node) = self.node_after(from, true) {
            let ctx = HandlerContext::new(self, &node);
            if let Err(error) = node.inbound().on_channel_active(&ctx) {
                self.dispatch_exception(Some(node.id), error);
            }
        }
    }

    /// 广播一条入站消息。
    pub fn fire_read(&self, msg: PipelineMessage) {
        self.dispatch_read(None, msg);
    }

    pub(super) fn dispatch_read(&self, from: Option<u64>, msg: PipelineMessage) {
        match self.node_after(from, true) {
            Some(node) => {
                let ctx = HandlerContext::new(self, &node);
                if let Err(error) = node.inbound().on_read(&ctx, msg) {
                    self.dispatch_exception(Some(node.id), error);
                }
            }
            None => tracing::trace!("入站消息抵达链尾未被处理，丢弃"),
        }
    }

    /// 广播可写性变化。
    pub fn fire_writability_changed(&self, is_writable: bool) {
        self.dispatch_writability_changed(None, is_writable);
    }

    pub(super) fn dispatch_writability_changed(&self, from: Option<u64>, is_writable: bool) {
        if let Some(node) = self.node_after(from, true) {
            let ctx = HandlerContext::new(self, &node);
            if let Err(error) = node.inbound().on_writability_changed(&ctx, is_writable) {
                self.dispatch_exception(Some(node.id), error);
            }
        }
    }

    /// 广播用户事件。
    pub fn fire_user_event(&self, event: UserEvent) {
        self.dispatch_user_event(None, event);
    }

    pub(super) fn dispatch_user_event(&self, from: Option<u64>, event: UserEvent) {
        if let Some(node) = self.node_after(from, true) {
            let ctx = HandlerContext::new(self, &node);
            if let Err(error) = node.inbound().on_user_event(&ctx, event) {
                self.dispatch_exception(Some(node.id), error);
            }
        }
    }

    /// 广播异常。
    pub fn fire_exception(&self, error: CoreError) {
        self.dispatch_exception(None, error);
    }

    pub(super) fn dispatch_exception(&self, from: Option<u64>, error: CoreError) {
        match self.node_after(from, true) {
            Some(node) => {
                let ctx = HandlerContext::new(self, &node);
                node.inbound().on_exception_caught(&ctx, error);
            }
            None => self.on_unhandled_exception(error),
        }
    }

    /// 链尾兜底：要求关闭的分类触发关闭，其余仅记录。
    fn on_unhandled_exception(&self, error: CoreError) {
        if error.closes_channel() {
            tracing::warn!(code = error.code(), "未被处理的异常触发通道关闭: {error}");
            if let Some(channel) = self.channel() {
                let (promise, _future) = completion_pair();
                channel.begin_close(promise);
            }
        } else {
            tracing::debug!(code = error.code(), "未被处理的异常抵达链尾: {error}");
        }
    }

    /// 广播"通道失活"。
    pub fn fire_channel_inactive(&self) {
        self.dispatch_channel_inactive(None);
    }

    pub(super) fn dispatch_channel_inactive(&self, from: Option<u64>) {
        if let Some(node) = self.node_after(from, true) {
            let ctx = HandlerContext::new(self, &node);
            if let Err(error) = node.inbound().on_channel_inactive(&ctx) {
                self.dispatch_exception(Some(node.id), error);
            }
        }
    }

    // ---- 出站事件 ----

    /// 从链尾发起写操作。
    pub fn write(&self, msg: PipelineMessage) -> (WriteSignal, CompletionFuture) {
        let (promise, future) = completion_pair();
        let signal = self.dispatch_write(None, msg, &promise);
        (signal, future)
    }

    /// 写入并随即刷新。
    pub fn write_and_flush(&self, msg: PipelineMessage) -> (WriteSignal, CompletionFuture) {
        let (signal, future) = self.write(msg);
        self.flush();
        (signal, future)
    }

    /// 以调用方提供的 promise 从链尾发起写操作，便于跨线程封送场景先造
    /// future 再投递。
    pub fn write_with(&self, msg: PipelineMessage, promise: &CompletionPromise) -> WriteSignal {
        self.dispatch_write(None, msg, promise)
    }

    /// 以调用方提供的 promise 从链尾发起关闭。
    pub fn close_with(&self, promise: &CompletionPromise) {
        self.dispatch_close(None, promise);
    }

    pub(super) fn dispatch_write(
        &self,
        from: Option<u64>,
        msg: PipelineMessage,
        promise: &CompletionPromise,
    ) -> WriteSignal {
        match self.node_before(from) {
            Some(node) => {
                let ctx = HandlerContext::new(self, &node);
                match node.outbound().on_write(&ctx, msg, promise) {
                    Ok(signal) => signal,
                    Err(error) => {
                        promise.fail(error.clone());
                        self.dispatch_exception(None, error);
                        WriteSignal::FlowControlApplied
                    }
                }
            }
            None => self.terminal_write(msg, promise),
        }
    }

    /// 链头终点：消息收敛为字节并移交通道。
    fn terminal_write(&self, msg: PipelineMessage, promise: &CompletionPromise) -> WriteSignal {
        let Some(channel) = self.channel() else {
            promise.fail(CoreError::channel_closed("通道未绑定或已销毁"));
            return WriteSignal::FlowControlApplied;
        };
        match into_wire_bytes(msg) {
            Ok(bytes) => match channel.enqueue_write(bytes, promise.clone()) {
                Ok(signal) => signal,
                Err(error) => {
                    self.dispatch_exception(None, error);
                    WriteSignal::FlowControlApplied
                }
            },
            Err(error) => {
                promise.fail(error.clone());
                self.dispatch_exception(None, error);
                WriteSignal::FlowControlApplied
            }
        }
    }

    /// 从链尾发起刷新。
    pub fn flush(&self) {
        self.dispatch_flush(None);
    }

    pub(super) fn dispatch_flush(&self, from: Option<u64>) {
        match self.node_before(from) {
            Some(node) => {
                let ctx = HandlerContext::new(self, &node);
                node.outbound().on_flush(&ctx);
            }
            None => {
                if let Some(channel) = self.channel() {
                    channel.begin_flush();
                }
            }
        }
    }

    /// 从链尾发起关闭。
    pub fn close(&self) -> CompletionFuture {
        let (promise, future) = completion_pair();
        self.dispatch_close(None, &promise);
        future
    }

    pub(super) fn dispatch_close(&self, from: Option<u64>, promise: &CompletionPromise) {
        match self.node_before(from) {
            Some(node) => {
                let ctx = HandlerContext::new(self, &node);
                node.outbound().on_close(&ctx, promise);
            }
            None => match self.channel() {
                Some(channel) => channel.begin_close(promise.clone()),
                None => promise.fail(CoreError::channel_closed("通道未绑定或已销毁")),
            },
        }
    }
}
