//! 通道契约模块。
//!
//! # 模块架构（Why）
//! - 流水线终点需要一个与具体传输解耦的通道抽象：出站事件走到链路头部后
//!   由 [`Channel`] 落地为真实 I/O；`flint-transport-*` 系列 crate 按此契约
//!   实现 TCP 等介质。
//! - 生命周期状态机、写背压信号与完成通知都属于"所有协议共享的语义"，
//!   集中定义避免各传输各自发明。
//!
//! # 设计总览（How）
//! - [`ChannelState`]：`Idle → Open → Bound → Connected → Closed` 状态机，
//!   客户端通道允许 `Open → Connected` 直达；`Closed` 为终态。
//! - [`WriteSignal`]：写路径的三态背压反馈。
//! - [`promise`]：基于一次性信道的完成通知（promise/future 对），在通道所
//!   属事件循环线程上解析。
//! - [`config`]：带类型校验的通道选项集。

pub mod config;
pub mod promise;

use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::CoreError;
use crate::pipeline::PipelineMessage;

pub use config::{ChannelConfig, ChannelOption, ConfigError, OptionValue};
pub use promise::{completion_pair, op_pair, CompletionFuture, CompletionPromise, OpFuture, OpPromise};

/// 通道生命周期状态机。
///
/// # 契约说明（What）
/// - `Idle`：对象已创建，尚未持有套接字资源；
/// - `Open`：套接字已创建并登记到事件循环；
/// - `Bound`：已绑定本地地址（服务端监听或显式 bind）；
/// - `Connected`：连接建立，可全双工读写，进入时广播 `channel_active`；
/// - `Closed`：终态，进入时广播 `channel_inactive`，此后任何事件被忽略。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelState {
    /// 初始态，尚未分配套接字。
    Idle,
    /// 套接字已创建。
    Open,
    /// 已绑定本地地址。
    Bound,
    /// 连接建立，可读写。
    Connected,
    /// 终态。
    Closed,
}

impl ChannelState {
    /// 是否处于可读写的活跃态。
    pub fn is_active(self) -> bool {
        matches!(self, ChannelState::Connected)
    }

    /// 是否已进入终态。
    pub fn is_closed(self) -> bool {
        matches!(self, ChannelState::Closed)
    }
}

/// 写入反馈信号。
///
/// # 契约说明（What）
/// - `Accepted`：消息进入写队列，尚未刷出；
/// - `AcceptedAndFlushed`：消息已随刷新写出；
/// - `FlowControlApplied`：写队列越过高水位，调用方应减速，待
///   `writability_changed(true)` 后恢复。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteSignal {
    /// 已入队，待刷出。
    Accepted,
    /// 已入队并刷出。
    AcceptedAndFlushed,
    /// 触发背压，调用方应减速。
    FlowControlApplied,
}

/// `Channel` 抽象单个 I/O 连接的控制面能力，是流水线出站方向的终点。
///
/// # 契约说明（What）
/// - 所有方法线程安全；但实现必须把真实 I/O 与流水线事件广播封送到通道所
///   属的事件循环线程执行（跨线程调用转为任务投递）。
/// - `enqueue_write` 只负责入队与水位核算；`Err` 表示消息在入队前即被拒绝
///   （此时实现已 fail 对应 promise）。
/// - `request_read(false)` 协作式暂停读循环（`AUTO_READ` 语义），
///   `request_read(true)` 恢复。
pub trait Channel: Send + Sync + 'static {
    /// 进程内唯一的通道标识，用于日志与追踪关联。
    fn id(&self) -> u64;

    /// 当前状态。
    fn state(&self) -> ChannelState;

    /// 本地地址（已绑定时）。
    fn local_addr(&self) -> Option<SocketAddr>;

    /// 对端地址（已连接时）。
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// 写队列是否仍低于高水位。
    fn is_writable(&self) -> bool;

    /// 把一段已编码字节挂入写队列。
    fn enqueue_write(
        &self,
        payload: Bytes,
        promise: CompletionPromise,
    ) -> Result<WriteSignal, CoreError>;

    /// 请求把写队列刷向套接字。
    fn begin_flush(&self);

    /// 请求关闭通道；`promise` 在关闭完成后解析。
    fn begin_close(&self, promise: CompletionPromise);

    /// 协作式开关读循环。
    fn request_read(&self, enabled: bool);
}

/// 终端写入前的消息形态收敛：流水线头部只接受字节。
pub(crate) fn into_wire_bytes(msg: PipelineMessage) -> Result<Bytes, CoreError> {
    match msg {
        PipelineMessage::Buffer(buf) => Ok(buf.freeze()),
        PipelineMessage::Shared(bytes) => Ok(bytes),
        PipelineMessage::User(_) => Err(CoreError::new(
            crate::error::codes::PIPELINE_UNENCODED,
            "未经编码的用户消息到达通道终点",
        )),
    }
}
