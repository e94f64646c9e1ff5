#![deny(unsafe_code)]
#![doc = "flint-core: 事件驱动通道流水线框架的运行时无关核心。"]
#![doc = ""]
#![doc = "本 crate 承载四块硬核心：零拷贝缓冲引擎（`buffer`）、自适应接收尺寸"]
#![doc = "算法（`sizer`）、可热改的 Handler 流水线（`pipeline`）与可回放的帧解码"]
#![doc = "状态机（`codec`）。具体传输（事件循环、套接字）由 `flint-transport-*`"]
#![doc = "系列 crate 按 `channel` 模块的契约落地。"]

pub mod buffer;
pub mod channel;
pub mod codec;
pub mod error;
pub mod pipeline;
pub mod sizer;

pub use buffer::{BufferAllocator, ByteBuf, CompositeBuf, RecyclingPool};
pub use channel::{
    Channel, ChannelConfig, ChannelOption, ChannelState, CompletionFuture, CompletionPromise,
    OptionValue, WriteSignal,
};
pub use codec::{ReplayCursor, ReplayDecode, ReplayingDecoder};
pub use error::{CoreError, ErrorCategory};
pub use pipeline::{
    Handler, HandlerContext, InboundHandler, OutboundHandler, Pipeline, PipelineMessage, UserEvent,
};
pub use sizer::AdaptiveReceiveBufferSizer;

/// 统一的 Result 别名，默认错误类型为 [`CoreError`]。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;
