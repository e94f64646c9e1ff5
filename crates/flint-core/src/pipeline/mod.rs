//! 通道流水线。
//!
//! # 模块架构（Why）
//! - 入站事件（数据到达、通道活跃/失活、异常、用户事件）严格头→尾传播，
//!   出站操作（写、刷新、关闭）严格尾→头传播，两个方向共享一张有序节点
//!   表；Handler 借助方向性默认实现自由选择拦截、改写或放行。
//! - 链路结构采用"节点仓库 + 有序 id 表"而非裸前驱/后继指针：分发过程中
//!   的插入与移除不会使在途遍历悬空，移除自身的 Handler 也不会破坏链路。
//!
//! # 设计总览（How）
//! - [`chain`]：[`Pipeline`] 本体与分发引擎；
//! - [`handler`]：[`InboundHandler`] / [`OutboundHandler`] 合约；
//! - [`context`]：回调期间的 [`HandlerContext`] 视图；
//! - [`message`]：消息体与用户事件的类型擦除载体。

pub mod chain;
pub mod context;
pub mod handler;
pub mod message;

pub use chain::Pipeline;
pub use context::HandlerContext;
pub use handler::{Handler, InboundHandler, OutboundHandler};
pub use message::{PipelineMessage, UserEvent};
