//! 零拷贝缓冲引擎。
//!
//! # 模块架构（Why）
//! - 将平坦缓冲、复合缓冲与缓冲池拆分为独立子模块，对齐 Netty ByteBuf、
//!   Tokio Bytes 等主流框架的职责分离实践。
//! - 所有权模型遵循"独占可变、共享只读"两态：[`ByteBuf`] 在持有者手中独占
//!   可变，[`ByteBuf::freeze`] 之后以 `bytes::Bytes` 形式共享只读，借用检查器
//!   负责杜绝并发写入。
//!
//! # 设计总览（How）
//! - [`byte_buf`]：带独立读写游标与前置预留区的平坦缓冲，支撑零拷贝切片与
//!   头部预写（先写 body、再回填长度头，不做任何搬移）。
//! - [`composite`]：多段缓冲的统一视图，通过累积偏移表 + 最近命中缓存 +
//!   二分查找把全局索引映射到（段，段内偏移）。
//! - [`pool`]：自由链表式缓冲池，传输层读循环在此租借接收缓冲并归还剩余
//!   容量，避免每次读取都向分配器要内存。

pub mod byte_buf;
pub mod composite;
pub mod pool;

pub use byte_buf::ByteBuf;
pub use composite::CompositeBuf;
pub use pool::{BufferAllocator, PoolStats, RecyclingPool, UnpooledAllocator};
