//! 编解码支撑。
//!
//! # 模块定位（Why）
//! - 具体线协议的编解码器属于外部协作者；本模块只提供所有协议共享的硬
//!   骨架：把 TCP 的"半包/粘包"字节流还原为离散消息的可回放状态机。
//!
//! # 设计总览（How）
//! - [`replay`]：检查点式解码——协议实现按"报文总是完整"的直线思路书写，
//!   字节不足时框架回滚读游标并在下次数据到达后从检查点状态重入。

pub mod replay;

pub use replay::{ReplayCursor, ReplayDecode, ReplayingDecoder};
