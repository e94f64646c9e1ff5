use std::any::Any;

use bytes::Bytes;

use crate::buffer::ByteBuf;

/// 流水线中流动的消息体。
///
/// # 设计背景（Why）
/// - 入站方向：传输层产出 [`ByteBuf`]，解码器逐级把它替换为业务对象；
///   出站方向：业务对象经编码器收敛为字节后抵达通道终点。
/// - 用类型擦除的 `User` 变体承载业务对象，避免流水线对协议类型泛型化，
///   保持 Handler 链的对象安全。
///
/// # 契约说明（What）
/// - `Buffer`：独占可变的平坦缓冲；
/// - `Shared`：冻结后的共享只读字节（例如切片转发、零拷贝回显）；
/// - `User`：任意 `Send + Sync` 业务对象。
#[derive(Debug)]
pub enum PipelineMessage {
    /// 独占可变缓冲。
    Buffer(ByteBuf),
    /// 共享只读字节。
    Shared(Bytes),
    /// 类型擦除的业务对象。
    User(Box<dyn Any + Send + Sync>),
}

impl PipelineMessage {
    /// 包装业务对象。
    pub fn from_user<T: Any + Send + Sync>(value: T) -> Self {
        PipelineMessage::User(Box::new(value))
    }

    /// 尝试取出指定类型的业务对象；类型不符时原样归还。
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Box<T>, PipelineMessage> {
        match self {
            PipelineMessage::User(any) => any.downcast::<T>().map_err(PipelineMessage::User),
            other => Err(other),
        }
    }

    /// 是否为字节形态（`Buffer` 或 `Shared`）。
    pub fn is_bytes(&self) -> bool {
        matches!(self, PipelineMessage::Buffer(_) | PipelineMessage::Shared(_))
    }
}

impl From<ByteBuf> for PipelineMessage {
    fn from(buf: ByteBuf) -> Self {
        PipelineMessage::Buffer(buf)
    }
}

impl From<Bytes> for PipelineMessage {
    fn from(bytes: Bytes) -> Self {
        PipelineMessage::Shared(bytes)
    }
}

/// 穿越入站链路的用户自定义事件（握手完成、空闲超时等）。
pub struct UserEvent {
    label: &'static str,
    payload: Box<dyn Any + Send + Sync>,
}

impl UserEvent {
    /// 以标签与负载构造事件。
    pub fn new<T: Any + Send + Sync>(label: &'static str, payload: T) -> Self {
        Self {
            label,
            payload: Box::new(payload),
        }
    }

    /// 事件标签，用于日志与快速分流。
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// 按类型借用负载。
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }
}

impl std::fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserEvent").field("label", &self.label).finish()
    }
}
