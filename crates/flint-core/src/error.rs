//! 核心错误域。
//!
//! # 设计背景（Why）
//! - 传输、流水线与解码在不同层次产生的故障需要合流为统一的稳定错误码，
//!   才能让上层 Handler（日志、告警、降级）不解析字符串就做出处置决策。
//! - 错误分类直接驱动通道的关闭策略：解码错误按约定关闭连接，I/O 错误
//!   只有在传输已不可用时才关闭，写失败默认只让该次写的 future 失败。
//!
//! # 契约说明（What）
//! - [`CoreError`]：携带 `<域>.<语义>` 格式的 `'static` 错误码、面向排障
//!   人员的消息、可选底层原因与 [`ErrorCategory`] 分类。
//! - [`codes`]：本 crate 预留的错误码常量；传输实现应在自己的命名空间下
//!   补充（如 `flint.transport.tcp.*`）。
//! - 纯编程/契约错误（越界索引、非法参数顺序）不会出现在这里：它们在
//!   调用点直接 panic，属于 bug 而非可恢复故障。
//!
//! # 风险提示（Trade-offs）
//! - 错误码使用 `&'static str` 而非枚举，换取跨 crate 扩展能力；拼写错误
//!   只能靠 [`codes`] 常量与评审约束。

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// 框架内预留的稳定错误码。
pub mod codes {
    /// 通道已处于终态，操作被拒绝。
    pub const CHANNEL_CLOSED: &str = "flint.core.channel.closed";
    /// 通道关闭时尚未完成的写操作被放弃。
    pub const WRITE_ABORTED: &str = "flint.core.channel.write_aborted";
    /// 配置项的值类型与期望不符。
    pub const CONFIG_INVALID_OPTION: &str = "flint.core.config.invalid_option";
    /// 高低水位线配置互相矛盾。
    pub const CONFIG_INVALID_WATERMARK: &str = "flint.core.config.invalid_watermark";
    /// 自适应尺寸器的边界参数非法。
    pub const SIZER_INVALID_BOUNDS: &str = "flint.core.sizer.invalid_bounds";
    /// 解码器判定字节流已不可信。
    pub const CODEC_MALFORMED_FRAME: &str = "flint.core.codec.malformed_frame";
    /// 未经编码的用户消息到达流水线头部的字节终点。
    pub const PIPELINE_UNENCODED: &str = "flint.core.pipeline.unencoded_message";
    /// 流水线中找不到指定名称的 Handler。
    pub const PIPELINE_HANDLER_MISSING: &str = "flint.core.pipeline.handler_missing";
    /// 流水线中已存在同名 Handler。
    pub const PIPELINE_DUPLICATE_NAME: &str = "flint.core.pipeline.duplicate_name";
    /// 完成通知在被解析前即被丢弃。
    pub const PROMISE_ABANDONED: &str = "flint.core.promise.abandoned";
    /// 操作在规定时限内未完成。
    pub const TIMEOUT: &str = "flint.core.timeout";
}

/// 错误处置分类，决定事件如何在流水线与通道之间流转。
///
/// # 契约说明（What）
/// - `Decode`：帧已畸形，字节流不可信，约定策略是关闭连接；
/// - `Io { fatal }`：`fatal = true` 表示传输已不可用（对端复位、管道断裂），
///   通道应进入 `Closed`；`fatal = false` 的读写失败彼此独立，不触发关闭；
/// - `Timeout` / `Cancelled`：操作级别的失败，不代表传输损坏；
/// - `Closed`：操作到达时通道已是终态；
/// - `Contract`：构造期参数校验失败（配置、边界），属于调用方缺陷，但发生
///   在可返回 `Result` 的入口，故以值而非 panic 呈现。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 构造期契约校验失败。
    Contract,
    /// 帧解码失败，字节流不可信。
    Decode,
    /// I/O 故障；`fatal` 指示传输是否已不可用。
    Io {
        /// 为真时通道必须转入 `Closed`。
        fatal: bool,
    },
    /// 操作超时。
    Timeout,
    /// 操作被取消。
    Cancelled,
    /// 通道已关闭。
    Closed,
}

impl ErrorCategory {
    /// 此类错误是否要求通道转入终态。
    pub fn closes_channel(self) -> bool {
        matches!(self, ErrorCategory::Decode | ErrorCategory::Io { fatal: true })
    }
}

/// `CoreError` 是跨层共享的稳定错误载体。
///
/// # 设计背景（Why）
/// - Handler 链路上的任何参与者都可能观察到错误（`on_exception_caught`），
///   因此错误必须 `Send + Sync + 'static`，并携带足够的机读上下文。
///
/// # 契约说明（What）
/// - `code`：`<域>.<语义>` 约定的稳定字符串，见 [`codes`]；
/// - `message`：面向排障人员的描述，不含敏感信息；
/// - `category`：驱动关闭/重试策略的分类，默认 `Io { fatal: false }`；
/// - `cause`：可选底层原因，经 `source()` 暴露完整链路。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    category: ErrorCategory,
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl CoreError {
    /// 构造核心错误，分类默认为非致命 I/O。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            category: ErrorCategory::Io { fatal: false },
            cause: None,
        }
    }

    /// 叠加处置分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// 叠加底层原因。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 排障描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 处置分类。
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// 是否要求通道关闭，等价于 `category().closes_channel()`。
    pub fn closes_channel(&self) -> bool {
        self.category.closes_channel()
    }

    /// 构造"通道已关闭"错误。
    pub fn channel_closed(detail: &'static str) -> Self {
        Self::new(codes::CHANNEL_CLOSED, detail).with_category(ErrorCategory::Closed)
    }

    /// 构造解码错误；按约定该分类会关闭连接。
    pub fn malformed_frame(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::CODEC_MALFORMED_FRAME, message).with_category(ErrorCategory::Decode)
    }

    /// 构造超时错误，消息中附带等待时长。
    pub fn timeout(what: &'static str, waited: Duration) -> Self {
        Self::new(codes::TIMEOUT, format!("{what} timed out after {waited:?}"))
            .with_category(ErrorCategory::Timeout)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl StdError for CoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl Clone for CoreError {
    fn clone(&self) -> Self {
        // cause 不可克隆，复制时降级为文本保留在 message 尾部。
        let message = match &self.cause {
            Some(cause) => Cow::Owned(format!("{} ({cause})", self.message)),
            None => self.message.clone(),
        };
        Self {
            code: self.code,
            message,
            category: self.category,
            cause: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_drives_close_policy() {
        assert!(CoreError::malformed_frame("bad length").closes_channel());
        assert!(
            CoreError::new("flint.test.io", "reset")
                .with_category(ErrorCategory::Io { fatal: true })
                .closes_channel()
        );
        assert!(
            !CoreError::new("flint.test.io", "partial write").closes_channel(),
            "非致命 I/O 错误不应关闭通道"
        );
        assert!(!CoreError::channel_closed("write after close").closes_channel());
    }

    #[test]
    fn clone_folds_cause_into_message() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err = CoreError::new("flint.test.io", "read failed").with_cause(io);
        let cloned = err.clone();
        assert!(cloned.message().contains("peer reset"));
        assert!(cloned.source().is_none());
    }
}
