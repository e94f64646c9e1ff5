//! 通道配置与选项校验。
//!
//! # 设计背景（Why）
//! - 配置以显式结构体注入（构造期依赖注入，无全局单例），同时保留
//!   "命名选项 + 类型校验"的通用入口，方便网关类调用方从配置表驱动。
//! - 高低水位、接收尺寸边界这类成对参数在设置时即校验一致性，把配置
//!   错误挡在连接建立之前。

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::error::{codes, CoreError, ErrorCategory};
use crate::sizer::AdaptiveReceiveBufferSizer;

/// 通道可调选项的名字空间。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelOption {
    /// 内核接收缓冲（`SO_RCVBUF`）。
    SoRcvBuf,
    /// 内核发送缓冲（`SO_SNDBUF`）。
    SoSndBuf,
    /// 地址复用（`SO_REUSEADDR`）。
    SoReuseAddr,
    /// 禁用 Nagle（`TCP_NODELAY`）。
    TcpNodelay,
    /// 连接超时毫秒数。
    ConnectTimeoutMillis,
    /// 是否自动驱动读循环。
    AutoRead,
    /// 写队列高水位（字节）。
    WriteHighWaterMark,
    /// 写队列低水位（字节）。
    WriteLowWaterMark,
}

impl fmt::Display for ChannelOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelOption::SoRcvBuf => "SO_RCVBUF",
            ChannelOption::SoSndBuf => "SO_SNDBUF",
            ChannelOption::SoReuseAddr => "SO_REUSEADDR",
            ChannelOption::TcpNodelay => "TCP_NODELAY",
            ChannelOption::ConnectTimeoutMillis => "CONNECT_TIMEOUT_MILLIS",
            ChannelOption::AutoRead => "AUTO_READ",
            ChannelOption::WriteHighWaterMark => "WRITE_HIGH_WATER_MARK",
            ChannelOption::WriteLowWaterMark => "WRITE_LOW_WATER_MARK",
        };
        f.write_str(name)
    }
}

/// 选项值的三种形态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionValue {
    /// 布尔开关。
    Bool(bool),
    /// 字节数或其它尺寸。
    Size(usize),
    /// 毫秒时长。
    Millis(u64),
}

/// 配置校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 选项的值类型与期望不符。
    #[error("选项 {option} 期望 {expected}，得到 {got:?}")]
    TypeMismatch {
        /// 被设置的选项。
        option: ChannelOption,
        /// 期望的值形态。
        expected: &'static str,
        /// 实际传入的值。
        got: OptionValue,
    },
    /// 低水位高于高水位。
    #[error("低水位 {low} 不得高于高水位 {high}")]
    InvalidWatermark {
        /// 低水位。
        low: usize,
        /// 高水位。
        high: usize,
    },
}

impl From<ConfigError> for CoreError {
    fn from(error: ConfigError) -> Self {
        let code = match &error {
            ConfigError::TypeMismatch { .. } => codes::CONFIG_INVALID_OPTION,
            ConfigError::InvalidWatermark { .. } => codes::CONFIG_INVALID_WATERMARK,
        };
        CoreError::new(code, error.to_string())
            .with_category(ErrorCategory::Contract)
            .with_cause(error)
    }
}

/// 通道配置集。
///
/// # 契约说明（What）
/// - 字段可直接构造（结构体更新语法 + `Default`），也可经
///   [`ChannelConfig::set_option`] 的校验入口写入。
/// - 接收尺寸三元组供 [`AdaptiveReceiveBufferSizer`] 使用；套接字相关项由
///   传输实现于连接建立时落到内核。
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// 连接超时。
    pub connect_timeout: Duration,
    /// 是否自动驱动读循环。
    pub auto_read: bool,
    /// 接收缓冲的最小预测值。
    pub recv_min: usize,
    /// 接收缓冲的初始预测值。
    pub recv_initial: usize,
    /// 接收缓冲的最大预测值。
    pub recv_max: usize,
    /// 写队列高水位（字节）。
    pub write_high_water: usize,
    /// 写队列低水位（字节）。
    pub write_low_water: usize,
    /// `SO_REUSEADDR`。
    pub reuse_addr: bool,
    /// `TCP_NODELAY`。
    pub tcp_nodelay: bool,
    /// `SO_RCVBUF`；`None` 表示沿用内核默认。
    pub so_rcvbuf: Option<usize>,
    /// `SO_SNDBUF`；`None` 表示沿用内核默认。
    pub so_sndbuf: Option<usize>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            auto_read: true,
            recv_min: 64,
            recv_initial: 2048,
            recv_max: 65536,
            write_high_water: 64 * 1024,
            write_low_water: 32 * 1024,
            reuse_addr: false,
            tcp_nodelay: false,
            so_rcvbuf: None,
            so_sndbuf: None,
        }
    }
}

impl ChannelConfig {
    /// 经命名选项入口写入配置，值类型不符即拒绝。
    pub fn set_option(
        &mut self,
        option: ChannelOption,
        value: OptionValue,
    ) -> Result<(), ConfigError> {
        match (option, value) {
            (ChannelOption::SoRcvBuf, OptionValue::Size(size)) => self.so_rcvbuf = Some(size),
            (ChannelOption::SoSndBuf, OptionValue::Size(size)) => self.so_sndbuf = Some(size),
            (ChannelOption::SoReuseAddr, OptionValue::Bool(flag)) => self.reuse_addr = flag,
            (ChannelOption::TcpNodelay, OptionValue::Bool(flag)) => self.tcp_nodelay = flag,
            (ChannelOption::ConnectTimeoutMillis, OptionValue::Millis(millis)) => {
                self.connect_timeout = Duration::from_millis(millis);
            }
            (ChannelOption::AutoRead, OptionValue::Bool(flag)) => self.auto_read = flag,
            (ChannelOption::WriteHighWaterMark, OptionValue::Size(high)) => {
                if self.write_low_water > high {
                    return Err(ConfigError::InvalidWatermark {
                        low: self.write_low_water,
                        high,
                    });
                }
                self.write_high_water = high;
            }
            (ChannelOption::WriteLowWaterMark, OptionValue::Size(low)) => {
                if low > self.write_high_water {
                    return Err(ConfigError::InvalidWatermark {
                        low,
                        high: self.write_high_water,
                    });
                }
                self.write_low_water = low;
            }
            (option, got) => {
                let expected = match option {
                    ChannelOption::SoRcvBuf
                    | ChannelOption::SoSndBuf
                    | ChannelOption::WriteHighWaterMark
                    | ChannelOption::WriteLowWaterMark => "Size",
                    ChannelOption::SoReuseAddr
                    | ChannelOption::TcpNodelay
                    | ChannelOption::AutoRead => "Bool",
                    ChannelOption::ConnectTimeoutMillis => "Millis",
                };
                return Err(ConfigError::TypeMismatch {
                    option,
                    expected,
                    got,
                });
            }
        }
        Ok(())
    }

    /// 按接收尺寸三元组构建自适应尺寸器。
    pub fn build_sizer(&self) -> crate::Result<AdaptiveReceiveBufferSizer> {
        AdaptiveReceiveBufferSizer::new(self.recv_min, self.recv_initial, self.recv_max)
    }
}
