//! 自适应接收缓冲尺寸算法。
//!
//! # 设计背景（Why）
//! - 读循环每次都要决定"下一个接收缓冲开多大"：开小了多一次系统调用，开
//!   大了浪费分配。本模块依据最近的真实读取量在一张预构建的单调尺寸表上
//!   滑动，给出下一次的预测值。
//! - 非对称迟滞是核心取舍：放大快（突发立即覆盖）、缩小慢（连续两次小读
//!   才降一档），避免在波动流量上来回震荡。
//!
//! # 契约说明（What）
//! - 尺寸表全局唯一：1..=16 线性递增，之后逐项翻倍直至表上限；配置的
//!   最小/初始/最大值被夹取到表项所在的索引窗口。
//! - [`AdaptiveReceiveBufferSizer::record`] 吞吐一次读取的字节数，
//!   [`AdaptiveReceiveBufferSizer::next_receive_size`] 给出当前预测，预测值
//!   恒落在 `[min, max]` 对应的表项内。

use std::sync::OnceLock;

use crate::error::{codes, CoreError, ErrorCategory};

/// 尺寸表上限；超过该值的配置会被夹取。
const MAX_TABLE_SIZE: usize = 1 << 26;

/// 放大步长；一次增长至少跨越的表项数。
const INDEX_INCREMENT: usize = 4;

/// 缩小步长。
const INDEX_DECREMENT: usize = 1;

fn size_table() -> &'static [usize] {
    static TABLE: OnceLock<Vec<usize>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: Vec<usize> = (1..=16).collect();
        let mut size = 32;
        while size <= MAX_TABLE_SIZE {
            table.push(size);
            size *= 2;
        }
        table
    })
}

/// 最小的 `i` 使 `table[i] >= value`；越过表尾时取尾项。
fn index_ceil(value: usize) -> usize {
    let table = size_table();
    table
        .iter()
        .position(|entry| *entry >= value)
        .unwrap_or(table.len() - 1)
}

/// 最大的 `i` 使 `table[i] <= value`。
fn index_floor(value: usize) -> usize {
    let table = size_table();
    table.partition_point(|entry| *entry <= value).saturating_sub(1)
}

/// 按近期流量预测下一次接收缓冲大小的迟滞状态机。
///
/// # 逻辑解析（How）
/// - 读取量落到"低一档表项"之下：第一次只竖旗（`decrease_now`），连续第二
///   次才真正降一档并收旗；
/// - 读取量触及当前预测值：立即放大，索引至少前进 [`INDEX_INCREMENT`] 档，
///   且直接跳到能覆盖本次读取量的表项，随后收旗；
/// - 中间地带（既不小也不大）收旗，保证"连续两次小读"的语义。
#[derive(Debug)]
pub struct AdaptiveReceiveBufferSizer {
    min_index: usize,
    max_index: usize,
    index: usize,
    decrease_now: bool,
}

impl AdaptiveReceiveBufferSizer {
    /// 以最小/初始/最大字节数构造；要求 `0 < min ≤ initial ≤ max`。
    pub fn new(min: usize, initial: usize, max: usize) -> crate::Result<Self> {
        if min == 0 || min > initial || initial > max {
            return Err(CoreError::new(
                codes::SIZER_INVALID_BOUNDS,
                format!("非法的尺寸边界: min={min}, initial={initial}, max={max}"),
            )
            .with_category(ErrorCategory::Contract));
        }
        let min_index = index_ceil(min);
        let max_index = index_floor(max.min(MAX_TABLE_SIZE)).max(min_index);
        let index = index_ceil(initial).clamp(min_index, max_index);
        Ok(Self {
            min_index,
            max_index,
            index,
            decrease_now: false,
        })
    }

    /// 默认档位：最小 64、初始 2048、最大 64 KiB。
    pub fn with_defaults() -> Self {
        Self::new(64, 2048, 65536).expect("内置边界必然合法")
    }

    /// 当前预测的下一次接收缓冲大小。
    pub fn next_receive_size(&self) -> usize {
        size_table()[self.index]
    }

    /// 反馈一次读取的实际字节数，推进迟滞状态机。
    pub fn record(&mut self, bytes_read: usize) {
        let table = size_table();
        let shrink_gate = table[self.index.saturating_sub(INDEX_DECREMENT).max(self.min_index)];
        if bytes_read < shrink_gate {
            if self.decrease_now {
                self.index = self.index.saturating_sub(INDEX_DECREMENT).max(self.min_index);
                self.decrease_now = false;
            } else {
                self.decrease_now = true;
            }
        } else if bytes_read >= table[self.index] {
            self.index = (self.index + INDEX_INCREMENT)
                .max(index_ceil(bytes_read))
                .min(self.max_index);
            self.decrease_now = false;
        } else {
            self.decrease_now = false;
        }
    }
}
