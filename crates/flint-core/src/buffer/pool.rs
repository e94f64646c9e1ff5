use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

use super::byte_buf::ByteBuf;

/// 缓冲分配器契约。
///
/// # 设计背景（Why）
/// - 统一缓冲租借入口，让传输层读循环在不关心内存策略的情况下获取接收
///   缓冲：既可以直接分配（[`UnpooledAllocator`]），也可以走自由链表复用
///   （[`RecyclingPool`]）。
///
/// # 契约说明（What）
/// - `acquire(min_capacity)`：返回容量不小于 `min_capacity` 的空缓冲，所有
///   权移交调用方。
/// - `give_back(storage)`：缓冲使用完毕后归还底层存储；实现可以复用，也可
///   以直接丢弃（默认行为）。
pub trait BufferAllocator: Send + Sync + 'static {
    /// 租借满足最小容量的空缓冲。
    fn acquire(&self, min_capacity: usize) -> ByteBuf;

    /// 归还底层存储，默认丢弃。
    fn give_back(&self, _storage: BytesMut) {}
}

/// 直接向分配器要内存的实现，适合测试与低频路径。
#[derive(Debug, Default)]
pub struct UnpooledAllocator;

impl BufferAllocator for UnpooledAllocator {
    fn acquire(&self, min_capacity: usize) -> ByteBuf {
        ByteBuf::with_capacity(min_capacity)
    }
}

/// 池统计快照，供观测与测试检查复用效果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 累计租借次数。
    pub leases: u64,
    /// 其中命中自由链表的次数。
    pub reuse_hits: u64,
    /// 当前自由链表中的存储块数量。
    pub retained: usize,
}

/// 自由链表式缓冲池。
///
/// # 逻辑解析（How）
/// - 归还的 `BytesMut` 清空后挂入链表，`acquire` 时从尾部寻找首个容量足够
///   的块复用；找不到就新分配。
/// - 链表长度由 `max_retained` 封顶，超出的归还直接丢弃，避免峰值流量把
///   内存长期钉死。
#[derive(Debug)]
pub struct RecyclingPool {
    free: Mutex<Vec<BytesMut>>,
    max_retained: usize,
    leases: AtomicU64,
    reuse_hits: AtomicU64,
}

impl RecyclingPool {
    /// 创建最多保留 `max_retained` 个空闲块的池。
    pub fn new(max_retained: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_retained,
            leases: AtomicU64::new(0),
            reuse_hits: AtomicU64::new(0),
        }
    }

    /// 读取统计快照。
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            leases: self.leases.load(Ordering::Relaxed),
            reuse_hits: self.reuse_hits.load(Ordering::Relaxed),
            retained: self.free.lock().len(),
        }
    }
}

impl Default for RecyclingPool {
    fn default() -> Self {
        Self::new(32)
    }
}

impl BufferAllocator for RecyclingPool {
    fn acquire(&self, min_capacity: usize) -> ByteBuf {
        self.leases.fetch_add(1, Ordering::Relaxed);
        let reused = {
            let mut free = self.free.lock();
            free.iter()
                .rposition(|block| block.capacity() >= min_capacity)
                .map(|at| free.swap_remove(at))
        };
        match reused {
            Some(block) => {
                self.reuse_hits.fetch_add(1, Ordering::Relaxed);
                ByteBuf::from_storage(block)
            }
            None => ByteBuf::with_capacity(min_capacity),
        }
    }

    fn give_back(&self, mut storage: BytesMut) {
        storage.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_retained {
            free.push(storage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_returned_storage() {
        let pool = RecyclingPool::new(4);
        let buf = pool.acquire(1024);
        assert!(buf.capacity() >= 1024);
        pool.give_back(buf.into_storage());

        let again = pool.acquire(512);
        assert!(again.capacity() >= 512);
        let stats = pool.stats();
        assert_eq!(stats.leases, 2);
        assert_eq!(stats.reuse_hits, 1, "第二次租借应命中自由链表");
    }

    #[test]
    fn undersized_blocks_are_skipped() {
        let pool = RecyclingPool::new(4);
        pool.give_back(BytesMut::with_capacity(16));
        let buf = pool.acquire(4096);
        assert!(buf.capacity() >= 4096);
        assert_eq!(pool.stats().reuse_hits, 0);
    }

    #[test]
    fn retention_is_capped() {
        let pool = RecyclingPool::new(1);
        pool.give_back(BytesMut::with_capacity(8));
        pool.give_back(BytesMut::with_capacity(8));
        assert_eq!(pool.stats().retained, 1);
    }
}
