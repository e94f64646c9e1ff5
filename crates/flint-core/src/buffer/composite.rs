use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;

use super::byte_buf::ByteBuf;

/// 追加写触发新段分配时的最小段容量。
const MIN_SEGMENT: usize = 64;

/// `CompositeBuf` 把多段 [`ByteBuf`] 组合成一个逻辑缓冲。
///
/// # 设计背景（Why）
/// - 解码器聚合、头体分离发送等场景天然产生多段字节；复合视图让上层按
///   单一连续缓冲的方式读写，省掉聚合拷贝。
/// - 段查找是热路径：累积偏移表配合最近命中缓存覆盖顺序访问，随机访问
///   回退到偏移表上的二分查找（O(log n)）。
///
/// # 契约说明（What）
/// - 所有读写操作与平坦 [`ByteBuf`] 行为一致；跨段边界的读写被拆分后按段
///   依次执行。
/// - 段在加入时被压缩并移交所有权（独占模型）；需要跨持有者共享时应先
///   [`ByteBuf::freeze`] 再分发。
/// - 追加写先填满尾段剩余空间，再追加新段；非尾段的多余容量不参与写入。
#[derive(Debug)]
pub struct CompositeBuf {
    segments: Vec<ByteBuf>,
    starts: Vec<usize>,
    reader: usize,
    writer: usize,
    last_hit: AtomicUsize,
}

impl Default for CompositeBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeBuf {
    /// 创建空的复合缓冲。
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            starts: Vec::new(),
            reader: 0,
            writer: 0,
            last_hit: AtomicUsize::new(0),
        }
    }

    /// 由既有缓冲列表构建；无可读字节的段被丢弃。
    pub fn from_bufs(bufs: impl IntoIterator<Item = ByteBuf>) -> Self {
        let mut composite = Self::new();
        for buf in bufs {
            if buf.is_readable() {
                composite.add_buf(buf);
            }
        }
        composite
    }

    /// 追加一段缓冲；段先被压缩为 `[0, len)` 窗口，随后由本缓冲独占持有。
    pub fn add_buf(&mut self, mut buf: ByteBuf) {
        buf.discard_read_bytes();
        self.starts.push(self.writer);
        self.writer += buf.writer_index();
        self.segments.push(buf);
    }

    /// 段数量。
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// 读游标。
    pub fn reader_index(&self) -> usize {
        self.reader
    }

    /// 写游标。
    pub fn writer_index(&self) -> usize {
        self.writer
    }

    /// 回拨或前移读游标；必须落在 `[0, writer]` 内。
    pub fn set_reader_index(&mut self, index: usize) {
        assert!(
            index <= self.writer,
            "reader index {index} 超出 writer index {}",
            self.writer
        );
        self.reader = index;
    }

    /// 尚未读取的字节数。
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    /// 是否还有可读字节。
    pub fn is_readable(&self) -> bool {
        self.reader < self.writer
    }

    /// 当前容量：已写字节加尾段剩余可写空间。
    pub fn capacity(&self) -> usize {
        self.writer + self.segments.last().map_or(0, ByteBuf::writable_bytes)
    }

    /// 全局索引映射到（段序号，段内偏移）。
    ///
    /// # 逻辑解析（How）
    /// - 先查最近命中缓存（顺序读写几乎总是命中同一段）；
    /// - 未命中时对累积偏移表做二分：取最后一个 `start ≤ index` 的段，
    ///   零宽段与后继共享起点，取后者即自然跳过。
    fn locate(&self, index: usize) -> (usize, usize) {
        debug_assert!(index < self.writer);
        let hit = self.last_hit.load(Ordering::Relaxed);
        if let Some(seg) = self.segments.get(hit) {
            let start = self.starts[hit];
            if index >= start && index < start + seg.writer_index() {
                return (hit, index - start);
            }
        }
        let seg_index = self.starts.partition_point(|start| *start <= index) - 1;
        self.last_hit.store(seg_index, Ordering::Relaxed);
        (seg_index, index - self.starts[seg_index])
    }

    /// 绝对读取：把 `[index, index + dst.len())` 拷贝进 `dst`，跨段自动拆分。
    pub fn get_slice(&self, index: usize, dst: &mut [u8]) {
        self.check_bounds(index, dst.len());
        let mut copied = 0;
        while copied < dst.len() {
            let (seg_index, local) = self.locate(index + copied);
            let seg = &self.segments[seg_index];
            let take = (seg.writer_index() - local).min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(seg.slice(local, take));
            copied += take;
        }
    }

    /// 绝对写入：覆盖已写区域内的 `[index, index + src.len())`，跨段自动拆分。
    pub fn set_slice(&mut self, index: usize, src: &[u8]) {
        self.check_bounds(index, src.len());
        let mut written = 0;
        while written < src.len() {
            let (seg_index, local) = self.locate(index + written);
            let seg = &mut self.segments[seg_index];
            let take = (seg.writer_index() - local).min(src.len() - written);
            seg.set_slice(local, &src[written..written + take]);
            written += take;
        }
    }

    /// 读取 `dst.len()` 字节并推进读游标。
    pub fn read_slice(&mut self, dst: &mut [u8]) {
        assert!(
            dst.len() <= self.readable_bytes(),
            "读取 {} 字节但仅剩 {} 字节可读",
            dst.len(),
            self.readable_bytes()
        );
        self.get_slice(self.reader, dst);
        self.reader += dst.len();
    }

    /// 读取一个字节。
    pub fn read_u8(&mut self) -> u8 {
        let mut b = [0u8; 1];
        self.read_slice(&mut b);
        b[0]
    }

    /// 读取大端 u16。
    pub fn read_u16(&mut self) -> u16 {
        let mut b = [0u8; 2];
        self.read_slice(&mut b);
        u16::from_be_bytes(b)
    }

    /// 读取大端 u32。
    pub fn read_u32(&mut self) -> u32 {
        let mut b = [0u8; 4];
        self.read_slice(&mut b);
        u32::from_be_bytes(b)
    }

    /// 读取大端 u64。
    pub fn read_u64(&mut self) -> u64 {
        let mut b = [0u8; 8];
        self.read_slice(&mut b);
        u64::from_be_bytes(b)
    }

    /// 读取 `len` 字节为新缓冲（深拷贝）并推进读游标。
    pub fn read_bytes(&mut self, len: usize) -> ByteBuf {
        let out = self.copy(self.reader, len);
        self.reader += len;
        out
    }

    /// 跳过 `len` 个可读字节。
    pub fn skip(&mut self, len: usize) {
        assert!(
            len <= self.readable_bytes(),
            "跳过 {len} 字节但仅剩 {} 字节可读",
            self.readable_bytes()
        );
        self.reader += len;
    }

    /// 追加 `src`：先填满尾段剩余空间，再按需追加新段。
    pub fn write_slice(&mut self, src: &[u8]) {
        let mut rest = src;
        if let Some(tail) = self.segments.last_mut() {
            let take = tail.writable_bytes().min(rest.len());
            if take > 0 {
                tail.write_slice(&rest[..take]);
                self.writer += take;
                rest = &rest[take..];
            }
        }
        if !rest.is_empty() {
            let mut seg = ByteBuf::with_capacity(rest.len().max(MIN_SEGMENT));
            seg.write_slice(rest);
            self.starts.push(self.writer);
            self.writer += rest.len();
            self.segments.push(seg);
        }
    }

    /// 写入一个字节。
    pub fn write_u8(&mut self, value: u8) {
        self.write_slice(&[value]);
    }

    /// 写入大端 u16。
    pub fn write_u16(&mut self, value: u16) {
        self.write_slice(&value.to_be_bytes());
    }

    /// 写入大端 u32。
    pub fn write_u32(&mut self, value: u32) {
        self.write_slice(&value.to_be_bytes());
    }

    /// 写入大端 u64。
    pub fn write_u64(&mut self, value: u64) {
        self.write_slice(&value.to_be_bytes());
    }

    /// 把 `src` 预写到所有可读字节之前：以独立头段插入，不搬移既有数据。
    ///
    /// # 契约说明（What）
    /// - **前置条件**：`reader_index() == 0`——预写用于出站帧组装（先 body
    ///   后回填头），此时尚无已消费字节；违反视为契约缺陷并 panic。
    pub fn write_slice_ahead(&mut self, src: &[u8]) {
        assert!(
            self.reader == 0,
            "复合缓冲的预写要求 reader index 为 0，当前为 {}",
            self.reader
        );
        let head = ByteBuf::from_slice(src);
        self.segments.insert(0, head);
        self.writer += src.len();
        self.rebuild_starts();
    }

    /// 向所有可读字节之前预写大端 u32。
    pub fn write_u32_ahead(&mut self, value: u32) {
        self.write_slice_ahead(&value.to_be_bytes());
    }

    /// 在可读窗口内线性扫描首个满足 `predicate` 的字节，返回相对读游标的
    /// 偏移。
    pub fn index_of(&self, predicate: impl Fn(u8) -> bool) -> Option<usize> {
        let mut offset = 0;
        let mut index = self.reader;
        while index < self.writer {
            let (seg_index, local) = self.locate(index);
            let seg = &self.segments[seg_index];
            let window = seg.slice(local, seg.writer_index() - local);
            if let Some(pos) = window.iter().position(|b| predicate(*b)) {
                return Some(offset + pos);
            }
            offset += window.len();
            index += window.len();
        }
        None
    }

    /// `[index, index + len)` 的深拷贝。
    pub fn copy(&self, index: usize, len: usize) -> ByteBuf {
        self.check_bounds(index, len);
        let mut out = ByteBuf::with_capacity(len);
        let mut tmp = vec![0u8; len];
        self.get_slice(index, &mut tmp);
        out.write_slice(&tmp);
        out
    }

    /// `[index, index + len)` 的零拷贝视图序列，按段边界切开。
    pub fn slices(&self, index: usize, len: usize) -> Vec<&[u8]> {
        self.check_bounds(index, len);
        let mut out = Vec::new();
        let mut taken = 0;
        while taken < len {
            let (seg_index, local) = self.locate(index + taken);
            let seg = &self.segments[seg_index];
            let take = (seg.writer_index() - local).min(len - taken);
            out.push(seg.slice(local, take));
            taken += take;
        }
        out
    }

    /// 丢弃已被整段消费的前缀段，返还其存储压力。
    pub fn discard_read_bytes(&mut self) {
        let mut dropped = 0;
        while let Some(first) = self.segments.first() {
            let width = first.writer_index();
            if width == 0 || dropped + width > self.reader {
                break;
            }
            self.segments.remove(0);
            dropped += width;
        }
        if dropped > 0 {
            self.reader -= dropped;
            self.writer -= dropped;
            self.rebuild_starts();
        }
    }

    /// 把全部可读字节拷贝为平坦缓冲。
    pub fn copy_readable(&self) -> ByteBuf {
        self.copy(self.reader, self.readable_bytes())
    }

    /// 冻结为共享只读的 `Bytes`；多段内容合并需要一次拷贝。
    pub fn freeze(self) -> bytes::Bytes {
        let mut flat = BytesMut::with_capacity(self.readable_bytes());
        for chunk in self.slices(self.reader, self.readable_bytes()) {
            flat.extend_from_slice(chunk);
        }
        flat.freeze()
    }

    fn rebuild_starts(&mut self) {
        self.starts.clear();
        let mut offset = 0;
        for seg in &self.segments {
            self.starts.push(offset);
            offset += seg.writer_index();
        }
        self.last_hit.store(0, Ordering::Relaxed);
    }

    fn check_bounds(&self, index: usize, len: usize) {
        assert!(
            index + len <= self.writer,
            "区间 [{index}, {}) 超出已写区域 [0, {})",
            index + len,
            self.writer
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn composite_of(parts: &[&[u8]]) -> CompositeBuf {
        CompositeBuf::from_bufs(parts.iter().map(|p| ByteBuf::from_slice(p)))
    }

    #[test]
    fn reads_match_flat_buffer() {
        let composite = composite_of(&[b"ab", b"cde", b"f"]);
        let flat = ByteBuf::from_slice(b"abcdef");
        for index in 0..6 {
            for len in 0..=(6 - index) {
                let mut lhs = vec![0u8; len];
                let mut rhs = vec![0u8; len];
                composite.get_slice(index, &mut lhs);
                flat.get_slice(index, &mut rhs);
                assert_eq!(lhs, rhs, "index {index} len {len} 与平坦缓冲不一致");
            }
        }
    }

    #[test]
    fn integer_read_spanning_boundary() {
        let mut composite = composite_of(&[&[0xDE, 0xAD], &[0xBE, 0xEF]]);
        assert_eq!(composite.read_u32(), 0xDEAD_BEEF);
        assert!(!composite.is_readable());
    }

    #[test]
    fn set_slice_spanning_boundary() {
        let mut composite = composite_of(&[b"aaa", b"bbb"]);
        composite.set_slice(2, b"XY");
        let mut out = vec![0u8; 6];
        composite.get_slice(0, &mut out);
        assert_eq!(&out, b"aaXYbb");
    }

    #[test]
    fn append_fills_tail_then_grows() {
        let mut tail = ByteBuf::with_capacity(4);
        tail.write_slice(b"ab");
        let mut composite = CompositeBuf::from_bufs([tail]);
        composite.write_slice(b"cdef");
        assert_eq!(composite.readable_bytes(), 6);
        assert_eq!(composite.segment_count(), 2, "尾段填满后才追加新段");
        let mut out = vec![0u8; 6];
        composite.get_slice(0, &mut out);
        assert_eq!(&out, b"abcdef");
    }

    #[test]
    fn locate_uses_binary_search_over_many_segments() {
        let parts: Vec<Vec<u8>> = (0u8..32).map(|i| vec![i; 3]).collect();
        let composite =
            CompositeBuf::from_bufs(parts.iter().map(|p| ByteBuf::from_slice(p)));
        // 远离缓存命中的随机访问走二分路径。
        let mut byte = [0u8; 1];
        composite.get_slice(95, &mut byte);
        assert_eq!(byte[0], 31);
        composite.get_slice(0, &mut byte);
        assert_eq!(byte[0], 0);
        composite.get_slice(47, &mut byte);
        assert_eq!(byte[0], 15);
    }

    #[test]
    fn ahead_prepend_equals_header_first() {
        let mut composite = composite_of(&[b"hel", b"lo"]);
        composite.write_u32_ahead(5);
        let mut out = vec![0u8; composite.readable_bytes()];
        composite.get_slice(0, &mut out);
        assert_eq!(&out, &[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn discard_drops_consumed_segments() {
        let mut composite = composite_of(&[b"ab", b"cd", b"ef"]);
        composite.skip(3);
        composite.discard_read_bytes();
        assert_eq!(composite.segment_count(), 2, "仅整段消费的前缀被移除");
        assert_eq!(composite.reader_index(), 1);
        assert_eq!(composite.copy_readable().readable(), b"def");
    }

    #[test]
    fn index_of_across_segments() {
        let composite = composite_of(&[b"foo\r", b"\nbar"]);
        assert_eq!(composite.index_of(|b| b == b'\n'), Some(4));
    }

    #[test]
    fn freeze_concatenates_readable_window() {
        let mut composite = composite_of(&[b"ab", b"cd"]);
        composite.skip(1);
        assert_eq!(&composite.freeze()[..], b"bcd");
    }
}
