use bytes::{Bytes, BytesMut};

/// 扩容时的最小容量，避免小缓冲反复倍增。
const MIN_GROWTH: usize = 64;

/// `ByteBuf` 是带独立读写游标与前置预留区的平坦缓冲。
///
/// # 设计背景（Why）
/// - 读写游标分离让解码器无需手工记录"消费到哪了"，编码器无需记录"写到
///   哪了"，两侧可以在同一块存储上交替推进。
/// - 前置预留区（ahead 区）解决"先写 body 再补长度头"的经典需求：头部直接
///   写入预留区，不搬移任何已写字节。
///
/// # 逻辑解析（How）
/// - 底层为一块保持全初始化的 `BytesMut`；`origin` 标记逻辑索引 0 在存储中
///   的位置，`origin` 之前即预留区。
/// - `reader`/`writer` 均为相对 `origin` 的逻辑索引；向前预写时 `origin`
///   后退、容量随之增长，已有索引不失效。
///
/// # 契约说明（What）
/// - 恒等式：任何操作之后 `0 ≤ reader ≤ writer ≤ capacity`。
/// - 越界索引、读取超过可读字节、预写超出预留区均视为调用方缺陷，在调用点
///   直接 panic；写入超出容量则触发扩容而非失败。
/// - 整数读写一律大端字节序。
#[derive(Debug, Default)]
pub struct ByteBuf {
    storage: BytesMut,
    origin: usize,
    reader: usize,
    writer: usize,
}

impl ByteBuf {
    /// 创建无预留区、容量为 `capacity` 的缓冲。
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_ahead(0, capacity)
    }

    /// 创建前置预留 `ahead` 字节、主体容量 `capacity` 的缓冲。
    pub fn with_ahead(ahead: usize, capacity: usize) -> Self {
        let mut storage = BytesMut::with_capacity(ahead + capacity);
        storage.resize(ahead + capacity, 0);
        Self {
            storage,
            origin: ahead,
            reader: 0,
            writer: 0,
        }
    }

    /// 以 `src` 的内容创建已写满的缓冲。
    pub fn from_slice(src: &[u8]) -> Self {
        let mut buf = Self::with_capacity(src.len());
        buf.write_slice(src);
        buf
    }

    /// 复用一块既有存储（通常来自缓冲池），视为空缓冲。
    pub fn from_storage(mut storage: BytesMut) -> Self {
        let capacity = storage.capacity();
        storage.resize(capacity, 0);
        Self {
            storage,
            origin: 0,
            reader: 0,
            writer: 0,
        }
    }

    /// 拆出底层存储以便归还缓冲池。
    pub fn into_storage(self) -> BytesMut {
        self.storage
    }

    /// 当前容量（不含预留区）。
    pub fn capacity(&self) -> usize {
        self.storage.len() - self.origin
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

    /// 不触发扩容即可写入的字节数。
    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.writer
    }

    /// 读游标之前仍可用于预写的字节数。
    pub fn ahead_writable(&self) -> usize {
        self.origin + self.reader
    }

    /// 是否还有可读字节。
    pub fn is_readable(&self) -> bool {
        self.reader < self.writer
    }

    /// 可读窗口的零拷贝视图。
    pub fn readable(&self) -> &[u8] {
        &self.storage[self.origin + self.reader..self.origin + self.writer]
    }

    /// `[index, index + len)` 的零拷贝切片；窗口必须位于已写区域内。
    pub fn slice(&self, index: usize, len: usize) -> &[u8] {
        self.check_bounds(index, len);
        &self.storage[self.origin + index..self.origin + index + len]
    }

    /// `[index, index + len)` 的深拷贝。
    pub fn copy(&self, index: usize, len: usize) -> ByteBuf {
        ByteBuf::from_slice(self.slice(index, len))
    }

    /// 绝对读取：把 `[index, index + dst.len())` 拷贝进 `dst`，不动游标。
    pub fn get_slice(&self, index: usize, dst: &mut [u8]) {
        dst.copy_from_slice(self.slice(index, dst.len()));
    }

    /// 绝对写入：覆盖已写区域内的 `[index, index + src.len())`，不动游标。
    pub fn set_slice(&mut self, index: usize, src: &[u8]) {
        self.check_bounds(index, src.len());
        let start = self.origin + index;
        self.storage[start..start + src.len()].copy_from_slice(src);
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

    /// 读取 `dst.len()` 字节并推进读游标。
    pub fn read_slice(&mut self, dst: &mut [u8]) {
        assert!(
            dst.len() <= self.readable_bytes(),
            "读取 {} 字节但仅剩 {} 字节可读",
            dst.len(),
            self.readable_bytes()
        );
        let start = self.origin + self.reader;
        dst.copy_from_slice(&self.storage[start..start + dst.len()]);
        self.reader += dst.len();
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

    /// 追加 `src` 并推进写游标，容量不足时自动扩容。
    pub fn write_slice(&mut self, src: &[u8]) {
        self.ensure_writable(src.len());
        let start = self.origin + self.writer;
        self.storage[start..start + src.len()].copy_from_slice(src);
        self.writer += src.len();
    }

    /// 把 `src` 的全部可读字节搬入本缓冲，并消费 `src`。
    pub fn write_buf(&mut self, src: &mut ByteBuf) {
        let n = src.readable_bytes();
        self.ensure_writable(n);
        let start = self.origin + self.writer;
        self.storage[start..start + n].copy_from_slice(src.readable());
        self.writer += n;
        src.reader += n;
    }

    /// 向读游标之前预写一个字节。
    pub fn write_u8_ahead(&mut self, value: u8) {
        self.write_slice_ahead(&[value]);
    }

    /// 向读游标之前预写大端 u16。
    pub fn write_u16_ahead(&mut self, value: u16) {
        self.write_slice_ahead(&value.to_be_bytes());
    }

    /// 向读游标之前预写大端 u32。
    pub fn write_u32_ahead(&mut self, value: u32) {
        self.write_slice_ahead(&value.to_be_bytes());
    }

    /// 把 `src` 预写到读游标之前，使其先于既有可读字节被读到。
    ///
    /// # 逻辑解析（How）
    /// - 字节落在读游标的正前方：优先覆盖已消费区域，不够时向预留区借
    ///   `d` 字节，此时 `origin` 后退、容量与写游标同步增长 `d`，既有逻辑
    ///   索引全部保持有效。
    ///
    /// # 契约说明（What）
    /// - **前置条件**：`src.len() ≤ ahead_writable()`，否则视为契约违约并
    ///   panic——预留区大小在构造时由调用方声明。
    /// - **后置条件**：`readable()` 以 `src` 开头，随后是原有可读字节；恒
    ///   等式 `reader ≤ writer ≤ capacity` 仍然成立。
    pub fn write_slice_ahead(&mut self, src: &[u8]) {
        let k = src.len();
        assert!(
            k <= self.ahead_writable(),
            "预写 {k} 字节超出前置预留区（剩余 {}）",
            self.ahead_writable()
        );
        let abs_reader = self.origin + self.reader;
        self.storage[abs_reader - k..abs_reader].copy_from_slice(src);
        if k <= self.reader {
            self.reader -= k;
        } else {
            let borrowed = k - self.reader;
            self.origin -= borrowed;
            self.reader = 0;
            self.writer += borrowed;
        }
    }

    /// 写游标之后尚未写入区域的可变视图，供一次性批量填充（如套接字读）。
    ///
    /// 存储保持全初始化，因此视图可安全暴露；填充后以
    /// [`advance_writer`](Self::advance_writer) 声明实际写入量。
    pub fn writable_slice(&mut self) -> &mut [u8] {
        let start = self.origin + self.writer;
        let end = self.storage.len();
        &mut self.storage[start..end]
    }

    /// 声明 `writable_slice` 中已被外部填充的字节数。
    pub fn advance_writer(&mut self, n: usize) {
        assert!(
            n <= self.writable_bytes(),
            "声明写入 {n} 字节超出剩余可写空间 {}",
            self.writable_bytes()
        );
        self.writer += n;
    }

    /// 把未读字节搬到逻辑索引 0，腾出已消费区域用于后续写入。
    pub fn discard_read_bytes(&mut self) {
        if self.reader == 0 {
            return;
        }
        let start = self.origin + self.reader;
        let end = self.origin + self.writer;
        self.storage.copy_within(start..end, self.origin);
        self.writer -= self.reader;
        self.reader = 0;
    }

    /// 在可读窗口内线性扫描首个满足 `predicate` 的字节，返回相对读游标的
    /// 偏移。
    pub fn index_of(&self, predicate: impl Fn(u8) -> bool) -> Option<usize> {
        self.readable().iter().position(|b| predicate(*b))
    }

    /// 清空游标；存储与预留区保持不变。
    pub fn clear(&mut self) {
        self.reader = 0;
        self.writer = 0;
    }

    /// 冻结为共享只读的 `Bytes`（零拷贝），内容为当前可读窗口。
    pub fn freeze(self) -> Bytes {
        let start = self.origin + self.reader;
        let end = self.origin + self.writer;
        self.storage.freeze().slice(start..end)
    }

    /// 保证至少还能写入 `additional` 字节，必要时倍增扩容。
    pub fn ensure_writable(&mut self, additional: usize) {
        let needed = self.writer + additional;
        if needed <= self.capacity() {
            return;
        }
        let grown = needed.max(self.capacity() * 2).max(MIN_GROWTH);
        self.storage.resize(self.origin + grown, 0);
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
