//! TCP 通道：通道契约在 Tokio 上的落地。
//!
//! # 设计背景（Why）
//! - 一个通道绑定一个事件循环，读循环、刷写与关闭全部以 `spawn_local`
//!   协程驻留在循环线程：流水线事件因此与 I/O 完成保持同序、同线程。
//! - 读路径按自适应尺寸器租借缓冲，写路径以带高低水位的队列吸收突发并
//!   广播可写性翻转，背压是协作信号而非硬阻塞。

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use flint_core::buffer::BufferAllocator;
use flint_core::channel::{
    completion_pair, Channel, ChannelConfig, ChannelState, CompletionFuture, CompletionPromise,
    WriteSignal,
};
use flint_core::error::{codes, CoreError, ErrorCategory};
use flint_core::pipeline::{Pipeline, PipelineMessage};
use flint_core::sizer::AdaptiveReceiveBufferSizer;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};

use crate::error::{self, map_io_error};
use crate::event_loop::EventLoop;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 每条新连接的流水线装配回调。
pub type PipelineInitializer = Arc<dyn Fn(&Pipeline) + Send + Sync>;

struct WriteQueue {
    entries: VecDeque<(Bytes, CompletionPromise)>,
    queued_bytes: usize,
}

pub(crate) struct TcpChannelInner {
    id: u64,
    event_loop: EventLoop,
    pipeline: Arc<Pipeline>,
    config: ChannelConfig,
    allocator: Arc<dyn BufferAllocator>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: Mutex<ChannelState>,
    write_queue: Mutex<WriteQueue>,
    writable: AtomicBool,
    flush_scheduled: AtomicBool,
    auto_read: AtomicBool,
    read_gate: Notify,
    write_half: AsyncMutex<Option<OwnedWriteHalf>>,
    read_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    self_ref: OnceLock<Weak<TcpChannelInner>>,
}

impl TcpChannelInner {
    fn upgrade_self(&self) -> Option<Arc<TcpChannelInner>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }
}

/// TCP 通道的公开句柄；克隆开销为一次引用计数。
#[derive(Clone)]
pub struct TcpChannel {
    inner: Arc<TcpChannelInner>,
}

impl TcpChannel {
    /// 在所属事件循环线程上装配通道：应用套接字选项、构建流水线、广播
    /// `channel_active` 并启动读循环。
    pub(crate) fn start(
        stream: TcpStream,
        event_loop: EventLoop,
        config: ChannelConfig,
        allocator: Arc<dyn BufferAllocator>,
        initializer: &PipelineInitializer,
    ) -> Result<TcpChannel, CoreError> {
        debug_assert!(event_loop.in_loop(), "通道必须在所属循环线程上装配");
        apply_socket_options(&stream, &config)?;
        let sizer = config.build_sizer()?;
        let local_addr = stream
            .local_addr()
            .map_err(|e| map_io_error(error::CONFIGURE, e))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| map_io_error(error::CONFIGURE, e))?;
        let (read_half, write_half) = stream.into_split();
        let (closed_tx, closed_rx) = watch::channel(false);

        let inner = Arc::new(TcpChannelInner {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            event_loop,
            pipeline: Arc::new(Pipeline::new()),
            auto_read: AtomicBool::new(config.auto_read),
            config,
            allocator,
            local_addr,
            peer_addr,
            state: Mutex::new(ChannelState::Open),
            write_queue: Mutex::new(WriteQueue {
                entries: VecDeque::new(),
                queued_bytes: 0,
            }),
            writable: AtomicBool::new(true),
            flush_scheduled: AtomicBool::new(false),
            read_gate: Notify::new(),
            write_half: AsyncMutex::new(Some(write_half)),
            read_task: Mutex::new(None),
            closed_tx,
            closed_rx,
            self_ref: OnceLock::new(),
        });
        let _ = inner.self_ref.set(Arc::downgrade(&inner));

        let erased: Arc<dyn Channel> = inner.clone();
        inner.pipeline.bind_channel(Arc::downgrade(&erased));
        initializer(&inner.pipeline);

        *inner.state.lock() = ChannelState::Connected;
        tracing::debug!(channel = inner.id, peer = %peer_addr, "tcp 通道建立");
        inner.pipeline.fire_channel_active();

        let reader = Arc::clone(&inner);
        let handle = tokio::task::spawn_local(read_loop(reader, read_half, sizer));
        *inner.read_task.lock() = Some(handle);

        Ok(TcpChannel { inner })
    }

    /// 通道标识。
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// 当前状态。
    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    /// 本地地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// 对端地址。
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// 通道的流水线。
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.inner.pipeline
    }

    /// 所属事件循环。
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// 写队列是否低于高水位。
    pub fn is_writable(&self) -> bool {
        self.inner.writable.load(Ordering::SeqCst)
    }

    /// 经出站链路写入并刷新；完成通知在循环线程解析。
    pub fn write_and_flush(&self, msg: PipelineMessage) -> CompletionFuture {
        let (promise, future) = completion_pair();
        let inner = Arc::clone(&self.inner);
        self.inner.event_loop.run(move || {
            inner.pipeline.write_with(msg, &promise);
            inner.pipeline.flush();
        });
        future
    }

    /// 经出站链路发起关闭。
    pub fn close(&self) -> CompletionFuture {
        let (promise, future) = completion_pair();
        let inner = Arc::clone(&self.inner);
        self.inner.event_loop.run(move || {
            inner.pipeline.close_with(&promise);
        });
        future
    }

    /// 协作式开关读循环（`AUTO_READ` 语义）。
    pub fn set_auto_read(&self, enabled: bool) {
        self.inner.request_read(enabled);
    }

    /// 等待通道完全关闭。
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer_addr)
            .finish()
    }
}

impl Channel for TcpChannelInner {
    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    fn enqueue_write(
        &self,
        payload: Bytes,
        promise: CompletionPromise,
    ) -> Result<WriteSignal, CoreError> {
        if self.state.lock().is_closed() {
            let error = CoreError::channel_closed("通道已关闭，写入被拒绝");
            promise.fail(error.clone());
            return Err(error);
        }
        let queued = {
            let mut queue = self.write_queue.lock();
            queue.queued_bytes += payload.len();
            queue.entries.push_back((payload, promise));
            queue.queued_bytes
        };
        if queued > self.config.write_high_water {
            if self
                .writable
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                tracing::trace!(channel = self.id, queued, "写队列越过高水位");
                self.pipeline.fire_writability_changed(false);
            }
            Ok(WriteSignal::FlowControlApplied)
        } else {
            Ok(WriteSignal::Accepted)
        }
    }

    fn begin_flush(&self) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.upgrade_self() else {
            return;
        };
        self.event_loop.run(move || {
            tokio::task::spawn_local(flush_task(inner));
        });
    }

    fn begin_close(&self, promise: CompletionPromise) {
        let Some(inner) = self.upgrade_self() else {
            promise.fail(CoreError::channel_closed("通道已销毁"));
            return;
        };
        self.event_loop.run(move || {
            tokio::task::spawn_local(close_task(inner, Some(promise), None));
        });
    }

    fn request_read(&self, enabled: bool) {
        self.auto_read.store(enabled, Ordering::SeqCst);
        if enabled {
            self.read_gate.notify_waiters();
        }
    }
}

/// 读循环：自适应租借缓冲 → 套接字读取 → 入站事件。
async fn read_loop(
    inner: Arc<TcpChannelInner>,
    mut read_half: OwnedReadHalf,
    mut sizer: AdaptiveReceiveBufferSizer,
) {
    loop {
        if inner.state.lock().is_closed() {
            break;
        }
        if !inner.auto_read.load(Ordering::SeqCst) {
            inner.read_gate.notified().await;
            continue;
        }
        let expected = sizer.next_receive_size();
        let mut buf = inner.allocator.acquire(expected);
        match read_half.read(buf.writable_slice()).await {
            Ok(0) => {
                inner.allocator.give_back(buf.into_storage());
                tracing::debug!(channel = inner.id, "对端关闭连接");
                tokio::task::spawn_local(close_task(Arc::clone(&inner), None, None));
                break;
            }
            Ok(n) => {
                buf.advance_writer(n);
                sizer.record(n);
                inner.pipeline.fire_read(PipelineMessage::from(buf));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                inner.allocator.give_back(buf.into_storage());
            }
            Err(e) => {
                inner.allocator.give_back(buf.into_storage());
                let error = map_io_error(error::READ, e);
                if error.closes_channel() {
                    tokio::task::spawn_local(close_task(Arc::clone(&inner), None, Some(error)));
                    break;
                }
                inner.pipeline.fire_exception(error);
            }
        }
    }
}

/// 刷写协程：排空写队列，维护低水位回落事件。
async fn flush_task(inner: Arc<TcpChannelInner>) {
    'outer: loop {
        loop {
            let next = { inner.write_queue.lock().entries.pop_front() };
            let Some((payload, promise)) = next else {
                break;
            };
            let result = {
                let mut guard = inner.write_half.lock().await;
                match guard.as_mut() {
                    Some(write_half) => write_half.write_all(&payload).await,
                    None => Err(io::Error::new(io::ErrorKind::NotConnected, "写半部已关闭")),
                }
            };
            match result {
                Ok(()) => {
                    promise.succeed(());
                    let queued = {
                        let mut queue = inner.write_queue.lock();
                        queue.queued_bytes -= payload.len();
                        queue.queued_bytes
                    };
                    if queued <= inner.config.write_low_water
                        && inner
                            .writable
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                    {
                        tracing::trace!(channel = inner.id, queued, "写队列回落到低水位");
                        inner.pipeline.fire_writability_changed(true);
                    }
                }
                Err(io_error) => {
                    {
                        let mut queue = inner.write_queue.lock();
                        queue.queued_bytes -= payload.len();
                    }
                    let error = map_io_error(error::WRITE, io_error);
                    let fatal = error.closes_channel();
                    promise.fail(error.clone());
                    if fatal {
                        inner.flush_scheduled.store(false, Ordering::SeqCst);
                        tokio::task::spawn_local(close_task(inner, None, Some(error)));
                        return;
                    }
                    inner.pipeline.fire_exception(error);
                }
            }
        }
        inner.flush_scheduled.store(false, Ordering::SeqCst);
        // 清旗与新写入之间存在窗口：若此刻队列非空则夺回旗帜继续，
        // 保证刷新信号不丢失。
        let pending = !inner.write_queue.lock().entries.is_empty();
        if pending && !inner.flush_scheduled.swap(true, Ordering::SeqCst) {
            continue 'outer;
        }
        break;
    }
}

/// 关闭协程：优雅路径先冲刷残余写队列，之后关写半部、终止读循环、放弃
/// 未完成写请求并广播 `channel_inactive`。
async fn close_task(
    inner: Arc<TcpChannelInner>,
    promise: Option<CompletionPromise>,
    error: Option<CoreError>,
) {
    {
        let mut state = inner.state.lock();
        if state.is_closed() {
            if let Some(promise) = promise {
                promise.succeed(());
            }
            return;
        }
        *state = ChannelState::Closed;
    }
    let abortive = error.is_some();
    if let Some(error) = error {
        inner.pipeline.fire_exception(error);
    }
    if !abortive {
        drain_before_close(&inner).await;
    }
    if let Some(mut write_half) = inner.write_half.lock().await.take() {
        if let Err(shutdown_error) = write_half.shutdown().await {
            tracing::debug!(
                channel = inner.id,
                code = error::SHUTDOWN.code,
                "关闭写半部失败: {shutdown_error}"
            );
        }
    }
    if let Some(handle) = inner.read_task.lock().take() {
        handle.abort();
    }
    let abandoned: Vec<(Bytes, CompletionPromise)> = {
        let mut queue = inner.write_queue.lock();
        queue.queued_bytes = 0;
        queue.entries.drain(..).collect()
    };
    for (_, write_promise) in abandoned {
        write_promise.fail(
            CoreError::new(codes::WRITE_ABORTED, "通道关闭，写操作被放弃")
                .with_category(ErrorCategory::Closed),
        );
    }
    tracing::debug!(channel = inner.id, "tcp 通道关闭");
    inner.pipeline.fire_channel_inactive();
    let _ = inner.closed_tx.send(true);
    if let Some(promise) = promise {
        promise.succeed(());
    }
}

/// 优雅关闭前的尽力冲刷；任何失败立即停止，残余条目由关闭流程统一放弃。
async fn drain_before_close(inner: &Arc<TcpChannelInner>) {
    loop {
        let next = { inner.write_queue.lock().entries.pop_front() };
        let Some((payload, promise)) = next else {
            break;
        };
        let result = {
            let mut guard = inner.write_half.lock().await;
            match guard.as_mut() {
                Some(write_half) => write_half.write_all(&payload).await,
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "写半部已关闭")),
            }
        };
        match result {
            Ok(()) => promise.succeed(()),
            Err(io_error) => {
                promise.fail(map_io_error(error::WRITE, io_error));
                break;
            }
        }
    }
}

/// 把配置落到内核套接字选项。
fn apply_socket_options(stream: &TcpStream, config: &ChannelConfig) -> Result<(), CoreError> {
    stream
        .set_nodelay(config.tcp_nodelay)
        .map_err(|e| map_io_error(error::CONFIGURE, e))?;
    let sock = socket2::SockRef::from(stream);
    if let Some(size) = config.so_rcvbuf {
        sock.set_recv_buffer_size(size)
            .map_err(|e| map_io_error(error::CONFIGURE, e))?;
    }
    if let Some(size) = config.so_sndbuf {
        sock.set_send_buffer_size(size)
            .map_err(|e| map_io_error(error::CONFIGURE, e))?;
    }
    Ok(())
}
