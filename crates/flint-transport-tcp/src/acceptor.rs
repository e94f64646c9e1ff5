//! 服务端引导：绑定、接受连接并把子通道轮转派发到事件循环组。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flint_core::buffer::{BufferAllocator, RecyclingPool};
use flint_core::channel::{op_pair, ChannelConfig, OpFuture};
use flint_core::pipeline::Pipeline;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::channel::{PipelineInitializer, TcpChannel};
use crate::error::{self, map_io_error};
use crate::event_loop::EventLoopGroup;

/// TCP 服务端接受器。
///
/// # 逻辑解析（How）
/// - `bind` 在组内一个循环（boss 语义）上完成套接字创建与监听，随后驻留
///   接受循环；
/// - 每条入站连接从组里轮转取下一个循环（worker 语义），并在**该循环的
///   线程上**完成子通道装配与 `channel_active` 广播——子通道自此终身绑定
///   该循环；
/// - 瞬时接受失败（文件句柄耗尽等）记录后退避重试，不终止监听。
pub struct TcpAcceptor {
    group: Arc<EventLoopGroup>,
    config: ChannelConfig,
    allocator: Arc<dyn BufferAllocator>,
    initializer: PipelineInitializer,
}

impl TcpAcceptor {
    /// 以事件循环组、子通道配置与流水线装配回调构造接受器。
    pub fn new(
        group: Arc<EventLoopGroup>,
        config: ChannelConfig,
        initializer: impl Fn(&Pipeline) + Send + Sync + 'static,
    ) -> Self {
        Self {
            group,
            config,
            allocator: Arc::new(RecyclingPool::default()),
            initializer: Arc::new(initializer),
        }
    }

    /// 替换接收缓冲分配器（默认自由链表池）。
    pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// 绑定 `addr` 并开始接受连接；future 解析为监听句柄。
    pub fn bind(&self, addr: SocketAddr) -> OpFuture<BoundListener> {
        let (promise, future) = op_pair();
        let boss = self.group.next().clone();
        let group = Arc::clone(&self.group);
        let config = self.config.clone();
        let allocator = Arc::clone(&self.allocator);
        let initializer = Arc::clone(&self.initializer);
        boss.run(move || {
            tokio::task::spawn_local(async move {
                let listener = match bind_listener(addr, &config) {
                    Ok(listener) => listener,
                    Err(bind_error) => {
                        promise.fail(bind_error);
                        return;
                    }
                };
                let local_addr = match listener.local_addr() {
                    Ok(local) => local,
                    Err(e) => {
                        promise.fail(map_io_error(error::BIND, e));
                        return;
                    }
                };
                tracing::debug!(%local_addr, "tcp 监听建立");
                let accept_task = tokio::task::spawn_local(accept_loop(
                    listener,
                    group,
                    config,
                    allocator,
                    initializer,
                ));
                promise.succeed(BoundListener {
                    local_addr,
                    accept_task: Arc::new(Mutex::new(Some(accept_task))),
                });
            });
        });
        future
    }
}

/// 已绑定的监听句柄；状态对应通道生命周期中的 `Bound`。
#[derive(Clone)]
pub struct BoundListener {
    local_addr: SocketAddr,
    accept_task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl BoundListener {
    /// 实际绑定的本地地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 停止接受新连接；既有通道不受影响。幂等。
    pub fn close(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

/// 经 socket2 应用 `SO_REUSEADDR` 后建立监听套接字。
fn bind_listener(
    addr: SocketAddr,
    config: &ChannelConfig,
) -> Result<TcpListener, flint_core::CoreError> {
    let domain = socket2::Domain::for_address(addr);
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(|e| map_io_error(error::BIND, e))?;
    socket
        .set_reuse_address(config.reuse_addr)
        .map_err(|e| map_io_error(error::BIND, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| map_io_error(error::BIND, e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| map_io_error(error::BIND, e))?;
    socket
        .listen(1024)
        .map_err(|e| map_io_error(error::BIND, e))?;
    TcpListener::from_std(socket.into()).map_err(|e| map_io_error(error::BIND, e))
}

async fn accept_loop(
    listener: TcpListener,
    group: Arc<EventLoopGroup>,
    config: ChannelConfig,
    allocator: Arc<dyn BufferAllocator>,
    initializer: PipelineInitializer,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let child_loop = group.next().clone();
                let child_config = config.clone();
                let child_allocator = Arc::clone(&allocator);
                let child_initializer = Arc::clone(&initializer);
                let assembly_loop = child_loop.clone();
                child_loop.run(move || {
                    if let Err(start_error) = TcpChannel::start(
                        stream,
                        assembly_loop,
                        child_config,
                        child_allocator,
                        &child_initializer,
                    ) {
                        tracing::warn!(%peer, "子通道装配失败: {start_error}");
                    }
                });
            }
            Err(accept_error) => {
                let error = map_io_error(error::ACCEPT, accept_error);
                tracing::warn!("接受连接失败: {error}");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}
