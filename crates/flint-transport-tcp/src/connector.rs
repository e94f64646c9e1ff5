//! 客户端引导：建立出站连接并装配流水线。

use std::net::SocketAddr;
use std::sync::Arc;

use flint_core::buffer::{BufferAllocator, RecyclingPool};
use flint_core::channel::{op_pair, ChannelConfig, OpFuture};
use flint_core::error::CoreError;
use flint_core::pipeline::Pipeline;
use tokio::net::TcpSocket;

use crate::channel::{PipelineInitializer, TcpChannel};
use crate::error::{self, map_io_error};
use crate::event_loop::EventLoopGroup;

/// TCP 客户端连接器。
///
/// # 契约说明（What）
/// - `connect` 异步返回 [`TcpChannel`] 的完成 future：连接、套接字选项、
///   流水线装配与 `channel_active` 广播全部在被轮转选中的事件循环线程上
///   完成；
/// - 连接超时由 [`ChannelConfig::connect_timeout`] 约束，超时与失败都会
///   fail 该 future——不会有半初始化的通道泄漏出来。
pub struct TcpConnector {
    group: Arc<EventLoopGroup>,
    config: ChannelConfig,
    allocator: Arc<dyn BufferAllocator>,
    initializer: PipelineInitializer,
}

impl TcpConnector {
    /// 以事件循环组、配置与流水线装配回调构造连接器。
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

    /// 向 `addr` 发起连接。
    pub fn connect(&self, addr: SocketAddr) -> OpFuture<TcpChannel> {
        let (promise, future) = op_pair();
        let event_loop = self.group.next().clone();
        let config = self.config.clone();
        let allocator = Arc::clone(&self.allocator);
        let initializer = Arc::clone(&self.initializer);
        let assembly_loop = event_loop.clone();
        event_loop.run(move || {
            tokio::task::spawn_local(async move {
                let connecting = async {
                    let socket = match addr {
                        SocketAddr::V4(_) => TcpSocket::new_v4(),
                        SocketAddr::V6(_) => TcpSocket::new_v6(),
                    }
                    .map_err(|e| map_io_error(error::CONNECT, e))?;
                    socket
                        .set_reuseaddr(config.reuse_addr)
                        .map_err(|e| map_io_error(error::CONNECT, e))?;
                    socket
                        .connect(addr)
                        .await
                        .map_err(|e| map_io_error(error::CONNECT, e))
                };
                let outcome = tokio::time::timeout(config.connect_timeout, connecting).await;
                let result: Result<TcpChannel, CoreError> = match outcome {
                    Err(_) => Err(CoreError::timeout("tcp connect", config.connect_timeout)),
                    Ok(Err(connect_error)) => Err(connect_error),
                    Ok(Ok(stream)) => {
                        TcpChannel::start(stream, assembly_loop, config, allocator, &initializer)
                    }
                };
                match result {
                    Ok(channel) => promise.succeed(channel),
                    Err(connect_error) => {
                        tracing::debug!(peer = %addr, "tcp 连接失败: {connect_error}");
                        promise.fail(connect_error);
                    }
                }
            });
        });
        future
    }
}
