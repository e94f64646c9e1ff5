#![deny(unsafe_code)]
#![doc = "flint-transport-tcp: 通道契约在 Tokio TCP 上的实现。"]
#![doc = ""]
#![doc = "提供一线程一循环的事件循环（`event_loop`）、带自适应读取与水位背压"]
#![doc = "的 TCP 通道（`channel`），以及客户端/服务端引导（`connector` /"]
#![doc = "`acceptor`）。流水线、缓冲与解码契约见 `flint-core`。"]

pub mod acceptor;
pub mod channel;
pub mod connector;
mod error;
pub mod event_loop;

pub use acceptor::{BoundListener, TcpAcceptor};
pub use channel::{PipelineInitializer, TcpChannel};
pub use connector::TcpConnector;
pub use event_loop::{EventLoop, EventLoopGroup, Timeout};
