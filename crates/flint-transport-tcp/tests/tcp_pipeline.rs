//! 端到端传输测试：真实 localhost 套接字上的回显、分片解码与关闭语义。

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use flint_core::channel::ChannelState;
use flint_core::codec::{ReplayCursor, ReplayDecode, ReplayingDecoder};
use flint_core::error::CoreError;
use flint_core::pipeline::{Handler, HandlerContext, InboundHandler, PipelineMessage};
use flint_core::ByteBuf;
use flint_transport_tcp::{EventLoopGroup, TcpAcceptor, TcpConnector};

#[derive(Clone, Copy, Default)]
enum FrameState {
    #[default]
    Header,
    Body(usize),
}

/// `<4 字节长度><body>` 的测试协议。
struct LengthPrefixDecoder;

impl ReplayDecode for LengthPrefixDecoder {
    type State = FrameState;
    type Message = Vec<u8>;

    fn decode(
        &self,
        cursor: &mut ReplayCursor<'_, FrameState>,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        if let FrameState::Header = cursor.state() {
            if cursor.readable_bytes() < 4 {
                return Ok(None);
            }
            let length = cursor.read_u32() as usize;
            if length > 1 << 20 {
                return Err(CoreError::malformed_frame("长度字段超出上限"));
            }
            cursor.checkpoint(FrameState::Body(length));
        }
        let FrameState::Body(length) = cursor.state() else {
            unreachable!("checkpoint 已推进到 Body");
        };
        if cursor.readable_bytes() < length {
            return Ok(None);
        }
        let mut body = vec![0u8; length];
        cursor.read_slice(&mut body);
        Ok(Some(body))
    }
}

/// 把解码产物送出测试断言通道的链尾 Handler。
struct Reporting {
    tx: mpsc::Sender<Vec<u8>>,
}

impl InboundHandler for Reporting {
    fn on_read(&self, _ctx: &HandlerContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        let body = msg.downcast::<Vec<u8>>().expect("解码产物类型固定");
        let _ = self.tx.send(*body);
        Ok(())
    }
}

/// 原样回写收到字节的服务端 Handler。
struct Echo;

impl InboundHandler for Echo {
    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        if let PipelineMessage::Buffer(buf) = msg {
            let (_signal, _future) = ctx.write(PipelineMessage::from(buf.freeze()));
            ctx.flush();
        }
        Ok(())
    }
}

fn frame(body: &[u8]) -> ByteBuf {
    let mut buf = ByteBuf::with_ahead(4, body.len());
    buf.write_slice(body);
    buf.write_u32_ahead(body.len() as u32);
    buf
}

fn block_on<T>(future: impl std::future::Future<Output = T>) -> T {
    futures::executor::block_on(future)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn echo_roundtrip_through_both_pipelines() {
    init_tracing();
    let server_group = Arc::new(EventLoopGroup::new(2, "echo-srv"));
    let client_group = Arc::new(EventLoopGroup::new(1, "echo-cli"));
    let (decoded_tx, decoded_rx) = mpsc::channel();

    let acceptor = TcpAcceptor::new(
        Arc::clone(&server_group),
        Default::default(),
        |pipeline| {
            pipeline.add_last("echo", Handler::inbound(Echo)).unwrap();
        },
    );
    let listener = block_on(acceptor.bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())).unwrap();

    let connector = TcpConnector::new(Arc::clone(&client_group), Default::default(), move |pipeline| {
        pipeline
            .add_last(
                "frame-decoder",
                Handler::inbound(ReplayingDecoder::new(LengthPrefixDecoder)),
            )
            .unwrap();
        pipeline
            .add_last(
                "reporter",
                Handler::inbound(Reporting {
                    tx: decoded_tx.clone(),
                }),
            )
            .unwrap();
    });
    let channel = block_on(connector.connect(listener.local_addr())).unwrap();
    assert_eq!(channel.state(), ChannelState::Connected);

    block_on(channel.write_and_flush(PipelineMessage::from(frame(b"hello")))).unwrap();

    let echoed = decoded_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("回显应在超时前抵达");
    assert_eq!(echoed, b"hello".to_vec(), "回显内容必须与发送一致");

    listener.close();
    server_group.shutdown_all();
    client_group.shutdown_all();
}

#[test]
fn split_frames_decode_across_deliveries() {
    init_tracing();
    let server_group = Arc::new(EventLoopGroup::new(1, "split-srv"));
    let client_group = Arc::new(EventLoopGroup::new(1, "split-cli"));
    let (decoded_tx, decoded_rx) = mpsc::channel();

    let acceptor = TcpAcceptor::new(
        Arc::clone(&server_group),
        Default::default(),
        move |pipeline| {
            pipeline
                .add_last(
                    "frame-decoder",
                    Handler::inbound(ReplayingDecoder::new(LengthPrefixDecoder)),
                )
                .unwrap();
            pipeline
                .add_last(
                    "reporter",
                    Handler::inbound(Reporting {
                        tx: decoded_tx.clone(),
                    }),
                )
                .unwrap();
        },
    );
    let listener = block_on(acceptor.bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())).unwrap();

    let connector = TcpConnector::new(Arc::clone(&client_group), Default::default(), |_| {});
    let channel = block_on(connector.connect(listener.local_addr())).unwrap();

    // 头与体分两次投递，中间留出跨越网络栈的间隙。
    block_on(channel.write_and_flush(PipelineMessage::from(ByteBuf::from_slice(&[0, 0, 0, 5]))))
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    block_on(channel.write_and_flush(PipelineMessage::from(ByteBuf::from_slice(b"hello"))))
        .unwrap();

    let decoded = decoded_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("分片送达的帧必须被完整解出");
    assert_eq!(decoded, b"hello".to_vec());

    listener.close();
    server_group.shutdown_all();
    client_group.shutdown_all();
}

#[test]
fn close_resolves_future_and_terminal_state() {
    init_tracing();
    let server_group = Arc::new(EventLoopGroup::new(1, "close-srv"));
    let client_group = Arc::new(EventLoopGroup::new(1, "close-cli"));

    let acceptor = TcpAcceptor::new(Arc::clone(&server_group), Default::default(), |_| {});
    let listener = block_on(acceptor.bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())).unwrap();

    let connector = TcpConnector::new(Arc::clone(&client_group), Default::default(), |_| {});
    let channel = block_on(connector.connect(listener.local_addr())).unwrap();

    block_on(channel.close()).unwrap();
    block_on(channel.closed());
    assert_eq!(channel.state(), ChannelState::Closed);

    // 终态后的写入必须立即失败。
    let write_error = block_on(channel.write_and_flush(PipelineMessage::from(
        ByteBuf::from_slice(b"late"),
    )));
    assert!(write_error.is_err(), "关闭后的写入应 fail 其 future");

    listener.close();
    server_group.shutdown_all();
    client_group.shutdown_all();
}

/// 把可写性翻转送出断言通道的 Handler。
struct WritabilityTap {
    tx: mpsc::Sender<bool>,
}

impl InboundHandler for WritabilityTap {
    fn on_writability_changed(
        &self,
        _ctx: &HandlerContext<'_>,
        is_writable: bool,
    ) -> Result<(), CoreError> {
        let _ = self.tx.send(is_writable);
        Ok(())
    }
}

#[test]
fn watermarks_toggle_writability_events() {
    init_tracing();
    let server_group = Arc::new(EventLoopGroup::new(1, "wm-srv"));
    let client_group = Arc::new(EventLoopGroup::new(1, "wm-cli"));
    let (toggle_tx, toggle_rx) = mpsc::channel();

    // 服务端空流水线：读循环照常排空套接字，数据在链尾被丢弃。
    let acceptor = TcpAcceptor::new(Arc::clone(&server_group), Default::default(), |_| {});
    let listener = block_on(acceptor.bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())).unwrap();

    let connector = TcpConnector::new(Arc::clone(&client_group), Default::default(), move |pipeline| {
        pipeline
            .add_last(
                "writability-tap",
                Handler::inbound(WritabilityTap {
                    tx: toggle_tx.clone(),
                }),
            )
            .unwrap();
    });
    let channel = block_on(connector.connect(listener.local_addr())).unwrap();

    // 单笔 1 MiB 超过默认 64 KiB 高水位：入队即触发不可写事件。
    let payload = ByteBuf::from_slice(&vec![0x5A; 1 << 20]);
    let write_future = channel.write_and_flush(PipelineMessage::from(payload));

    let first = toggle_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("越过高水位必须广播可写性翻转");
    assert!(!first, "首个事件应为不可写");

    block_on(write_future).unwrap();
    let second = toggle_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("回落到低水位必须广播恢复事件");
    assert!(second, "排空后应恢复可写");
    assert!(channel.is_writable());

    listener.close();
    server_group.shutdown_all();
    client_group.shutdown_all();
}

#[test]
fn connect_refused_fails_the_future() {
    init_tracing();
    let client_group = Arc::new(EventLoopGroup::new(1, "refused-cli"));
    let connector = TcpConnector::new(Arc::clone(&client_group), Default::default(), |_| {});

    // 端口 1 基本不可能有监听者。
    let result = block_on(connector.connect("127.0.0.1:1".parse::<SocketAddr>().unwrap()));
    assert!(result.is_err(), "连接失败必须 fail connect future");

    client_group.shutdown_all();
}
