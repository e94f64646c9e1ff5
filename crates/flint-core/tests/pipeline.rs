//! 流水线行为测试：方向性传播、分发期间的结构性修改、异常路由与可回放
//! 解码的分块不变性。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use flint_core::channel::{Channel, ChannelState, CompletionPromise, WriteSignal};
use flint_core::codec::{ReplayCursor, ReplayDecode, ReplayingDecoder};
use flint_core::error::CoreError;
use flint_core::pipeline::{
    Handler, HandlerContext, InboundHandler, OutboundHandler, Pipeline, PipelineMessage,
};
use flint_core::ByteBuf;

type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// 记录回调顺序的入站 Handler。
struct RecordingInbound {
    name: &'static str,
    log: Log,
    forward: bool,
}

impl RecordingInbound {
    fn new(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: Arc::clone(log),
            forward: true,
        }
    }

    fn stopping(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: Arc::clone(log),
            forward: false,
        }
    }
}

impl InboundHandler for RecordingInbound {
    fn on_channel_active(&self, ctx: &HandlerContext<'_>) -> Result<(), CoreError> {
        self.log.lock().unwrap().push(self.name.to_string());
        if self.forward {
            ctx.forward_channel_active();
        }
        Ok(())
    }

    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        self.log.lock().unwrap().push(format!("{}:read", self.name));
        if self.forward {
            ctx.forward_read(msg);
        }
        Ok(())
    }

    fn on_exception_caught(&self, ctx: &HandlerContext<'_>, error: CoreError) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:exception:{}", self.name, error.code()));
        ctx.forward_exception(error);
    }
}

/// 记录回调顺序的出站 Handler。
struct RecordingOutbound {
    name: &'static str,
    log: Log,
}

impl OutboundHandler for RecordingOutbound {
    fn on_write(
        &self,
        ctx: &HandlerContext<'_>,
        msg: PipelineMessage,
        promise: &CompletionPromise,
    ) -> Result<WriteSignal, CoreError> {
        self.log.lock().unwrap().push(format!("{}:write", self.name));
        Ok(ctx.forward_write(msg, promise))
    }
}

/// 终端桩通道：记录抵达链头的字节。
#[derive(Default)]
struct StubChannel {
    written: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl Channel for StubChannel {
    fn id(&self) -> u64 {
        1
    }

    fn state(&self) -> ChannelState {
        if self.closed.load(Ordering::SeqCst) {
            ChannelState::Closed
        } else {
            ChannelState::Connected
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn enqueue_write(
        &self,
        payload: Bytes,
        promise: CompletionPromise,
    ) -> Result<WriteSignal, CoreError> {
        self.written.lock().unwrap().push(payload);
        promise.succeed(());
        Ok(WriteSignal::Accepted)
    }

    fn begin_flush(&self) {}

    fn begin_close(&self, promise: CompletionPromise) {
        self.closed.store(true, Ordering::SeqCst);
        promise.succeed(());
    }

    fn request_read(&self, _enabled: bool) {}
}

fn pipeline_with_channel() -> (Arc<Pipeline>, Arc<StubChannel>) {
    let pipeline = Arc::new(Pipeline::new());
    let channel: Arc<StubChannel> = Arc::new(StubChannel::default());
    let erased: Arc<dyn Channel> = channel.clone();
    pipeline.bind_channel(Arc::downgrade(&erased));
    (pipeline, channel)
}

#[test]
fn inbound_events_run_head_to_tail() {
    let log = new_log();
    let pipeline = Pipeline::new();
    pipeline
        .add_last("A", Handler::inbound(RecordingInbound::new("A", &log)))
        .unwrap();
    pipeline
        .add_last("B", Handler::inbound(RecordingInbound::new("B", &log)))
        .unwrap();
    pipeline
        .add_last("C", Handler::inbound(RecordingInbound::new("C", &log)))
        .unwrap();

    pipeline.fire_channel_active();
    assert_eq!(entries(&log), ["A", "B", "C"], "入站事件必须头→尾传播");
}

#[test]
fn outbound_events_run_tail_to_head() {
    let log = new_log();
    let (pipeline, channel) = pipeline_with_channel();
    for name in ["X", "Y", "Z"] {
        pipeline
            .add_last(
                name,
                Handler::outbound(RecordingOutbound {
                    name,
                    log: Arc::clone(&log),
                }),
            )
            .unwrap();
    }

    let (signal, future) = pipeline.write(PipelineMessage::from(Bytes::from_static(b"hi")));
    assert_eq!(signal, WriteSignal::Accepted);
    futures::executor::block_on(future).unwrap();
    assert_eq!(
        entries(&log),
        ["Z:write", "Y:write", "X:write"],
        "出站事件必须尾→头传播"
    );
    assert_eq!(channel.written.lock().unwrap().as_slice(), [Bytes::from_static(b"hi")]);
}

#[test]
fn a_handler_may_stop_propagation() {
    let log = new_log();
    let pipeline = Pipeline::new();
    pipeline
        .add_last("A", Handler::inbound(RecordingInbound::new("A", &log)))
        .unwrap();
    pipeline
        .add_last("B", Handler::inbound(RecordingInbound::stopping("B", &log)))
        .unwrap();
    pipeline
        .add_last("C", Handler::inbound(RecordingInbound::new("C", &log)))
        .unwrap();

    pipeline.fire_channel_active();
    assert_eq!(entries(&log), ["A", "B"], "B 拦截后 C 不应收到事件");
}

/// 首次收到消息时移除自身、随后照常转发的 Handler。
struct SelfRemoving {
    log: Log,
}

impl InboundHandler for SelfRemoving {
    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        self.log.lock().unwrap().push("self-removing:read".into());
        ctx.pipeline().remove("self-removing").unwrap();
        ctx.forward_read(msg);
        Ok(())
    }
}

#[test]
fn removal_of_running_handler_keeps_chain_intact() {
    let log = new_log();
    let pipeline = Pipeline::new();
    pipeline
        .add_last(
            "self-removing",
            Handler::inbound(SelfRemoving {
                log: Arc::clone(&log),
            }),
        )
        .unwrap();
    pipeline
        .add_last("sink", Handler::inbound(RecordingInbound::new("sink", &log)))
        .unwrap();

    pipeline.fire_read(PipelineMessage::from(ByteBuf::from_slice(b"1")));
    assert_eq!(
        entries(&log),
        ["self-removing:read", "sink:read"],
        "移除自身后事件仍到达后继"
    );

    log.lock().unwrap().clear();
    pipeline.fire_read(PipelineMessage::from(ByteBuf::from_slice(b"2")));
    assert_eq!(entries(&log), ["sink:read"], "第二条消息不再经过被移除的节点");
    assert_eq!(pipeline.names(), ["sink"]);
}

/// 转发前移除后继节点的 Handler。
struct NeighborRemoving {
    victim: &'static str,
}

impl InboundHandler for NeighborRemoving {
    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        let _ = ctx.pipeline().remove(self.victim);
        ctx.forward_read(msg);
        Ok(())
    }
}

#[test]
fn removing_the_next_handler_mid_dispatch_skips_it() {
    let log = new_log();
    let pipeline = Pipeline::new();
    pipeline
        .add_last("surgeon", Handler::inbound(NeighborRemoving { victim: "B" }))
        .unwrap();
    pipeline
        .add_last("B", Handler::inbound(RecordingInbound::new("B", &log)))
        .unwrap();
    pipeline
        .add_last("C", Handler::inbound(RecordingInbound::new("C", &log)))
        .unwrap();

    pipeline.fire_read(PipelineMessage::from(ByteBuf::from_slice(b"x")));
    assert_eq!(entries(&log), ["C:read"], "被移除的 B 不得再收到在途事件");
}

/// 收到消息即报错的 Handler。
struct Failing;

impl InboundHandler for Failing {
    fn on_read(&self, _ctx: &HandlerContext<'_>, _msg: PipelineMessage) -> Result<(), CoreError> {
        Err(CoreError::new("flint.test.boom", "handler failed"))
    }
}

#[test]
fn handler_errors_become_exception_events_for_the_successor() {
    let log = new_log();
    let pipeline = Pipeline::new();
    pipeline.add_last("failing", Handler::inbound(Failing)).unwrap();
    pipeline
        .add_last("observer", Handler::inbound(RecordingInbound::new("observer", &log)))
        .unwrap();

    pipeline.fire_read(PipelineMessage::from(ByteBuf::from_slice(b"x")));
    assert_eq!(
        entries(&log),
        ["observer:exception:flint.test.boom"],
        "错误必须转为发往后继的异常事件"
    );
}

#[test]
fn unhandled_decode_errors_close_the_channel() {
    let (pipeline, channel) = pipeline_with_channel();
    pipeline.fire_exception(CoreError::malformed_frame("poisoned stream"));
    assert!(
        channel.closed.load(Ordering::SeqCst),
        "解码类异常抵达链尾后按约定关闭通道"
    );
}

#[test]
fn insertion_positions_and_duplicate_names() {
    let log = new_log();
    let pipeline = Pipeline::new();
    pipeline
        .add_last("B", Handler::inbound(RecordingInbound::new("B", &log)))
        .unwrap();
    pipeline
        .add_first("A", Handler::inbound(RecordingInbound::new("A", &log)))
        .unwrap();
    pipeline
        .add_after("B", "D", Handler::inbound(RecordingInbound::new("D", &log)))
        .unwrap();
    pipeline
        .add_before("D", "C", Handler::inbound(RecordingInbound::new("C", &log)))
        .unwrap();
    assert_eq!(pipeline.names(), ["A", "B", "C", "D"]);

    let duplicate = pipeline.add_last("A", Handler::inbound(RecordingInbound::new("A", &log)));
    assert!(duplicate.is_err(), "同名注册必须被拒绝");
}

/// 记录用户事件标签的 Handler。
struct EventTap {
    log: Log,
}

impl InboundHandler for EventTap {
    fn on_user_event(
        &self,
        ctx: &HandlerContext<'_>,
        event: flint_core::pipeline::UserEvent,
    ) -> Result<(), CoreError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("event:{}", event.label()));
        ctx.forward_user_event(event);
        Ok(())
    }
}

#[test]
fn user_events_traverse_the_inbound_chain() {
    let log = new_log();
    let pipeline = Pipeline::new();
    pipeline
        .add_last("tap-1", Handler::inbound(EventTap { log: Arc::clone(&log) }))
        .unwrap();
    pipeline
        .add_last("tap-2", Handler::inbound(EventTap { log: Arc::clone(&log) }))
        .unwrap();

    pipeline.fire_user_event(flint_core::pipeline::UserEvent::new("handshake-done", 7u32));
    assert_eq!(entries(&log), ["event:handshake-done", "event:handshake-done"]);
}

// ---- 可回放解码 ----

#[derive(Clone, Copy, Default)]
enum FrameState {
    #[default]
    Header,
    Body(usize),
}

/// `<4 字节长度><body>` 的教学协议。
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
            unreachable!("checkpoint 已将状态推进到 Body");
        };
        if cursor.readable_bytes() < length {
            return Ok(None);
        }
        let mut body = vec![0u8; length];
        cursor.read_slice(&mut body);
        Ok(Some(body))
    }
}

/// 收集解码产物的链尾 Handler。
struct Collecting {
    out: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl InboundHandler for Collecting {
    fn on_read(&self, _ctx: &HandlerContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        let body = msg.downcast::<Vec<u8>>().expect("解码产物类型固定");
        self.out.lock().unwrap().push(*body);
        Ok(())
    }
}

fn decoder_pipeline() -> (Pipeline, Arc<Mutex<Vec<Vec<u8>>>>) {
    let out = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new();
    pipeline
        .add_last(
            "frame-decoder",
            Handler::inbound(ReplayingDecoder::new(LengthPrefixDecoder)),
        )
        .unwrap();
    pipeline
        .add_last("collector", Handler::inbound(Collecting { out: Arc::clone(&out) }))
        .unwrap();
    (pipeline, out)
}

fn frame(body: &[u8]) -> Vec<u8> {
    let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(body);
    bytes
}

#[test]
fn split_header_and_body_still_decode() {
    let (pipeline, out) = decoder_pipeline();
    pipeline.fire_read(PipelineMessage::from(ByteBuf::from_slice(&[0, 0, 0, 5])));
    assert!(out.lock().unwrap().is_empty(), "半包不得提前产出消息");
    pipeline.fire_read(PipelineMessage::from(ByteBuf::from_slice(b"hello")));
    assert_eq!(out.lock().unwrap().as_slice(), [b"hello".to_vec()]);
}

#[test]
fn byte_by_byte_delivery_matches_single_chunk() {
    let payload: Vec<u8> = [frame(b"hello"), frame(b"flint")].concat();

    let (whole, whole_out) = decoder_pipeline();
    whole.fire_read(PipelineMessage::from(ByteBuf::from_slice(&payload)));

    let (dribble, dribble_out) = decoder_pipeline();
    for byte in &payload {
        dribble.fire_read(PipelineMessage::from(ByteBuf::from_slice(&[*byte])));
    }

    let expected = vec![b"hello".to_vec(), b"flint".to_vec()];
    assert_eq!(whole_out.lock().unwrap().as_slice(), expected.as_slice());
    assert_eq!(
        dribble_out.lock().unwrap().as_slice(),
        expected.as_slice(),
        "逐字节送入必须产出与整块送入完全一致的消息序列"
    );
}

#[test]
fn multiple_buffered_messages_decode_in_one_round() {
    let (pipeline, out) = decoder_pipeline();
    let payload: Vec<u8> = [frame(b"a"), frame(b"bb"), frame(b"ccc")].concat();
    pipeline.fire_read(PipelineMessage::from(ByteBuf::from_slice(&payload)));
    assert_eq!(
        out.lock().unwrap().as_slice(),
        [b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]
    );
}

#[test]
fn oversized_length_is_a_decode_error() {
    let (pipeline, channel) = pipeline_with_channel();
    pipeline
        .add_last(
            "frame-decoder",
            Handler::inbound(ReplayingDecoder::new(LengthPrefixDecoder)),
        )
        .unwrap();
    let mut poison = ByteBuf::with_capacity(8);
    poison.write_u32(u32::MAX);
    poison.write_u32(0);
    pipeline.fire_read(PipelineMessage::from(poison));
    assert!(
        channel.closed.load(Ordering::SeqCst),
        "畸形帧经链尾兜底关闭通道"
    );
}
