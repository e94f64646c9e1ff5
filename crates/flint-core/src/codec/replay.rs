use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

use crate::buffer::ByteBuf;
use crate::error::CoreError;
use crate::pipeline::{HandlerContext, InboundHandler, PipelineMessage};

/// 解码游标：累积缓冲的读取视图加检查点簿记。
///
/// # 契约说明（What）
/// - 经 `Deref` 暴露 [`ByteBuf`] 的全部读取能力，解码器按"数据总是够"的
///   直线思路消费字节；
/// - [`checkpoint`](Self::checkpoint) 把"当前读位置 + 给定状态"记为新的回
///   滚点：此后若数据不足（返回 `Ok(None)`），读游标只回滚到这里，下次
///   重入直接从该状态继续，已解析的前缀不会被重复解析。
pub struct ReplayCursor<'a, S> {
    buf: &'a mut ByteBuf,
    state: S,
    checkpoint_index: usize,
}

impl<'a, S: Copy> ReplayCursor<'a, S> {
    fn new(buf: &'a mut ByteBuf, state: S) -> Self {
        let checkpoint_index = buf.reader_index();
        Self {
            buf,
            state,
            checkpoint_index,
        }
    }

    /// 当前解码状态。
    pub fn state(&self) -> S {
        self.state
    }

    /// 把当前读位置与 `next` 状态记为新的回滚点。
    pub fn checkpoint(&mut self, next: S) {
        self.checkpoint_index = self.buf.reader_index();
        self.state = next;
    }

    fn into_parts(self) -> (S, usize) {
        (self.state, self.checkpoint_index)
    }
}

impl<S> Deref for ReplayCursor<'_, S> {
    type Target = ByteBuf;

    fn deref(&self) -> &ByteBuf {
        self.buf
    }
}

impl<S> DerefMut for ReplayCursor<'_, S> {
    fn deref_mut(&mut self) -> &mut ByteBuf {
        self.buf
    }
}

/// 可回放解码的扩展点。
///
/// # 契约说明（What）
/// - `State`：协议自定义的解码阶段枚举（最少 `Header`/`Body` 两态），
///   `Default` 值为每条消息的起始状态；
/// - `decode` 的三种出路：
///   - `Ok(Some(msg))`：消息完整，读游标必须恰好停在被消费字节之后；
///   - `Ok(None)`：数据不足，框架回滚到最近的检查点等待更多字节——这不是
///     错误；
///   - `Err(_)`：帧已畸形，错误经 `on_exception_caught` 广播，按约定由链
///     尾关闭连接。
pub trait ReplayDecode: Send + Sync + 'static {
    /// 解码阶段。
    type State: Copy + Default + Send + 'static;
    /// 解码产物。
    type Message: Send + Sync + 'static;

    /// 尝试从游标中解出一条完整消息。
    fn decode(
        &self,
        cursor: &mut ReplayCursor<'_, Self::State>,
    ) -> Result<Option<Self::Message>, CoreError>;
}

/// 每连接一个的解码状态。
struct ReplayInner<S> {
    cumulation: ByteBuf,
    state: S,
}

/// 把字节流还原为离散消息的入站 Handler。
///
/// # 逻辑解析（How）
/// 1. 入站字节先并入累积缓冲；
/// 2. 反复调用 [`ReplayDecode::decode`]：每轮进入前把读游标记为检查点，
///    `Ok(None)` 时回滚到（可能已被 [`ReplayCursor::checkpoint`] 前移的）
///    检查点并停止；`Ok(Some)` 时状态重置为起始态，消息向后转发，继续
///    解下一条已就绪的消息；
/// 3. 一轮结束后压缩累积缓冲，丢弃已消费前缀。
///
/// # 契约说明（What）
/// - 分块方式不影响结果：一次性送入与逐字节送入产出完全相同的消息序列
///   与最终读位置；
/// - `decode` 声称产出消息却未消费任何字节视为实现缺陷，转为解码错误上
///   报，避免死循环。
pub struct ReplayingDecoder<D: ReplayDecode> {
    decoder: D,
    inner: Mutex<ReplayInner<D::State>>,
}

impl<D: ReplayDecode> ReplayingDecoder<D> {
    /// 包装协议解码器。
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            inner: Mutex::new(ReplayInner {
                cumulation: ByteBuf::with_capacity(0),
                state: D::State::default(),
            }),
        }
    }

    /// 累积并尽可能多地解码；持锁期间不回调用户代码。
    fn accumulate_and_decode(
        &self,
        msg: PipelineMessage,
    ) -> Result<Vec<D::Message>, (Vec<D::Message>, CoreError)> {
        let mut inner = self.inner.lock();
        let ReplayInner { cumulation, state } = &mut *inner;
        match msg {
            PipelineMessage::Buffer(mut buf) => cumulation.write_buf(&mut buf),
            PipelineMessage::Shared(bytes) => cumulation.write_slice(&bytes),
            PipelineMessage::User(_) => unreachable!("调用方已分流用户消息"),
        }

        let mut decoded = Vec::new();
        loop {
            if !cumulation.is_readable() {
                break;
            }
            let entry_index = cumulation.reader_index();
            let mut cursor = ReplayCursor::new(cumulation, *state);
            match self.decoder.decode(&mut cursor) {
                Ok(Some(message)) => {
                    drop(cursor);
                    if cumulation.reader_index() == entry_index {
                        return Err((
                            decoded,
                            CoreError::malformed_frame("解码器产出消息却未消费任何字节"),
                        ));
                    }
                    *state = D::State::default();
                    decoded.push(message);
                }
                Ok(None) => {
                    let (next_state, checkpoint) = cursor.into_parts();
                    cumulation.set_reader_index(checkpoint);
                    *state = next_state;
                    break;
                }
                Err(error) => {
                    drop(cursor);
                    cumulation.set_reader_index(entry_index);
                    return Err((decoded, error));
                }
            }
        }
        cumulation.discard_read_bytes();
        Ok(decoded)
    }
}

impl<D: ReplayDecode> InboundHandler for ReplayingDecoder<D> {
    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) -> Result<(), CoreError> {
        let msg = match msg {
            user @ PipelineMessage::User(_) => {
                ctx.forward_read(user);
                return Ok(());
            }
            bytes => bytes,
        };
        match self.accumulate_and_decode(msg) {
            Ok(messages) => {
                for message in messages {
                    ctx.forward_read(PipelineMessage::from_user(message));
                }
                Ok(())
            }
            Err((messages, error)) => {
                for message in messages {
                    ctx.forward_read(PipelineMessage::from_user(message));
                }
                Err(error)
            }
        }
    }

    fn on_channel_inactive(&self, ctx: &HandlerContext<'_>) -> Result<(), CoreError> {
        // 连接终止即弃置半包状态。
        let mut inner = self.inner.lock();
        inner.cumulation.clear();
        inner.state = D::State::default();
        drop(inner);
        ctx.forward_channel_inactive();
        Ok(())
    }
}
