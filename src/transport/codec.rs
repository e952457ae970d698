/// 端点编解码
///
/// 出站时把类型化消息编码成线上表示，入站时把线上表示解码为零个或多个消息。
/// 出站与入站的线上类型可以不同，因此客户端与服务端可以在不经过字节的情况下
/// 直接互传各自的消息类型。

use bytes::{Bytes, BytesMut};
use std::fmt::Display;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;

pub trait Codec: Send + 'static {
    /// 写入的消息
    type Input: Send + 'static;
    /// 发布给监听器的消息
    type Output: Send + Sync + 'static;
    /// 发往对端的线上表示
    type Outbound: Send + 'static;
    /// 从对端收到的线上表示
    type Inbound: Send + 'static;

    fn encode(&mut self, message: Self::Input) -> Result<Self::Outbound, TransportError>;

    /// 数据不足时返回空列表，等待更多输入
    fn decode(&mut self, wire: Self::Inbound) -> Result<Vec<Self::Output>, TransportError>;
}

/// 不做任何转换的编解码器
pub struct Passthrough<I, O = I> {
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Passthrough<I, O> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<I, O> Default for Passthrough<I, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, O> Codec for Passthrough<I, O>
where
    I: Send + 'static,
    O: Send + Sync + 'static,
{
    type Input = I;
    type Output = O;
    type Outbound = I;
    type Inbound = O;

    fn encode(&mut self, message: I) -> Result<I, TransportError> {
        Ok(message)
    }

    fn decode(&mut self, wire: O) -> Result<Vec<O>, TransportError> {
        Ok(vec![wire])
    }
}

/// 基于 tokio-util 编解码器的字节帧编解码
///
/// 入站字节先追加到累积缓冲区，再尽可能多地切出完整帧
pub struct FrameCodec<C, I> {
    codec: C,
    buffer: BytesMut,
    _input: PhantomData<fn(I)>,
}

impl<C, I> FrameCodec<C, I> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            buffer: BytesMut::new(),
            _input: PhantomData,
        }
    }

    /// 尚未成帧的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl<C, I> Codec for FrameCodec<C, I>
where
    C: Decoder + Encoder<I> + Send + 'static,
    C::Item: Send + Sync + 'static,
    <C as Decoder>::Error: Display,
    <C as Encoder<I>>::Error: Display,
    I: Send + 'static,
{
    type Input = I;
    type Output = C::Item;
    type Outbound = Bytes;
    type Inbound = Bytes;

    fn encode(&mut self, message: I) -> Result<Bytes, TransportError> {
        let mut out = BytesMut::new();
        self.codec
            .encode(message, &mut out)
            .map_err(|e| TransportError::codec_error(format!("encode failed: {}", e)))?;
        Ok(out.freeze())
    }

    fn decode(&mut self, wire: Bytes) -> Result<Vec<C::Item>, TransportError> {
        self.buffer.extend_from_slice(&wire);
        let mut decoded = Vec::new();
        while let Some(item) = self
            .codec
            .decode(&mut self.buffer)
            .map_err(|e| TransportError::codec_error(format!("decode failed: {}", e)))?
        {
            decoded.push(item);
        }
        Ok(decoded)
    }
}
