/// 会话消息的帧编解码
///
/// 长度前缀分帧，帧体为 JSON。可直接放进 [`FrameCodec`] 作为端点编解码器。

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::protocol::message::{ClientMessage, ServerMessage};
use crate::transport::FrameCodec;

/// 编码 `I`、解码 `O` 的 JSON 帧编解码器
pub struct JsonCodec<I, O> {
    frames: LengthDelimitedCodec,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> JsonCodec<I, O> {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::new(),
            _marker: PhantomData,
        }
    }

    /// 限制单帧大小
    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder().max_frame_length(max).new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<I, O> Default for JsonCodec<I, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Serialize, O> Encoder<I> for JsonCodec<I, O> {
    type Error = io::Error;

    fn encode(&mut self, item: I, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.frames.encode(Bytes::from(body), dst)
    }
}

impl<I, O: DeserializeOwned> Decoder for JsonCodec<I, O> {
    type Item = O;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<O>, io::Error> {
        match self.frames.decode(src)? {
            Some(frame) => serde_json::from_slice(&frame)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

/// 客户端端点的编解码器
pub type ClientCodec = FrameCodec<JsonCodec<ClientMessage, ServerMessage>, ClientMessage>;

/// 服务端端点的编解码器
pub type ServerCodec = FrameCodec<JsonCodec<ServerMessage, ClientMessage>, ServerMessage>;

pub fn client_codec() -> ClientCodec {
    FrameCodec::new(JsonCodec::new())
}

pub fn server_codec() -> ServerCodec {
    FrameCodec::new(JsonCodec::new())
}
