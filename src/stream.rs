use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::event::SessionEvent;
use crate::SessionId;

/// 会话事件流
///
/// 提供对会话事件的流式访问，支持按会话过滤
pub struct EventStream {
    /// 内部广播流
    inner: BroadcastStream<SessionEvent>,
    /// 可选的会话过滤器
    session_filter: Option<SessionId>,
}

impl EventStream {
    /// 创建新的事件流
    pub fn new(receiver: broadcast::Receiver<SessionEvent>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
            session_filter: None,
        }
    }

    /// 只保留特定会话的事件
    pub fn filter_session(mut self, session_id: SessionId) -> Self {
        self.session_filter = Some(session_id);
        self
    }

    /// 获取下一个协议状态事件
    pub async fn next_state_event(&mut self) -> Option<SessionEvent> {
        self.next_matching(SessionEvent::is_state_event).await
    }

    /// 获取下一个服务端通知
    pub async fn next_notification(&mut self) -> Option<SessionEvent> {
        self.next_matching(SessionEvent::is_notification).await
    }

    /// 获取会话终止事件
    pub async fn next_terminal_event(&mut self) -> Option<SessionEvent> {
        self.next_matching(SessionEvent::is_terminal).await
    }

    async fn next_matching(&mut self, predicate: fn(&SessionEvent) -> bool) -> Option<SessionEvent> {
        while let Some(event) = self.next().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    }

    /// 未分配会话ID之前的事件总是发出
    fn should_emit_event(&self, event: &SessionEvent) -> bool {
        match self.session_filter {
            Some(filter) => {
                let session_id = event.session_id();
                !session_id.is_initialized() || session_id == filter
            }
            None => true,
        }
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if self.should_emit_event(&event) {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(lagged))) => {
                    // 落后的接收者跳过丢失的事件继续读取
                    trace!("事件流落后: {}", lagged);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
