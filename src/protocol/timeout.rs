use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// 会话存活窗口
///
/// 每收到一条消息刷新一次，超过窗口未刷新即视为过期。
/// 使用 tokio 时钟，暂停时间的测试可以直接推进。
#[derive(Debug)]
pub struct TimeOut {
    inner: Mutex<Window>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    timeout: Duration,
    last_touched: Instant,
}

impl TimeOut {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Window {
                timeout,
                last_touched: Instant::now(),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.lock().timeout
    }

    /// 替换窗口长度（协商结果），同时刷新
    pub fn set_timeout(&self, timeout: Duration) {
        let mut window = self.inner.lock();
        window.timeout = timeout;
        window.last_touched = Instant::now();
    }

    pub fn touch(&self) {
        self.inner.lock().last_touched = Instant::now();
    }

    /// 距离过期的剩余时间
    pub fn remaining(&self) -> Duration {
        let window = *self.inner.lock();
        window.timeout.saturating_sub(window.last_touched.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// 心跳间隔：窗口的三分之一
    pub fn heartbeat_interval(&self) -> Duration {
        (self.timeout() / 3).max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expires_without_touch() {
        let timeout = TimeOut::new(Duration::from_secs(3));
        assert_eq!(timeout.heartbeat_interval(), Duration::from_secs(1));
        assert!(!timeout.is_expired());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(timeout.remaining(), Duration::from_secs(1));
        timeout.touch();
        assert_eq!(timeout.remaining(), Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(timeout.is_expired());

        timeout.set_timeout(Duration::from_secs(6));
        assert!(!timeout.is_expired());
        assert_eq!(timeout.heartbeat_interval(), Duration::from_secs(2));
    }
}
