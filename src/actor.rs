use crossbeam::queue::SegQueue;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Actor状态枚举
///
/// 状态字只在 Waiting → Scheduled → Running → Waiting 之间循环，Terminated 为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ActorState {
    /// 空闲，邮箱可能为空
    Waiting = 0,
    /// 已调度，等待执行器执行
    Scheduled = 1,
    /// 正在排空邮箱
    Running = 2,
    /// 已停止，不再接收消息
    Terminated = 3,
}

impl ActorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ActorState::Waiting,
            1 => ActorState::Scheduled,
            2 => ActorState::Running,
            _ => ActorState::Terminated,
        }
    }
}

/// 邮箱排空任务的执行器
#[derive(Debug, Clone, Default)]
pub enum Executor {
    /// 在调度线程上直接执行（确定性，适合测试）
    #[default]
    SameThread,
    /// 投递到 tokio 运行时执行
    Tokio(tokio::runtime::Handle),
}

impl Executor {
    /// 当前运行时可用则使用 tokio，否则同线程执行
    pub fn current() -> Self {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Executor::Tokio(handle),
            Err(_) => Executor::SameThread,
        }
    }

    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Executor::SameThread => task(),
            Executor::Tokio(handle) => {
                handle.spawn(async move { task() });
            }
        }
    }
}

/// Actor 邮箱
///
/// 无锁 FIFO 队列加一个 CAS 状态字。任何线程都可以投递消息，但同一时刻至多一个
/// 线程在排空队列；排空结束后会重新检查队列，避免丢失排空期间到达的唤醒。
pub struct Mailbox<T> {
    queue: SegQueue<T>,
    state: CachePadded<AtomicU8>,
    processed: AtomicU64,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            state: CachePadded::new(AtomicU8::new(ActorState::Waiting as u8)),
            processed: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ActorState {
        ActorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ActorState::Terminated
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// 已处理的消息数量
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// 投递消息；邮箱已停止时原样退回
    pub fn offer(&self, message: T) -> Result<(), T> {
        if self.is_terminated() {
            return Err(message);
        }
        self.queue.push(message);
        Ok(())
    }

    /// 尝试把 Waiting 切到 Scheduled
    ///
    /// 返回 true 时调用方负责安排一次 [`Mailbox::run`]
    pub fn schedule(&self) -> bool {
        self.transition(ActorState::Waiting, ActorState::Scheduled)
    }

    /// 排空邮箱
    ///
    /// `apply` 返回 false 时停止本轮排空（通常是遇到了关闭哨兵）
    pub fn run<F>(&self, mut apply: F)
    where
        F: FnMut(T) -> bool,
    {
        loop {
            if !self.transition(ActorState::Scheduled, ActorState::Running) {
                return;
            }
            while let Some(message) = self.queue.pop() {
                self.processed.fetch_add(1, Ordering::Relaxed);
                if !apply(message) {
                    break;
                }
            }
            if !self.transition(ActorState::Running, ActorState::Waiting) {
                // 排空期间被停止
                return;
            }
            if self.queue.is_empty() || !self.schedule() {
                return;
            }
        }
    }

    /// 停止邮箱，只有第一次调用返回 true
    pub fn stop(&self) -> bool {
        self.state.swap(ActorState::Terminated as u8, Ordering::AcqRel) != ActorState::Terminated as u8
    }

    /// 取出所有剩余消息
    pub fn clear(&self) -> Vec<T> {
        let mut remaining = Vec::with_capacity(self.queue.len());
        while let Some(message) = self.queue.pop() {
            remaining.push(message);
        }
        remaining
    }

    fn transition(&self, from: ActorState, to: ActorState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("state", &self.state())
            .field("len", &self.len())
            .field("processed", &self.processed())
            .finish()
    }
}
