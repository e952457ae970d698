use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crate::error::TransportError;
use crate::promise::Promise;
use crate::protocol::message::{OpCode, Response, ServerMessage, Xid, Zxid};
use crate::protocol::session::Session;

/// Per-connection xid counter
///
/// Starts at 1 and wraps back to 1, never handing out the reserved negative xids
#[derive(Debug)]
pub struct XidGenerator {
    next: AtomicI32,
}

impl XidGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }

    pub fn next(&self) -> Xid {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let following = if current == Xid::MAX { 1 } else { current + 1 };
            match self
                .next
                .compare_exchange_weak(current, following, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn peek(&self) -> Xid {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for XidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Last zxid seen from the server, never moves backward
#[derive(Debug, Default)]
pub struct ZxidTracker {
    last: AtomicI64,
}

impl ZxidTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Zxid {
        self.last.load(Ordering::Acquire)
    }

    /// Advance to `zxid` if it is newer. Returns whether the value changed.
    pub fn advance(&self, zxid: Zxid) -> bool {
        self.last.fetch_max(zxid, Ordering::AcqRel) < zxid
    }
}

/// Where a pending request delivers its outcome
pub(crate) enum Reply {
    Session(Promise<Result<Session, TransportError>>),
    Operation(Promise<Result<Response, TransportError>>),
}

impl Reply {
    pub fn fail(self, error: TransportError) {
        match self {
            Reply::Session(promise) => {
                promise.set(Err(error));
            }
            Reply::Operation(promise) => {
                promise.set(Err(error));
            }
        }
    }
}

pub(crate) struct PendingTask {
    pub xid: Xid,
    pub op: OpCode,
    pub reply: Reply,
}

impl PendingTask {
    pub fn fail(self, error: TransportError) {
        self.reply.fail(error);
    }
}

/// Head of the queue at the moment a response failed to correlate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub expected: Option<(Xid, OpCode)>,
    pub received: OpCode,
}

/// FIFO of requests awaiting a response
///
/// Requests are assumed to complete in send order, so only the head is ever
/// matched against an incoming response.
#[derive(Default)]
pub(crate) struct PendingQueue {
    tasks: Mutex<VecDeque<PendingTask>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: PendingTask) {
        self.tasks.lock().push_back(task);
    }

    /// Remove a task whose request never made it onto the wire
    pub fn remove(&self, xid: Xid) -> Option<PendingTask> {
        let mut tasks = self.tasks.lock();
        let index = tasks.iter().position(|t| t.xid == xid)?;
        tasks.remove(index)
    }

    /// Pop the head if its operation matches
    pub fn correlate(&self, message: &ServerMessage) -> Result<PendingTask, Mismatch> {
        let received = message.op();
        let mut tasks = self.tasks.lock();
        match tasks.front().map(|head| (head.xid, head.op)) {
            Some((_, op)) if op == received => tasks.pop_front().ok_or(Mismatch {
                expected: None,
                received,
            }),
            expected => Err(Mismatch { expected, received }),
        }
    }

    pub fn drain(&self) -> Vec<PendingTask> {
        self.tasks.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}
