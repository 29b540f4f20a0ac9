//! Bounded outbound queue with watermark backpressure.
//!
//! Single producer (the session owner), single consumer (the session
//! task). Pushes never block: a push that would exceed the byte budget
//! reports `WouldBlock` and the caller retries after a `Writable` event,
//! which the session task raises when draining crosses the low watermark.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Outcome of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    WouldBlock,
    Closed,
}

struct Inner {
    chunks: VecDeque<Bytes>,
    bytes: usize,
    closed: bool,
    /// Set once the queue grows past the high watermark; cleared (and a
    /// writable signal owed) when draining falls below the low watermark.
    above_high: bool,
}

pub struct SendQueue {
    inner: Mutex<Inner>,
    budget: usize,
    high_water: usize,
    low_water: usize,
    notify: Notify,
}

impl SendQueue {
    pub fn new(budget: usize, high_water: usize, low_water: usize) -> Self {
        SendQueue {
            inner: Mutex::new(Inner {
                chunks: VecDeque::new(),
                bytes: 0,
                closed: false,
                above_high: false,
            }),
            budget,
            high_water,
            low_water,
            notify: Notify::new(),
        }
    }

    /// Queue one chunk. Never blocks.
    pub fn push(&self, chunk: Bytes) -> SendOutcome {
        let mut inner = self.inner.lock();
        if inner.closed {
            return SendOutcome::Closed;
        }
        if inner.bytes + chunk.len() > self.budget {
            return SendOutcome::WouldBlock;
        }
        inner.bytes += chunk.len();
        inner.chunks.push_back(chunk);
        if inner.bytes >= self.high_water {
            inner.above_high = true;
        }
        drop(inner);
        self.notify.notify_one();
        SendOutcome::Sent
    }

    /// Await the next chunk. The boolean is true when this pop crossed
    /// the low watermark coming down from the high one, i.e. the owner
    /// should be told the session is writable again. Returns `None` once
    /// the queue is closed and drained.
    pub async fn pop(&self) -> Option<(Bytes, bool)> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(chunk) = inner.chunks.pop_front() {
                    inner.bytes -= chunk.len();
                    let writable = inner.above_high && inner.bytes <= self.low_water;
                    if writable {
                        inner.above_high = false;
                    }
                    return Some((chunk, writable));
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue; queued chunks still drain, further pushes fail.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn above_high_water(&self) -> bool {
        self.inner.lock().bytes >= self.high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> SendQueue {
        SendQueue::new(100, 75, 50)
    }

    #[test]
    fn push_respects_budget() {
        let q = queue();
        assert_eq!(q.push(Bytes::from(vec![0u8; 60])), SendOutcome::Sent);
        assert_eq!(q.push(Bytes::from(vec![0u8; 60])), SendOutcome::WouldBlock);
        assert_eq!(q.queued_bytes(), 60);
    }

    #[test]
    fn closed_queue_rejects() {
        let q = queue();
        q.close();
        assert_eq!(q.push(Bytes::from_static(b"x")), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn pop_signals_writable_after_high_water() {
        let q = queue();
        assert_eq!(q.push(Bytes::from(vec![1u8; 40])), SendOutcome::Sent);
        assert_eq!(q.push(Bytes::from(vec![2u8; 40])), SendOutcome::Sent);
        assert!(q.above_high_water());

        // 80 -> 40 crosses the low watermark on the second pop.
        let (_, writable) = q.pop().await.unwrap();
        assert!(!writable);
        let (_, writable) = q.pop().await.unwrap();
        assert!(writable);
    }

    #[tokio::test]
    async fn pop_drains_then_ends_after_close() {
        let q = queue();
        assert_eq!(q.push(Bytes::from_static(b"last")), SendOutcome::Sent);
        q.close();
        let (chunk, _) = q.pop().await.unwrap();
        assert_eq!(&chunk[..], b"last");
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = std::sync::Arc::new(queue());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        q.push(Bytes::from_static(b"wake"));
        let (chunk, _) = waiter.await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"wake");
    }
}
