//! Response queue between the SIP server's receive loop and the probe.
//!
//! When the probe borrows the server's UDP/5060 socket it cannot read from
//! it; the server reads every datagram and hands matching responses to this
//! queue. A small ring is plenty, responses for one in-flight transaction
//! arrive one or two at a time; on overflow the oldest message is dropped.

use crate::config::defaults::RESPONSE_QUEUE_SLOTS;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct ResponseQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
    cond: Condvar,
    slots: usize,
}

impl ResponseQueue {
    pub fn new() -> Self {
        Self::with_slots(RESPONSE_QUEUE_SLOTS)
    }

    pub fn with_slots(slots: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(slots)),
            cond: Condvar::new(),
            slots,
        }
    }

    /// Enqueue one SIP message, dropping the oldest when full.
    pub fn enqueue(&self, message: Vec<u8>) {
        let mut queue = self.inner.lock().expect("response queue lock");
        if queue.len() >= self.slots {
            queue.pop_front();
        }
        queue.push_back(message);
        self.cond.notify_one();
    }

    /// Wait up to `timeout` for a message, against a monotonic deadline.
    pub fn dequeue(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.lock().expect("response queue lock");

        loop {
            if let Some(message) = queue.pop_front() {
                return Some(message);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .cond
                .wait_timeout(queue, deadline - now)
                .expect("response queue wait");
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("response queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResponseQueue {
    fn default() -> Self {
        Self::new()
    }
}
