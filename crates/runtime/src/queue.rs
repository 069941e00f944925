use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Error surface of the bounded queue.
///
/// `Busy` and `Deadlock` are distinct so callers can branch on "try again
/// later" versus "this entry can never fit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue has been closed; terminal.
    #[error("queue is closed")]
    Closed,
    /// Non-blocking call found the queue full (put) or empty (get).
    #[error("queue is busy")]
    Busy,
    /// A single entry is heavier than the queue's whole capacity.
    #[error("entry weight exceeds queue capacity")]
    Deadlock,
}

/// One queued record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<T> {
    pub id: u32,
    pub item: T,
    pub weight: u32,
}

struct Inner<T> {
    entries: VecDeque<Entry<T>>,
    size: u64,
    closed: bool,
}

/// FIFO queue bounded by the aggregate weight of its entries.
///
/// A `max_size` of zero means unbounded. Once closed the queue never
/// re-opens: blocked producers and consumers are released, later puts fail
/// with [`QueueError::Closed`], and gets drain what is left before failing
/// the same way.
pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    max_size: u64,
}

impl<T> Queue<T> {
    pub fn new(max_size: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                size: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            max_size: u64::from(max_size),
        }
    }

    /// Enqueue, blocking while the queue is over capacity.
    pub fn put(&self, id: u32, item: T, weight: u32) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if self.max_size > 0 {
            if u64::from(weight) > self.max_size {
                return Err(QueueError::Deadlock);
            }
            while inner.size + u64::from(weight) > self.max_size && !inner.closed {
                inner = self.not_full.wait(inner).unwrap();
            }
        }
        if inner.closed {
            return Err(QueueError::Closed);
        }
        inner.size += u64::from(weight);
        inner.entries.push_back(Entry { id, item, weight });
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue without blocking; full queues report [`QueueError::Busy`].
    pub fn try_put(&self, id: u32, item: T, weight: u32) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if self.max_size > 0 {
            if u64::from(weight) > self.max_size {
                return Err(QueueError::Deadlock);
            }
            if inner.size + u64::from(weight) > self.max_size {
                return Err(QueueError::Busy);
            }
        }
        inner.size += u64::from(weight);
        inner.entries.push_back(Entry { id, item, weight });
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue, blocking while the queue is empty and open.
    pub fn get(&self) -> Result<Entry<T>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        while inner.entries.is_empty() && !inner.closed {
            inner = self.not_empty.wait(inner).unwrap();
        }
        match inner.entries.pop_front() {
            Some(entry) => {
                inner.size -= u64::from(entry.weight);
                self.not_full.notify_one();
                Ok(entry)
            }
            None => Err(QueueError::Closed),
        }
    }

    /// Dequeue without blocking; empty open queues report [`QueueError::Busy`].
    pub fn try_get(&self) -> Result<Entry<T>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.pop_front() {
            Some(entry) => {
                inner.size -= u64::from(entry.weight);
                self.not_full.notify_one();
                Ok(entry)
            }
            None if inner.closed => Err(QueueError::Closed),
            None => Err(QueueError::Busy),
        }
    }

    /// Close the queue and release every blocked producer and consumer.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        if self.max_size == 0 {
            return false;
        }
        self.inner.lock().unwrap().size >= self.max_size
    }

    pub fn elements(&self) -> u32 {
        self.inner.lock().unwrap().entries.len() as u32
    }

    pub fn size_left(&self) -> u64 {
        if self.max_size == 0 {
            return u64::MAX;
        }
        let inner = self.inner.lock().unwrap();
        self.max_size.saturating_sub(inner.size)
    }
}
