use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded FIFO with a blocking `take`.
///
/// Closing wakes every blocked taker. After close `push` hands the item
/// back and `take` returns `None`; whatever was left is collected with
/// `drain`.
#[derive(Debug)]
pub(crate) struct BlockingQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
}

impl<T> BlockingQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State { items: VecDeque::new(), closed: false }),
            not_empty: Condvar::new(),
        }
    }

    /// Append an item, returning the depth after the push.
    pub(crate) fn push(&self, item: T) -> Result<usize, T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        let depth = state.items.len();
        self.not_empty.notify_one();
        Ok(depth)
    }

    /// Block until an item is available or the queue is closed.
    pub(crate) fn take(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Refuse further pushes and release every blocked `take`.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
    }

    /// Remove and return everything still queued.
    pub(crate) fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}
