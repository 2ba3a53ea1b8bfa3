//! Bounded FIFO of upstream messages captured while no client is attached.
//!
//! Two caps apply simultaneously: a configurable line count and a hard
//! 10 MiB byte cap. Overruns evict from the head; a single chunk larger
//! than the byte cap is dropped outright.

use crate::config::MAX_BUFFER_BYTES;
use std::collections::VecDeque;
use std::time::Instant;

/// One buffered upstream message.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub data: Vec<u8>,
    pub timestamp: Instant,
}

/// Replay buffer for a single session.
#[derive(Debug, Default)]
pub struct ReplayBuffer {
    messages: VecDeque<BufferedMessage>,
    byte_size: usize,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, evicting from the head until both caps hold.
    ///
    /// Returns `false` if the chunk alone exceeds the byte cap and was
    /// dropped; the caller logs, the session continues.
    pub fn push(&mut self, data: Vec<u8>, max_lines: usize) -> bool {
        if data.len() > MAX_BUFFER_BYTES {
            return false;
        }
        while self.messages.len() >= max_lines {
            self.evict_oldest();
        }
        while self.byte_size + data.len() > MAX_BUFFER_BYTES && !self.messages.is_empty() {
            self.evict_oldest();
        }
        self.byte_size += data.len();
        self.messages.push_back(BufferedMessage {
            data,
            timestamp: Instant::now(),
        });
        true
    }

    /// Take every buffered message in arrival order, leaving the buffer
    /// empty. Called on client reattach.
    pub fn drain(&mut self) -> Vec<BufferedMessage> {
        self.byte_size = 0;
        self.messages.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Sum of payload lengths currently held.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    fn evict_oldest(&mut self) {
        if let Some(evicted) = self.messages.pop_front() {
            self.byte_size -= evicted.data.len();
        }
    }
}
