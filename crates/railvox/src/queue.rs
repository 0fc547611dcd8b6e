//! Bounded FIFO of in-flight requests with head-of-line dequeue.

use std::collections::VecDeque;

use crate::buffer::AudioBuffer;
use crate::error::VoxResult;
use crate::request::{PlaybackRequest, RequestId, ResolvedRequest};

/// Requests in submission order. Only the head may leave, and only once resolved,
/// no matter which later requests finished first.
#[derive(Debug)]
pub struct PendingQueue {
    requests: VecDeque<PlaybackRequest>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            requests: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.requests.len() >= self.capacity
    }

    /// Append at the tail. Hands the request back when the queue is full.
    pub fn push(&mut self, request: PlaybackRequest) -> Result<(), PlaybackRequest> {
        if self.is_full() {
            return Err(request);
        }
        self.requests.push_back(request);
        Ok(())
    }

    pub fn head(&self) -> Option<&PlaybackRequest> {
        self.requests.front()
    }

    /// Dequeue the head if it has resolved; otherwise leave everything in place.
    pub fn pop_resolved(&mut self) -> Option<ResolvedRequest> {
        let head = self.requests.pop_front()?;
        match head.into_resolved() {
            Ok(resolved) => Some(resolved),
            Err(pending) => {
                self.requests.push_front(pending);
                None
            }
        }
    }

    /// Apply an outcome to the request with `id`. False when it is no longer queued.
    pub fn resolve(&mut self, id: RequestId, outcome: VoxResult<AudioBuffer>) -> bool {
        match self.requests.iter_mut().find(|r| r.id() == id) {
            Some(request) => {
                request.resolve(outcome);
                true
            }
            None => false,
        }
    }

    /// Cancel and drop every request. Returns how many were dropped.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.requests.len();
        for mut request in self.requests.drain(..) {
            request.cancel();
        }
        count
    }
}
