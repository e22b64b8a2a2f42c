//! Bounded frame buffer shared with downstream consumers.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::types::Frame;

// ── SampleWindow ──────────────────────────────────────────────────────────────

/// Fixed-capacity FIFO of the most recent frames.
///
/// A single producer (the controller's reader task) appends; when full, the
/// oldest frame is evicted. Consumers never see the buffer directly; they
/// read copies through [`WindowHandle`].
#[derive(Debug)]
pub struct SampleWindow {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl SampleWindow {
    /// Create a window retaining at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame, evicting the oldest if the window is full.
    pub fn push(&mut self, frame: Frame) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// The most recently appended frame.
    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    /// Copy out all retained frames, oldest first.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames.iter().cloned().collect()
    }

    /// Copy out all retained samples as one flat sequence, oldest frame first.
    pub fn samples(&self) -> Vec<i16> {
        self.frames
            .iter()
            .flat_map(|f| f.samples.iter().copied())
            .collect()
    }
}

// ── WindowHandle ──────────────────────────────────────────────────────────────

/// Cloneable reference to a [`SampleWindow`].
///
/// Clones handed to consumers expose only the read side; the write side
/// (`push`, `clear`) is crate-private and used solely by the controller, so
/// the single-producer discipline is enforced by visibility.
#[derive(Debug, Clone)]
pub struct WindowHandle {
    inner: Arc<RwLock<SampleWindow>>,
}

impl WindowHandle {
    pub(crate) fn new(window: SampleWindow) -> Self {
        Self {
            inner: Arc::new(RwLock::new(window)),
        }
    }

    pub async fn snapshot(&self) -> Vec<Frame> {
        self.inner.read().await.snapshot()
    }

    pub async fn samples(&self) -> Vec<i16> {
        self.inner.read().await.samples()
    }

    pub async fn latest(&self) -> Option<Frame> {
        self.inner.read().await.latest().cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn capacity(&self) -> usize {
        self.inner.read().await.capacity()
    }

    pub(crate) async fn push(&self, frame: Frame) {
        self.inner.write().await.push(frame);
    }

    pub(crate) async fn clear(&self) {
        self.inner.write().await.clear();
    }
}
