use bytes::Bytes;
use std::sync::{Arc, Mutex};

/// One decoded camera frame, RGB24, top row first, rows tightly packed.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32, data: Bytes) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    /// True when `data` holds a full frame of the stated size.
    pub fn is_complete(&self) -> bool {
        self.data.len() >= self.width as usize * self.height as usize * 3
    }
}

/// Single-slot mailbox between the frame source and the render thread.
/// Publishing replaces whatever frame has not been drawn yet.
#[derive(Debug, Clone, Default)]
pub struct LatestFrame {
    slot: Arc<Mutex<Option<FrameBuffer>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when an undrawn frame was replaced.
    pub fn publish(&self, frame: FrameBuffer) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.replace(frame).is_some()
    }

    /// The newest frame. It stays in the slot so that a second pass (the
    /// recorder) and later redraws upload the same image.
    pub fn latest(&self) -> Option<FrameBuffer> {
        let slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.clone()
    }

    pub fn clear(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.take();
    }
}
