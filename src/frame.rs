use std::sync::Arc;
use std::time::SystemTime;

/// A single JPEG-encoded camera frame
#[derive(Debug, Clone)]
pub struct FrameData {
    /// Unique frame identifier
    pub id: u64,
    /// Timestamp when frame was captured
    pub timestamp: SystemTime,
    /// Encoded frame bytes (shared ownership for efficiency)
    pub data: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl FrameData {
    /// Create a new frame data instance
    pub fn new(id: u64, timestamp: SystemTime, data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            id,
            timestamp,
            data: Arc::new(data),
            width,
            height,
        }
    }

    /// Size of the encoded frame in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check that the bytes carry JPEG start/end markers
    pub fn is_jpeg(&self) -> bool {
        self.data.len() >= 4
            && self.data[0] == 0xFF
            && self.data[1] == 0xD8
            && self.data[self.data.len() - 2] == 0xFF
            && self.data[self.data.len() - 1] == 0xD9
    }

    /// Get frame age in milliseconds
    pub fn age_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.timestamp)
            .unwrap_or_default()
            .as_millis() as u64
    }
}
