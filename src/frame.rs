//! Frame hand-off layer.
//!
//! - `Frame`: Immutable image buffer. Pixel data sits behind an `Arc`, so cloning a frame
//!   hands out a snapshot, never a live reference into the producer's buffer.
//! - `ImageSlot`: Single-element, mutex-guarded cell holding the freshest frame of one stream.
//! - `FramePublisher`: Producer-side handle onto a slot.
//!
//! A slot is NOT a queue. A publish replaces whatever was there: consumers may miss frames,
//! but never observe a half-written one.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard};

// ----------------------------------------------------------------------------
// Frame: immutable image payload
// ----------------------------------------------------------------------------

/// Pixel layout of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 3 channels, 8 bits each, interleaved.
    Rgb8,
    /// 1 channel, 16 bits little-endian. Multiply by the camera depth scale for meters.
    Depth16,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Depth16 => 2,
        }
    }
}

/// One captured image. Cheap to clone; the pixel buffer is shared and never mutated.
#[derive(Clone, Debug)]
pub struct Frame {
    format: PixelFormat,
    width: u32,
    height: u32,
    data: Arc<[u8]>,
    /// Publish order assigned by the slot. Zero until published.
    generation: u64,
    /// Sequence position of the file or message this frame came from, if known.
    source_index: Option<u64>,
    placeholder: bool,
}

impl Frame {
    /// Build a frame from raw bytes. The length must match `width * height * bpp`.
    pub fn new(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(anyhow!(
                "{:?} frame {}x{} needs {} bytes, got {}",
                format,
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            format,
            width,
            height,
            data: data.into(),
            generation: 0,
            source_index: None,
            placeholder: false,
        })
    }

    pub fn rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        Self::new(PixelFormat::Rgb8, width, height, data)
    }

    pub fn depth(width: u32, height: u32, depth: &[u16]) -> Result<Self> {
        let bytes = depth.iter().flat_map(|d| d.to_le_bytes()).collect();
        Self::new(PixelFormat::Depth16, width, height, bytes)
    }

    /// Zero-filled frame used to mark a stream as wired before real data arrives.
    pub fn placeholder(format: PixelFormat, width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            format,
            width,
            height,
            data: vec![0u8; len].into(),
            generation: 0,
            source_index: None,
            placeholder: true,
        }
    }

    /// Tag the frame with its load index before publishing.
    pub fn with_source_index(mut self, index: u64) -> Self {
        self.source_index = Some(index);
        self
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source_index(&self) -> Option<u64> {
        self.source_index
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    /// Depth value at a pixel, or `None` for color frames and out-of-range coordinates.
    pub fn depth_at(&self, x: u32, y: u32) -> Option<u16> {
        if self.format != PixelFormat::Depth16 || x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 2;
        Some(u16::from_le_bytes([self.data[i], self.data[i + 1]]))
    }
}

// ----------------------------------------------------------------------------
// ImageSlot: freshest-frame cell
// ----------------------------------------------------------------------------

#[derive(Default)]
struct SlotState {
    frame: Option<Frame>,
    generation: u64,
}

/// Single-slot buffer for one stream.
///
/// The mutex guards exactly one frame handle; it is held only for the swap or the clone of
/// an `Arc`, so neither side blocks beyond that critical section.
#[derive(Default)]
pub struct ImageSlot {
    state: Mutex<SlotState>,
}

impl ImageSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame. Always succeeds; the previous frame is dropped.
    pub fn publish(&self, mut frame: Frame) {
        let mut state = self.lock();
        state.generation += 1;
        frame.generation = state.generation;
        state.frame = Some(frame);
    }

    /// The most recently published frame, or `None` if nothing was ever published.
    pub fn snapshot(&self) -> Option<Frame> {
        self.lock().frame.clone()
    }

    /// Number of publishes so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn is_ready(&self) -> bool {
        self.lock().frame.is_some()
    }

    // Publish is a single assignment, so a poisoned lock never holds a torn frame.
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Producer handle onto a slot. Clone it into callback threads.
///
/// Bound to the pixel format of the stream it feeds; frames of any other format are
/// rejected and the slot keeps its current frame.
#[derive(Clone)]
pub struct FramePublisher {
    slot: Arc<ImageSlot>,
    format: PixelFormat,
}

impl FramePublisher {
    pub(crate) fn new(slot: Arc<ImageSlot>, format: PixelFormat) -> Self {
        Self { slot, format }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn publish(&self, frame: Frame) -> Result<()> {
        if frame.format() != self.format {
            return Err(anyhow!(
                "{:?} frame rejected by a {:?} stream",
                frame.format(),
                self.format
            ));
        }
        self.slot.publish(frame);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn filled(value: u8) -> Frame {
        Frame::rgb(4, 2, vec![value; 4 * 2 * 3]).unwrap()
    }

    #[test]
    fn empty_slot_snapshot_is_none() {
        let slot = ImageSlot::new();
        assert!(slot.snapshot().is_none());
        assert!(!slot.is_ready());
        assert_eq!(slot.generation(), 0);
    }

    #[test]
    fn publish_replaces_previous_frame() {
        let slot = ImageSlot::new();
        slot.publish(filled(1));
        slot.publish(filled(2));

        let frame = slot.snapshot().expect("frame");
        assert!(frame.data().iter().all(|&p| p == 2));
        assert_eq!(frame.generation(), 2);
    }

    #[test]
    fn snapshot_outlives_overwrite() {
        let slot = ImageSlot::new();
        slot.publish(filled(7));
        let held = slot.snapshot().unwrap();
        slot.publish(filled(9));

        assert!(held.data().iter().all(|&p| p == 7));
        assert!(slot.snapshot().unwrap().data().iter().all(|&p| p == 9));
    }

    #[test]
    fn frame_rejects_wrong_length() {
        assert!(Frame::rgb(2, 2, vec![0; 11]).is_err());
        assert!(Frame::new(PixelFormat::Depth16, 2, 2, vec![0; 8]).is_ok());
    }

    #[test]
    fn depth_frame_reads_back_values() {
        let frame = Frame::depth(2, 2, &[1, 500, 1000, 65535]).unwrap();
        assert_eq!(frame.depth_at(1, 0), Some(500));
        assert_eq!(frame.depth_at(1, 1), Some(65535));
        assert_eq!(frame.depth_at(2, 0), None);
        assert_eq!(filled(1).depth_at(0, 0), None);
    }

    #[test]
    fn publisher_rejects_other_pixel_formats() {
        let slot = Arc::new(ImageSlot::new());
        let publisher = FramePublisher::new(slot.clone(), PixelFormat::Rgb8);
        publisher.publish(filled(3)).unwrap();

        let depth = Frame::depth(2, 2, &[1, 2, 3, 4]).unwrap();
        let err = publisher.publish(depth).unwrap_err();
        assert!(err.to_string().contains("Depth16"));
        let held = slot.snapshot().unwrap();
        assert_eq!(held.format(), PixelFormat::Rgb8);
        assert_eq!(slot.generation(), 1);
    }

    #[test]
    fn concurrent_snapshots_are_never_torn() {
        let slot = Arc::new(ImageSlot::new());
        let publisher = FramePublisher::new(slot.clone(), PixelFormat::Rgb8);

        let producer = thread::spawn(move || {
            for i in 0..2000u32 {
                publisher.publish(filled((i % 251) as u8)).unwrap();
            }
        });

        let mut last_generation = 0;
        for _ in 0..2000 {
            if let Some(frame) = slot.snapshot() {
                let first = frame.data()[0];
                assert!(frame.data().iter().all(|&p| p == first));
                assert!(frame.generation() >= last_generation);
                last_generation = frame.generation();
            }
        }
        producer.join().unwrap();
        assert_eq!(slot.generation(), 2000);
    }
}
