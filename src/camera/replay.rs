//! File-driven frame playback.
//!
//! A recorded sequence is a directory of numbered image files:
//! `{directory}/{prefix}{index, zero padded}{suffix}.{extension}`.
//! `SequenceCursor` walks the indices, wrapping back to 0 when replay is looped.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::StreamKind;
use crate::frame::Frame;

/// Where a recorded sequence lives and how its files are named.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceSpec {
    pub directory: PathBuf,
    pub prefix: String,
    pub suffix: String,
    pub leading_zeros: usize,
    pub extension: String,
    pub start_index: u64,
    /// Number of entries. When unset, matching files in `directory` are counted.
    pub count: Option<u64>,
    /// Loop back to index 0 after the last entry.
    pub wrap: bool,
}

impl SequenceSpec {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            prefix: String::new(),
            suffix: String::new(),
            leading_zeros: 0,
            extension: "png".to_string(),
            start_index: 0,
            count: None,
            wrap: false,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_leading_zeros(mut self, leading_zeros: usize) -> Self {
        self.leading_zeros = leading_zeros;
        self
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_wrap(mut self, wrap: bool) -> Self {
        self.wrap = wrap;
        self
    }

    /// File path for a sequence index.
    pub fn path_for(&self, index: u64) -> PathBuf {
        let name = format!(
            "{}{:0width$}{}.{}",
            self.prefix,
            index,
            self.suffix,
            self.extension,
            width = self.leading_zeros
        );
        self.directory.join(name)
    }

    /// Sequence length: the configured count, or the number of matching files on disk.
    pub fn resolve_len(&self) -> Result<u64> {
        if let Some(count) = self.count {
            return Ok(count);
        }
        count_sequence_files(&self.directory, &self.prefix, &self.extension)
    }
}

fn count_sequence_files(directory: &Path, prefix: &str, extension: &str) -> Result<u64> {
    let entries = std::fs::read_dir(directory).map_err(|e| {
        anyhow!(
            "failed to read sequence directory {}: {}",
            directory.display(),
            e
        )
    })?;
    let mut count = 0u64;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches_ext = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        let matches_prefix = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(prefix))
            .unwrap_or(false);
        if matches_ext && matches_prefix {
            count += 1;
        }
    }
    Ok(count)
}

// ----------------------------------------------------------------------------
// SequenceCursor
// ----------------------------------------------------------------------------

/// Position in a finite input sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceCursor {
    index: u64,
    len: u64,
    wrap: bool,
}

impl SequenceCursor {
    pub fn new(start: u64, len: u64, wrap: bool) -> Self {
        Self {
            index: start,
            len,
            wrap,
        }
    }

    /// Index the next `advance` will hand out.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True once every index was consumed and wrapping is off. An empty sequence is always
    /// exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.len == 0 || (!self.wrap && self.index >= self.len)
    }

    /// Consume the current index and move to the next one. Returns `None` when exhausted.
    pub fn advance(&mut self) -> Option<u64> {
        if self.is_exhausted() {
            return None;
        }
        let current = self.index;
        self.index += 1;
        if self.wrap && self.index >= self.len {
            self.index = 0;
        }
        Some(current)
    }
}

// ----------------------------------------------------------------------------
// ReplaySource
// ----------------------------------------------------------------------------

pub(crate) struct ReplaySource {
    spec: SequenceSpec,
    cursor: SequenceCursor,
}

impl ReplaySource {
    pub(crate) fn open(spec: SequenceSpec) -> Result<Self> {
        let len = spec.resolve_len()?;
        if len == 0 {
            return Err(anyhow!(
                "sequence in {} has no {} files",
                spec.directory.display(),
                spec.extension
            ));
        }
        if spec.start_index >= len {
            return Err(anyhow!(
                "sequence start index {} is past the last entry ({})",
                spec.start_index,
                len - 1
            ));
        }
        let cursor = SequenceCursor::new(spec.start_index, len, spec.wrap);
        Ok(Self { spec, cursor })
    }

    /// Load the frame at the start index without moving the cursor.
    pub(crate) fn load_start(&self, kind: StreamKind) -> Result<Frame> {
        load_frame(&self.spec.path_for(self.spec.start_index), kind)
            .map(|frame| frame.with_source_index(self.spec.start_index))
    }

    /// Load the frame under the cursor and advance. The cursor moves even when the file
    /// cannot be read, so one bad file does not stall playback.
    pub(crate) fn load_next(&mut self, kind: StreamKind) -> Result<Frame> {
        let index = self.cursor.advance().ok_or_else(|| {
            anyhow!(
                "sequence exhausted after {} entries in {}",
                self.cursor.len(),
                self.spec.directory.display()
            )
        })?;
        load_frame(&self.spec.path_for(index), kind).map(|frame| frame.with_source_index(index))
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.cursor.is_exhausted()
    }

    pub(crate) fn cursor(&self) -> SequenceCursor {
        self.cursor
    }
}

/// Decode an image file into a frame of the stream's pixel format.
pub fn load_frame(path: &Path, kind: StreamKind) -> Result<Frame> {
    let image = image::open(path).with_context(|| format!("read image {}", path.display()))?;
    match kind {
        StreamKind::Color => {
            let rgb = image.to_rgb8();
            let (width, height) = rgb.dimensions();
            Frame::rgb(width, height, rgb.into_raw())
        }
        StreamKind::Depth => {
            let luma = image.to_luma16();
            let (width, height) = luma.dimensions();
            Frame::depth(width, height, luma.as_raw())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_for_zero_pads_index() {
        let spec = SequenceSpec::new("/data/video")
            .with_prefix("scene_")
            .with_leading_zeros(6);
        assert_eq!(
            spec.path_for(42),
            PathBuf::from("/data/video/scene_000042.png")
        );
    }

    #[test]
    fn cursor_wraps_to_zero_without_gap() {
        let mut cursor = SequenceCursor::new(0, 5, true);
        let seen: Vec<u64> = (0..12).filter_map(|_| cursor.advance()).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 0, 1, 2, 3, 4, 0, 1]);
        assert!(!cursor.is_exhausted());
    }

    #[test]
    fn cursor_without_wrap_exhausts() {
        let mut cursor = SequenceCursor::new(3, 5, false);
        assert_eq!(cursor.advance(), Some(3));
        assert_eq!(cursor.advance(), Some(4));
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.advance(), None);
    }

    #[test]
    fn empty_cursor_is_exhausted_even_when_wrapping() {
        let mut cursor = SequenceCursor::new(0, 0, true);
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.advance(), None);
    }

    #[test]
    fn configured_count_skips_directory_scan() -> Result<()> {
        let spec = SequenceSpec::new("/does/not/exist").with_count(7);
        assert_eq!(spec.resolve_len()?, 7);
        Ok(())
    }
}
