//! Frames and the frame source seam
//!
//! The sensor itself lives behind [`FrameSource`]. A source hands out
//! [`RawFrameSet`]s as the device produced them; [`RawFrameSet::convert`]
//! turns one into an owned [`FramePair`] that can be moved to a save worker.
//!
//! ```text
//! FrameSource::try_acquire ──▶ RawFrameSet ──convert──▶ FramePair ──▶ save queue
//!          │                       (color?, depth?)        (owned)
//!          └── Acquired::Timeout (not an error, poll again)
//! ```

use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use image::RgbImage;

/// Depth-to-color alignment requested from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignMode {
    #[default]
    Hardware,
    Software,
    Disabled,
}

impl AlignMode {
    /// Parse the wire spelling: `HW`, `SW` or `NONE`, any case.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HW" => Some(AlignMode::Hardware),
            "SW" => Some(AlignMode::Software),
            "NONE" => Some(AlignMode::Disabled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlignMode::Hardware => "HW",
            AlignMode::Software => "SW",
            AlignMode::Disabled => "NONE",
        }
    }
}

impl fmt::Display for AlignMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session settings passed through to the source when it is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSettings {
    pub align_mode: AlignMode,
    pub enable_sync: bool,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            align_mode: AlignMode::Hardware,
            enable_sync: true,
        }
    }
}

/// Pixel layout of a raw color frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    Rgb8,
    Bgr8,
}

#[derive(Debug, Clone)]
pub struct RawColorFrame {
    pub width: u32,
    pub height: u32,
    pub format: ColorFormat,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RawDepthFrame {
    pub width: u32,
    pub height: u32,
    /// Multiplier from device units to millimetres.
    pub scale: f32,
    pub data: Vec<u16>,
}

/// One delivery from the source. Either stream may be missing.
#[derive(Debug, Clone)]
pub struct RawFrameSet {
    pub color: Option<RawColorFrame>,
    pub depth: Option<RawDepthFrame>,
    pub captured_at: SystemTime,
}

/// Why a raw frame set could not become a [`FramePair`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConvertError {
    #[error("frame set has no color frame")]
    MissingColor,

    #[error("frame set has no depth frame")]
    MissingDepth,

    #[error("{stream} frame has zero size")]
    Empty { stream: &'static str },

    #[error("{stream} buffer holds {actual} elements, expected {expected}")]
    SizeMismatch {
        stream: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("depth scale {0} is not a usable multiplier")]
    BadScale(f32),
}

/// Depth in millimetres, row-major, `height` rows of `width` samples.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthMap {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
}

/// A converted color + depth pair, owned by whoever persists it.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub color: RgbImage,
    pub depth: DepthMap,
    pub captured_at: SystemTime,
}

impl FramePair {
    /// Milliseconds since the Unix epoch of the capture instant.
    pub fn epoch_millis(&self) -> u128 {
        self.captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    /// Shared filename stem for the color and depth files.
    pub fn stem(&self) -> String {
        self.epoch_millis().to_string()
    }
}

impl RawFrameSet {
    /// Convert into an owned pair. Buffers are copied so the source is free
    /// to reuse its own storage on the next acquisition.
    pub fn convert(&self) -> Result<FramePair, ConvertError> {
        let color = self.color.as_ref().ok_or(ConvertError::MissingColor)?;
        let depth = self.depth.as_ref().ok_or(ConvertError::MissingDepth)?;

        Ok(FramePair {
            color: convert_color(color)?,
            depth: convert_depth(depth)?,
            captured_at: self.captured_at,
        })
    }
}

fn convert_color(frame: &RawColorFrame) -> Result<RgbImage, ConvertError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(ConvertError::Empty { stream: "color" });
    }
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.data.len() != expected {
        return Err(ConvertError::SizeMismatch {
            stream: "color",
            expected,
            actual: frame.data.len(),
        });
    }

    let pixels = match frame.format {
        ColorFormat::Rgb8 => frame.data.clone(),
        ColorFormat::Bgr8 => {
            let mut swapped = frame.data.clone();
            for px in swapped.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            swapped
        }
    };

    // Length was checked above, so this only fails on a logic error.
    RgbImage::from_raw(frame.width, frame.height, pixels).ok_or(ConvertError::SizeMismatch {
        stream: "color",
        expected,
        actual: frame.data.len(),
    })
}

fn convert_depth(frame: &RawDepthFrame) -> Result<DepthMap, ConvertError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(ConvertError::Empty { stream: "depth" });
    }
    let expected = frame.width as usize * frame.height as usize;
    if frame.data.len() != expected {
        return Err(ConvertError::SizeMismatch {
            stream: "depth",
            expected,
            actual: frame.data.len(),
        });
    }
    if !frame.scale.is_finite() || frame.scale < 0.0 {
        return Err(ConvertError::BadScale(frame.scale));
    }

    let data = if frame.scale == 1.0 {
        frame.data.clone()
    } else {
        // `as` saturates float -> int, which is what we want for out-of-range depth
        frame
            .data
            .iter()
            .map(|&raw| (raw as f32 * frame.scale) as u16)
            .collect()
    };

    Ok(DepthMap {
        width: frame.width,
        height: frame.height,
        data,
    })
}

/// Result of one bounded poll.
#[derive(Debug)]
pub enum Acquired {
    Frames(RawFrameSet),
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("frame source is not open")]
    NotOpen,

    #[error("frame source failed to open: {0}")]
    Open(String),

    #[error("device error: {0}")]
    Device(String),
}

/// Anything that can produce frame sets for a capture session.
///
/// A session calls `open` once, then `try_acquire` in a loop, then `release`
/// once after the last save has drained. The source moves onto the
/// acquisition thread for the duration of the session.
pub trait FrameSource: Send + 'static {
    fn open(&mut self, settings: &SourceSettings) -> Result<(), SourceError>;

    /// Wait at most `timeout` for the next frame set.
    fn try_acquire(&mut self, timeout: Duration) -> Result<Acquired, SourceError>;

    /// Stop streaming and free per-session resources.
    fn release(&mut self);
}

impl FrameSource for Box<dyn FrameSource> {
    fn open(&mut self, settings: &SourceSettings) -> Result<(), SourceError> {
        (**self).open(settings)
    }

    fn try_acquire(&mut self, timeout: Duration) -> Result<Acquired, SourceError> {
        (**self).try_acquire(timeout)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Generated frames at a fixed rate, for running the agent without a camera.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    interval: Duration,
    next_due: Option<Instant>,
    sequence: u32,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            interval: Duration::from_secs(1) / fps.max(1),
            next_due: None,
            sequence: 0,
        }
    }

    fn generate(&mut self) -> RawFrameSet {
        let (w, h) = (self.width, self.height);
        let shift = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let mut color = Vec::with_capacity(w as usize * h as usize * 3);
        let mut depth = Vec::with_capacity(w as usize * h as usize);
        for y in 0..h {
            for x in 0..w {
                color.push(((x + shift) % 256) as u8);
                color.push(((y + shift) % 256) as u8);
                color.push((shift % 256) as u8);
                depth.push((500 + x + y) as u16);
            }
        }

        RawFrameSet {
            color: Some(RawColorFrame {
                width: w,
                height: h,
                format: ColorFormat::Rgb8,
                data: color,
            }),
            depth: Some(RawDepthFrame {
                width: w,
                height: h,
                scale: 1.0,
                data: depth,
            }),
            captured_at: SystemTime::now(),
        }
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self, settings: &SourceSettings) -> Result<(), SourceError> {
        tracing::debug!(
            "synthetic source open: {}x{} align={} sync={}",
            self.width,
            self.height,
            settings.align_mode,
            settings.enable_sync
        );
        self.next_due = Some(Instant::now());
        Ok(())
    }

    fn try_acquire(&mut self, timeout: Duration) -> Result<Acquired, SourceError> {
        let due = self.next_due.ok_or(SourceError::NotOpen)?;
        let now = Instant::now();
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(Acquired::Timeout);
            }
            std::thread::sleep(wait);
        }
        // Missed slots are skipped, not replayed as a burst
        self.next_due = Some(due.max(Instant::now()) + self.interval);
        Ok(Acquired::Frames(self.generate()))
    }

    fn release(&mut self) {
        self.next_due = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(color: Option<RawColorFrame>, depth: Option<RawDepthFrame>) -> RawFrameSet {
        RawFrameSet {
            color,
            depth,
            captured_at: UNIX_EPOCH + Duration::from_millis(1_700_000_000_123),
        }
    }

    fn color_2x1(format: ColorFormat) -> RawColorFrame {
        RawColorFrame {
            width: 2,
            height: 1,
            format,
            data: vec![1, 2, 3, 4, 5, 6],
        }
    }

    fn depth_2x1(scale: f32) -> RawDepthFrame {
        RawDepthFrame {
            width: 2,
            height: 1,
            scale,
            data: vec![100, 60_000],
        }
    }

    #[test]
    fn test_align_mode_parse() {
        assert_eq!(AlignMode::parse("hw"), Some(AlignMode::Hardware));
        assert_eq!(AlignMode::parse("SW"), Some(AlignMode::Software));
        assert_eq!(AlignMode::parse("None"), Some(AlignMode::Disabled));
        assert_eq!(AlignMode::parse("auto"), None);
    }

    #[test]
    fn test_bgr_is_swizzled() {
        let pair = raw(Some(color_2x1(ColorFormat::Bgr8)), Some(depth_2x1(1.0)))
            .convert()
            .unwrap();
        assert_eq!(pair.color.as_raw(), &vec![3, 2, 1, 6, 5, 4]);
        assert_eq!(pair.stem(), "1700000000123");
    }

    #[test]
    fn test_depth_scale_saturates() {
        let pair = raw(Some(color_2x1(ColorFormat::Rgb8)), Some(depth_2x1(2.0)))
            .convert()
            .unwrap();
        assert_eq!(pair.depth.data, vec![200, u16::MAX]);
    }

    #[test]
    fn test_missing_streams() {
        let err = raw(None, Some(depth_2x1(1.0))).convert().unwrap_err();
        assert_eq!(err, ConvertError::MissingColor);
        let err = raw(Some(color_2x1(ColorFormat::Rgb8)), None).convert().unwrap_err();
        assert_eq!(err, ConvertError::MissingDepth);
    }

    #[test]
    fn test_short_color_buffer() {
        let mut color = color_2x1(ColorFormat::Rgb8);
        color.data.pop();
        let err = raw(Some(color), Some(depth_2x1(1.0))).convert().unwrap_err();
        assert!(matches!(
            err,
            ConvertError::SizeMismatch { stream: "color", expected: 6, actual: 5 }
        ));
    }

    #[test]
    fn test_nan_scale_rejected() {
        let err = raw(Some(color_2x1(ColorFormat::Rgb8)), Some(depth_2x1(f32::NAN)))
            .convert()
            .unwrap_err();
        assert!(matches!(err, ConvertError::BadScale(_)));
    }

    #[test]
    fn test_synthetic_source_requires_open() {
        let mut source = SyntheticSource::new(4, 3, 30);
        assert!(matches!(
            source.try_acquire(Duration::from_millis(1)),
            Err(SourceError::NotOpen)
        ));

        source.open(&SourceSettings::default()).unwrap();
        match source.try_acquire(Duration::from_millis(100)).unwrap() {
            Acquired::Frames(set) => {
                let pair = set.convert().unwrap();
                assert_eq!(pair.color.dimensions(), (4, 3));
                assert_eq!(pair.depth.data.len(), 12);
            }
            Acquired::Timeout => panic!("first frame is due immediately"),
        }

        source.release();
        assert!(source.try_acquire(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_synthetic_source_does_not_burst_after_stall() {
        let mut source = SyntheticSource::new(2, 2, 200);
        source.open(&SourceSettings::default()).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let mut stems = std::collections::HashSet::new();
        for _ in 0..20 {
            match source.try_acquire(Duration::from_millis(100)).unwrap() {
                Acquired::Frames(set) => {
                    stems.insert(set.convert().unwrap().stem());
                }
                Acquired::Timeout => panic!("frames are due every 5ms"),
            }
        }
        assert_eq!(stems.len(), 20);
    }
}
