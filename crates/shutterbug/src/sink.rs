//! Persistence sink - writes frame pairs under a session root
//!
//! Layout:
//! ```text
//! {root}/
//! ├── front_RGB/
//! │   └── 1700000000123.jpg      # JPEG, RGB8
//! └── front_depth/
//!     └── 1700000000123.npy      # NumPy v1.0, <u2, shape (height, width)
//! ```
//!
//! Both files share the capture instant's epoch-millisecond stem, so saves
//! that complete out of order still line up.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use uuid::Uuid;

use crate::frame::{DepthMap, FramePair};

pub const COLOR_DIR: &str = "front_RGB";
pub const DEPTH_DIR: &str = "front_depth";
pub const COLOR_EXT: &str = "jpg";
pub const DEPTH_EXT: &str = "npy";

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },
}

impl SinkError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        SinkError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where frame pairs go.
///
/// Implementations must be shareable across save workers; `save` is called
/// concurrently for different pairs of the same session.
pub trait PersistenceSink: Send + Sync + 'static {
    /// Create the per-session subdirectories. Called once per session,
    /// before the first `save`.
    fn ensure_directories(&self, root: &Path) -> Result<(), SinkError>;

    fn save(&self, pair: &FramePair, root: &Path) -> Result<(), SinkError>;
}

/// Writes JPEG color and `.npy` depth files to the local filesystem.
#[derive(Debug, Clone)]
pub struct DiskSink {
    jpeg_quality: u8,
}

impl DiskSink {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn color_path(root: &Path, pair: &FramePair) -> PathBuf {
        root.join(COLOR_DIR)
            .join(format!("{}.{}", pair.stem(), COLOR_EXT))
    }

    pub fn depth_path(root: &Path, pair: &FramePair) -> PathBuf {
        root.join(DEPTH_DIR)
            .join(format!("{}.{}", pair.stem(), DEPTH_EXT))
    }

    fn stage_color(&self, pair: &FramePair, path: &Path) -> Result<Staged, SinkError> {
        Staged::write(path, |w| {
            let mut encoder = JpegEncoder::new_with_quality(w, self.jpeg_quality);
            encoder
                .encode_image(&pair.color)
                .map_err(|source| SinkError::Encode {
                    path: path.to_path_buf(),
                    source,
                })
        })
    }

    fn stage_depth(&self, depth: &DepthMap, path: &Path) -> Result<Staged, SinkError> {
        Staged::write(path, |w| {
            write_npy_u16(w, depth).map_err(|e| SinkError::io(path, e))
        })
    }
}

impl Default for DiskSink {
    fn default() -> Self {
        Self::new(90)
    }
}

impl PersistenceSink for DiskSink {
    fn ensure_directories(&self, root: &Path) -> Result<(), SinkError> {
        for dir in [COLOR_DIR, DEPTH_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| SinkError::io(&path, e))?;
        }
        Ok(())
    }

    /// Both files land under their final names, or neither does.
    fn save(&self, pair: &FramePair, root: &Path) -> Result<(), SinkError> {
        let color_path = Self::color_path(root, pair);
        let color = self.stage_color(pair, &color_path)?;
        let depth = match self.stage_depth(&pair.depth, &Self::depth_path(root, pair)) {
            Ok(depth) => depth,
            Err(e) => {
                color.discard();
                return Err(e);
            }
        };

        let result = color.commit().and_then(|()| {
            depth.commit().inspect_err(|_| {
                let _ = fs::remove_file(&color_path);
            })
        });
        if result.is_err() {
            color.discard();
            depth.discard();
        }
        result
    }
}

/// A fully written temp sibling, not yet renamed to its final name.
///
/// Temp names are unique per write, so two saves of the same stem never
/// share a temp file.
struct Staged {
    tmp: PathBuf,
    dest: PathBuf,
}

impl Staged {
    fn write<F>(dest: &Path, body: F) -> Result<Self, SinkError>
    where
        F: FnOnce(&mut BufWriter<File>) -> Result<(), SinkError>,
    {
        let mut tmp = dest.as_os_str().to_owned();
        tmp.push(format!(".{}.part", Uuid::new_v4().simple()));
        let staged = Self {
            tmp: PathBuf::from(tmp),
            dest: dest.to_path_buf(),
        };

        let result = (|| {
            let file = File::create(&staged.tmp).map_err(|e| SinkError::io(&staged.tmp, e))?;
            let mut writer = BufWriter::new(file);
            body(&mut writer)?;
            writer.flush().map_err(|e| SinkError::io(&staged.tmp, e))
        })();

        match result {
            Ok(()) => Ok(staged),
            Err(e) => {
                staged.discard();
                Err(e)
            }
        }
    }

    fn commit(&self) -> Result<(), SinkError> {
        fs::rename(&self.tmp, &self.dest).map_err(|e| SinkError::io(&self.dest, e))
    }

    /// Remove the temp file; a no-op once committed.
    fn discard(&self) {
        let _ = fs::remove_file(&self.tmp);
    }
}

/// Serialize a depth map as a NumPy v1.0 array of little-endian `u16`.
pub fn write_npy_u16<W: Write>(w: &mut W, depth: &DepthMap) -> std::io::Result<()> {
    let mut header = format!(
        "{{'descr': '<u2', 'fortran_order': False, 'shape': ({}, {}), }}",
        depth.height, depth.width
    );
    // magic(6) + version(2) + header_len(2) + header, padded to 64 with '\n' last
    let unpadded = 10 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    w.write_all(b"\x93NUMPY")?;
    w.write_all(&[1, 0])?;
    w.write_all(&(header.len() as u16).to_le_bytes())?;
    w.write_all(header.as_bytes())?;

    let mut body = Vec::with_capacity(depth.data.len() * 2);
    for sample in &depth.data {
        body.extend_from_slice(&sample.to_le_bytes());
    }
    w.write_all(&body)
}
