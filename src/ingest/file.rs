//! Image-sequence replay.
//!
//! Reads every PNG/JPEG in a local directory in lexical file-name order, one frame
//! per file, then reports the end of the stream. Only local paths are accepted.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

use super::StreamBackend;

const EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

pub struct ImageSequenceSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
}

impl ImageSequenceSource {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if dir.as_os_str().is_empty() || dir.to_string_lossy().contains("://") {
            return Err(anyhow!(
                "image sequence source only supports local directories"
            ));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            files: Vec::new(),
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl StreamBackend for ImageSequenceSource {
    fn name(&self) -> &'static str {
        "image-sequence"
    }

    /// Lists the directory once. A reconnect after an error resumes where
    /// playback stopped.
    fn connect(&mut self) -> Result<()> {
        if !self.files.is_empty() {
            return Ok(());
        }
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("read frame directory {}", self.dir.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_frame_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(anyhow!("no PNG/JPEG frames in {}", self.dir.display()));
        }
        log::info!(
            "image sequence {}: {} frames",
            self.dir.display(),
            files.len()
        );
        self.files = files;
        self.next = 0;
        Ok(())
    }

    fn next_image(&mut self) -> Result<Option<RgbImage>> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        let image = image::open(path)
            .with_context(|| format!("decode frame {}", path.display()))?;
        Ok(Some(image.to_rgb8()))
    }
}
