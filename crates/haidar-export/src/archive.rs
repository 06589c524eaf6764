//! File layout of a bulk download.
//!
//! Every converted image contributes three files:
//!
//! ```text
//! no-background/<stem>.png   background-removed raster
//! vectorized/<stem>.svg      vector document
//! vectorized/<stem>.png      transparent rendition of the document
//! ```
//!
//! Stems are unique within one archive; a repeated stem gets a numeric
//! suffix (`photo`, `photo-2`, `photo-3`, ...).

use std::collections::HashSet;

use haidar_pipeline::PixelBuffer;

use crate::png::{ExportError, encode_png};

/// Directory for background-removed rasters.
pub const NO_BACKGROUND_DIR: &str = "no-background";

/// Directory for vector documents and their renditions.
pub const VECTORIZED_DIR: &str = "vectorized";

/// One file in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Forward-slash relative path.
    pub path: String,
    pub bytes: Vec<u8>,
}

/// The outputs of one converted image.
#[derive(Debug, Clone, Copy)]
pub struct Artifacts<'a> {
    /// Base name for the three files, without extension.
    pub stem: &'a str,
    pub no_background: &'a PixelBuffer,
    pub svg: &'a str,
    pub vector_raster: &'a PixelBuffer,
}

/// Strip any directory and the last extension from a file name.
///
/// ```
/// use haidar_export::file_stem;
///
/// assert_eq!(file_stem("holiday/beach.final.jpg"), "beach.final");
/// assert_eq!(file_stem(r"C:\photos\cat.png"), "cat");
/// assert_eq!(file_stem(".hidden"), ".hidden");
/// ```
#[must_use]
pub fn file_stem(name: &str) -> &str {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base.rfind('.') {
        Some(dot) if dot > 0 => &base[..dot],
        _ => base,
    }
}

/// Accumulates archive entries.
#[derive(Debug, Default)]
pub struct Archive {
    entries: Vec<ArchiveEntry>,
    stems: HashSet<String>,
}

impl Archive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one image's outputs. Returns the stem actually used.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Png`] if a raster cannot be encoded. Nothing
    /// is added in that case.
    pub fn add(&mut self, artifacts: &Artifacts<'_>) -> Result<String, ExportError> {
        let no_background = encode_png(artifacts.no_background)?;
        let vector_raster = encode_png(artifacts.vector_raster)?;

        let stem = self.unique_stem(artifacts.stem);
        self.entries.push(ArchiveEntry {
            path: format!("{NO_BACKGROUND_DIR}/{stem}.png"),
            bytes: no_background,
        });
        self.entries.push(ArchiveEntry {
            path: format!("{VECTORIZED_DIR}/{stem}.svg"),
            bytes: artifacts.svg.as_bytes().to_vec(),
        });
        self.entries.push(ArchiveEntry {
            path: format!("{VECTORIZED_DIR}/{stem}.png"),
            bytes: vector_raster,
        });
        Ok(stem)
    }

    #[must_use]
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    #[must_use]
    pub fn into_entries(self) -> Vec<ArchiveEntry> {
        self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn unique_stem(&mut self, stem: &str) -> String {
        let stem = if stem.is_empty() { "image" } else { stem };
        let mut candidate = stem.to_owned();
        let mut n = 1u32;
        while self.stems.contains(&candidate) {
            n += 1;
            candidate = format!("{stem}-{n}");
        }
        self.stems.insert(candidate.clone());
        candidate
    }
}
