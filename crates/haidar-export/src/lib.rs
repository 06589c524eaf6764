//! haidar-export: Pure format serializers (sans-IO)
//!
//! Converts vector documents and pixel buffers into output formats:
//! SVG text, PNG bytes, and the file layout of a bulk download.
//! Nothing here touches the filesystem; callers decide where bytes go.

pub mod archive;
pub mod png;
pub mod svg;

pub use archive::{Archive, ArchiveEntry, Artifacts, NO_BACKGROUND_DIR, VECTORIZED_DIR, file_stem};
pub use png::{ExportError, encode_png};
pub use svg::{SvgMetadata, build_path_data, to_svg};
