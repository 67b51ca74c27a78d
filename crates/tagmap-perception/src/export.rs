//! Estimate table export.
//!
//! The table is rendered as one line per marker,
//!
//! ```text
//! Tag <id>: <transform>
//! ```
//!
//! in first-detection order, using the deterministic [`Transform`] display
//! form.  [`FileExporter`] writes the whole table to a sibling temporary file
//! and renames it over the target, so a reader never sees a partial table.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use tagmap_types::{MarkerId, TagMapError};

use crate::transform::Transform;

/// Destination for a full estimate table.
pub trait EstimateSink: Send + Sync {
    /// Persist `table` (already in first-detection order), replacing any
    /// previous export.
    fn write_table(&self, table: &[(MarkerId, Transform)]) -> Result<(), TagMapError>;
}

/// Render `table` in the export line format.
pub fn render_table(table: &[(MarkerId, Transform)]) -> String {
    table
        .iter()
        .map(|(id, transform)| format!("Tag {id}: {transform}\n"))
        .collect()
}

/// Writes the table to a single file, overwritten on every export.
#[derive(Debug, Clone)]
pub struct FileExporter {
    path: PathBuf,
}

impl FileExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn export_error(&self, details: impl std::fmt::Display) -> TagMapError {
        TagMapError::Export {
            path: self.path.display().to_string(),
            details: details.to_string(),
        }
    }
}

impl EstimateSink for FileExporter {
    fn write_table(&self, table: &[(MarkerId, Transform)]) -> Result<(), TagMapError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|e| self.export_error(format!("create directory: {e}")))?;
        }
        let tmp = self.temp_path();
        fs::write(&tmp, render_table(table))
            .map_err(|e| self.export_error(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.export_error(format!("rename: {e}")))?;
        Ok(())
    }
}
