//! CBZ (zip of page images) writer.
//!
//! Entries are stored uncompressed with a fixed timestamp so the archive is
//! reproducible. Names are `NNNN.<ext>` in page order; gaps are written as
//! `NNNN-missing.txt` so readers keep page numbering.

use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use super::transform::sniff_format;
use super::{AssemblyError, DocumentSink, Gap, PageWrite};

/// CBZ document sink over a seekable writer.
pub struct CbzSink<W: Write + Seek> {
    zip: ZipWriter<W>,
    path: PathBuf,
}

impl<W: Write + Seek> std::fmt::Debug for CbzSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CbzSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn entry_options() -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(DateTime::default())
}

impl<W: Write + Seek> CbzSink<W> {
    /// Starts an archive. `path` only labels errors.
    pub fn new(writer: W, path: &Path) -> Self {
        Self {
            zip: ZipWriter::new(writer),
            path: path.to_path_buf(),
        }
    }

    fn entry(&mut self, name: &str, bytes: &[u8]) -> Result<(), AssemblyError> {
        self.zip.start_file(name, entry_options())?;
        self.zip
            .write_all(bytes)
            .map_err(|e| AssemblyError::io(&self.path, e))
    }

    /// Writes the central directory and returns the writer and its length.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::Zip`] or [`AssemblyError::Io`].
    pub fn finish_into(mut self) -> Result<(W, u64), AssemblyError> {
        let mut inner = self.zip.finish()?;
        inner
            .flush()
            .map_err(|e| AssemblyError::io(&self.path, e))?;
        let len = inner
            .stream_position()
            .map_err(|e| AssemblyError::io(&self.path, e))?;
        Ok((inner, len))
    }
}

impl<W: Write + Seek + Send> DocumentSink for CbzSink<W> {
    fn write_page(
        &mut self,
        index: usize,
        _label: Option<&str>,
        bytes: &[u8],
    ) -> Result<PageWrite, AssemblyError> {
        let Some(ext) = sniff_format(bytes) else {
            let note = format!("Page {} is missing: unrecognised image data\n", index + 1);
            self.entry(&format!("{:04}-missing.txt", index + 1), note.as_bytes())?;
            return Ok(PageWrite::Placeholder {
                reason: "unrecognised image data".to_string(),
            });
        };
        self.entry(&format!("{:04}.{ext}", index + 1), bytes)?;
        Ok(PageWrite::Embedded)
    }

    fn write_gap(&mut self, gap: &Gap) -> Result<(), AssemblyError> {
        let note = match &gap.label {
            Some(label) => format!("Page {} ({label}) is missing: {}\n", gap.index + 1, gap.reason),
            None => format!("Page {} is missing: {}\n", gap.index + 1, gap.reason),
        };
        self.entry(&format!("{:04}-missing.txt", gap.index + 1), note.as_bytes())
    }

    fn finish(self: Box<Self>) -> Result<u64, AssemblyError> {
        let (_, len) = self.finish_into()?;
        Ok(len)
    }
}
