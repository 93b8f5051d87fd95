//! Ordered assembly of page results into one document.
//!
//! Fetch tasks finish in any order. The [`Assembler`] keeps a reorder
//! buffer keyed by page index and only hands the sink the next expected
//! index, so memory is bounded by the current out-of-order gap. Failed
//! pages become [`Gap`]s: the sink writes a placeholder and assembly goes on.
//! The only fatal error is the output stream itself failing.

mod cbz;
mod pdf;
mod transform;

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::download::PageFailure;
use crate::manifest::CanonicalManifest;

pub use cbz::CbzSink;
pub use pdf::PdfSink;
pub use transform::{Invert, NormalizeJpeg, PageTransform, TransformChain, TransformError, sniff_format};

/// Output-stream failures. Page-level problems never produce these.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// The output could not be written.
    #[error("cannot write output {path}: {source}\n  Suggestion: check free disk space and write permissions")]
    Io {
        /// Output path (or a description for in-memory sinks).
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The CBZ archive writer failed.
    #[error("cannot write archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Image re-encoding needed by the sink itself failed at the stream level.
    #[error("cannot encode page image: {0}")]
    Image(#[from] image::ImageError),

    /// `finish` was called before every index had been received.
    #[error("assembly incomplete: next expected page {next} of {total}")]
    Incomplete {
        /// Next index the buffer is waiting for.
        next: usize,
        /// Pages in the manifest.
        total: usize,
    },
}

impl AssemblyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Output document format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// PDF, one page per image.
    #[default]
    Pdf,
    /// Comic-book ZIP of page images.
    Cbz,
}

impl OutputFormat {
    /// Storage and CLI label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Cbz => "cbz",
        }
    }

    /// Parses a label, case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "cbz" => Some(Self::Cbz),
            _ => None,
        }
    }

    /// File extension without the dot.
    #[must_use]
    pub fn extension(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bytes of a completed page, in memory or already on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagePayload {
    /// Bytes held in memory.
    Bytes(Vec<u8>),
    /// Bytes stored at a path; read when the page is written.
    Stored(PathBuf),
}

/// One settled page, as produced by a fetch task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResult {
    /// Page index.
    pub index: usize,
    /// Payload or failure reason.
    pub outcome: Result<PagePayload, PageFailure>,
    /// Attempt that produced the outcome (0 for pages stored by earlier runs).
    pub attempt: u32,
}

impl PageResult {
    /// A completed page.
    #[must_use]
    pub fn completed(index: usize, payload: PagePayload, attempt: u32) -> Self {
        Self {
            index,
            outcome: Ok(payload),
            attempt,
        }
    }

    /// A permanently failed page.
    #[must_use]
    pub fn failed(index: usize, reason: PageFailure, attempt: u32) -> Self {
        Self {
            index,
            outcome: Err(reason),
            attempt,
        }
    }
}

/// A page missing from the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    /// Page index.
    pub index: usize,
    /// Page label from the manifest.
    pub label: Option<String>,
    /// Why the page is missing.
    pub reason: PageFailure,
}

/// Statistics of a finished document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    /// Pages written with their image.
    pub pages_written: usize,
    /// Placeholders written, for failed pages and for pages whose bytes
    /// could not be read back or embedded.
    pub gaps: Vec<Gap>,
    /// Non-fatal transform and embedding warnings.
    pub warnings: Vec<String>,
    /// Bytes in the finished output.
    pub bytes_written: u64,
    /// Largest number of results that waited in the reorder buffer at once.
    pub peak_buffered: usize,
}

/// What a sink did with one page image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageWrite {
    /// The image is in the document.
    Embedded,
    /// The image could not be embedded; a placeholder stands in for it and
    /// the page counts as missing.
    Placeholder {
        /// Why the image was rejected.
        reason: String,
    },
}

/// A streaming document writer. Pages arrive strictly in index order.
pub trait DocumentSink: Send {
    /// Writes one page image, or a placeholder when the sink cannot embed it.
    ///
    /// # Errors
    ///
    /// Only output-stream failures.
    fn write_page(
        &mut self,
        index: usize,
        label: Option<&str>,
        bytes: &[u8],
    ) -> Result<PageWrite, AssemblyError>;

    /// Writes a placeholder for a missing page.
    ///
    /// # Errors
    ///
    /// Only output-stream failures.
    fn write_gap(&mut self, gap: &Gap) -> Result<(), AssemblyError>;

    /// Finalizes the document and returns the bytes written.
    ///
    /// # Errors
    ///
    /// Only output-stream failures.
    fn finish(self: Box<Self>) -> Result<u64, AssemblyError>;
}

/// Opens a file-backed sink for `format` at `path`.
///
/// # Errors
///
/// Returns [`AssemblyError::Io`] when the file cannot be created.
pub fn open_file_sink(
    format: OutputFormat,
    path: &Path,
    title: &str,
) -> Result<Box<dyn DocumentSink>, AssemblyError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| AssemblyError::io(parent, e))?;
    }
    let file = File::create(path).map_err(|e| AssemblyError::io(path, e))?;
    let writer = BufWriter::new(file);
    Ok(match format {
        OutputFormat::Pdf => Box::new(PdfSink::new(writer, title, path)?),
        OutputFormat::Cbz => Box::new(CbzSink::new(writer, path)),
    })
}

/// Reorders page results and streams them into a sink.
pub struct Assembler {
    manifest: Arc<CanonicalManifest>,
    sink: Box<dyn DocumentSink>,
    transforms: TransformChain,
    buffer: BTreeMap<usize, PageResult>,
    next_index: usize,
    report: AssemblyReport,
}

impl fmt::Debug for Assembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assembler")
            .field("total", &self.manifest.page_count())
            .field("next_index", &self.next_index)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl Assembler {
    /// Creates an assembler writing `manifest`'s pages into `sink`.
    #[must_use]
    pub fn new(
        manifest: Arc<CanonicalManifest>,
        sink: Box<dyn DocumentSink>,
        transforms: TransformChain,
    ) -> Self {
        Self {
            manifest,
            sink,
            transforms,
            buffer: BTreeMap::new(),
            next_index: 0,
            report: AssemblyReport::default(),
        }
    }

    /// Next index the assembler is waiting for.
    #[must_use]
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Results currently held out of order.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether every page has been written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.next_index >= self.manifest.page_count()
    }

    /// Accepts one result and writes every page that is now in order.
    /// Results for indices already written, or outside the manifest, are ignored.
    ///
    /// # Errors
    ///
    /// Only output-stream failures.
    #[instrument(skip(self, result), fields(page_index = result.index, next = self.next_index))]
    pub fn push(&mut self, result: PageResult) -> Result<(), AssemblyError> {
        if result.index < self.next_index || self.buffer.contains_key(&result.index) {
            debug!("duplicate page result ignored");
            return Ok(());
        }
        if result.index >= self.manifest.page_count() {
            warn!(total = self.manifest.page_count(), "page result outside manifest ignored");
            return Ok(());
        }
        self.buffer.insert(result.index, result);
        self.report.peak_buffered = self.report.peak_buffered.max(self.buffer.len());

        while let Some(ready) = self.buffer.remove(&self.next_index) {
            self.emit(ready)?;
            self.next_index += 1;
        }
        Ok(())
    }

    fn emit(&mut self, result: PageResult) -> Result<(), AssemblyError> {
        let label = self
            .manifest
            .page(result.index)
            .and_then(|page| page.label.clone());
        let payload = match result.outcome {
            Ok(payload) => payload,
            Err(reason) => {
                let gap = Gap {
                    index: result.index,
                    label,
                    reason,
                };
                self.sink.write_gap(&gap)?;
                self.report.gaps.push(gap);
                return Ok(());
            }
        };
        let bytes = match payload {
            PagePayload::Bytes(bytes) => bytes,
            PagePayload::Stored(path) => match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(page_index = result.index, error = %error, "stored page unreadable");
                    let gap = Gap {
                        index: result.index,
                        label,
                        reason: PageFailure::PermanentFetch {
                            status: None,
                            message: format!("stored page {} unreadable: {error}", path.display()),
                        },
                    };
                    self.sink.write_gap(&gap)?;
                    self.report.gaps.push(gap);
                    return Ok(());
                }
            },
        };
        let (bytes, warnings) = self.transforms.apply(result.index, bytes);
        self.report.warnings.extend(warnings);
        match self.sink.write_page(result.index, label.as_deref(), &bytes)? {
            PageWrite::Embedded => self.report.pages_written += 1,
            PageWrite::Placeholder { reason } => {
                warn!(page_index = result.index, %reason, "page image not embedded");
                self.report.gaps.push(Gap {
                    index: result.index,
                    label,
                    reason: PageFailure::InvalidImage { message: reason },
                });
            }
        }
        Ok(())
    }

    /// Finalizes the document.
    ///
    /// # Errors
    ///
    /// [`AssemblyError::Incomplete`] when pages are still missing, otherwise
    /// only output-stream failures.
    pub fn finish(self) -> Result<AssemblyReport, AssemblyError> {
        let total = self.manifest.page_count();
        if self.next_index < total {
            return Err(AssemblyError::Incomplete {
                next: self.next_index,
                total,
            });
        }
        let mut report = self.report;
        report.bytes_written = self.sink.finish()?;
        debug!(
            pages = report.pages_written,
            gaps = report.gaps.len(),
            bytes = report.bytes_written,
            "document finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::{ImageTarget, ManifestBuilder};
    use std::sync::Mutex;

    /// Records what the assembler hands the sink.
    #[derive(Clone, Default)]
    struct Recording(Arc<Mutex<Vec<String>>>);

    impl DocumentSink for Recording {
        fn write_page(
            &mut self,
            index: usize,
            _label: Option<&str>,
            bytes: &[u8],
        ) -> Result<PageWrite, AssemblyError> {
            let text = String::from_utf8_lossy(bytes).into_owned();
            if text == "bad" {
                self.0.lock().unwrap().push(format!("{index}:placeholder"));
                return Ok(PageWrite::Placeholder {
                    reason: "cannot embed".to_string(),
                });
            }
            self.0.lock().unwrap().push(format!("{index}:{text}"));
            Ok(PageWrite::Embedded)
        }

        fn write_gap(&mut self, gap: &Gap) -> Result<(), AssemblyError> {
            self.0.lock().unwrap().push(format!("{}:gap", gap.index));
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<u64, AssemblyError> {
            Ok(0)
        }
    }

    fn manifest(count: usize) -> Arc<CanonicalManifest> {
        let mut builder = ManifestBuilder::new("iiif", "Codex");
        for n in 0..count {
            builder.push_page(ImageTarget::url(format!("https://img/{n}")), None);
        }
        Arc::new(builder.build().unwrap())
    }

    fn ok(index: usize) -> PageResult {
        PageResult::completed(index, PagePayload::Bytes(format!("p{index}").into_bytes()), 1)
    }

    #[test]
    fn test_reorders_out_of_order_results() {
        let recording = Recording::default();
        let mut assembler = Assembler::new(
            manifest(4),
            Box::new(recording.clone()),
            TransformChain::default(),
        );
        for index in [2, 0, 3, 1] {
            assembler.push(ok(index)).unwrap();
        }
        assert!(assembler.is_complete());
        let report = assembler.finish().unwrap();
        assert_eq!(
            *recording.0.lock().unwrap(),
            vec!["0:p0", "1:p1", "2:p2", "3:p3"]
        );
        assert_eq!(report.pages_written, 4);
        assert_eq!(report.peak_buffered, 2);
    }

    #[test]
    fn test_every_permutation_yields_manifest_order() {
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let recording = Recording::default();
            let mut assembler = Assembler::new(
                manifest(3),
                Box::new(recording.clone()),
                TransformChain::default(),
            );
            for index in order {
                assembler.push(ok(index)).unwrap();
            }
            assembler.finish().unwrap();
            assert_eq!(*recording.0.lock().unwrap(), vec!["0:p0", "1:p1", "2:p2"], "{order:?}");
        }
    }

    #[test]
    fn test_buffer_drains_as_gap_closes() {
        let mut assembler = Assembler::new(
            manifest(5),
            Box::new(Recording::default()),
            TransformChain::default(),
        );
        assembler.push(ok(3)).unwrap();
        assembler.push(ok(2)).unwrap();
        assert_eq!(assembler.buffered(), 2);
        assembler.push(ok(0)).unwrap();
        assert_eq!(assembler.next_index(), 1);
        assembler.push(ok(1)).unwrap();
        assert_eq!(assembler.buffered(), 0);
        assert_eq!(assembler.next_index(), 4);
    }

    #[test]
    fn test_failed_pages_become_gaps() {
        let recording = Recording::default();
        let mut assembler = Assembler::new(
            manifest(3),
            Box::new(recording.clone()),
            TransformChain::default(),
        );
        assembler.push(ok(0)).unwrap();
        assembler
            .push(PageResult::failed(1, PageFailure::GeoBlocked { status: 403 }, 1))
            .unwrap();
        assembler.push(ok(2)).unwrap();
        let report = assembler.finish().unwrap();
        assert_eq!(*recording.0.lock().unwrap(), vec!["0:p0", "1:gap", "2:p2"]);
        assert_eq!(report.gaps.len(), 1);
        assert_eq!(report.gaps[0].index, 1);
    }

    #[test]
    fn test_duplicates_and_out_of_range_ignored() {
        let recording = Recording::default();
        let mut assembler = Assembler::new(
            manifest(2),
            Box::new(recording.clone()),
            TransformChain::default(),
        );
        assembler.push(ok(0)).unwrap();
        assembler.push(ok(0)).unwrap();
        assembler.push(ok(9)).unwrap();
        assembler.push(ok(1)).unwrap();
        assembler.finish().unwrap();
        assert_eq!(recording.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_finish_before_complete_is_error() {
        let mut assembler = Assembler::new(
            manifest(2),
            Box::new(Recording::default()),
            TransformChain::default(),
        );
        assembler.push(ok(1)).unwrap();
        assert!(matches!(
            assembler.finish(),
            Err(AssemblyError::Incomplete { next: 0, total: 2 })
        ));
    }

    #[test]
    fn test_stored_payload_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.bin");
        std::fs::write(&path, b"disk").unwrap();
        let recording = Recording::default();
        let mut assembler = Assembler::new(
            manifest(1),
            Box::new(recording.clone()),
            TransformChain::default(),
        );
        assembler
            .push(PageResult::completed(0, PagePayload::Stored(path), 0))
            .unwrap();
        assembler.finish().unwrap();
        assert_eq!(*recording.0.lock().unwrap(), vec!["0:disk"]);
    }

    #[test]
    fn test_missing_stored_payload_becomes_gap() {
        let recording = Recording::default();
        let mut assembler = Assembler::new(
            manifest(1),
            Box::new(recording.clone()),
            TransformChain::default(),
        );
        assembler
            .push(PageResult::completed(0, PagePayload::Stored("/nonexistent/page.bin".into()), 0))
            .unwrap();
        let report = assembler.finish().unwrap();
        assert_eq!(report.gaps.len(), 1);
        assert_eq!(report.pages_written, 0);
        assert_eq!(*recording.0.lock().unwrap(), vec!["0:gap"]);
    }

    #[test]
    fn test_placeholder_page_counts_as_gap() {
        let recording = Recording::default();
        let mut assembler = Assembler::new(
            manifest(3),
            Box::new(recording.clone()),
            TransformChain::default(),
        );
        assembler.push(ok(0)).unwrap();
        assembler
            .push(PageResult::completed(1, PagePayload::Bytes(b"bad".to_vec()), 1))
            .unwrap();
        assembler.push(ok(2)).unwrap();
        let report = assembler.finish().unwrap();
        assert_eq!(
            *recording.0.lock().unwrap(),
            vec!["0:p0", "1:placeholder", "2:p2"]
        );
        assert_eq!(report.pages_written, 2);
        assert_eq!(report.gaps.len(), 1);
        assert_eq!(report.gaps[0].index, 1);
        assert!(matches!(report.gaps[0].reason, PageFailure::InvalidImage { .. }));
    }

    #[test]
    fn test_output_format_labels() {
        assert_eq!(OutputFormat::parse("PDF"), Some(OutputFormat::Pdf));
        assert_eq!(OutputFormat::parse("cbz"), Some(OutputFormat::Cbz));
        assert_eq!(OutputFormat::parse("epub"), None);
        assert_eq!(OutputFormat::Cbz.extension(), "cbz");
    }
}
