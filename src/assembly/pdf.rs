//! Streaming PDF writer.
//!
//! Each page is written as soon as it arrives and only its xref offset is
//! kept, so memory does not grow with page count. JPEG pages are embedded
//! verbatim with `DCTDecode`; anything else becomes a text placeholder page
//! and is reported back as a missing page.
//! Output carries no timestamps or random ids and is byte-for-byte
//! reproducible for the same input.

use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{AssemblyError, DocumentSink, Gap, PageWrite};

const CATALOG_ID: usize = 1;
const PAGES_ID: usize = 2;
const FONT_ID: usize = 3;
const INFO_ID: usize = 4;
const FIRST_FREE_ID: usize = 5;

/// A4 in points, used for placeholder pages.
const PLACEHOLDER_SIZE: (u32, u32) = (595, 842);

/// Dimensions and colour layout read from a JPEG frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JpegInfo {
    pub width: u32,
    pub height: u32,
    pub components: u8,
}

/// Reads the first SOF marker of a JPEG stream.
pub(crate) fn jpeg_info(bytes: &[u8]) -> Option<JpegInfo> {
    if bytes.get(..2)? != [0xFF, 0xD8] {
        return None;
    }
    let mut pos = 2;
    while pos + 1 < bytes.len() {
        if bytes[pos] != 0xFF {
            return None;
        }
        let marker = bytes[pos + 1];
        match marker {
            0xFF => {
                pos += 1;
                continue;
            }
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            0xD9 | 0xDA => return None,
            _ => {}
        }
        let len = usize::from(u16::from_be_bytes([*bytes.get(pos + 2)?, *bytes.get(pos + 3)?]));
        let is_sof = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            let segment = bytes.get(pos + 4..pos + 2 + len)?;
            let height = u32::from(u16::from_be_bytes([*segment.get(1)?, *segment.get(2)?]));
            let width = u32::from(u16::from_be_bytes([*segment.get(3)?, *segment.get(4)?]));
            let components = *segment.get(5)?;
            if width == 0 || height == 0 {
                return None;
            }
            return Some(JpegInfo {
                width,
                height,
                components,
            });
        }
        pos += 2 + len;
    }
    None
}

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// PDF document sink over any writer.
pub struct PdfSink<W: Write> {
    out: CountingWriter<W>,
    path: PathBuf,
    title: String,
    /// Byte offset of each object, indexed by object number.
    offsets: Vec<Option<u64>>,
    page_ids: Vec<usize>,
}

impl<W: Write> std::fmt::Debug for PdfSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfSink")
            .field("path", &self.path)
            .field("pages", &self.page_ids.len())
            .field("bytes", &self.out.count)
            .finish_non_exhaustive()
    }
}

impl<W: Write> PdfSink<W> {
    /// Starts a document. `path` only labels errors.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::Io`] when the header cannot be written.
    pub fn new(writer: W, title: &str, path: &Path) -> Result<Self, AssemblyError> {
        let mut sink = Self {
            out: CountingWriter {
                inner: writer,
                count: 0,
            },
            path: path.to_path_buf(),
            title: title.to_string(),
            offsets: vec![None; FIRST_FREE_ID],
            page_ids: Vec::new(),
        };
        sink.raw(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n")?;
        sink.object(
            FONT_ID,
            b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>",
        )?;
        Ok(sink)
    }

    fn io(&self, error: std::io::Error) -> AssemblyError {
        AssemblyError::io(&self.path, error)
    }

    fn raw(&mut self, bytes: &[u8]) -> Result<(), AssemblyError> {
        self.out.write_all(bytes).map_err(|e| self.io(e))
    }

    fn allocate(&mut self) -> usize {
        self.offsets.push(None);
        self.offsets.len() - 1
    }

    fn object(&mut self, id: usize, body: &[u8]) -> Result<(), AssemblyError> {
        self.offsets[id] = Some(self.out.count);
        self.raw(format!("{id} 0 obj\n").as_bytes())?;
        self.raw(body)?;
        self.raw(b"\nendobj\n")
    }

    fn stream_object(&mut self, id: usize, dict: &str, data: &[u8]) -> Result<(), AssemblyError> {
        self.offsets[id] = Some(self.out.count);
        self.raw(format!("{id} 0 obj\n<< {dict} /Length {} >>\nstream\n", data.len()).as_bytes())?;
        self.raw(data)?;
        self.raw(b"\nendstream\nendobj\n")
    }

    fn page_object(&mut self, size: (u32, u32), content_id: usize, resources: &str) -> Result<(), AssemblyError> {
        let page_id = self.allocate();
        let body = format!(
            "<< /Type /Page /Parent {PAGES_ID} 0 R /MediaBox [0 0 {} {}] /Resources << {resources} >> /Contents {content_id} 0 R >>",
            size.0, size.1
        );
        self.object(page_id, body.as_bytes())?;
        self.page_ids.push(page_id);
        Ok(())
    }

    fn image_page(&mut self, info: JpegInfo, jpeg: &[u8]) -> Result<(), AssemblyError> {
        let color_space = match info.components {
            1 => "/DeviceGray",
            4 => "/DeviceCMYK",
            _ => "/DeviceRGB",
        };
        let image_id = self.allocate();
        let dict = format!(
            "/Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace {color_space} /BitsPerComponent 8 /Filter /DCTDecode",
            info.width, info.height
        );
        self.stream_object(image_id, &dict, jpeg)?;

        let content_id = self.allocate();
        let content = format!("q {} 0 0 {} 0 0 cm /Im0 Do Q", info.width, info.height);
        self.stream_object(content_id, "", content.as_bytes())?;

        self.page_object(
            (info.width, info.height),
            content_id,
            &format!("/XObject << /Im0 {image_id} 0 R >>"),
        )
    }

    fn text_page(&mut self, lines: &[String]) -> Result<(), AssemblyError> {
        let mut content = String::from("BT /F1 14 Tf 56 760 Td 18 TL");
        for line in lines {
            let _ = write!(content, " ({}) '", escape_text(line));
        }
        content.push_str(" ET");
        let content_id = self.allocate();
        self.stream_object(content_id, "", content.as_bytes())?;
        self.page_object(
            PLACEHOLDER_SIZE,
            content_id,
            &format!("/Font << /F1 {FONT_ID} 0 R >>"),
        )
    }

    /// Writes the page tree, xref table and trailer, then returns the writer
    /// and the total bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::Io`] when the tail cannot be written.
    pub fn finish_into(mut self) -> Result<(W, u64), AssemblyError> {
        let kids = self
            .page_ids
            .iter()
            .map(|id| format!("{id} 0 R"))
            .collect::<Vec<_>>()
            .join(" ");
        let pages = format!(
            "<< /Type /Pages /Kids [{kids}] /Count {} >>",
            self.page_ids.len()
        );
        self.object(PAGES_ID, pages.as_bytes())?;
        self.object(
            CATALOG_ID,
            format!("<< /Type /Catalog /Pages {PAGES_ID} 0 R >>").as_bytes(),
        )?;
        let info = format!(
            "<< /Title ({}) /Producer (manuscript-downloader) >>",
            escape_text(&self.title)
        );
        self.object(INFO_ID, info.as_bytes())?;

        let xref_offset = self.out.count;
        let mut xref = format!("xref\n0 {}\n0000000000 65535 f \n", self.offsets.len());
        for offset in self.offsets.iter().skip(1) {
            // Every allocated object is written before finish.
            let _ = writeln!(xref, "{:010} 00000 n ", offset.unwrap_or(0));
        }
        let _ = write!(
            xref,
            "trailer\n<< /Size {} /Root {CATALOG_ID} 0 R /Info {INFO_ID} 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n",
            self.offsets.len()
        );
        self.raw(xref.as_bytes())?;
        self.out.flush().map_err(|e| self.io(e))?;
        Ok((self.out.inner, self.out.count))
    }
}

impl<W: Write + Send> DocumentSink for PdfSink<W> {
    fn write_page(
        &mut self,
        index: usize,
        label: Option<&str>,
        bytes: &[u8],
    ) -> Result<PageWrite, AssemblyError> {
        if let Some(info) = jpeg_info(bytes) {
            self.image_page(info, bytes)?;
            return Ok(PageWrite::Embedded);
        }
        self.text_page(&[
            page_title(index, label),
            "Image could not be embedded (unsupported format).".to_string(),
        ])?;
        Ok(PageWrite::Placeholder {
            reason: "image is not a readable JPEG".to_string(),
        })
    }

    fn write_gap(&mut self, gap: &Gap) -> Result<(), AssemblyError> {
        let reason = serde_json::to_value(&gap.reason)
            .ok()
            .and_then(|v| v.get("kind").and_then(|k| k.as_str()).map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        self.text_page(&[
            page_title(gap.index, gap.label.as_deref()),
            format!("Missing page ({reason})."),
        ])
    }

    fn finish(self: Box<Self>) -> Result<u64, AssemblyError> {
        let (_, count) = self.finish_into()?;
        Ok(count)
    }
}

fn page_title(index: usize, label: Option<&str>) -> String {
    match label {
        Some(label) => format!("Page {} ({label})", index + 1),
        None => format!("Page {}", index + 1),
    }
}

/// Escapes a PDF literal string. Non-ASCII characters become `?`.
fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' | '(' | ')' => {
                out.push('\\');
                out.push(c);
            }
            ' '..='~' => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}
