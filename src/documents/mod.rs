//! Document loader
//!
//! Validates uploaded files, extracts their text and splits it into
//! retrievable chunks. Embedding happens later, in the session store.

use crate::config::Settings;
use crate::error::AgentError;
use crate::models::UploadedFile;
use crate::Result;
use sha2::{Digest, Sha256};
use tracing::warn;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "csv"];
const PDF_EXTENSIONS: &[&str] = &["pdf"];
const SPREADSHEET_EXTENSIONS: &[&str] = &["xls", "xlsx"];

const TEXT_MIME_TYPES: &[&str] = &["text/plain", "text/markdown", "text/csv"];
const PDF_MIME_TYPES: &[&str] = &["application/pdf"];
const SPREADSHEET_MIME_TYPES: &[&str] = &[
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    Pdf,
    Spreadsheet,
}

/// Text of one upload, split into chunks in document order.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub name: String,
    pub content_hash: String,
    pub chunks: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentLoader {
    max_file_size: usize,
    chunk_size: usize,
    chunk_overlap: usize,
    max_chunks: usize,
}

impl DocumentLoader {
    pub fn new(max_file_size: usize, chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunk_overlap = chunk_overlap.min(chunk_size - 1);
        Self {
            max_file_size,
            chunk_size,
            chunk_overlap,
            max_chunks: chunk_limit(max_file_size, chunk_size, chunk_overlap),
        }
    }

    /// Override the per-document chunk limit.
    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = max_chunks.max(1);
        self
    }

    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.max_file_size,
            settings.chunk_size,
            settings.chunk_overlap,
        )
    }

    /// Check size and type. A file passes when either its MIME type or its
    /// extension is accepted; the extension decides how it is read.
    pub fn validate(&self, file: &UploadedFile) -> Result<FileKind> {
        if file.bytes.len() > self.max_file_size {
            return Err(AgentError::FileTooLarge {
                name: file.name.clone(),
                size: file.bytes.len(),
                limit: self.max_file_size,
            });
        }

        let extension = file
            .name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();

        let mime = file
            .content_type
            .as_deref()
            .map(|m| m.split(';').next().unwrap_or(m).trim().to_lowercase())
            .unwrap_or_default();

        kind_by_extension(&extension)
            .or_else(|| kind_by_mime(&mime))
            .ok_or_else(|| AgentError::UnsupportedFile {
                name: file.name.clone(),
                reason: format!(
                    "file type .{} not allowed; only .txt, .md, .csv, .pdf, .xls, .xlsx are accepted",
                    extension
                ),
            })
    }

    /// Validate every file of a batch before any of them is processed.
    pub fn validate_batch(&self, files: &[UploadedFile]) -> Result<()> {
        files.iter().try_for_each(|f| self.validate(f).map(|_| ()))
    }

    /// Extract and chunk one file.
    pub fn load(&self, file: &UploadedFile) -> Result<LoadedDocument> {
        let kind = self.validate(file)?;
        let text = extract_text(file, kind)?;

        if text.trim().is_empty() {
            return Err(AgentError::Document(format!(
                "{} contains no extractable text",
                file.name
            )));
        }

        let chunks = chunk_text(&text, self.chunk_size, self.chunk_overlap);
        if chunks.len() > self.max_chunks {
            warn!(
                file = %file.name,
                produced = chunks.len(),
                limit = self.max_chunks,
                "Rejecting document: too many chunks"
            );
            return Err(AgentError::Document(format!(
                "{} yields {} text chunks, more than the {} a single document may hold",
                file.name,
                chunks.len(),
                self.max_chunks
            )));
        }

        Ok(LoadedDocument {
            name: file.name.clone(),
            content_hash: hex::encode(Sha256::digest(&file.bytes)),
            chunks,
        })
    }
}

/// Chunks a text file of `max_file_size` bytes can produce.
///
/// Every flushed chunk plus the unit that did not fit spans more than
/// `size - overlap` new characters, so two chunks per step is an upper bound.
/// Only extracted formats (PDF) can exceed it.
fn chunk_limit(max_file_size: usize, size: usize, overlap: usize) -> usize {
    let step = size.saturating_sub(overlap).saturating_sub(2).max(1);
    max_file_size.saturating_mul(2).div_ceil(step).saturating_add(1)
}

const KINDS: &[(&[&str], &[&str], FileKind)] = &[
    (TEXT_EXTENSIONS, TEXT_MIME_TYPES, FileKind::Text),
    (PDF_EXTENSIONS, PDF_MIME_TYPES, FileKind::Pdf),
    (SPREADSHEET_EXTENSIONS, SPREADSHEET_MIME_TYPES, FileKind::Spreadsheet),
];

fn kind_by_extension(extension: &str) -> Option<FileKind> {
    KINDS
        .iter()
        .find(|(exts, _, _)| exts.iter().any(|e| *e == extension))
        .map(|(_, _, kind)| *kind)
}

fn kind_by_mime(mime: &str) -> Option<FileKind> {
    KINDS
        .iter()
        .find(|(_, mimes, _)| mimes.iter().any(|m| *m == mime))
        .map(|(_, _, kind)| *kind)
}

fn extract_text(file: &UploadedFile, kind: FileKind) -> Result<String> {
    match kind {
        FileKind::Text => Ok(String::from_utf8_lossy(&file.bytes).into_owned()),
        FileKind::Pdf => extract_pdf(file),
        FileKind::Spreadsheet => Err(AgentError::UnsupportedFile {
            name: file.name.clone(),
            reason: "spreadsheet text extraction is not available; export the sheet as .csv"
                .to_string(),
        }),
    }
}

#[cfg(feature = "pdf")]
fn extract_pdf(file: &UploadedFile) -> Result<String> {
    pdf_extract::extract_text_from_mem(&file.bytes)
        .map_err(|e| AgentError::Document(format!("{}: PDF extraction failed: {}", file.name, e)))
}

#[cfg(not(feature = "pdf"))]
fn extract_pdf(file: &UploadedFile) -> Result<String> {
    Err(AgentError::UnsupportedFile {
        name: file.name.clone(),
        reason: "PDF support is not compiled in (enable the `pdf` feature)".to_string(),
    })
}

/// Split text into chunks of at most `size` characters.
///
/// Paragraphs are packed greedily; consecutive chunks share up to `overlap`
/// trailing characters. Paragraphs longer than `size` are windowed.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let size = size.max(1);
    let overlap = overlap.min(size - 1);
    let normalized = text.replace("\r\n", "\n");

    let units: Vec<String> = normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .flat_map(|p| window(p, size, overlap))
        .collect();

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for unit in units {
        if current.is_empty() {
            current = unit;
            continue;
        }
        if char_len(&current) + 2 + char_len(&unit) <= size {
            current.push_str("\n\n");
            current.push_str(&unit);
            continue;
        }

        let carry = tail(&current, overlap);
        chunks.push(std::mem::take(&mut current));
        current = if !carry.is_empty() && char_len(&carry) + 1 + char_len(&unit) <= size {
            format!("{} {}", carry, unit)
        } else {
            unit
        };
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Windows of `size` characters stepping by `size - overlap`.
fn window(paragraph: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = paragraph.chars().collect();
    if chars.len() <= size {
        return vec![paragraph.to_string()];
    }
    let step = size - overlap;
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        pieces.push(chars[start..end].iter().collect::<String>().trim().to_string());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    pieces.retain(|p| !p.is_empty());
    pieces
}

/// Last `n` characters, starting at a word boundary when one is available.
fn tail(s: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= n {
        return String::new();
    }
    let piece: String = chars[chars.len() - n..].iter().collect();
    match piece.find(char::is_whitespace) {
        Some(i) => piece[i..].trim().to_string(),
        None => piece,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> DocumentLoader {
        DocumentLoader::new(1024, 60, 10)
    }

    #[test]
    fn test_accepts_by_extension_or_mime() {
        let l = loader();
        assert_eq!(l.validate(&UploadedFile::text("notes.TXT", "hi")).unwrap(), FileKind::Text);
        let by_mime = UploadedFile::new("upload", Some("application/pdf".into()), vec![1]);
        assert_eq!(l.validate(&by_mime).unwrap(), FileKind::Pdf);
        let sheet = UploadedFile::new("q3.xlsx", None, vec![1]);
        assert_eq!(l.validate(&sheet).unwrap(), FileKind::Spreadsheet);
    }

    #[test]
    fn test_rejects_type_and_size() {
        let l = loader();
        let exe = UploadedFile::new("run.exe", Some("application/octet-stream".into()), vec![0]);
        assert!(matches!(l.validate(&exe), Err(AgentError::UnsupportedFile { .. })));

        let big = UploadedFile::new("big.txt", None, vec![b'a'; 2048]);
        assert!(matches!(l.validate(&big), Err(AgentError::FileTooLarge { .. })));

        let batch = vec![UploadedFile::text("ok.txt", "fine"), exe];
        assert!(l.validate_batch(&batch).is_err());
    }

    #[test]
    fn test_load_chunks_in_order() {
        let text = "Revenue rose.\n\nCosts fell sharply over the year.\n\nMargins widened to a record level for the group.";
        let doc = loader().load(&UploadedFile::text("r.txt", text)).unwrap();
        assert!(doc.chunks.len() >= 2);
        assert!(doc.chunks[0].starts_with("Revenue rose."));
        assert!(doc.chunks.iter().all(|c| c.chars().count() <= 60));
        assert_eq!(doc.content_hash.len(), 64);
    }

    #[test]
    fn test_blank_document_is_an_error() {
        let result = loader().load(&UploadedFile::text("empty.txt", " \n\n \t"));
        assert!(matches!(result, Err(AgentError::Document(_))));
    }

    #[test]
    fn test_spreadsheet_has_no_extractor() {
        let sheet = UploadedFile::new("q3.xls", None, vec![1, 2, 3]);
        assert!(matches!(loader().load(&sheet), Err(AgentError::UnsupportedFile { .. })));
    }

    #[test]
    fn test_file_at_size_limit_is_indexed_whole() {
        let l = DocumentLoader::new(4096, 60, 10);
        let mut text = String::new();
        let mut n = 0;
        while text.len() < 4000 {
            text.push_str(&format!("Line item {} booked at cost.\n\n", n));
            n += 1;
        }
        text.push_str("Closing balance carried forward.");
        assert!(text.len() <= 4096);

        let doc = l.load(&UploadedFile::text("ledger.txt", &text)).unwrap();
        assert!(doc.chunks.len() <= l.max_chunks());
        assert!(doc.chunks.last().unwrap().contains("Closing balance carried forward."));
    }

    #[test]
    fn test_too_many_chunks_is_rejected_not_truncated() {
        let l = loader().with_max_chunks(1);
        let text = "Revenue rose.\n\nCosts fell sharply over the year.\n\nMargins widened to a record level for the group.";
        let result = l.load(&UploadedFile::text("r.txt", text));
        assert!(matches!(result, Err(AgentError::Document(msg)) if msg.contains("r.txt")));
    }

    #[test]
    fn test_long_paragraph_is_windowed_with_overlap() {
        let paragraph = "abcdefghij".repeat(10);
        let chunks = chunk_text(&paragraph, 30, 5);
        assert!(chunks.len() >= 4);
        assert!(chunks.iter().all(|c| c.chars().count() <= 30));
        assert_eq!(&chunks[0][25..30], &chunks[1][..5]);
    }

    #[test]
    fn test_multibyte_text_is_safe() {
        let text = "₹ rupee ".repeat(40);
        let chunks = chunk_text(&text, 25, 5);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 25));
    }
}
