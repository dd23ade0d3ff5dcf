//! Document loaders: raw file bytes to plain text.
//!
//! Dispatch is by file extension. Anything unrecognised goes through a
//! best-effort extractor that keeps whatever printable text it can find.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;

use quick_xml::events::Event;
use thiserror::Error;
use tracing::debug;

/// Upper bound on `word/document.xml` size.
const MAX_DOCX_XML_BYTES: u64 = 64 * 1024 * 1024;

/// Extensions picked up when scanning a materials directory.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "docx", "doc", "txt", "md", "markdown"];

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("DOCX extraction failed: {0}")]
    Docx(String),

    #[error("No readable text found in {0}")]
    NoText(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    PlainText,
    Markdown,
    Other,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("pdf") => DocumentKind::Pdf,
            Some("docx") => DocumentKind::Docx,
            Some("txt") => DocumentKind::PlainText,
            Some("md") | Some("markdown") => DocumentKind::Markdown,
            _ => DocumentKind::Other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Docx => "docx",
            DocumentKind::PlainText => "text",
            DocumentKind::Markdown => "markdown",
            DocumentKind::Other => "other",
        }
    }
}

/// Text extracted from a source file.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

/// Read and extract a file from disk.
pub fn load_document(path: &Path, source: &str) -> Result<Vec<LoadedDocument>, LoaderError> {
    let bytes = std::fs::read(path).map_err(|e| LoaderError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_bytes(&bytes, DocumentKind::from_path(path), source)
}

/// Extract text from bytes of a known kind.
pub fn load_bytes(
    bytes: &[u8],
    kind: DocumentKind,
    source: &str,
) -> Result<Vec<LoadedDocument>, LoaderError> {
    let text = match kind {
        DocumentKind::Pdf => extract_pdf(bytes)?,
        DocumentKind::Docx => extract_docx(bytes)?,
        DocumentKind::PlainText | DocumentKind::Markdown => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        DocumentKind::Other => extract_generic(bytes, source)?,
    };

    debug!(source, kind = kind.label(), chars = text.chars().count(), "Loaded document");

    let mut metadata = BTreeMap::new();
    metadata.insert("source".to_string(), source.to_string());
    metadata.insert("kind".to_string(), kind.label().to_string());
    Ok(vec![LoadedDocument { text, metadata }])
}

fn extract_pdf(bytes: &[u8]) -> Result<String, LoaderError> {
    // pdf-extract panics on some malformed files
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(result) => result.map_err(|e| LoaderError::Pdf(e.to_string())),
        Err(_) => Err(LoaderError::Pdf("extractor panicked".to_string())),
    }
}

fn extract_docx(bytes: &[u8]) -> Result<String, LoaderError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| LoaderError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| LoaderError::Docx(e.to_string()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_DOCX_XML_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| LoaderError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_DOCX_XML_BYTES {
        return Err(LoaderError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    docx_text(&xml)
}

/// Concatenate `w:t` runs, one line per `w:p` paragraph.
fn docx_text(xml: &[u8]) -> Result<String, LoaderError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" => out.push('\n'),
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(LoaderError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

/// Lossy UTF-8 with control characters dropped.
fn extract_generic(bytes: &[u8], source: &str) -> Result<String, LoaderError> {
    let text: String = String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .collect();

    if !text.chars().any(char::is_alphanumeric) {
        return Err(LoaderError::NoText(source.to_string()));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_docx(document_xml: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            writer
                .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(document_xml.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_kind_from_path() {
        assert_eq!(DocumentKind::from_path(Path::new("a/Week1.PDF")), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_path(Path::new("b.docx")), DocumentKind::Docx);
        assert_eq!(DocumentKind::from_path(Path::new("c.markdown")), DocumentKind::Markdown);
        assert_eq!(DocumentKind::from_path(Path::new("d.txt")), DocumentKind::PlainText);
        assert_eq!(DocumentKind::from_path(Path::new("e.doc")), DocumentKind::Other);
        assert_eq!(DocumentKind::from_path(Path::new("Makefile")), DocumentKind::Other);
    }

    #[test]
    fn test_markdown_passthrough() {
        let docs = load_bytes("# Title\n\nBody".as_bytes(), DocumentKind::Markdown, "notes.md").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, "# Title\n\nBody");
        assert_eq!(docs[0].metadata["source"], "notes.md");
        assert_eq!(docs[0].metadata["kind"], "markdown");
    }

    #[test]
    fn test_docx_paragraphs() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
<w:body>
<w:p><w:r><w:t>Python</w:t></w:r><w:r><w:t xml:space="preserve"> and Django</w:t></w:r></w:p>
<w:p><w:r><w:t>R&amp;D</w:t></w:r></w:p>
</w:body>
</w:document>"#;
        let docs = load_bytes(&make_docx(xml), DocumentKind::Docx, "w.docx").unwrap();
        assert_eq!(docs[0].text, "Python and Django\nR&D\n");
    }

    #[test]
    fn test_docx_invalid_zip() {
        let result = load_bytes(b"not a zip", DocumentKind::Docx, "broken.docx");
        assert!(matches!(result, Err(LoaderError::Docx(_))));
    }

    #[test]
    fn test_pdf_invalid_bytes() {
        let result = load_bytes(b"%PDF-garbage", DocumentKind::Pdf, "broken.pdf");
        assert!(matches!(result, Err(LoaderError::Pdf(_))));
    }

    #[test]
    fn test_generic_strips_control_characters() {
        let docs = load_bytes(b"Hello\x00\x01 world\n", DocumentKind::Other, "x.bin").unwrap();
        assert_eq!(docs[0].text, "Hello world\n");
    }

    #[test]
    fn test_generic_rejects_binary_noise() {
        let result = load_bytes(&[0u8, 1, 2, 0xff, 0xfe], DocumentKind::Other, "blob.bin");
        assert!(matches!(result, Err(LoaderError::NoText(_))));
    }

    #[test]
    fn test_load_document_missing_file() {
        let result = load_document(Path::new("/nonexistent/lecture.md"), "lecture.md");
        assert!(matches!(result, Err(LoaderError::Io { .. })));
    }
}
