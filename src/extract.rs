//! Plain-text extraction for fetched policy documents.
//!
//! Fetchers supply bytes plus whatever hints they have (content-type
//! header, file name); this module picks a [`DocumentFormat`] and returns
//! UTF-8 text.
//!
//! | Format | Detected by | Extractor |
//! |--------|-------------|-----------|
//! | PDF | `application/pdf`, `.pdf`, `%PDF` magic | `pdf-extract` |
//! | DOCX | wordprocessingml content-type, `.docx` | `zip` + `quick-xml` over `word/document.xml` |
//! | Text | `text/*`, `.txt`, `.md`, anything else that is valid UTF-8 | lossless passthrough |

use std::io::Read;
use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported document format: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Text,
}

/// Pick a format from the content-type header, then the name's extension,
/// then the leading bytes.
pub fn detect_format(content_type: Option<&str>, name: &str, bytes: &[u8]) -> DocumentFormat {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    match mime.as_deref() {
        Some(MIME_PDF) => return DocumentFormat::Pdf,
        Some(MIME_DOCX) => return DocumentFormat::Docx,
        Some(ct) if ct.starts_with("text/") => return DocumentFormat::Text,
        _ => {}
    }

    // Drop any query string before looking at the extension.
    let path = name.split(['?', '#']).next().unwrap_or(name).to_ascii_lowercase();
    if path.ends_with(".pdf") {
        return DocumentFormat::Pdf;
    }
    if path.ends_with(".docx") {
        return DocumentFormat::Docx;
    }

    if bytes.starts_with(b"%PDF") {
        DocumentFormat::Pdf
    } else {
        DocumentFormat::Text
    }
}

pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> Result<String, ExtractError> {
    match format {
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Docx => extract_docx(bytes),
        DocumentFormat::Text => std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| ExtractError::Unsupported(format!("binary content ({})", e))),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;

    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    extract_paragraphs(&doc_xml)
}

/// Collect `<w:t>` runs, one line per `<w:p>` paragraph.
fn extract_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
