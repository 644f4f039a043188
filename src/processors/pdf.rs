//! PDF text extraction, one block per page.

use easy_dataset_core::document::{DocumentBuilder, HintKind, ProcessedDocument};

use super::{DocumentProcessor, ProcessError};

pub struct PdfProcessor;

impl DocumentProcessor for PdfProcessor {
    fn tag(&self) -> &str {
        "pdf"
    }

    fn process(&self, bytes: &[u8], _filename: &str) -> Result<ProcessedDocument, ProcessError> {
        if bytes.is_empty() {
            return Ok(ProcessedDocument::empty());
        }
        let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
            .map_err(|e| ProcessError::Pdf(e.to_string()))?;
        Ok(assemble_pages(&pages))
    }
}

/// Join page texts, marking a `page` hint where each non-empty page starts.
pub(crate) fn assemble_pages(pages: &[String]) -> ProcessedDocument {
    let mut builder = DocumentBuilder::new();
    for (i, page) in pages.iter().enumerate() {
        builder.mark(HintKind::Page, Some(&format!("page {}", i + 1)));
        builder.push_block(page);
    }
    builder.set_meta("pages", pages.len().to_string());
    builder.finish()
}
