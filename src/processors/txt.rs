//! Plain text. A form feed (`\x0c`) is a page break.

use easy_dataset_core::document::{normalize_text, HintKind, ProcessedDocument, StructureHint};

use super::{DocumentProcessor, ProcessError};

pub struct TxtProcessor;

impl DocumentProcessor for TxtProcessor {
    fn tag(&self) -> &str {
        "txt"
    }

    fn process(&self, bytes: &[u8], _filename: &str) -> Result<ProcessedDocument, ProcessError> {
        let raw = decode_text(bytes);
        let mut text = normalize_text(&raw);

        // Both characters are one byte, so offsets survive the swap.
        let mut hints = Vec::new();
        for (i, _) in text.match_indices('\x0c') {
            hints.push(StructureHint::at(HintKind::Page, i + 1));
        }
        if !hints.is_empty() {
            text = text.replace('\x0c', "\n");
        }

        let mut doc = ProcessedDocument {
            text,
            hints,
            ..Default::default()
        };
        doc.metadata
            .insert("pages".to_string(), (doc.hints.len() + 1).to_string());
        Ok(doc)
    }
}

/// Decode text-like uploads: strip a UTF-8 BOM and replace invalid sequences.
pub(crate) fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
