//! Format processors: raw upload bytes → [`ProcessedDocument`].
//!
//! Processors are looked up by file-type tag in a [`ProcessorRegistry`].
//! The registry starts with the five built-in formats and is open:
//! callers may register extra processors under new tags at runtime.
//!
//! | Tag | Processor | Hints emitted |
//! |-----|-----------|---------------|
//! | `pdf` | [`pdf::PdfProcessor`] | `page` |
//! | `docx` | [`docx::DocxProcessor`] | `heading`, `page`, `table` |
//! | `epub` | [`epub::EpubProcessor`] | `section`, `heading` |
//! | `markdown` | [`markdown::MarkdownProcessor`] | `heading`, `code_fence`, `table` |
//! | `txt` | [`txt::TxtProcessor`] | `page` |
//!
//! Every processor returns an empty document for an empty body rather
//! than failing.

pub mod docx;
pub mod epub;
pub mod markdown;
pub mod pdf;
pub mod txt;

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use easy_dataset_core::document::ProcessedDocument;
use easy_dataset_core::PipelineError;

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb protection).
pub(crate) const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extraction failure. Never a panic; the file-processing task fails with it.
#[derive(Debug)]
pub enum ProcessError {
    Unsupported(String),
    Pdf(String),
    Archive(String),
    Xml(String),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Unsupported(tag) => write!(f, "no processor for file type '{}'", tag),
            ProcessError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ProcessError::Archive(e) => write!(f, "archive extraction failed: {}", e),
            ProcessError::Xml(e) => write!(f, "XML parsing failed: {}", e),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<ProcessError> for PipelineError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Unsupported(tag) => PipelineError::UnsupportedFileType(tag),
            other => PipelineError::Validation(other.to_string()),
        }
    }
}

/// Converts one file format into normalized text with structure hints.
pub trait DocumentProcessor: Send + Sync {
    /// File-type tag this processor handles.
    fn tag(&self) -> &str;

    fn process(&self, bytes: &[u8], filename: &str) -> Result<ProcessedDocument, ProcessError>;
}

/// Registry of processors keyed by file-type tag.
#[derive(Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn DocumentProcessor>>,
}

impl ProcessorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            processors: HashMap::new(),
        }
    }

    /// A registry holding the built-in processors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(pdf::PdfProcessor));
        registry.register(Arc::new(docx::DocxProcessor));
        registry.register(Arc::new(epub::EpubProcessor));
        registry.register(Arc::new(markdown::MarkdownProcessor));
        registry.register(Arc::new(txt::TxtProcessor));
        registry
    }

    /// Register a processor under its tag, replacing any previous one.
    pub fn register(&mut self, processor: Arc<dyn DocumentProcessor>) {
        self.processors
            .insert(processor.tag().to_lowercase(), processor);
    }

    pub fn find(&self, tag: &str) -> Option<Arc<dyn DocumentProcessor>> {
        self.processors.get(&tag.to_lowercase()).cloned()
    }

    pub fn supports(&self, tag: &str) -> bool {
        self.processors.contains_key(&tag.to_lowercase())
    }

    /// Sorted list of registered tags.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.processors.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Run the processor registered for `tag`.
    pub fn process(
        &self,
        tag: &str,
        bytes: &[u8],
        filename: &str,
    ) -> Result<ProcessedDocument, ProcessError> {
        let processor = self
            .find(tag)
            .ok_or_else(|| ProcessError::Unsupported(tag.to_string()))?;
        let mut doc = processor.process(bytes, filename)?;
        doc.finalize_hints();
        Ok(doc)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

pub(crate) type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

pub(crate) fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ProcessError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ProcessError::Archive(e.to_string()))
}

/// Read a ZIP entry, refusing entries that decompress past `max_bytes`.
pub(crate) fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ProcessError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ProcessError::Archive(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ProcessError::Archive(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ProcessError::Archive(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Text of an XML text event, falling back to the raw bytes when an
/// entity cannot be resolved (XHTML often uses `&nbsp;` and friends).
pub(crate) fn event_text(text: &quick_xml::events::BytesText<'_>) -> String {
    match text.unescape() {
        Ok(s) => s.into_owned(),
        Err(_) => String::from_utf8_lossy(text)
            .replace("&nbsp;", " ")
            .replace("&amp;", "&"),
    }
}

/// Value of the attribute whose local name is `key`.
pub(crate) fn attr_value(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use easy_dataset_core::ErrorKind;

    struct Shout;

    impl DocumentProcessor for Shout {
        fn tag(&self) -> &str {
            "shout"
        }

        fn process(&self, bytes: &[u8], _filename: &str) -> Result<ProcessedDocument, ProcessError> {
            Ok(ProcessedDocument {
                text: String::from_utf8_lossy(bytes).to_uppercase(),
                ..Default::default()
            })
        }
    }

    #[test]
    fn builtins_are_registered() {
        let reg = ProcessorRegistry::with_builtins();
        assert_eq!(reg.tags(), vec!["docx", "epub", "markdown", "pdf", "txt"]);
        assert_eq!(reg.len(), 5);
    }

    #[test]
    fn unknown_tag_is_unsupported() {
        let reg = ProcessorRegistry::with_builtins();
        let err = reg.process("xlsx", b"x", "a.xlsx").unwrap_err();
        assert_eq!(PipelineError::from(err).kind(), ErrorKind::UnsupportedFileType);
    }

    #[test]
    fn custom_processor_can_be_attached() {
        let mut reg = ProcessorRegistry::with_builtins();
        reg.register(Arc::new(Shout));
        assert!(reg.supports("SHOUT"));
        let doc = reg.process("shout", b"hey", "a.shout").unwrap();
        assert_eq!(doc.text, "HEY");
    }

    #[test]
    fn empty_bodies_never_fail() {
        let reg = ProcessorRegistry::with_builtins();
        for tag in reg.tags() {
            let doc = reg.process(&tag, b"", "empty").unwrap();
            assert!(doc.text.is_empty(), "{} produced text", tag);
        }
    }
}
