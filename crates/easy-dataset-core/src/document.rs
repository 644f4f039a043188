//! Processed documents and the structure hints the chunker consumes.
//!
//! A [`ProcessedDocument`] is transient: format processors produce it,
//! the chunker consumes it, and only the resulting chunks are persisted.
//! All hint offsets are byte offsets into the normalized text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Built-in file types. Processor registries key on [`FileType::tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Pdf,
    Docx,
    Epub,
    Markdown,
    Txt,
}

impl FileType {
    pub const ALL: [FileType; 5] = [
        FileType::Pdf,
        FileType::Docx,
        FileType::Epub,
        FileType::Markdown,
        FileType::Txt,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Epub => "epub",
            FileType::Markdown => "markdown",
            FileType::Txt => "txt",
        }
    }

    /// Map a (case-insensitive) extension without the dot.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(FileType::Pdf),
            "docx" => Some(FileType::Docx),
            "epub" => Some(FileType::Epub),
            "md" | "markdown" => Some(FileType::Markdown),
            "txt" => Some(FileType::Txt),
            _ => None,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        FileType::ALL.into_iter().find(|t| t.tag() == tag)
    }

    /// Whether the type is plain text that must pass a UTF-8 probe.
    pub fn is_text(&self) -> bool {
        matches!(self, FileType::Markdown | FileType::Txt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintKind {
    Page,
    Section,
    Heading,
    CodeFence,
    Table,
}

/// A typed offset annotation emitted by a processor.
///
/// Range hints (`code_fence`, `table`) carry `end`; the chunker never
/// places a boundary strictly inside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureHint {
    pub kind: HintKind,
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl StructureHint {
    pub fn at(kind: HintKind, offset: usize) -> Self {
        Self {
            kind,
            offset,
            end: None,
            level: None,
            label: None,
        }
    }

    pub fn heading(offset: usize, level: u8, label: impl Into<String>) -> Self {
        Self {
            kind: HintKind::Heading,
            offset,
            end: None,
            level: Some(level),
            label: Some(label.into()),
        }
    }

    pub fn range(kind: HintKind, offset: usize, end: usize) -> Self {
        Self {
            kind,
            offset,
            end: Some(end),
            level: None,
            label: None,
        }
    }

    pub fn is_protected(&self) -> bool {
        matches!(self.kind, HintKind::CodeFence | HintKind::Table) && self.end.is_some()
    }
}

/// An entry of a document outline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocEntry {
    pub level: u8,
    pub title: String,
    pub offset: usize,
}

/// Normalized text plus structure hints and source metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessedDocument {
    pub text: String,
    pub hints: Vec<StructureHint>,
    pub metadata: BTreeMap<String, String>,
}

impl ProcessedDocument {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Half-open byte ranges no chunk boundary may fall strictly inside.
    pub fn protected_ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges: Vec<(usize, usize)> = self
            .hints
            .iter()
            .filter(|h| h.is_protected())
            .filter_map(|h| h.end.map(|end| (h.offset, end)))
            .collect();
        ranges.sort_unstable();
        ranges
    }

    /// Heading outline in document order.
    pub fn toc(&self) -> Vec<TocEntry> {
        self.hints
            .iter()
            .filter(|h| h.kind == HintKind::Heading)
            .filter_map(|h| {
                h.label.as_ref().map(|title| TocEntry {
                    level: h.level.unwrap_or(1),
                    title: title.clone(),
                    offset: h.offset,
                })
            })
            .collect()
    }

    /// Sort hints by offset and drop any that point past the text.
    pub fn finalize_hints(&mut self) {
        let len = self.text.len();
        self.hints.retain(|h| h.offset <= len);
        for h in &mut self.hints {
            if let Some(end) = h.end {
                h.end = Some(end.min(len));
            }
        }
        self.hints.sort_by_key(|h| h.offset);
    }
}

/// Maximum consecutive blank lines kept by [`normalize_text`].
const MAX_BLANK_LINES: usize = 2;

/// Normalize line endings to `\n` and collapse runs of more than two
/// blank lines to two. Lines holding only spaces or tabs count as blank
/// and are emptied. Everything else is preserved byte for byte.
pub fn normalize_text(raw: &str) -> String {
    let unified;
    let src = if raw.contains('\r') {
        unified = raw.replace("\r\n", "\n").replace('\r', "\n");
        unified.as_str()
    } else {
        raw
    };

    let mut out = String::with_capacity(src.len());
    let mut blank_run = 0usize;
    for (i, line) in src.split('\n').enumerate() {
        let blank = line.chars().all(|c| c == ' ' || c == '\t');
        if blank {
            blank_run += 1;
            if blank_run > MAX_BLANK_LINES {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if i > 0 {
            out.push('\n');
        }
        if !blank {
            out.push_str(line);
        }
    }
    out
}

/// Incrementally assembles a [`ProcessedDocument`] from blocks.
///
/// Blocks are normalized, stripped of surrounding newlines, and joined
/// with one blank line. Hints queued with [`mark`](DocumentBuilder::mark)
/// attach to the start of the next non-empty block.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    text: String,
    hints: Vec<StructureHint>,
    pending: Vec<StructureHint>,
    metadata: BTreeMap<String, String>,
}

impl DocumentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a hint for the next block.
    pub fn mark(&mut self, kind: HintKind, label: Option<&str>) {
        let mut hint = StructureHint::at(kind, 0);
        hint.label = label.map(str::to_string);
        self.pending.push(hint);
    }

    /// Append a block. Returns its byte range, or `None` when it was empty.
    pub fn push_block(&mut self, raw: &str) -> Option<(usize, usize)> {
        let normalized = normalize_text(raw);
        let block = normalized.trim_matches('\n');
        if block.trim().is_empty() {
            return None;
        }
        if !self.text.is_empty() {
            self.text.push_str("\n\n");
        }
        let start = self.text.len();
        self.text.push_str(block);
        let end = self.text.len();
        for mut hint in self.pending.drain(..) {
            hint.offset = start;
            self.hints.push(hint);
        }
        Some((start, end))
    }

    pub fn push_heading(&mut self, level: u8, title: &str) {
        let title = title.trim();
        if let Some((start, _)) = self.push_block(title) {
            self.hints.push(StructureHint::heading(start, level, title));
        }
    }

    /// Append a block the chunker must not split (a table, a code listing).
    pub fn push_protected(&mut self, kind: HintKind, raw: &str) {
        if let Some((start, end)) = self.push_block(raw) {
            self.hints.push(StructureHint::range(kind, start, end));
        }
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn finish(self) -> ProcessedDocument {
        let mut doc = ProcessedDocument {
            text: self.text,
            hints: self.hints,
            metadata: self.metadata,
        };
        doc.finalize_hints();
        doc
    }
}
