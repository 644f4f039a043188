//! Markdown: headings, fenced code blocks, and pipe tables become hints.
//!
//! The text itself is only normalized, never rewritten, so hint offsets
//! point straight into the source the operator uploaded.

use regex::Regex;
use std::sync::OnceLock;

use easy_dataset_core::document::{normalize_text, HintKind, ProcessedDocument, StructureHint};

use super::txt::decode_text;
use super::{DocumentProcessor, ProcessError};

pub struct MarkdownProcessor;

impl DocumentProcessor for MarkdownProcessor {
    fn tag(&self) -> &str {
        "markdown"
    }

    fn process(&self, bytes: &[u8], _filename: &str) -> Result<ProcessedDocument, ProcessError> {
        let text = normalize_text(&decode_text(bytes));
        let hints = scan(&text);
        let mut doc = ProcessedDocument {
            text,
            hints,
            ..Default::default()
        };
        if let Some(title) = doc
            .hints
            .iter()
            .find(|h| h.kind == HintKind::Heading && h.level == Some(1))
            .and_then(|h| h.label.clone())
        {
            doc.metadata.insert("title".to_string(), title);
        }
        Ok(doc)
    }
}

struct Line<'a> {
    start: usize,
    /// End offset excluding the newline.
    end: usize,
    text: &'a str,
}

fn lines(text: &str) -> Vec<Line<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    for piece in text.split('\n') {
        out.push(Line {
            start,
            end: start + piece.len(),
            text: piece,
        });
        start += piece.len() + 1;
    }
    out
}

fn atx_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^ {0,3}(#{1,6})(?:[ \t]+(.*?))?(?:[ \t]+#+)?[ \t]*$")
            .expect("valid heading regex")
    })
}

fn table_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*\|?\s*:?-{1,}:?\s*(\|\s*:?-{1,}:?\s*)*\|?\s*$")
            .expect("valid table separator regex")
    })
}

/// Opening fence marker: (char, run length).
fn fence_open(line: &str) -> Option<(char, usize)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let marker = rest.chars().next()?;
    if marker != '`' && marker != '~' {
        return None;
    }
    let run = rest.chars().take_while(|c| *c == marker).count();
    if run < 3 {
        return None;
    }
    // Backtick fences may not carry backticks in their info string.
    if marker == '`' && rest[run..].contains('`') {
        return None;
    }
    Some((marker, run))
}

fn fence_closes(line: &str, marker: char, run: usize) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= run && trimmed.chars().all(|c| c == marker)
}

fn is_table_row(line: &str) -> bool {
    !line.trim().is_empty() && line.contains('|')
}

fn setext_level(line: &str) -> Option<u8> {
    let t = line.trim();
    if t.len() >= 2 && t.chars().all(|c| c == '=') {
        Some(1)
    } else if t.len() >= 2 && t.chars().all(|c| c == '-') {
        Some(2)
    } else {
        None
    }
}

/// Scan normalized Markdown for structure hints.
pub fn scan(text: &str) -> Vec<StructureHint> {
    let lines = lines(text);
    let mut hints = Vec::new();
    // A plain paragraph line directly above may become a setext heading.
    let mut paragraph_line: Option<usize> = None;
    let mut i = 0;

    while i < lines.len() {
        let line = &lines[i];

        if let Some((marker, run)) = fence_open(line.text) {
            let close = (i + 1..lines.len()).find(|&j| fence_closes(lines[j].text, marker, run));
            let last = close.unwrap_or(lines.len() - 1);
            hints.push(StructureHint::range(
                HintKind::CodeFence,
                line.start,
                lines[last].end,
            ));
            paragraph_line = None;
            i = last + 1;
            continue;
        }

        if let Some(caps) = atx_heading().captures(line.text) {
            let level = caps.get(1).map_or(1, |m| m.as_str().len()) as u8;
            let label = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
            hints.push(StructureHint::heading(line.start, level, label));
            paragraph_line = None;
            i += 1;
            continue;
        }

        if is_table_row(line.text)
            && i + 1 < lines.len()
            && lines[i + 1].text.contains('|')
            && table_separator().is_match(lines[i + 1].text)
        {
            let mut last = i + 1;
            while last + 1 < lines.len() && is_table_row(lines[last + 1].text) {
                last += 1;
            }
            hints.push(StructureHint::range(HintKind::Table, line.start, lines[last].end));
            paragraph_line = None;
            i = last + 1;
            continue;
        }

        if let (Some(p), Some(level)) = (paragraph_line, setext_level(line.text)) {
            let label = lines[p].text.trim().to_string();
            hints.push(StructureHint::heading(lines[p].start, level, label));
            paragraph_line = None;
            i += 1;
            continue;
        }

        paragraph_line = if line.text.trim().is_empty() {
            None
        } else {
            Some(i)
        };
        i += 1;
    }

    hints.sort_by_key(|h| h.offset);
    hints
}
