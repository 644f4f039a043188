//! Boundary-aware document chunker.
//!
//! Splits a [`ProcessedDocument`] into [`Chunk`]s bounded by
//! [`ChunkerConfig`]. Chunks partition the normalized text: chunk *i*
//! covers `start_offset..end_offset`, chunk *i+1* starts where chunk *i*
//! ended, and whitespace between paragraphs belongs to the chunk before it.
//!
//! # Strategies
//!
//! | Strategy | Boundaries |
//! |----------|------------|
//! | `semantic` | best-ranked boundary near `target_size` inside `[min_size, max_size]` |
//! | `heading` | every chunk starts at a heading; oversize sections fall back to `semantic` |
//! | `fixed` | every `target_size` bytes, snapped to a character boundary |
//!
//! Semantic boundary ranks, best first: heading or section starts, blank
//! lines and page breaks, sentence terminators, whitespace. The boundary
//! closest to `target_size` within the best non-empty rank wins. No rank
//! may place a boundary strictly inside a code fence or table hint.
//!
//! Each chunk gets an id derived from its file id and ordinal, plus a
//! SHA-256 hash of its content, so identical input and configuration
//! always yield identical chunks.
//!
//! # Example
//!
//! ```rust
//! use easy_dataset_core::chunk::{chunk_document, ChunkerConfig};
//! use easy_dataset_core::document::ProcessedDocument;
//!
//! let doc = ProcessedDocument {
//!     text: "Hello world.\n\nSecond paragraph.".into(),
//!     ..Default::default()
//! };
//! let chunks = chunk_document("proj", "file", "notes", &doc, &ChunkerConfig::default()).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].end_offset, doc.text.len());
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::document::{HintKind, ProcessedDocument};
use crate::error::{PipelineError, PipelineResult};
use crate::models::Chunk;

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    Semantic,
    Fixed,
    Heading,
}

impl SplitStrategy {
    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "semantic" => Ok(SplitStrategy::Semantic),
            "fixed" => Ok(SplitStrategy::Fixed),
            "heading" => Ok(SplitStrategy::Heading),
            other => Err(PipelineError::validation(format!(
                "unknown split strategy '{}' (expected semantic, fixed, or heading)",
                other
            ))),
        }
    }
}

/// Chunker bounds, in bytes of normalized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub target_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub overlap: usize,
    pub split_strategy: SplitStrategy,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_size: 2000,
            min_size: 500,
            max_size: 3000,
            overlap: 0,
            split_strategy: SplitStrategy::Semantic,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.min_size == 0 || self.target_size == 0 || self.max_size == 0 {
            return Err(PipelineError::validation("chunk sizes must be > 0"));
        }
        if !(self.min_size <= self.target_size && self.target_size <= self.max_size) {
            return Err(PipelineError::validation(format!(
                "chunk sizes must satisfy min_size <= target_size <= max_size (got {} / {} / {})",
                self.min_size, self.target_size, self.max_size
            )));
        }
        if self.overlap >= self.min_size {
            return Err(PipelineError::validation(format!(
                "overlap ({}) must be smaller than min_size ({})",
                self.overlap, self.min_size
            )));
        }
        Ok(())
    }
}

/// Split `doc` into chunks for the file `file_id`.
///
/// `file_stem` names the chunks (`<stem>-part-<n>`). Empty or
/// whitespace-only documents produce no chunks.
pub fn chunk_document(
    project_id: &str,
    file_id: &str,
    file_stem: &str,
    doc: &ProcessedDocument,
    cfg: &ChunkerConfig,
) -> PipelineResult<Vec<Chunk>> {
    cfg.validate()?;
    if doc.is_empty() {
        return Ok(Vec::new());
    }

    let spans = split_spans(doc, cfg);
    let summaries = span_summaries(doc, &spans);

    let text = doc.text.as_str();
    let mut chunks = Vec::with_capacity(spans.len());
    for (i, &(start, end)) in spans.iter().enumerate() {
        let overlap_start = if i == 0 || cfg.overlap == 0 {
            start
        } else {
            let prev_start = spans[i - 1].0;
            let back = cfg.overlap.min(start - prev_start);
            ceil_char_boundary(text, start - back)
        };
        let content = &text[overlap_start..end];
        chunks.push(make_chunk(
            project_id,
            file_id,
            file_stem,
            i as u32,
            (start, end),
            start - overlap_start,
            content,
            summaries[i].clone(),
        ));
    }
    Ok(chunks)
}

/// Compute the non-overlapping `(start, end)` spans for a document.
pub fn split_spans(doc: &ProcessedDocument, cfg: &ChunkerConfig) -> Vec<(usize, usize)> {
    let text = doc.text.as_str();
    if text.is_empty() {
        return Vec::new();
    }
    match cfg.split_strategy {
        SplitStrategy::Fixed => fixed_spans(text, cfg.target_size),
        SplitStrategy::Semantic => {
            let boundaries = Boundaries::scan(doc);
            semantic_spans(text, 0, text.len(), cfg, &boundaries)
        }
        SplitStrategy::Heading => heading_spans(doc, cfg),
    }
}

fn fixed_spans(text: &str, size: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut pos = 0;
    while pos < text.len() {
        let mut end = floor_char_boundary(text, (pos + size).min(text.len()));
        if end <= pos {
            end = ceil_char_boundary(text, pos + 1);
        }
        spans.push((pos, end));
        pos = end;
    }
    spans
}

fn heading_spans(doc: &ProcessedDocument, cfg: &ChunkerConfig) -> Vec<(usize, usize)> {
    let text = doc.text.as_str();
    let len = text.len();
    let boundaries = Boundaries::scan(doc);

    let mut starts: Vec<usize> = vec![0];
    starts.extend(boundaries.ranks[0].iter().copied().filter(|&o| o > 0 && o < len));
    starts.dedup();

    let mut sections: Vec<(usize, usize)> = Vec::with_capacity(starts.len());
    for (i, &s) in starts.iter().enumerate() {
        let e = starts.get(i + 1).copied().unwrap_or(len);
        if e > s {
            sections.push((s, e));
        }
    }

    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (s, e) in sections {
        if let Some(last) = merged.last_mut() {
            let cur = last.1 - last.0;
            let combined = e - last.0;
            if combined <= cfg.target_size || (cur < cfg.min_size && combined <= cfg.max_size) {
                last.1 = e;
                continue;
            }
        }
        merged.push((s, e));
    }

    let mut spans = Vec::new();
    for (s, e) in merged {
        if e - s <= cfg.max_size {
            spans.push((s, e));
        } else {
            spans.extend(semantic_spans(text, s, e, cfg, &boundaries));
        }
    }
    spans
}

fn semantic_spans(
    text: &str,
    from: usize,
    to: usize,
    cfg: &ChunkerConfig,
    boundaries: &Boundaries,
) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut pos = from;
    while pos < to {
        let remaining = to - pos;
        if remaining <= cfg.max_size && remaining < cfg.target_size + cfg.min_size {
            spans.push((pos, to));
            break;
        }

        let lo = pos + cfg.min_size;
        let mut hi = (pos + cfg.max_size).min(to.saturating_sub(cfg.min_size));
        if hi < lo {
            hi = (pos + cfg.max_size).min(to);
        }
        let hi = hi.max(lo);
        let ideal = (pos + cfg.target_size).clamp(lo, hi);

        let cut = boundaries
            .best_in(lo, hi, ideal)
            .unwrap_or_else(|| boundaries.hard_cut(text, pos, ideal, cfg.max_size));
        spans.push((pos, cut));
        pos = cut;
    }
    spans
}

/// Ranked candidate boundary offsets plus protected ranges.
struct Boundaries {
    ranks: [Vec<usize>; 4],
    protected: Vec<(usize, usize)>,
}

impl Boundaries {
    fn scan(doc: &ProcessedDocument) -> Self {
        let text = doc.text.as_str();
        let bytes = text.as_bytes();
        let mut ranks: [Vec<usize>; 4] = Default::default();

        for hint in &doc.hints {
            match hint.kind {
                HintKind::Heading | HintKind::Section => ranks[0].push(hint.offset),
                HintKind::Page => ranks[1].push(hint.offset),
                HintKind::CodeFence | HintKind::Table => {}
            }
        }

        let mut prev: Option<char> = None;
        for (i, c) in text.char_indices() {
            if !c.is_whitespace() {
                match prev {
                    Some(p) if p.is_whitespace() => {
                        let run_start = whitespace_run_start(bytes, i);
                        let newlines = bytes[run_start..i].iter().filter(|&&b| b == b'\n').count();
                        if newlines >= 2 {
                            ranks[1].push(i);
                        } else if sentence_end_at(bytes, run_start) {
                            ranks[2].push(i);
                        } else {
                            ranks[3].push(i);
                        }
                    }
                    Some('。' | '！' | '？') => ranks[2].push(i),
                    _ => {}
                }
            }
            prev = Some(c);
        }

        for rank in &mut ranks {
            rank.sort_unstable();
            rank.dedup();
        }
        let protected = doc.protected_ranges();
        Self { ranks, protected }
    }

    fn is_protected(&self, offset: usize) -> bool {
        self.protected
            .iter()
            .any(|&(s, e)| s < offset && offset < e)
    }

    /// Closest allowed boundary to `ideal` within the best non-empty rank.
    fn best_in(&self, lo: usize, hi: usize, ideal: usize) -> Option<usize> {
        for rank in &self.ranks {
            let a = rank.partition_point(|&o| o < lo);
            let b = rank.partition_point(|&o| o <= hi);
            let best = rank[a..b]
                .iter()
                .copied()
                .filter(|&o| !self.is_protected(o))
                .min_by_key(|&o| (o.abs_diff(ideal), o));
            if best.is_some() {
                return best;
            }
        }
        None
    }

    /// Boundary when no ranked candidate fits. A cut that would land inside
    /// a protected range moves to its end when that stays within `max`,
    /// else to its start (even below `min_size`), else to its end, so an
    /// oversize range becomes its own chunk. The result is never strictly
    /// inside a protected range.
    fn hard_cut(&self, text: &str, pos: usize, ideal: usize, max: usize) -> usize {
        let mut cut = floor_char_boundary(text, ideal);
        if let Some(&(s, e)) = self
            .protected
            .iter()
            .find(|&&(s, e)| s < cut && cut < e)
        {
            cut = if e <= pos + max || s <= pos { e } else { s };
        }
        if cut <= pos {
            cut = ceil_char_boundary(text, pos + 1);
        }
        cut
    }
}

fn whitespace_run_start(bytes: &[u8], i: usize) -> usize {
    let mut j = i;
    while j > 0 && bytes[j - 1].is_ascii_whitespace() {
        j -= 1;
    }
    j
}

fn sentence_end_at(bytes: &[u8], run_start: usize) -> bool {
    run_start > 0 && matches!(bytes[run_start - 1], b'.' | b'!' | b'?')
}

/// Heading labels for each span; multi-chunk sections get ` (part k)`.
fn span_summaries(doc: &ProcessedDocument, spans: &[(usize, usize)]) -> Vec<Option<String>> {
    let headings: Vec<(usize, &str)> = doc
        .hints
        .iter()
        .filter(|h| h.kind == HintKind::Heading)
        .filter_map(|h| h.label.as_deref().map(|l| (h.offset, l)))
        .collect();

    let governing: Vec<Option<usize>> = spans
        .iter()
        .map(|&(start, _)| {
            let idx = headings.partition_point(|&(o, _)| o <= start);
            idx.checked_sub(1)
        })
        .collect();

    let mut out = Vec::with_capacity(spans.len());
    for (i, g) in governing.iter().enumerate() {
        let Some(h) = *g else {
            out.push(None);
            continue;
        };
        let title = headings[h].1;
        let total = governing.iter().filter(|x| **x == Some(h)).count();
        if total > 1 {
            let part = governing[..=i].iter().filter(|x| **x == Some(h)).count();
            out.push(Some(format!("{} (part {})", title, part)));
        } else {
            out.push(Some(title.to_string()));
        }
    }
    out
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Snap a byte index forward to the nearest valid UTF-8 char boundary.
pub fn ceil_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Estimated token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Deterministic chunk id for `(file_id, ordinal)`.
pub fn chunk_id(file_id: &str, ordinal: u32) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}/chunk/{}", file_id, ordinal).as_bytes(),
    )
    .to_string()
}

#[allow(clippy::too_many_arguments)]
fn make_chunk(
    project_id: &str,
    file_id: &str,
    file_stem: &str,
    ordinal: u32,
    (start, end): (usize, usize),
    overlap: usize,
    content: &str,
    summary: Option<String>,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(file_id, ordinal),
        project_id: project_id.to_string(),
        file_id: file_id.to_string(),
        ordinal,
        name: format!("{}-part-{}", file_stem, ordinal + 1),
        start_offset: start,
        end_offset: end,
        overlap,
        content: content.to_string(),
        token_estimate: estimate_tokens(content),
        summary,
        tags: Vec::new(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::StructureHint;

    fn doc(text: &str) -> ProcessedDocument {
        ProcessedDocument {
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn cfg(target: usize, min: usize, max: usize, strategy: SplitStrategy) -> ChunkerConfig {
        ChunkerConfig {
            target_size: target,
            min_size: min,
            max_size: max,
            overlap: 0,
            split_strategy: strategy,
        }
    }

    /// 32 paragraphs of exactly 256 bytes each (8 KiB total).
    fn eight_kib_text() -> String {
        let mut text = String::new();
        for i in 0..32 {
            let mut para = format!("Paragraph {:02} talks about topic {}. ", i, i % 7);
            while para.len() < 254 {
                para.push_str("word ");
            }
            para.truncate(253);
            para.push('.');
            para.push_str("\n\n");
            assert_eq!(para.len(), 256);
            text.push_str(&para);
        }
        text
    }

    fn assert_partition(chunks: &[Chunk], len: usize) {
        assert_eq!(chunks.first().map(|c| c.start_offset), Some(0));
        assert_eq!(chunks.last().map(|c| c.end_offset), Some(len));
        for w in chunks.windows(2) {
            assert_eq!(w[0].end_offset, w[1].start_offset);
        }
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i as u32);
        }
    }

    #[test]
    fn semantic_eight_kib_gives_four_chunks() {
        let text = eight_kib_text();
        assert_eq!(text.len(), 8192);
        let d = doc(&text);
        let c = cfg(2000, 500, 3000, SplitStrategy::Semantic);
        let chunks = chunk_document("p", "f", "short", &d, &c).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_partition(&chunks, 8192);
        for chunk in &chunks {
            assert!(chunk.len() >= 500 && chunk.len() <= 3000);
        }
        assert_eq!(chunks[0].name, "short-part-1");
    }

    #[test]
    fn deterministic() {
        let text = eight_kib_text();
        let d = doc(&text);
        let c = cfg(1000, 300, 1500, SplitStrategy::Semantic);
        let a = chunk_document("p", "f", "s", &d, &c).unwrap();
        let b = chunk_document("p", "f", "s", &d, &c).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn semantic_respects_bounds_on_unstructured_text() {
        let text = "lorem ipsum dolor sit amet ".repeat(400);
        let d = doc(&text);
        let c = cfg(1000, 400, 1400, SplitStrategy::Semantic);
        let chunks = chunk_document("p", "f", "s", &d, &c).unwrap();
        assert_partition(&chunks, text.len());
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.len() >= 400 && chunk.len() <= 1400, "len {}", chunk.len());
            // whitespace rank: chunks start on a word
            assert!(!chunk.content.starts_with(' '));
        }
    }

    #[test]
    fn semantic_prefers_sentence_over_whitespace() {
        let mut text = "a".repeat(5);
        text.push(' ');
        let body = "word ".repeat(150) + "End of sentence. " + &"more ".repeat(150);
        text.push_str(&body);
        let d = doc(&text);
        let c = cfg(760, 200, 1200, SplitStrategy::Semantic);
        let spans = split_spans(&d, &c);
        let cut = spans[0].1;
        assert!(text[..cut].ends_with("End of sentence. "));
    }

    #[test]
    fn semantic_never_splits_code_fence() {
        let mut text = "intro text here. ".repeat(30);
        let fence_start = text.len();
        text.push_str("```\n");
        text.push_str(&"let x = 1; // code line\n".repeat(60));
        text.push_str("```\n");
        let fence_end = text.len();
        text.push_str(&"outro text here. ".repeat(30));
        let mut d = doc(&text);
        d.hints
            .push(StructureHint::range(HintKind::CodeFence, fence_start, fence_end));
        let c = cfg(900, 300, 2500, SplitStrategy::Semantic);
        let spans = split_spans(&d, &c);
        for &(s, _) in &spans[1..] {
            assert!(s <= fence_start || s >= fence_end, "split inside fence at {}", s);
        }
    }

    /// A fence that fits in `max_size` only if the chunk starts at it.
    fn fence_straddling_target() -> (ProcessedDocument, usize, usize) {
        let mut text = "Lead in words. ".repeat(14);
        text.truncate(200);
        let fence_start = text.len();
        text.push_str("```\n");
        while text.len() < fence_start + 900 {
            text.push_str("let value = compute();\n");
        }
        text.truncate(fence_start + 900);
        text.push_str("```\n");
        let fence_end = text.len();
        text.push_str(&"Closing remarks follow here. ".repeat(40));
        let mut d = doc(&text);
        d.hints
            .push(StructureHint::range(HintKind::CodeFence, fence_start, fence_end));
        (d, fence_start, fence_end)
    }

    #[test]
    fn fence_past_max_moves_cut_to_fence_start() {
        let (d, fence_start, fence_end) = fence_straddling_target();
        assert_eq!(fence_end - fence_start, 904);
        let c = cfg(600, 300, 1000, SplitStrategy::Semantic);
        let spans = split_spans(&d, &c);
        assert_eq!(spans[0], (0, fence_start));
        for &(s, e) in &spans {
            assert!(s <= fence_start || s >= fence_end, "split inside fence at {}", s);
            assert!(e <= fence_start || e >= fence_end, "split inside fence at {}", e);
        }
        assert_eq!(spans.last().map(|s| s.1), Some(d.text.len()));
    }

    #[test]
    fn oversize_fence_becomes_its_own_chunk() {
        let mut text = String::from("```\n");
        text.push_str(&"print(1)\n".repeat(200));
        text.push_str("```\n");
        let fence_end = text.len();
        text.push_str(&"Plain prose sentence. ".repeat(60));
        let mut d = doc(&text);
        d.hints.push(StructureHint::range(HintKind::CodeFence, 0, fence_end));
        let c = cfg(600, 300, 1000, SplitStrategy::Semantic);
        let spans = split_spans(&d, &c);
        assert_eq!(spans[0], (0, fence_end));
        assert!(spans[0].1 - spans[0].0 > c.max_size);
    }

    #[test]
    fn heading_strategy_starts_at_headings() {
        let mut text = String::new();
        let mut d = doc("");
        for i in 0..4 {
            d.hints.push(StructureHint::heading(text.len(), 1, format!("Section {}", i)));
            text.push_str(&format!("# Section {}\n\n", i));
            text.push_str(&"Body sentence for the section. ".repeat(20));
            text.push_str("\n\n");
        }
        d.text = text.clone();
        let c = cfg(600, 200, 1200, SplitStrategy::Heading);
        let chunks = chunk_document("p", "f", "s", &d, &c).unwrap();
        assert_eq!(chunks.len(), 4);
        for chunk in &chunks {
            assert!(chunk.content.starts_with("# Section"));
        }
        assert_eq!(chunks[2].summary.as_deref(), Some("Section 2"));
        assert_partition(&chunks, text.len());
    }

    #[test]
    fn heading_strategy_subdivides_oversize_sections() {
        let mut d = doc("");
        let mut text = String::from("# Big\n\n");
        d.hints.push(StructureHint::heading(0, 1, "Big"));
        text.push_str(&"Long sentence in a big section. ".repeat(120));
        d.text = text.clone();
        let c = cfg(1000, 300, 1500, SplitStrategy::Heading);
        let chunks = chunk_document("p", "f", "s", &d, &c).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].summary.as_deref(), Some("Big (part 1)"));
        assert_eq!(chunks[1].summary.as_deref(), Some("Big (part 2)"));
        assert_partition(&chunks, text.len());
    }

    #[test]
    fn fixed_sizes_exact_except_tail() {
        let text = "x".repeat(2500);
        let d = doc(&text);
        let c = cfg(1000, 100, 1000, SplitStrategy::Fixed);
        let chunks = chunk_document("p", "f", "s", &d, &c).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
    }

    #[test]
    fn fixed_snaps_to_char_boundaries() {
        let text = "é".repeat(1001);
        let d = doc(&text);
        let c = cfg(999, 100, 999, SplitStrategy::Fixed);
        let chunks = chunk_document("p", "f", "s", &d, &c).unwrap();
        assert_partition(&chunks, text.len());
        for chunk in &chunks {
            assert!(text.is_char_boundary(chunk.start_offset));
        }
    }

    #[test]
    fn overlap_is_metadata_not_offsets() {
        let text = eight_kib_text();
        let d = doc(&text);
        let mut c = cfg(2000, 500, 3000, SplitStrategy::Semantic);
        c.overlap = 100;
        let chunks = chunk_document("p", "f", "s", &d, &c).unwrap();
        assert_partition(&chunks, text.len());
        assert_eq!(chunks[0].overlap, 0);
        for w in chunks.windows(2) {
            let next = &w[1];
            assert_eq!(next.overlap, 100);
            assert!(w[0].content.ends_with(&next.content[..next.overlap]));
            assert_eq!(next.body(), &text[next.start_offset..next.end_offset]);
        }
    }

    #[test]
    fn empty_document_has_no_chunks() {
        let d = doc("  \n\n ");
        let chunks = chunk_document("p", "f", "s", &d, &ChunkerConfig::default()).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn invalid_config_rejected() {
        let c = cfg(100, 500, 3000, SplitStrategy::Semantic);
        assert!(c.validate().is_err());
        let mut c = ChunkerConfig::default();
        c.overlap = c.min_size;
        assert!(c.validate().is_err());
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("日本語です"), 2);
    }

    #[test]
    fn chunk_ids_are_stable() {
        assert_eq!(chunk_id("file-1", 3), chunk_id("file-1", 3));
        assert_ne!(chunk_id("file-1", 3), chunk_id("file-1", 4));
    }
}
