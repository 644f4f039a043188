//! DOCX (OOXML word processing) extraction.
//!
//! Walks `word/document.xml` in body order. `Title` and `HeadingN`
//! paragraph styles become headings, `<w:br w:type="page"/>` becomes a
//! page hint, and tables are flattened to one line per row with cells
//! joined by ` | `, protected from splitting.

use quick_xml::events::Event;

use easy_dataset_core::document::{DocumentBuilder, HintKind, ProcessedDocument};

use super::{
    attr_value, event_text, open_archive, read_zip_entry_bounded, DocumentProcessor, ProcessError,
    MAX_XML_ENTRY_BYTES,
};

pub struct DocxProcessor;

impl DocumentProcessor for DocxProcessor {
    fn tag(&self) -> &str {
        "docx"
    }

    fn process(&self, bytes: &[u8], _filename: &str) -> Result<ProcessedDocument, ProcessError> {
        if bytes.is_empty() {
            return Ok(ProcessedDocument::empty());
        }
        let mut archive = open_archive(bytes)?;
        let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
        let mut builder = DocumentBuilder::new();
        walk_body(&xml, &mut builder)?;

        if archive.file_names().any(|n| n == "docProps/core.xml") {
            let core = read_zip_entry_bounded(&mut archive, "docProps/core.xml", MAX_XML_ENTRY_BYTES)?;
            for (key, value) in core_properties(&core) {
                builder.set_meta(key, value);
            }
        }
        Ok(builder.finish())
    }
}

/// Heading level for a paragraph style id, if it is a heading style.
fn heading_level(style: &str) -> Option<u8> {
    let lower = style.to_ascii_lowercase();
    if lower == "title" {
        return Some(1);
    }
    let digits = lower
        .strip_prefix("heading")?
        .trim_start_matches(|c: char| c == ' ' || c == '-' || c == '_');
    digits.parse::<u8>().ok().filter(|l| (1..=9).contains(l))
}

#[derive(Default)]
struct Walker {
    para: String,
    style: Option<String>,
    in_text: bool,
    table_depth: usize,
    cell: String,
    cells: Vec<String>,
    rows: Vec<String>,
    paragraphs: usize,
}

impl Walker {
    fn end_paragraph(&mut self, builder: &mut DocumentBuilder) {
        let text = std::mem::take(&mut self.para);
        let style = self.style.take();
        if self.table_depth > 0 {
            let text = text.trim();
            if !text.is_empty() {
                if !self.cell.is_empty() {
                    self.cell.push(' ');
                }
                self.cell.push_str(text);
            }
            return;
        }
        if text.trim().is_empty() {
            return;
        }
        self.paragraphs += 1;
        match style.as_deref().and_then(heading_level) {
            Some(level) => builder.push_heading(level, &text),
            None => {
                builder.push_block(&text);
            }
        }
    }

    fn page_break(&mut self, builder: &mut DocumentBuilder) {
        if self.table_depth > 0 {
            return;
        }
        // Text before the break stays on the earlier page.
        let style = self.style.clone();
        self.end_paragraph(builder);
        self.style = style;
        builder.mark(HintKind::Page, None);
    }
}

fn walk_body(xml: &[u8], builder: &mut DocumentBuilder) -> Result<(), ProcessError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut w = Walker::default();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    w.para.clear();
                    w.style = None;
                }
                b"pStyle" => w.style = attr_value(&e, b"val"),
                b"t" => w.in_text = true,
                b"tbl" => {
                    w.table_depth += 1;
                    if w.table_depth == 1 {
                        w.rows.clear();
                    }
                }
                b"tr" if w.table_depth == 1 => w.cells.clear(),
                b"tc" if w.table_depth == 1 => w.cell.clear(),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"pStyle" => w.style = attr_value(&e, b"val"),
                b"tab" => w.para.push('\t'),
                b"br" | b"cr" => {
                    if attr_value(&e, b"type").as_deref() == Some("page") {
                        w.page_break(builder);
                    } else {
                        w.para.push('\n');
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) if w.in_text => w.para.push_str(&event_text(&t)),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => w.in_text = false,
                b"p" => w.end_paragraph(builder),
                b"tc" if w.table_depth == 1 => {
                    let cell = std::mem::take(&mut w.cell);
                    w.cells.push(cell.trim().to_string());
                }
                b"tr" if w.table_depth == 1 => {
                    let row = w.cells.join(" | ");
                    if !row.trim_matches(|c| c == ' ' || c == '|').is_empty() {
                        w.rows.push(row);
                    }
                    w.cells.clear();
                }
                b"tbl" => {
                    w.table_depth = w.table_depth.saturating_sub(1);
                    if w.table_depth == 0 {
                        let table = w.rows.join("\n");
                        builder.push_protected(HintKind::Table, &table);
                        w.rows.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ProcessError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    builder.set_meta("paragraphs", w.paragraphs.to_string());
    Ok(())
}

/// `dc:title` and `dc:creator` from `docProps/core.xml`; unreadable XML yields nothing.
fn core_properties(xml: &[u8]) -> Vec<(&'static str, String)> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<&'static str> = None;
    let mut out = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current = match e.local_name().as_ref() {
                    b"title" => Some("title"),
                    b"creator" => Some("creator"),
                    _ => None,
                };
            }
            Ok(Event::Text(t)) => {
                if let Some(key) = current.take() {
                    let value = event_text(&t);
                    if !value.trim().is_empty() {
                        out.push((key, value.trim().to_string()));
                    }
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx(body: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            let xml = format!(
                "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
                body
            );
            zip.write_all(xml.as_bytes()).unwrap();
            zip.start_file("docProps/core.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(
                b"<cp:coreProperties xmlns:cp=\"c\" xmlns:dc=\"d\"><dc:title>Guide</dc:title></cp:coreProperties>",
            )
            .unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    fn para(style: Option<&str>, text: &str) -> String {
        let ppr = style
            .map(|s| format!("<w:pPr><w:pStyle w:val=\"{}\"/></w:pPr>", s))
            .unwrap_or_default();
        format!("<w:p>{}<w:r><w:t xml:space=\"preserve\">{}</w:t></w:r></w:p>", ppr, text)
    }

    #[test]
    fn headings_paragraphs_and_metadata() {
        let body = [
            para(Some("Title"), "User Guide"),
            para(None, "Intro text."),
            para(Some("Heading2"), "Setup"),
            para(None, "Install it."),
        ]
        .concat();
        let doc = DocxProcessor.process(&docx(&body), "g.docx").unwrap();
        assert_eq!(doc.text, "User Guide\n\nIntro text.\n\nSetup\n\nInstall it.");
        let toc = doc.toc();
        assert_eq!(toc.len(), 2);
        assert_eq!((toc[1].title.as_str(), toc[1].level), ("Setup", 2));
        assert_eq!(doc.metadata["title"], "Guide");
        assert_eq!(doc.metadata["paragraphs"], "4");
    }

    #[test]
    fn page_break_marks_next_paragraph() {
        let body = format!(
            "{}<w:p><w:r><w:br w:type=\"page\"/></w:r></w:p>{}",
            para(None, "one"),
            para(None, "two")
        );
        let doc = DocxProcessor.process(&docx(&body), "g.docx").unwrap();
        assert_eq!(doc.text, "one\n\ntwo");
        let page = doc.hints.iter().find(|h| h.kind == HintKind::Page).unwrap();
        assert_eq!(page.offset, 5);
    }

    #[test]
    fn tables_flatten_to_rows() {
        let cell = |t: &str| format!("<w:tc>{}</w:tc>", para(None, t));
        let body = format!(
            "{}<w:tbl><w:tr>{}{}</w:tr><w:tr>{}{}</w:tr></w:tbl>{}",
            para(None, "before"),
            cell("a"),
            cell("b"),
            cell("1"),
            cell("2"),
            para(None, "after")
        );
        let doc = DocxProcessor.process(&docx(&body), "t.docx").unwrap();
        assert_eq!(doc.text, "before\n\na | b\n1 | 2\n\nafter");
        assert_eq!(doc.protected_ranges(), vec![(8, 19)]);
    }

    #[test]
    fn missing_document_xml_is_an_error() {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("other.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<x/>").unwrap();
            zip.finish().unwrap();
        }
        let err = DocxProcessor.process(&buf, "x.docx").unwrap_err();
        assert!(matches!(err, ProcessError::Archive(_)));
    }

    #[test]
    fn style_ids_map_to_levels() {
        assert_eq!(heading_level("Heading1"), Some(1));
        assert_eq!(heading_level("heading 3"), Some(3));
        assert_eq!(heading_level("Title"), Some(1));
        assert_eq!(heading_level("Normal"), None);
    }
}
