//! EPUB extraction: `META-INF/container.xml` → OPF package → spine.
//!
//! Each spine document becomes a chapter carrying a `section` hint
//! labelled with its title. `h1`–`h6` become heading hints; `script` and
//! `style` contents are dropped.

use std::collections::HashMap;

use quick_xml::events::Event;

use easy_dataset_core::document::{DocumentBuilder, HintKind, ProcessedDocument};

use super::{
    attr_value, event_text, open_archive, read_zip_entry_bounded, Archive, DocumentProcessor,
    ProcessError, MAX_XML_ENTRY_BYTES,
};

pub struct EpubProcessor;

impl DocumentProcessor for EpubProcessor {
    fn tag(&self) -> &str {
        "epub"
    }

    fn process(&self, bytes: &[u8], _filename: &str) -> Result<ProcessedDocument, ProcessError> {
        if bytes.is_empty() {
            return Ok(ProcessedDocument::empty());
        }
        let mut archive = open_archive(bytes)?;
        let container = read_zip_entry_bounded(
            &mut archive,
            "META-INF/container.xml",
            MAX_XML_ENTRY_BYTES,
        )?;
        let opf_path = rootfile_path(&container)?;
        let opf = read_zip_entry_bounded(&mut archive, &opf_path, MAX_XML_ENTRY_BYTES)?;
        let package = parse_package(&opf)?;
        let base = match opf_path.rfind('/') {
            Some(i) => &opf_path[..=i],
            None => "",
        };

        let mut builder = DocumentBuilder::new();
        for (key, value) in &package.metadata {
            builder.set_meta(key, value.clone());
        }
        let mut chapters = 0usize;
        for idref in &package.spine {
            let Some(href) = package.manifest.get(idref) else {
                continue;
            };
            let path = resolve_href(base, href);
            let xhtml = match read_entry(&mut archive, &path) {
                Some(x) => x,
                None => continue,
            };
            let chapter = parse_chapter(&xhtml)?;
            if chapter.blocks.is_empty() {
                continue;
            }
            let title = chapter.title().unwrap_or_else(|| idref.clone());
            builder.mark(HintKind::Section, Some(&title));
            if !chapter.has_heading() {
                builder.push_heading(1, &title);
            }
            for block in chapter.blocks {
                match block {
                    Block::Heading(level, text) => builder.push_heading(level, &text),
                    Block::Text(text) => {
                        builder.push_block(&text);
                    }
                }
            }
            chapters += 1;
        }
        builder.set_meta("chapters", chapters.to_string());
        Ok(builder.finish())
    }
}

fn read_entry(archive: &mut Archive<'_>, path: &str) -> Option<Vec<u8>> {
    read_zip_entry_bounded(archive, path, MAX_XML_ENTRY_BYTES).ok()
}

/// Resolve a manifest href against the OPF directory, handling `..` and
/// percent-encoded spaces.
fn resolve_href(base: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href).replace("%20", " ");
    let mut parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    for seg in href.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

fn rootfile_path(container: &[u8]) -> Result<String, ProcessError> {
    let mut reader = quick_xml::Reader::from_reader(container);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"rootfile" => {
                if let Some(path) = attr_value(&e, b"full-path") {
                    return Ok(path);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ProcessError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Err(ProcessError::Archive(
        "container.xml names no rootfile".to_string(),
    ))
}

#[derive(Default)]
struct Package {
    metadata: Vec<(&'static str, String)>,
    manifest: HashMap<String, String>,
    spine: Vec<String>,
}

fn parse_package(opf: &[u8]) -> Result<Package, ProcessError> {
    let mut reader = quick_xml::Reader::from_reader(opf);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut pkg = Package::default();
    let mut meta_key: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => {
                    if let (Some(id), Some(href)) = (attr_value(&e, b"id"), attr_value(&e, b"href")) {
                        pkg.manifest.insert(id, href);
                    }
                }
                b"itemref" => {
                    if let Some(idref) = attr_value(&e, b"idref") {
                        pkg.spine.push(idref);
                    }
                }
                b"title" => meta_key = Some("title"),
                b"creator" => meta_key = Some("creator"),
                b"language" => meta_key = Some("language"),
                _ => meta_key = None,
            },
            Ok(Event::Text(t)) => {
                if let Some(key) = meta_key.take() {
                    if !pkg.metadata.iter().any(|(k, _)| *k == key) {
                        pkg.metadata.push((key, event_text(&t).trim().to_string()));
                    }
                }
            }
            Ok(Event::End(_)) => meta_key = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(ProcessError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(pkg)
}

enum Block {
    Heading(u8, String),
    Text(String),
}

#[derive(Default)]
struct Chapter {
    doc_title: Option<String>,
    blocks: Vec<Block>,
}

impl Chapter {
    fn has_heading(&self) -> bool {
        self.blocks.iter().any(|b| matches!(b, Block::Heading(..)))
    }

    /// First heading, else the XHTML `<title>`.
    fn title(&self) -> Option<String> {
        self.blocks
            .iter()
            .find_map(|b| match b {
                Block::Heading(_, t) => Some(t.clone()),
                Block::Text(_) => None,
            })
            .or_else(|| self.doc_title.clone())
            .filter(|t| !t.is_empty())
    }
}

fn heading_tag(name: &[u8]) -> Option<u8> {
    match name {
        [b'h', d @ b'1'..=b'6'] => Some(d - b'0'),
        _ => None,
    }
}

fn is_block_tag(name: &[u8]) -> bool {
    matches!(
        name,
        b"p" | b"div" | b"li" | b"pre" | b"blockquote" | b"tr" | b"section" | b"article" | b"dt"
            | b"dd" | b"figcaption"
    )
}

fn parse_chapter(xhtml: &[u8]) -> Result<Chapter, ProcessError> {
    let mut reader = quick_xml::Reader::from_reader(xhtml);
    reader.config_mut().check_end_names = false;
    let mut buf = Vec::new();
    let mut chapter = Chapter::default();
    let mut current = String::new();
    let mut heading: Option<u8> = None;
    let mut skip_depth = 0usize;
    let mut in_title = false;

    let flush = |chapter: &mut Chapter, current: &mut String, heading: Option<u8>| {
        let text = current.split_whitespace().collect::<Vec<_>>().join(" ");
        current.clear();
        if text.is_empty() {
            return;
        }
        chapter.blocks.push(match heading {
            Some(level) => Block::Heading(level, text),
            None => Block::Text(text),
        });
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if name == b"script" || name == b"style" {
                    skip_depth += 1;
                } else if name == b"title" {
                    in_title = true;
                } else if let Some(level) = heading_tag(name) {
                    flush(&mut chapter, &mut current, heading);
                    heading = Some(level);
                } else if is_block_tag(name) {
                    flush(&mut chapter, &mut current, heading);
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"br" {
                    current.push(' ');
                }
            }
            Ok(Event::Text(t)) => {
                if skip_depth > 0 {
                    // dropped
                } else if in_title {
                    let title = event_text(&t).trim().to_string();
                    if !title.is_empty() {
                        chapter.doc_title = Some(title);
                    }
                } else {
                    current.push_str(&event_text(&t));
                    current.push(' ');
                }
            }
            Ok(Event::CData(t)) if skip_depth == 0 && !in_title => {
                current.push_str(&String::from_utf8_lossy(&t));
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if name == b"script" || name == b"style" {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if name == b"title" {
                    in_title = false;
                } else if heading_tag(name).is_some() {
                    flush(&mut chapter, &mut current, heading);
                    heading = None;
                } else if is_block_tag(name) || name == b"body" {
                    flush(&mut chapter, &mut current, heading);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ProcessError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    flush(&mut chapter, &mut current, heading);
    Ok(chapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn epub(chapters: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let stored = || {
                zip::write::SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Stored)
            };
            zip.start_file("mimetype", stored()).unwrap();
            zip.write_all(b"application/epub+zip").unwrap();
            zip.start_file("META-INF/container.xml", stored()).unwrap();
            zip.write_all(b"<container><rootfiles><rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/></rootfiles></container>").unwrap();

            let mut manifest = String::new();
            let mut spine = String::new();
            for (i, (name, _)) in chapters.iter().enumerate() {
                manifest.push_str(&format!(
                    "<item id=\"c{}\" href=\"text/{}\" media-type=\"application/xhtml+xml\"/>",
                    i, name
                ));
                spine.push_str(&format!("<itemref idref=\"c{}\"/>", i));
            }
            let opf = format!(
                "<package xmlns:dc=\"http://purl.org/dc/elements/1.1/\"><metadata><dc:title>Book</dc:title><dc:creator>Ann</dc:creator><dc:language>en</dc:language></metadata><manifest>{}</manifest><spine>{}</spine></package>",
                manifest, spine
            );
            zip.start_file("OEBPS/content.opf", stored()).unwrap();
            zip.write_all(opf.as_bytes()).unwrap();
            for (name, body) in chapters {
                zip.start_file(format!("OEBPS/text/{}", name), stored()).unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn spine_order_sections_and_headings() {
        let bytes = epub(&[
            (
                "one.xhtml",
                "<html><head><title>T1</title><style>p{}</style></head><body><h1>Chapter One</h1><p>Alpha   text.</p><script>var x;</script></body></html>",
            ),
            (
                "two.xhtml",
                "<html><head><title>Second</title></head><body><p>Beta text.</p></body></html>",
            ),
        ]);
        let doc = EpubProcessor.process(&bytes, "b.epub").unwrap();
        assert_eq!(
            doc.text,
            "Chapter One\n\nAlpha text.\n\nSecond\n\nBeta text."
        );
        let sections: Vec<&str> = doc
            .hints
            .iter()
            .filter(|h| h.kind == HintKind::Section)
            .filter_map(|h| h.label.as_deref())
            .collect();
        assert_eq!(sections, vec!["Chapter One", "Second"]);
        assert_eq!(doc.metadata["title"], "Book");
        assert_eq!(doc.metadata["creator"], "Ann");
        assert_eq!(doc.metadata["chapters"], "2");
        assert!(!doc.text.contains("var x"));
    }

    #[test]
    fn hrefs_resolve_relative_to_opf() {
        assert_eq!(resolve_href("OEBPS/", "text/a.xhtml"), "OEBPS/text/a.xhtml");
        assert_eq!(resolve_href("OEBPS/", "../a.xhtml#frag"), "a.xhtml");
        assert_eq!(resolve_href("", "a%20b.xhtml"), "a b.xhtml");
    }

    #[test]
    fn not_a_zip_is_an_error() {
        assert!(EpubProcessor.process(b"nope", "x.epub").is_err());
    }
}
