//! Upload storage and file-type detection.
//!
//! Detection checks, in order: the extension, first-kilobyte magic for
//! PDF and ZIP containers, and a UTF-8 probe for text formats. An
//! extension that disagrees with the magic is rejected.
//!
//! Stored bytes live at `<upload_root>/<project_id>/<md5>.<ext>`. A second
//! upload of the same bytes into a project returns the existing record and
//! leaves the disk untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use md5::{Digest, Md5};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use easy_dataset_core::document::FileType;
use easy_dataset_core::models::UploadFile;
use easy_dataset_core::store::Store;
use easy_dataset_core::{PipelineError, PipelineResult};

use crate::processors::ProcessorRegistry;

/// Bytes inspected by the magic and UTF-8 probes.
const PROBE_LEN: usize = 1024;

const PDF_MAGIC: &[u8] = b"%PDF-";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const EPUB_MIMETYPE: &[u8] = b"application/epub+zip";

/// `%PDF-` at the start, after any leading whitespace.
fn is_pdf(head: &[u8]) -> bool {
    head.trim_ascii_start().starts_with(PDF_MAGIC)
}

fn is_zip(head: &[u8]) -> bool {
    head.starts_with(ZIP_MAGIC)
}

/// EPUB archives store an uncompressed `mimetype` entry first.
fn is_epub(head: &[u8]) -> bool {
    is_zip(head)
        && head.windows(8).any(|w| w == b"mimetype")
        && head
            .windows(EPUB_MIMETYPE.len())
            .any(|w| w == EPUB_MIMETYPE)
}

/// Valid UTF-8 without NUL bytes; a sequence cut off by the probe window is tolerated.
fn is_text(head: &[u8]) -> bool {
    if head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}

/// Lowercased extension of `filename`, without the dot.
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty())
}

/// Determine the processor tag for an upload.
///
/// Built-in extensions are checked against their magic; other extensions
/// are accepted when a custom processor is registered under that tag.
pub fn detect_file_type(
    filename: &str,
    bytes: &[u8],
    registry: &ProcessorRegistry,
) -> PipelineResult<String> {
    let ext = extension_of(filename).ok_or_else(|| {
        PipelineError::UnsupportedFileType(format!("{}: no file extension", filename))
    })?;
    let head = &bytes[..bytes.len().min(PROBE_LEN)];

    let Some(file_type) = FileType::from_extension(&ext) else {
        if registry.supports(&ext) {
            return Ok(ext);
        }
        return Err(PipelineError::UnsupportedFileType(format!(
            "{}: .{} is not a supported format",
            filename, ext
        )));
    };

    let agrees = match file_type {
        FileType::Pdf => is_pdf(head),
        FileType::Epub => is_epub(head),
        FileType::Docx => is_zip(head) && !is_epub(head),
        FileType::Markdown | FileType::Txt => !is_pdf(head) && !is_zip(head) && is_text(head),
    };
    if !agrees {
        return Err(PipelineError::UnsupportedFileType(format!(
            "{}: content does not match .{}",
            filename, ext
        )));
    }
    Ok(file_type.tag().to_string())
}

/// Lowercase hex MD5 digest.
pub fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Result of storing one upload.
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub file: UploadFile,
    /// `false` when the bytes were already stored in this project.
    pub created: bool,
}

/// Per-file outcome of a directory upload.
#[derive(Debug)]
pub enum UploadOutcome {
    Stored(StoredUpload),
    Skipped { path: PathBuf, reason: String },
}

/// Filesystem-backed upload storage.
#[derive(Clone)]
pub struct FileStorage {
    root: PathBuf,
    max_size: u64,
    store: Arc<dyn Store>,
    registry: Arc<ProcessorRegistry>,
}

impl FileStorage {
    pub fn new(
        root: impl Into<PathBuf>,
        max_size: u64,
        store: Arc<dyn Store>,
        registry: Arc<ProcessorRegistry>,
    ) -> Self {
        Self {
            root: root.into(),
            max_size,
            store,
            registry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical location of an upload's bytes.
    pub fn path_for(&self, project_id: &str, md5: &str, ext: &str) -> PathBuf {
        self.root.join(project_id).join(format!("{}.{}", md5, ext))
    }

    /// Store `bytes` under `filename` in a project.
    pub async fn store_bytes(
        &self,
        project_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> PipelineResult<StoredUpload> {
        let size = bytes.len() as u64;
        if size > self.max_size {
            return Err(PipelineError::SizeExceedsLimit {
                size,
                limit: self.max_size,
            });
        }
        if self.store.get_project(project_id).await?.is_none() {
            return Err(PipelineError::not_found("project", project_id));
        }
        let file_type = detect_file_type(filename, bytes, &self.registry)?;
        let md5 = md5_hex(bytes);

        if let Some(existing) = self.store.find_file_by_md5(project_id, &md5).await? {
            debug!(file_id = %existing.id, md5 = %md5, "upload already stored");
            return Ok(StoredUpload {
                file: existing,
                created: false,
            });
        }

        let ext = extension_of(filename).unwrap_or_else(|| file_type.clone());
        let path = self.path_for(project_id, &md5, &ext);
        write_once(&path, bytes).await?;

        let display_name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(filename)
            .to_string();
        let record = UploadFile {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            file_name: display_name,
            extension: ext,
            file_type,
            stored_path: path.display().to_string(),
            size,
            md5,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        };
        let (file, created) = self.store.insert_file(&record).await?;
        if created {
            info!(file_id = %file.id, name = %file.file_name, size, "stored upload");
        }
        Ok(StoredUpload { file, created })
    }

    /// Store a file from disk, checking its size before reading it.
    pub async fn store_path(&self, project_id: &str, path: &Path) -> PipelineResult<StoredUpload> {
        let meta = tokio::fs::metadata(path).await?;
        if meta.len() > self.max_size {
            return Err(PipelineError::SizeExceedsLimit {
                size: meta.len(),
                limit: self.max_size,
            });
        }
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PipelineError::validation(format!("bad file name: {}", path.display())))?;
        self.store_bytes(project_id, filename, &bytes).await
    }

    /// Store a single file, or every supported file below a directory.
    ///
    /// Unsupported or oversized files in a directory are skipped and
    /// reported; any other failure aborts.
    pub async fn upload(&self, project_id: &str, path: &Path) -> PipelineResult<Vec<UploadOutcome>> {
        if !path.is_dir() {
            let stored = self.store_path(project_id, path).await?;
            return Ok(vec![UploadOutcome::Stored(stored)]);
        }

        let mut files: Vec<PathBuf> = WalkDir::new(path)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        files.sort();

        let mut outcomes = Vec::with_capacity(files.len());
        for file in files {
            match self.store_path(project_id, &file).await {
                Ok(stored) => outcomes.push(UploadOutcome::Stored(stored)),
                Err(e @ PipelineError::UnsupportedFileType(_))
                | Err(e @ PipelineError::SizeExceedsLimit { .. }) => {
                    warn!(path = %file.display(), error = %e, "skipping file");
                    outcomes.push(UploadOutcome::Skipped {
                        path: file,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    pub async fn read(&self, file: &UploadFile) -> PipelineResult<Vec<u8>> {
        Ok(tokio::fs::read(&file.stored_path).await?)
    }

    /// Delete an upload record (cascading to its chunks and questions) and
    /// its bytes, unless another record still points at the same path.
    pub async fn delete(&self, file_id: &str) -> PipelineResult<()> {
        let file = self
            .store
            .get_file(file_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("file", file_id))?;
        self.store.delete_file(file_id).await?;
        let still_used = self
            .store
            .list_files(&file.project_id)
            .await?
            .iter()
            .any(|f| f.stored_path == file.stored_path);
        if !still_used {
            match tokio::fs::remove_file(&file.stored_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Write via a temporary sibling and rename, skipping existing targets.
async fn write_once(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    if tokio::fs::try_exists(path).await? {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use easy_dataset_core::models::Project;
    use easy_dataset_core::store::memory::InMemoryStore;
    use easy_dataset_core::ErrorKind;
    use tempfile::TempDir;

    fn registry() -> ProcessorRegistry {
        ProcessorRegistry::with_builtins()
    }

    async fn storage(max: u64) -> (TempDir, FileStorage) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        store
            .create_project(&Project {
                id: "p".into(),
                name: "p".into(),
                description: String::new(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let fs = FileStorage::new(tmp.path().join("uploads"), max, store, Arc::new(registry()));
        (tmp, fs)
    }

    #[test]
    fn detection_by_extension_and_magic() {
        let reg = registry();
        assert_eq!(detect_file_type("a.txt", b"hello", &reg).unwrap(), "txt");
        assert_eq!(detect_file_type("a.MD", b"# hi", &reg).unwrap(), "markdown");
        assert_eq!(detect_file_type("a.pdf", b"%PDF-1.7\n...", &reg).unwrap(), "pdf");
        assert_eq!(detect_file_type("a.docx", b"PK\x03\x04rest", &reg).unwrap(), "docx");
        let epub = b"PK\x03\x04....mimetypeapplication/epub+zip";
        assert_eq!(detect_file_type("a.epub", epub, &reg).unwrap(), "epub");
    }

    #[test]
    fn disagreement_is_rejected() {
        let reg = registry();
        for (name, bytes) in [
            ("a.pdf", &b"just text"[..]),
            ("a.txt", &b"%PDF-1.4"[..]),
            ("a.docx", &b"plain"[..]),
            ("a.txt", &b"\x00\x01\x02"[..]),
            ("a.exe", &b"MZ"[..]),
            ("noext", &b"text"[..]),
        ] {
            let err = detect_file_type(name, bytes, &reg).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnsupportedFileType, "{}", name);
        }
    }

    #[test]
    fn pdf_magic_only_counts_at_the_start() {
        let reg = registry();
        let notes = b"PDF files begin with the bytes %PDF- followed by a version.";
        assert_eq!(detect_file_type("notes.txt", notes, &reg).unwrap(), "txt");
        assert_eq!(detect_file_type("notes.md", notes, &reg).unwrap(), "markdown");
        assert!(detect_file_type("notes.pdf", notes, &reg).is_err());
        assert_eq!(detect_file_type("a.pdf", b"\r\n %PDF-1.5\n", &reg).unwrap(), "pdf");
    }

    #[test]
    fn utf8_probe_tolerates_cut_sequence() {
        let mut bytes = "a".repeat(PROBE_LEN - 1).into_bytes();
        bytes.extend_from_slice("é".as_bytes());
        assert!(detect_file_type("a.txt", &bytes, &registry()).is_ok());
    }

    #[tokio::test]
    async fn second_upload_returns_existing_record() {
        let (_tmp, fs) = storage(1024).await;
        let first = fs.store_bytes("p", "short.txt", b"same bytes").await.unwrap();
        let second = fs.store_bytes("p", "copy.txt", b"same bytes").await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.file.id, second.file.id);
        let dir = fs.root().join("p");
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 1);
        assert!(first.file.stored_path.ends_with(&format!("{}.txt", first.file.md5)));
    }

    #[tokio::test]
    async fn size_limit_is_enforced() {
        let (_tmp, fs) = storage(4).await;
        let err = fs.store_bytes("p", "a.txt", b"too long").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SizeExceedsLimit);
    }

    #[tokio::test]
    async fn directory_upload_skips_unsupported() {
        let (tmp, fs) = storage(1024).await;
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.txt"), "alpha").unwrap();
        std::fs::write(src.join("nested/b.md"), "# beta").unwrap();
        std::fs::write(src.join("c.bin"), [0u8, 1, 2]).unwrap();

        let outcomes = fs.upload("p", &src).await.unwrap();
        let stored = outcomes
            .iter()
            .filter(|o| matches!(o, UploadOutcome::Stored(_)))
            .count();
        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o, UploadOutcome::Skipped { .. }))
            .count();
        assert_eq!((stored, skipped), (2, 1));
    }

    #[tokio::test]
    async fn delete_removes_bytes() {
        let (_tmp, fs) = storage(1024).await;
        let stored = fs.store_bytes("p", "a.txt", b"bytes").await.unwrap();
        fs.delete(&stored.file.id).await.unwrap();
        assert!(!Path::new(&stored.file.stored_path).exists());
    }
}
