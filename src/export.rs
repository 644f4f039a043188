//! Dataset export and reimport.
//!
//! Exports read a dataset's snapshot entries, never the live questions,
//! so an export is stable against later edits. Supported formats:
//!
//! | Format | Output |
//! |--------|--------|
//! | `json` | one file: array of `{question, answer, chunk_id, tags}` |
//! | `jsonl` | one file: one such object per line, LF-terminated |
//! | `csv` | one file: `question,answer,chunk_id,tags`, tags joined by `|` |
//! | `huggingface` | a directory: `dataset_info.json` plus `train/validation/test.jsonl` |
//! | `llama-factory` | a directory: `<name>.json` (alpaca) plus `dataset_info.json` |
//!
//! The readers at the bottom load `(question, answer)` pairs back from
//! any of these, for round-trip checks and for importing curated sets.

use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use easy_dataset_core::conversation::split_history;
use easy_dataset_core::models::{Dataset, DatasetConversation, Role};
use easy_dataset_core::{PipelineError, PipelineResult};

use crate::config::ExportConfig;
use crate::dataset::DatasetAssembler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExportFormat {
    Json,
    Jsonl,
    Csv,
    #[value(name = "huggingface", alias = "hf")]
    #[serde(rename = "huggingface")]
    HuggingFace,
    #[value(name = "llama-factory", alias = "alpaca")]
    LlamaFactory,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Jsonl => "jsonl",
            ExportFormat::Csv => "csv",
            ExportFormat::HuggingFace => "huggingface",
            ExportFormat::LlamaFactory => "llama-factory",
        }
    }

    /// Whether the output path names a directory rather than a file.
    pub fn is_directory(&self) -> bool {
        matches!(self, ExportFormat::HuggingFace | ExportFormat::LlamaFactory)
    }
}

/// The flat record shared by JSON, JSONL, and CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub question: String,
    pub answer: String,
    pub chunk_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl From<&DatasetConversation> for ExportRecord {
    fn from(entry: &DatasetConversation) -> Self {
        Self {
            question: entry.question.clone(),
            answer: entry.answer.clone(),
            chunk_id: entry.chunk_id.clone(),
            tags: entry.tags.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Splits
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios {
    pub train: f64,
    pub validation: f64,
    pub test: f64,
}

impl SplitRatios {
    pub fn new(train: f64, validation: f64, test: f64) -> PipelineResult<Self> {
        let ratios = Self {
            train,
            validation,
            test,
        };
        let all = [train, validation, test];
        if all.iter().any(|r| !(0.0..=1.0).contains(r)) {
            return Err(PipelineError::validation("split ratios must be within [0, 1]"));
        }
        if (all.iter().sum::<f64>() - 1.0).abs() > 1e-6 {
            return Err(PipelineError::validation("split ratios must sum to 1"));
        }
        Ok(ratios)
    }

    pub fn from_config(config: &ExportConfig) -> PipelineResult<Self> {
        Self::new(config.train_ratio, config.validation_ratio, config.test_ratio)
    }
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.8,
            validation: 0.1,
            test: 0.1,
        }
    }
}

/// Split for a question: SHA-256 of its id, mod 10000, against the
/// cumulative ratios. Variations of one question always land together.
pub fn split_for(question_id: &str, ratios: &SplitRatios) -> Split {
    let digest = Sha256::digest(question_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let bucket = (u64::from_be_bytes(head) % 10_000) as f64 / 10_000.0;
    if bucket < ratios.train {
        Split::Train
    } else if bucket < ratios.train + ratios.validation {
        Split::Validation
    } else {
        Split::Test
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Writers
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub out: PathBuf,
    pub ratios: SplitRatios,
    /// System text for LLaMA Factory rows whose conversation has none.
    pub default_system: Option<String>,
}

/// What an export wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportReport {
    pub format: &'static str,
    pub records: usize,
    pub files: Vec<PathBuf>,
}

/// Export a snapshotted dataset and mark it exported.
///
/// The files are written on the blocking pool.
pub async fn export_dataset(
    assembler: &DatasetAssembler,
    dataset_id: &str,
    options: &ExportOptions,
) -> PipelineResult<ExportReport> {
    let mut dataset = assembler.get(dataset_id).await?;
    let entries = assembler.entries(&dataset).await?;
    let snapshot = dataset.clone();
    let opts = options.clone();
    let report = tokio::task::spawn_blocking(move || write_export(&snapshot, &entries, &opts))
        .await
        .map_err(|e| PipelineError::Storage(format!("export writer panicked: {}", e)))??;
    assembler.mark_exported(&mut dataset).await?;
    info!(
        dataset_id = %dataset.id,
        format = report.format,
        records = report.records,
        "exported dataset"
    );
    Ok(report)
}

/// Write entries in the requested format.
pub fn write_export(
    dataset: &Dataset,
    entries: &[DatasetConversation],
    options: &ExportOptions,
) -> PipelineResult<ExportReport> {
    let files = match options.format {
        ExportFormat::Json => {
            let records: Vec<ExportRecord> = entries.iter().map(ExportRecord::from).collect();
            write_file(&options.out, &serde_json::to_vec_pretty(&records)?)?;
            vec![options.out.clone()]
        }
        ExportFormat::Jsonl => {
            let records: Vec<ExportRecord> = entries.iter().map(ExportRecord::from).collect();
            write_jsonl(&options.out, &records)?;
            vec![options.out.clone()]
        }
        ExportFormat::Csv => {
            write_csv(&options.out, entries)?;
            vec![options.out.clone()]
        }
        ExportFormat::HuggingFace => write_huggingface(dataset, entries, options)?,
        ExportFormat::LlamaFactory => write_llama_factory(dataset, entries, options)?,
    };
    Ok(ExportReport {
        format: options.format.as_str(),
        records: entries.len(),
        files,
    })
}

fn ensure_parent(path: &Path) -> PipelineResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    ensure_parent(path)?;
    fs::write(path, bytes)?;
    Ok(())
}

fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> PipelineResult<()> {
    ensure_parent(path)?;
    let mut out = BufWriter::new(fs::File::create(path)?);
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn write_csv(path: &Path, entries: &[DatasetConversation]) -> PipelineResult<()> {
    ensure_parent(path)?;
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_path(path)
        .map_err(csv_error)?;
    writer
        .write_record(["question", "answer", "chunk_id", "tags"])
        .map_err(csv_error)?;
    for entry in entries {
        let tags = entry.tags.join("|");
        writer
            .write_record([
                entry.question.as_str(),
                entry.answer.as_str(),
                entry.chunk_id.as_str(),
                tags.as_str(),
            ])
            .map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

fn csv_error(e: csv::Error) -> PipelineError {
    PipelineError::StorageIo(format!("csv: {}", e))
}

/// File-system-safe form of a dataset name.
fn slug(name: &str) -> String {
    let slug: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if slug.is_empty() {
        "dataset".to_string()
    } else {
        slug
    }
}

fn messages(entry: &DatasetConversation) -> Vec<Value> {
    entry
        .turns
        .iter()
        .map(|t| json!({"role": t.role.as_str(), "content": t.content}))
        .collect()
}

fn write_huggingface(
    dataset: &Dataset,
    entries: &[DatasetConversation],
    options: &ExportOptions,
) -> PipelineResult<Vec<PathBuf>> {
    fs::create_dir_all(&options.out)?;
    let mut rows: [Vec<Value>; 3] = Default::default();
    for entry in entries {
        let split = split_for(&entry.question_id, &options.ratios);
        let index = Split::ALL.iter().position(|s| *s == split).unwrap_or(0);
        rows[index].push(json!({
            "question": entry.question,
            "answer": entry.answer,
            "chunk_id": entry.chunk_id,
            "tags": entry.tags,
            "messages": messages(entry),
        }));
    }

    let mut files = Vec::new();
    let mut splits = Vec::new();
    for (split, rows) in Split::ALL.iter().zip(rows.iter()) {
        let file = format!("{}.jsonl", split.as_str());
        let path = options.out.join(&file);
        write_jsonl(&path, rows)?;
        splits.push(json!({"name": split.as_str(), "num_examples": rows.len(), "file": file}));
        files.push(path);
    }

    let info = json!({
        "dataset_name": dataset.name,
        "description": format!("Question/answer pairs exported from dataset {}", dataset.id),
        "version": "1.0.0",
        "features": {
            "question": {"dtype": "string", "_type": "Value"},
            "answer": {"dtype": "string", "_type": "Value"},
            "chunk_id": {"dtype": "string", "_type": "Value"},
            "tags": {"feature": {"dtype": "string", "_type": "Value"}, "_type": "Sequence"},
            "messages": [{
                "role": {"dtype": "string", "_type": "Value"},
                "content": {"dtype": "string", "_type": "Value"}
            }]
        },
        "splits": splits,
        "created_at": Utc::now().to_rfc3339(),
    });
    let info_path = options.out.join("dataset_info.json");
    write_file(&info_path, &serde_json::to_vec_pretty(&info)?)?;
    files.insert(0, info_path);
    Ok(files)
}

/// One alpaca-format row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlpacaRow {
    pub instruction: String,
    #[serde(default)]
    pub input: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default)]
    pub history: Vec<[String; 2]>,
}

/// Alpaca row for an entry. Multi-turn entries carry their earlier
/// exchanges in `history`.
pub fn alpaca_row(entry: &DatasetConversation, default_system: Option<&str>) -> AlpacaRow {
    match split_history(&entry.turns) {
        Some((system, history, last_q, last_a)) => AlpacaRow {
            instruction: last_q.to_string(),
            input: String::new(),
            output: last_a.to_string(),
            system: system.or(default_system).map(str::to_string),
            history: history
                .into_iter()
                .map(|(q, a)| [q.to_string(), a.to_string()])
                .collect(),
        },
        None => AlpacaRow {
            instruction: entry.question.clone(),
            input: String::new(),
            output: entry.answer.clone(),
            system: entry
                .turns
                .first()
                .filter(|t| t.role == Role::System)
                .map(|t| t.content.as_str())
                .or(default_system)
                .map(str::to_string),
            history: Vec::new(),
        },
    }
}

fn write_llama_factory(
    dataset: &Dataset,
    entries: &[DatasetConversation],
    options: &ExportOptions,
) -> PipelineResult<Vec<PathBuf>> {
    fs::create_dir_all(&options.out)?;
    let name = slug(&dataset.name);
    let file = format!("{}.json", name);
    let default_system = options.default_system.as_deref().filter(|s| !s.trim().is_empty());
    let rows: Vec<AlpacaRow> = entries.iter().map(|e| alpaca_row(e, default_system)).collect();
    let data_path = options.out.join(&file);
    write_file(&data_path, &serde_json::to_vec_pretty(&rows)?)?;

    let mut info = serde_json::Map::new();
    info.insert(
        name,
        json!({
            "file_name": file,
            "formatting": "alpaca",
            "columns": {
                "prompt": "instruction",
                "query": "input",
                "response": "output",
                "system": "system",
                "history": "history"
            }
        }),
    );
    let info = Value::Object(info);
    let info_path = options.out.join("dataset_info.json");
    write_file(&info_path, &serde_json::to_vec_pretty(&info)?)?;
    Ok(vec![data_path, info_path])
}

// ═══════════════════════════════════════════════════════════════════════
// Readers
// ═══════════════════════════════════════════════════════════════════════

/// Load `(question, answer)` pairs from an export.
///
/// For directory formats `path` may be the directory or, for LLaMA
/// Factory, the data file itself.
pub fn read_pairs(format: ExportFormat, path: &Path) -> PipelineResult<Vec<(String, String)>> {
    match format {
        ExportFormat::Json => {
            let records: Vec<ExportRecord> = serde_json::from_slice(&fs::read(path)?)?;
            Ok(records.into_iter().map(|r| (r.question, r.answer)).collect())
        }
        ExportFormat::Jsonl => Ok(read_jsonl(path)?
            .into_iter()
            .map(|r| (r.question, r.answer))
            .collect()),
        ExportFormat::Csv => read_csv(path),
        ExportFormat::HuggingFace => {
            let mut pairs = Vec::new();
            for split in Split::ALL {
                let file = path.join(format!("{}.jsonl", split.as_str()));
                if file.exists() {
                    pairs.extend(read_jsonl(&file)?.into_iter().map(|r| (r.question, r.answer)));
                }
            }
            Ok(pairs)
        }
        ExportFormat::LlamaFactory => {
            let data = if path.is_dir() {
                llama_factory_data_file(path)?
            } else {
                path.to_path_buf()
            };
            let rows: Vec<AlpacaRow> = serde_json::from_slice(&fs::read(&data)?)?;
            Ok(rows
                .into_iter()
                .map(|r| {
                    // Multi-turn rows were written from their last exchange;
                    // the seed pair is the first history entry.
                    match r.history.into_iter().next() {
                        Some([q, a]) => (q, a),
                        None => (r.instruction, r.output),
                    }
                })
                .collect())
        }
    }
}

fn read_jsonl(path: &Path) -> PipelineResult<Vec<ExportRecord>> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut out = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ExportRecord = serde_json::from_str(&line).map_err(|e| {
            PipelineError::validation(format!("{} line {}: {}", path.display(), n + 1, e))
        })?;
        out.push(record);
    }
    Ok(out)
}

fn read_csv(path: &Path) -> PipelineResult<Vec<(String, String)>> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
    let headers = reader.headers().map_err(csv_error)?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| PipelineError::validation(format!("csv is missing column '{}'", name)))
    };
    let (q, a) = (column("question")?, column("answer")?);
    let mut out = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        out.push((
            record.get(q).unwrap_or_default().to_string(),
            record.get(a).unwrap_or_default().to_string(),
        ));
    }
    Ok(out)
}

fn llama_factory_data_file(dir: &Path) -> PipelineResult<PathBuf> {
    let info: Value = serde_json::from_slice(&fs::read(dir.join("dataset_info.json"))?)?;
    info.as_object()
        .and_then(|m| m.values().next())
        .and_then(|d| d["file_name"].as_str())
        .map(|f| dir.join(f))
        .ok_or_else(|| PipelineError::validation("dataset_info.json names no data file"))
}
