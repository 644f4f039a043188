//! # Easy Dataset CLI (`eds`)
//!
//! The `eds` binary drives the whole pipeline: upload documents, chunk
//! them, generate questions and answers with an LLM, assemble datasets
//! and export them for fine-tuning.
//!
//! ## Usage
//!
//! ```bash
//! eds --config ./config/easy-dataset.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `eds init` | Create the SQLite database and upload directory |
//! | `eds project create <name>` | Create a project |
//! | `eds upload <project> <path>` | Store a file or directory and chunk it |
//! | `eds chunks <file-id>` | List a file's chunks |
//! | `eds generate questions <project>` | Generate questions for chunks |
//! | `eds generate answers <project>` | Answer pending questions |
//! | `eds dataset create <project> <name>` | Select and snapshot answered questions |
//! | `eds export <dataset> --format jsonl --out out.jsonl` | Write an export |
//! | `eds task list` | Show tasks and their progress |
//! | `eds worker` | Run queued tasks until interrupted |
//! | `eds db backup <path>` | Copy the database to a new file |
//! | `eds db restore <path>` | Replace the database with a backup |
//!
//! ## Examples
//!
//! ```bash
//! eds init
//! eds project create handbook
//! eds upload <project-id> ./docs
//! eds generate questions <project-id> --provider openai --model gpt-4o-mini
//! eds generate answers <project-id>
//! eds dataset create <project-id> handbook-v1 --min-score 0.5
//! eds export <dataset-id> --format huggingface --out ./out/handbook
//! ```
//!
//! Commands that submit tasks wait for them and report progress on stderr.
//! With `--detach` they print the task id and return; `eds worker` (or a
//! later waiting command) picks the task up.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use easy_dataset::app::{App, EngineMode};
use easy_dataset::config::{self, Config};
use easy_dataset::dataset::NewDataset;
use easy_dataset::db;
use easy_dataset::export::{self, ExportFormat, ExportOptions, SplitRatios};
use easy_dataset::generators::cleaning::{apply_edits, Edit};
use easy_dataset::generators::ga_pair::GaPairGenerator;
use easy_dataset::generators::ModelChoice;
use easy_dataset::migrate;
use easy_dataset::progress::{ProgressEvent, ProgressMode, ProgressReporter};
use easy_dataset::storage::UploadOutcome;
use easy_dataset::tasks::{CancelFlag, JobRequest};
use easy_dataset_core::models::{
    ModelConfig, Project, Selection, SelectionFilter, Task, TaskStatus, TaskType,
};
use easy_dataset_core::store::{QuestionQuery, TaskQuery};

/// Easy Dataset: turn documents into LLM fine-tuning datasets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults plus `EASY_DATASET_*`
/// environment overrides. See `config/easy-dataset.example.toml`.
#[derive(Parser)]
#[command(
    name = "eds",
    about = "Easy Dataset: build supervised fine-tuning datasets from documents",
    version,
    long_about = "Easy Dataset uploads documents (PDF, DOCX, EPUB, Markdown, text), splits them \
    into chunks, asks an LLM for questions, answers and multi-turn conversations, and exports \
    curated snapshots as JSON, JSONL, CSV, HuggingFace or LLaMA Factory datasets."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/easy-dataset.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// Submit tasks and return immediately instead of waiting.
    #[arg(long, global = true)]
    detach: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and the upload directory.
    ///
    /// Idempotent: running it again leaves existing data alone.
    Init,

    /// Manage projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Upload a file or every supported file under a directory, then
    /// extract and chunk each new upload.
    Upload {
        project: String,
        path: PathBuf,

        /// Store the bytes but do not chunk them yet.
        #[arg(long)]
        no_process: bool,
    },

    /// List the chunks of an uploaded file.
    Chunks { file_id: String },

    /// Run an LLM generation step.
    Generate {
        #[command(subcommand)]
        step: GenerateStep,
    },

    /// Create and inspect dataset snapshots.
    Dataset {
        #[command(subcommand)]
        action: DatasetAction,
    },

    /// Export a snapshotted dataset.
    ///
    /// `huggingface` and `llama-factory` write a directory; the other
    /// formats write a single file.
    Export {
        dataset: String,

        #[arg(long, value_enum, default_value = "jsonl")]
        format: ExportFormat,

        #[arg(long)]
        out: PathBuf,
    },

    /// Inspect and cancel tasks.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Run queued tasks until interrupted, resuming interrupted ones first.
    Worker,

    /// Back up or restore the SQLite database.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
}

#[derive(Subcommand)]
enum DbAction {
    /// Write a compacted copy of the database. The target must not exist.
    Backup { path: PathBuf },
    /// Replace the database with a backup. Stop any `eds worker` first.
    Restore { path: PathBuf },
}

#[derive(Subcommand)]
enum ProjectAction {
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    List,
    /// Delete a project with all its files, questions, datasets and tasks.
    Delete { id: String },
}

/// Model and prompt selection shared by every generation step.
#[derive(Args, Clone, Default)]
struct ModelArgs {
    /// Provider name from `[providers.<name>]`. Defaults to `[generation].provider`.
    #[arg(long)]
    provider: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    temperature: Option<f32>,

    /// Prompt language (`en`, `zh`).
    #[arg(long)]
    language: Option<String>,

    /// Pin a prompt template version.
    #[arg(long)]
    prompt_version: Option<u32>,
}

impl ModelArgs {
    fn choice(&self) -> Result<ModelChoice> {
        let model = match (&self.provider, &self.model) {
            (Some(provider), Some(model)) => {
                let mut mc = ModelConfig::new(provider.clone(), model.clone());
                mc.temperature = self.temperature;
                Some(mc)
            }
            (None, None) => {
                if self.temperature.is_some() {
                    bail!("--temperature needs --provider and --model");
                }
                None
            }
            _ => bail!("--provider and --model must be given together"),
        };
        Ok(ModelChoice {
            model,
            language: self.language.clone(),
            prompt_version: self.prompt_version,
        })
    }
}

#[derive(Subcommand)]
enum GenerateStep {
    /// Generate questions for chunks.
    Questions {
        project: String,
        #[arg(long)]
        file: Option<String>,
        /// Only these chunks (comma separated).
        #[arg(long, value_delimiter = ',')]
        chunks: Vec<String>,
        /// Condition on one GA pair.
        #[arg(long)]
        ga_pair: Option<String>,
        /// Condition on every active GA pair of each chunk's file.
        #[arg(long)]
        use_ga_pairs: bool,
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Answer pending questions.
    Answers {
        project: String,
        #[arg(long)]
        file: Option<String>,
        #[arg(long, value_delimiter = ',')]
        questions: Vec<String>,
        /// Regenerate answers that already exist.
        #[arg(long)]
        include_answered: bool,
        /// Extra instructions appended to the answer prompt.
        #[arg(long)]
        instructions: Option<String>,
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Propose genre/audience pairs for a file.
    GaPairs {
        file_id: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Review questions and answers; prints the proposed edits.
    Clean {
        project: String,
        #[arg(long)]
        file: Option<String>,
        #[arg(long, value_delimiter = ',')]
        questions: Vec<String>,
        /// Ask the model for a critique after the deterministic passes.
        #[arg(long)]
        llm: bool,
        /// Write the edits back once the review finishes.
        #[arg(long)]
        apply: bool,
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Score a dataset's entries with the model.
    Evaluate {
        dataset: String,
        #[arg(long)]
        sample: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Turn answered questions (or one topic) into multi-turn conversations.
    Conversations {
        project: String,
        #[arg(long)]
        file: Option<String>,
        #[arg(long, value_delimiter = ',')]
        questions: Vec<String>,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        scenario: Option<String>,
        #[arg(long)]
        role_a: Option<String>,
        #[arg(long)]
        role_b: Option<String>,
        #[arg(long)]
        max_turns: Option<usize>,
        #[arg(long)]
        system_prompt: Option<String>,
        #[command(flatten)]
        model: ModelArgs,
    },
}

#[derive(Subcommand)]
enum DatasetAction {
    /// Create a dataset from explicit questions or a filter, and snapshot it.
    Create {
        project: String,
        name: String,
        /// Explicit question ids (comma separated). Overrides the filter flags.
        #[arg(long, value_delimiter = ',')]
        questions: Vec<String>,
        #[arg(long = "file", value_delimiter = ',')]
        files: Vec<String>,
        #[arg(long = "tag", value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        min_score: Option<f64>,
        /// Emit one entry per active GA pair of each question's file.
        #[arg(long)]
        ga_pairs: bool,
        #[arg(long)]
        system_prompt: Option<String>,
        /// Leave the dataset as a draft.
        #[arg(long)]
        no_snapshot: bool,
    },
    /// Snapshot (or re-snapshot) a dataset that has not been exported.
    Snapshot { id: String },
    Show {
        id: String,
        /// Also print the entries.
        #[arg(long)]
        entries: bool,
    },
    List { project: String },
}

#[derive(Subcommand)]
enum TaskAction {
    List {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    Show { id: String },
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_or_default(&cli.config)?;
    init_tracing(&cfg);

    let reporter = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            std::fs::create_dir_all(&cfg.app.upload_dir).with_context(|| {
                format!("Failed to create upload directory: {}", cfg.app.upload_dir.display())
            })?;
            println!("Database initialized successfully.");
        }
        Commands::Db { action } => match action {
            DbAction::Backup { path } => {
                let pool = db::connect(&cfg).await?;
                let outcome = db::backup(&pool, &path).await;
                pool.close().await;
                outcome?;
                println!("Database backed up to {}", path.display());
            }
            DbAction::Restore { path } => {
                db::restore(&cfg.app.database_url, &path).await?;
                println!("Database restored from {}", path.display());
            }
        },
        Commands::Worker => {
            let app = App::open(cfg, EngineMode::Worker).await?;
            app.run_worker().await?;
            app.close().await;
        }
        command => {
            let app = App::open(cfg, EngineMode::Inline).await?;
            let outcome = run_command(&app, command, cli.detach, reporter.as_ref()).await;
            app.close().await;
            outcome?;
        }
    }

    Ok(())
}

/// Logs go to stderr; `RUST_LOG` wins over `[app].log_level`.
fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.app.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_command(
    app: &App,
    command: Commands,
    detach: bool,
    reporter: &dyn ProgressReporter,
) -> Result<()> {
    match command {
        Commands::Project { action } => run_project(app, action).await,
        Commands::Upload {
            project,
            path,
            no_process,
        } => run_upload(app, &project, &path, no_process, detach, reporter).await,
        Commands::Chunks { file_id } => run_chunks(app, &file_id).await,
        Commands::Generate { step } => run_generate(app, step, detach, reporter).await,
        Commands::Dataset { action } => run_dataset(app, action).await,
        Commands::Export {
            dataset,
            format,
            out,
        } => run_export(app, &dataset, format, out).await,
        Commands::Task { action } => run_task(app, action).await,
        Commands::Init | Commands::Worker | Commands::Db { .. } => {
            unreachable!("handled in main")
        }
    }
}

async fn run_project(app: &App, action: ProjectAction) -> Result<()> {
    match action {
        ProjectAction::Create { name, description } => {
            let project = Project::new(name, description);
            app.store.create_project(&project).await?;
            println!("{}", project.id);
            eprintln!("Created project '{}'", project.name);
        }
        ProjectAction::List => {
            let projects = app.store.list_projects().await?;
            if projects.is_empty() {
                eprintln!("No projects.");
            }
            for p in projects {
                println!("{}\t{}\t{}", p.id, p.name, p.created_at.to_rfc3339());
            }
        }
        ProjectAction::Delete { id } => {
            let project = app
                .store
                .get_project(&id)
                .await?
                .with_context(|| format!("project {} not found", id))?;
            for file in app.store.list_files(&id).await? {
                app.storage.delete(&file.id).await?;
            }
            app.store.delete_project(&id).await?;
            eprintln!("Deleted project '{}'", project.name);
        }
    }
    Ok(())
}

async fn run_upload(
    app: &App,
    project_id: &str,
    path: &Path,
    no_process: bool,
    detach: bool,
    reporter: &dyn ProgressReporter,
) -> Result<()> {
    if app.store.get_project(project_id).await?.is_none() {
        bail!("project {} not found", project_id);
    }

    let mut to_process = Vec::new();
    let (mut stored_count, mut skipped) = (0usize, 0usize);
    for outcome in app.storage.upload(project_id, path).await? {
        match outcome {
            UploadOutcome::Stored(stored) => {
                stored_count += 1;
                reporter.report(ProgressEvent::Uploaded {
                    file_name: stored.file.file_name.clone(),
                    file_id: stored.file.id.clone(),
                    duplicate: !stored.created,
                });
                println!("{}\t{}", stored.file.id, stored.file.file_name);
                let chunked = !app.store.list_chunks(&stored.file.id).await?.is_empty();
                if stored.created || !chunked {
                    to_process.push(stored.file.id);
                }
            }
            UploadOutcome::Skipped { path, reason } => {
                skipped += 1;
                reporter.report(ProgressEvent::Skipped {
                    path: path.display().to_string(),
                    reason,
                });
            }
        }
    }

    if no_process || to_process.is_empty() {
        eprintln!("Stored {} file(s), skipped {}", stored_count, skipped);
        return Ok(());
    }

    let requests = to_process
        .iter()
        .map(|file_id| {
            JobRequest::new(
                TaskType::FileProcessing,
                project_id,
                json!({ "file_id": file_id }),
            )
            .with_target(file_id.clone())
        })
        .collect();
    let tasks = app.run_jobs(requests, detach, reporter).await?;
    finish_tasks(&tasks, detach)
}

async fn run_chunks(app: &App, file_id: &str) -> Result<()> {
    let file = app
        .store
        .get_file(file_id)
        .await?
        .with_context(|| format!("file {} not found", file_id))?;
    let chunks = app.store.list_chunks(file_id).await?;
    for c in &chunks {
        println!(
            "{}\t{}\t{}..{}\t{}",
            c.id,
            c.name,
            c.start_offset,
            c.end_offset,
            c.summary.as_deref().unwrap_or("-")
        );
    }
    eprintln!("{} chunk(s) in {}", chunks.len(), file.file_name);
    Ok(())
}

async fn run_generate(
    app: &App,
    step: GenerateStep,
    detach: bool,
    reporter: &dyn ProgressReporter,
) -> Result<()> {
    let request = match step {
        GenerateStep::Questions {
            project,
            file,
            chunks,
            ga_pair,
            use_ga_pairs,
            model,
        } => {
            let mut payload = choice_payload(&model)?;
            payload["file_id"] = json!(file);
            payload["chunk_ids"] = ids_or_null(chunks);
            payload["ga_pair_id"] = json!(ga_pair);
            payload["use_ga_pairs"] = json!(use_ga_pairs);
            targeted(TaskType::QuestionGeneration, &project, file, payload)
        }
        GenerateStep::Answers {
            project,
            file,
            questions,
            include_answered,
            instructions,
            model,
        } => {
            let mut payload = choice_payload(&model)?;
            payload["file_id"] = json!(file);
            payload["question_ids"] = ids_or_null(questions);
            payload["include_answered"] = json!(include_answered);
            payload["template_prompt"] = json!(instructions);
            targeted(TaskType::AnswerGeneration, &project, file, payload)
        }
        GenerateStep::GaPairs {
            file_id,
            count,
            model,
        } => {
            let generator = GaPairGenerator::new(app.generators.clone());
            let pairs = generator
                .generate(&file_id, count, &model.choice()?, &CancelFlag::new())
                .await?;
            for p in &pairs {
                println!(
                    "{}\t{}\t{}\t{}",
                    p.id, p.ordinal, p.genre_title, p.audience_title
                );
            }
            eprintln!("Generated {} GA pair(s)", pairs.len());
            return Ok(());
        }
        GenerateStep::Clean {
            project,
            file,
            questions,
            llm,
            apply,
            model,
        } => {
            let mut payload = choice_payload(&model)?;
            payload["file_id"] = json!(file);
            payload["question_ids"] = ids_or_null(questions);
            payload["llm"] = json!(llm);
            let request = targeted(TaskType::DataCleaning, &project, file, payload);
            let task = app.run_job(request, detach, reporter).await?;
            finish_tasks(std::slice::from_ref(&task), detach)?;
            if apply && !detach {
                let edits: Vec<Edit> = task
                    .result
                    .as_ref()
                    .and_then(|r| r.get("edits"))
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .context("cleaning result has malformed edits")?
                    .unwrap_or_default();
                let summary = apply_edits(app.store.as_ref(), &edits).await?;
                eprintln!(
                    "Applied edits: {} revised, {} rejected, {} accepted, {} missing",
                    summary.revised, summary.rejected, summary.accepted, summary.missing
                );
            }
            return Ok(());
        }
        GenerateStep::Evaluate {
            dataset,
            sample,
            seed,
            model,
        } => {
            let ds = app.datasets.get(&dataset).await?;
            let mut payload = choice_payload(&model)?;
            payload["dataset_id"] = json!(ds.id);
            payload["sample_size"] = json!(sample);
            payload["seed"] = json!(seed);
            JobRequest::new(TaskType::DatasetEvaluation, ds.project_id.clone(), payload)
                .with_target(ds.id)
        }
        GenerateStep::Conversations {
            project,
            file,
            questions,
            topic,
            scenario,
            role_a,
            role_b,
            max_turns,
            system_prompt,
            model,
        } => {
            let mut payload = choice_payload(&model)?;
            payload["file_id"] = json!(file);
            payload["question_ids"] = ids_or_null(questions);
            payload["topic"] = json!(topic);
            payload["scenario"] = json!(scenario);
            payload["role_a"] = json!(role_a);
            payload["role_b"] = json!(role_b);
            payload["max_turns"] = json!(max_turns);
            payload["system_prompt"] = json!(system_prompt);
            targeted(TaskType::ConversationGeneration, &project, file, payload)
        }
    };

    let task = app.run_job(request, detach, reporter).await?;
    finish_tasks(std::slice::from_ref(&task), detach)
}

fn choice_payload(model: &ModelArgs) -> Result<Value> {
    Ok(serde_json::to_value(model.choice()?)?)
}

fn ids_or_null(ids: Vec<String>) -> Value {
    if ids.is_empty() {
        Value::Null
    } else {
        json!(ids)
    }
}

/// File-scoped jobs are keyed on the file, project-wide ones on the project.
fn targeted(task_type: TaskType, project: &str, file: Option<String>, payload: Value) -> JobRequest {
    let target = file.unwrap_or_else(|| project.to_string());
    JobRequest::new(task_type, project, payload).with_target(target)
}

/// Print results on stdout and fail the command if any task did not succeed.
fn finish_tasks(tasks: &[Task], detach: bool) -> Result<()> {
    let mut failed = 0usize;
    for task in tasks {
        if detach {
            println!("{}", task.id);
            eprintln!("Queued {} task {}", task.task_type.as_str(), task.id);
            continue;
        }
        match task.status {
            TaskStatus::Succeeded => {
                if let Some(result) = &task.result {
                    println!("{}", serde_json::to_string_pretty(result)?);
                }
            }
            status => {
                failed += 1;
                match &task.error {
                    Some(err) => eprintln!(
                        "Task {} {}: {} ({})",
                        task.id,
                        status.as_str(),
                        err.message,
                        err.kind.as_str()
                    ),
                    None => eprintln!("Task {} {}", task.id, status.as_str()),
                }
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} task(s) did not succeed", failed, tasks.len());
    }
    Ok(())
}

async fn run_dataset(app: &App, action: DatasetAction) -> Result<()> {
    match action {
        DatasetAction::Create {
            project,
            name,
            questions,
            files,
            tags,
            min_score,
            ga_pairs,
            system_prompt,
            no_snapshot,
        } => {
            let selection = if questions.is_empty() {
                Selection::Filter(SelectionFilter {
                    file_ids: (!files.is_empty()).then_some(files),
                    tags: (!tags.is_empty()).then_some(tags),
                    min_score,
                })
            } else {
                Selection::Ids {
                    question_ids: questions,
                }
            };
            let dataset = app
                .datasets
                .create(
                    &project,
                    NewDataset {
                        name,
                        selection,
                        materialize_ga_pairs: ga_pairs,
                        system_prompt,
                    },
                )
                .await?;
            println!("{}", dataset.id);
            if no_snapshot {
                eprintln!("Created draft dataset '{}'", dataset.name);
                return Ok(());
            }
            let (dataset, entries) = app.datasets.snapshot(&dataset.id).await?;
            eprintln!(
                "Created dataset '{}' with {} entries",
                dataset.name,
                entries.len()
            );
        }
        DatasetAction::Snapshot { id } => {
            let (dataset, entries) = app.datasets.snapshot(&id).await?;
            eprintln!(
                "Snapshotted dataset '{}': {} entries",
                dataset.name,
                entries.len()
            );
        }
        DatasetAction::Show { id, entries } => {
            let dataset = app.datasets.get(&id).await?;
            let mut shown = serde_json::to_value(&dataset)?;
            if dataset.snapshot_at.is_some() {
                let rows = app.store.list_dataset_entries(&dataset.id).await?;
                shown["entry_count"] = json!(rows.len());
                if entries {
                    shown["entries"] = serde_json::to_value(&rows)?;
                }
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        DatasetAction::List { project } => {
            let datasets = app.store.list_datasets(&project).await?;
            if datasets.is_empty() {
                let answered = app
                    .store
                    .list_questions(&QuestionQuery::project(&project))
                    .await?
                    .iter()
                    .filter(|q| q.answer.is_some())
                    .count();
                eprintln!("No datasets ({} answered question(s) available).", answered);
            }
            for d in datasets {
                println!("{}\t{}\t{}", d.id, d.name, d.status.as_str());
            }
        }
    }
    Ok(())
}

async fn run_export(app: &App, dataset_id: &str, format: ExportFormat, out: PathBuf) -> Result<()> {
    let options = ExportOptions {
        format,
        out,
        ratios: SplitRatios::from_config(&app.config.export)?,
        default_system: Some(app.config.export.system_prompt.clone()),
    };
    let report = export::export_dataset(&app.datasets, dataset_id, &options).await?;
    for file in &report.files {
        println!("{}", file.display());
    }
    eprintln!(
        "Exported {} record(s) as {}",
        report.records, report.format
    );
    Ok(())
}

async fn run_task(app: &App, action: TaskAction) -> Result<()> {
    match action {
        TaskAction::List { project, status } => {
            let query = TaskQuery {
                project_id: project,
                status: status.as_deref().map(TaskStatus::parse).transpose()?,
                task_type: None,
            };
            let tasks = app.store.list_tasks(&query).await?;
            if tasks.is_empty() {
                eprintln!("No tasks.");
            }
            for t in tasks {
                println!(
                    "{}\t{}\t{}\t{}/{}\t{}",
                    t.id,
                    t.task_type.as_str(),
                    t.status.as_str(),
                    t.completed_units,
                    t.total_units,
                    t.created_at.to_rfc3339()
                );
            }
        }
        TaskAction::Show { id } => {
            let task = app
                .store
                .get_task(&id)
                .await?
                .with_context(|| format!("task {} not found", id))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskAction::Cancel { id } => {
            let task = app.engine.cancel(&id).await?;
            eprintln!("Task {} is {}", task.id, task.status.as_str());
            if task.status == TaskStatus::Running {
                eprintln!("The running worker stops at its next checkpoint.");
            }
        }
    }
    Ok(())
}
