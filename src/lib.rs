//! # Easy Dataset
//!
//! A local pipeline that turns documents into supervised fine-tuning
//! datasets for LLMs.
//!
//! Uploaded files are detected, stored by content hash and converted to
//! text with structure hints. The chunker splits that text on headings and
//! paragraph boundaries. Generators call an LLM through the provider
//! registry to produce questions, answers, genre/audience pairs, cleaning
//! edits, evaluation scores and multi-turn conversations. Long-running
//! steps run as persisted, resumable tasks. Curated questions are frozen
//! into dataset snapshots and exported.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌─────────┐   ┌──────────────┐
//! │ Storage  │──▶│ Processors │──▶│ Chunker │──▶│  Generators  │
//! │ md5/type │   │ pdf/docx/… │   │         │   │  (LLM tasks) │
//! └──────────┘   └────────────┘   └─────────┘   └──────┬───────┘
//!                                                      │
//!        ┌──────────────┐   ┌───────────┐   ┌──────────▼───┐
//!        │  Exporters   │◀──│ Datasets  │◀──│    SQLite    │
//!        │ json/hf/…    │   │ snapshots │   │   (sqlx)     │
//!        └──────────────┘   └───────────┘   └──────────────┘
//! ```
//!
//! Domain types, the chunker, prompt templates and the `Store` contract
//! live in the `easy-dataset-core` crate; this crate adds the runtime:
//! database, HTTP providers, the task engine and the `eds` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | `Store` implementation over SQLite |
//! | [`storage`] | Upload detection, dedupe and on-disk storage |
//! | [`processors`] | PDF, DOCX, EPUB, Markdown and text extraction |
//! | [`ingest`] | The `file_processing` task: extract, chunk, store |
//! | [`llm`] | Provider adapters, retries, rate limits, structured output |
//! | [`generators`] | Question, answer, GA-pair, cleaning, evaluation and conversation steps |
//! | [`tasks`] | Persisted task engine with resume and cancellation |
//! | [`dataset`] | Selection and copy-on-write snapshots |
//! | [`export`] | JSON, JSONL, CSV, HuggingFace and LLaMA Factory writers and readers |
//! | [`progress`] | CLI progress reporting |
//! | [`app`] | Wiring used by the CLI |

pub mod app;
pub mod config;
pub mod dataset;
pub mod db;
pub mod export;
pub mod generators;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod processors;
pub mod progress;
pub mod sqlite_store;
pub mod storage;
pub mod tasks;
