//! # Easy Dataset Core
//!
//! Runtime-free logic shared by the dataset pipeline: the data model,
//! the error taxonomy, processed documents and their structure hints,
//! the chunker, conversation validation, prompt templates, and the
//! [`Store`](store::Store) persistence contract.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. The
//! `easy-dataset` crate layers those on top.

pub mod chunk;
pub mod conversation;
pub mod document;
pub mod error;
pub mod models;
pub mod prompt;
pub mod store;

pub use error::{ErrorKind, ErrorView, PipelineError, PipelineResult};
