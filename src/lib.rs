//! # docpipe
//!
//! An event-driven document processing pipeline.
//!
//! Each object-created notification triggers one independent invocation that
//! fetches the object, classifies it, extracts its text (directly or with a
//! vision-capable generative model), summarizes the text, and upserts one
//! record per `(bucket, key, version)` into the result store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────────────────────────┐   ┌──────────┐
//! │ Notification │──▶│ Fetch ▶ Classify ▶ Extract ▶ Summarize ▶  │──▶│  SQLite  │
//! │  (Records[]) │   │                  Store                    │   │documents │
//! └──────────────┘   └──────────┬───────────────┬────────────────┘   └──────────┘
//!                               ▼               ▼
//!                         ┌──────────┐    ┌──────────┐
//!                         │    S3    │    │ Bedrock  │
//!                         └──────────┘    └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docpipe init                                  # create database
//! docpipe process my-bucket reports/q3.pdf      # one object
//! docpipe handle notification.json              # a notification document
//! docpipe get <document_id>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed failure taxonomy |
//! | [`event`] | Notification parsing and handler response |
//! | [`classify`] | Content classification |
//! | [`aws`] | SigV4 request signing |
//! | [`object_store`] | Object fetching (S3) |
//! | [`model`] | Generative model abstraction (Bedrock) |
//! | [`extract`] | Direct and vision text extraction |
//! | [`summarize`] | Summarization |
//! | [`store`] | Result persistence |
//! | [`retry`] | Backoff and invocation deadline |
//! | [`pipeline`] | Orchestrator |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod aws;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod extract;
pub mod migrate;
pub mod model;
pub mod models;
pub mod object_store;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod summarize;
