//! # notion-index
//!
//! Incremental sync of a Notion workspace subtree into a vector index, and
//! similarity retrieval over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │ Notion API   │──▶│  Sync Orchestrator    │──▶│ SQLite index │
//! │ pages/blocks │   │ scan→diff→apply→ckpt │   │ + kv config  │
//! └──────────────┘   └──────────┬───────────┘   └──────┬───────┘
//!                               │ embed                │
//!                       ┌───────▼───────┐        ┌─────▼─────┐
//!                       │   Embedding   │◀───────│ Retriever │
//!                       │ OpenAI/Ollama │        └─────┬─────┘
//!                       └───────────────┘      ┌───────┴──────┐
//!                                              ▼              ▼
//!                                         ┌────────┐    ┌────────┐
//!                                         │  CLI   │    │  HTTP  │
//!                                         │ (nidx) │    │ (axum) │
//!                                         └────────┘    └────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export NOTION_TOKEN=... OPENAI_API_KEY=...
//! nidx init
//! nidx config set root_id <page-id>
//! nidx sync
//! nidx search "how do we deploy"
//! nidx serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`], [`migrate`] | SQLite connection and schema |
//! | [`sqlite_index`] | SQLite vector index |
//! | [`kv_store`], [`checkpoint`] | Key/value settings and sync checkpoints |
//! | [`notion`] | Notion REST document client |
//! | [`embedding`] | Embedding providers |
//! | [`retry`] | Timeouts and exponential backoff |
//! | [`extract`] | Tree traversal and content extraction |
//! | [`writer`] | Single-writer index wrapper |
//! | [`sync`] | Sync orchestrator |
//! | [`retrieve`] | Query-time retrieval |
//! | [`app`] | Component wiring |
//! | [`server`] | HTTP trigger surface |
//!
//! Data model, chunking, diffing and ranking live in `notion_index_core`.

pub mod app;
pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod kv_store;
pub mod logging;
pub mod migrate;
pub mod notion;
pub mod retrieve;
pub mod retry;
pub mod server;
pub mod sqlite_index;
pub mod sync;
pub mod writer;
