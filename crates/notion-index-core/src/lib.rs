//! # Notion Index Core
//!
//! Runtime-free logic for notion-index: data models, error taxonomy, node
//! normalization, chunking, the three-way sync diff, ranking, and the
//! traits for the document source, embedding provider, vector index and
//! config store, with in-memory implementations of each store.
//!
//! This crate contains no tokio, sqlx, HTTP or filesystem dependencies.

pub mod chunk;
pub mod diff;
pub mod embedding;
pub mod error;
pub mod kv;
pub mod models;
pub mod normalize;
pub mod search;
pub mod source;
pub mod store;

pub use error::{Error, Result};
