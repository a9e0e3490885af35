//! sift-fanout library crate
//!
//! Runs every candidate edit through several model backends: a tool-calling
//! investigation, a structured verdict, and a cost lookup per (edit, model),
//! with crash-safe resumption from a checkpoint.

pub mod config;
pub mod context;
pub mod fanout;
pub mod llm;
pub mod snapshot;
pub mod store;
pub mod tools;
pub mod util;
