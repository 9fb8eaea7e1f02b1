//! Shared types for the TENEX execution orchestration kernel.
//!
//! This crate is the dependency root for every other `tenex-*` crate:
//! the conversation aggregate and its invariants (`model`), the
//! injected external capabilities (`capability`), the wire-level LLM
//! request/response shapes (`llm`, `stream`), the shared error type
//! (`error`), the kernel's configuration surface (`config`), and the
//! structured trace events emitted across the kernel (`trace`).
//!
//! Nothing in this crate talks to a file, a socket, or an LLM — it
//! only defines the shapes and contracts other crates implement
//! against.

pub mod capability;
pub mod config;
pub mod error;
pub mod llm;
pub mod model;
pub mod stream;
pub mod trace;

pub use error::{Error, Result};
