//! Core data models for the resumable upload service.
//!
//! Persistent entities map to SQLite tables via `sqlx::FromRow`; wire types in
//! [`api`] are shared by the HTTP handlers and the upload client so both sides
//! agree on the JSON contract.

pub mod api;
pub mod file;
pub mod session;
