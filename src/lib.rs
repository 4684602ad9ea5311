//! Multi-user markdown note storage library
//!
//! Notes live as flat files: a per-user JSON index of metadata next to one
//! markdown file per note. On top of that sit installation-wide registries
//! for users, accounts and public share links, plus additive backup and
//! restore. [`NoteService`] is the entry point.

mod accounts;
mod backup;
mod backup_scheduler;
mod cli;
mod config;
mod errors;
mod helper;
mod id;
mod kv;
mod legacy;
mod note;
mod password;
mod registry;
mod search;
mod service;
mod share;
mod types;
mod user_store;

// Re-export key components
pub use accounts::*;
pub use backup::*;
pub use backup_scheduler::*;
pub use cli::*;
pub use config::*;
pub use errors::*;
pub use helper::*;
pub use id::*;
pub use kv::*;
pub use legacy::*;
pub use note::*;
pub use password::*;
pub use registry::*;
pub use search::*;
pub use service::*;
pub use share::*;
pub use types::*;
pub use user_store::*;
