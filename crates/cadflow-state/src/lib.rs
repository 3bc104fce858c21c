//! Cadflow-State: Build Aggregate and Persistence
//!
//! This crate provides the persisted `Build` aggregate (project metadata,
//! chat history, and mechanical assets: CAD source files plus parameters)
//! and the storage layer the build machine persists through.
//!
//! ## Key Components
//!
//! - `Build` / `Chat` / `MechanicalAssets`: the aggregate and its named
//!   mutation operations (updated_at bump rules, main-file invariant)
//! - `BuildStore`: async, backend-agnostic persistence trait
//! - `MemoryBuildStore`: in-memory fake with failure injection for tests
//! - `SurrealBuildStore`: SurrealDB-backed implementation

mod error;
pub mod fakes;
mod schema;
pub mod store;
mod surreal_store;

pub use error::{BuildError, StoreError};
pub use schema::{
    Assets, Build, BuildId, Chat, ChatId, ContentDigest, MechanicalAssets, DEFAULT_CHAT_NAME,
};
pub use store::{BuildStore, StoreResult};
pub use surreal_store::SurrealBuildStore;

/// Result type for cadflow-state operations
pub type Result<T> = std::result::Result<T, StoreError>;
