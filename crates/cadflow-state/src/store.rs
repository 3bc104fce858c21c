//! Storage trait for Build persistence
//!
//! `BuildStore` is the async, backend-agnostic contract the build machine
//! persists through. An in-memory fake lives in `fakes`; a SurrealDB-backed
//! implementation lives in `surreal_store`. Any conforming backend must
//! pass the contract tests in `tests/store_contracts.rs`.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::schema::{Build, BuildId};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence contract for the Build aggregate.
///
/// Guarantees:
/// - `create_build` fails with `AlreadyExists` on id collision.
/// - `get_build` returns soft-deleted builds (callers filter on
///   `deleted_at`); it fails with `NotFound` only for ids never created or
///   hard-deleted.
/// - `update_build` replaces the whole document; it fails with `NotFound`
///   for unknown ids. Partial patching is the caller's concern; the build
///   machine always writes its coalesced in-memory aggregate.
/// - `soft_delete_build` marks `deleted_at` and keeps the record;
///   `hard_delete_build` removes it entirely.
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Persist a new build.
    async fn create_build(&self, build: &Build) -> StoreResult<()>;

    /// Fetch a build by id.
    async fn get_build(&self, id: &BuildId) -> StoreResult<Build>;

    /// Replace the stored document for an existing build.
    async fn update_build(&self, build: &Build) -> StoreResult<()>;

    /// Mark a build deleted without removing the record.
    async fn soft_delete_build(&self, id: &BuildId) -> StoreResult<()>;

    /// Remove a build record entirely.
    async fn hard_delete_build(&self, id: &BuildId) -> StoreResult<()>;

    /// List builds, optionally including soft-deleted ones.
    async fn list_builds(&self, include_deleted: bool) -> StoreResult<Vec<Build>>;
}
