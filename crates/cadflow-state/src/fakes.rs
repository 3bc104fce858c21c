//! In-memory fake for the BuildStore trait (testing only)
//!
//! `MemoryBuildStore` satisfies the trait contract without any external
//! dependency, and adds failure injection so orchestration tests can drive
//! the build machine's silent-retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StoreError;
use crate::schema::{Build, BuildId};
use crate::store::{BuildStore, StoreResult};

/// In-memory build store backed by a `Mutex<HashMap<id, Build>>`.
#[derive(Debug, Default)]
pub struct MemoryBuildStore {
    builds: Mutex<HashMap<String, Build>>,
    fail_updates: AtomicU32,
    update_count: AtomicU64,
}

impl MemoryBuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `update_build` fail with a backend error.
    pub fn fail_next_updates(&self, n: u32) {
        self.fail_updates.store(n, Ordering::SeqCst);
    }

    /// How many `update_build` calls have been attempted (including the
    /// injected failures).
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildStore for MemoryBuildStore {
    async fn create_build(&self, build: &Build) -> StoreResult<()> {
        let mut builds = self.builds.lock().unwrap();
        if builds.contains_key(&build.id.0) {
            return Err(StoreError::AlreadyExists {
                build_id: build.id.0.clone(),
            });
        }
        builds.insert(build.id.0.clone(), build.clone());
        Ok(())
    }

    async fn get_build(&self, id: &BuildId) -> StoreResult<Build> {
        let builds = self.builds.lock().unwrap();
        builds
            .get(&id.0)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                build_id: id.0.clone(),
            })
    }

    async fn update_build(&self, build: &Build) -> StoreResult<()> {
        self.update_count.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_updates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_updates.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Backend("injected update failure".into()));
        }

        let mut builds = self.builds.lock().unwrap();
        if !builds.contains_key(&build.id.0) {
            return Err(StoreError::NotFound {
                build_id: build.id.0.clone(),
            });
        }
        builds.insert(build.id.0.clone(), build.clone());
        Ok(())
    }

    async fn soft_delete_build(&self, id: &BuildId) -> StoreResult<()> {
        let mut builds = self.builds.lock().unwrap();
        let build = builds.get_mut(&id.0).ok_or_else(|| StoreError::NotFound {
            build_id: id.0.clone(),
        })?;
        build.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn hard_delete_build(&self, id: &BuildId) -> StoreResult<()> {
        let mut builds = self.builds.lock().unwrap();
        builds.remove(&id.0).ok_or_else(|| StoreError::NotFound {
            build_id: id.0.clone(),
        })?;
        Ok(())
    }

    async fn list_builds(&self, include_deleted: bool) -> StoreResult<Vec<Build>> {
        let builds = self.builds.lock().unwrap();
        let mut out: Vec<Build> = builds
            .values()
            .filter(|b| include_deleted || !b.is_deleted())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}
