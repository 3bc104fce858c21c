//! SurrealDB-backed BuildStore implementation
//!
//! Stores each build as a single `builds` row carrying the serialized
//! aggregate, converting to/from the `schema::Build` type at the boundary.
//! Supports in-memory (`mem://`) connections for tests and any
//! `surrealdb::engine::any` URL for real deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::schema::{Build, BuildId};
use crate::store::{BuildStore, StoreResult};

/// Row shape for the `builds` table.
///
/// The aggregate travels as one JSON payload; `build_id` and `deleted` are
/// lifted out for indexing and filtered listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbBuild {
    build_id: String,
    deleted: bool,
    payload: serde_json::Value,
}

impl DbBuild {
    fn from_build(build: &Build) -> StoreResult<Self> {
        Ok(Self {
            build_id: build.id.0.clone(),
            deleted: build.is_deleted(),
            payload: serde_json::to_value(build)?,
        })
    }

    fn into_build(self) -> StoreResult<Build> {
        Ok(serde_json::from_value(self.payload)?)
    }
}

/// SurrealDB-backed implementation of [`BuildStore`].
pub struct SurrealBuildStore {
    db: Surreal<Any>,
}

impl SurrealBuildStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `cadflow/main`, and runs the schema
    /// setup.
    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint URL.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        db.use_ns("cadflow")
            .use_db("main")
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let store = Self { db };
        store.init_schema().await?;

        info!("SurrealBuildStore connected ({})", url);
        Ok(store)
    }

    /// Set up the `builds` table. Idempotent.
    async fn init_schema(&self) -> StoreResult<()> {
        debug!("Initializing builds table");

        let sql = r#"
            DEFINE TABLE IF NOT EXISTS builds SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_build_id ON TABLE builds COLUMNS build_id UNIQUE;
        "#;

        self.db
            .query(sql)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Fetch a row by build id, or `NotFound`.
    async fn fetch_row(&self, id: &str) -> StoreResult<DbBuild> {
        let id_owned = id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM builds WHERE build_id = $id")
            .bind(("id", id_owned))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let rows: Vec<DbBuild> = res
            .take(0)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound {
                build_id: id.to_string(),
            })
    }
}

#[async_trait]
impl BuildStore for SurrealBuildStore {
    async fn create_build(&self, build: &Build) -> StoreResult<()> {
        if self.fetch_row(&build.id.0).await.is_ok() {
            return Err(StoreError::AlreadyExists {
                build_id: build.id.0.clone(),
            });
        }

        let row = DbBuild::from_build(build)?;
        debug!(build_id = %build.id, "creating build");

        let _created: Option<DbBuild> = self
            .db
            .create("builds")
            .content(row)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn get_build(&self, id: &BuildId) -> StoreResult<Build> {
        self.fetch_row(&id.0).await?.into_build()
    }

    async fn update_build(&self, build: &Build) -> StoreResult<()> {
        // Existence check keeps NotFound semantics identical to the fake.
        self.fetch_row(&build.id.0).await?;

        let row = DbBuild::from_build(build)?;
        let id_owned = build.id.0.clone();

        self.db
            .query("UPDATE builds SET deleted = $deleted, payload = $payload WHERE build_id = $id")
            .bind(("id", id_owned))
            .bind(("deleted", row.deleted))
            .bind(("payload", row.payload))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn soft_delete_build(&self, id: &BuildId) -> StoreResult<()> {
        let row = self.fetch_row(&id.0).await?;
        let mut build = row.into_build()?;
        build.mark_deleted();
        self.update_build(&build).await
    }

    async fn hard_delete_build(&self, id: &BuildId) -> StoreResult<()> {
        self.fetch_row(&id.0).await?;

        let id_owned = id.0.clone();
        self.db
            .query("DELETE FROM builds WHERE build_id = $id")
            .bind(("id", id_owned))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn list_builds(&self, include_deleted: bool) -> StoreResult<Vec<Build>> {
        let mut res = self
            .db
            .query("SELECT * FROM builds")
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let rows: Vec<DbBuild> = res
            .take(0)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut builds = Vec::with_capacity(rows.len());
        for row in rows {
            if !include_deleted && row.deleted {
                continue;
            }
            builds.push(row.into_build()?);
        }
        builds.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(builds)
    }
}
