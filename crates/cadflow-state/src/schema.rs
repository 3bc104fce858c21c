//! Build aggregate schema
//!
//! The `Build` is the persisted project aggregate: metadata, chat history,
//! and the mechanical assets (CAD source files + parameters) that feed the
//! orchestration machines. All mutation goes through named methods so the
//! `updated_at` bump rules and the main-file invariant live in one place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::BuildError;

/// Default name given to a chat created on demand.
pub const DEFAULT_CHAT_NAME: &str = "New chat";

/// Unique identifier for a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildId(pub String);

impl BuildId {
    /// Generate a new random build id.
    pub fn new() -> Self {
        BuildId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a chat within a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl ChatId {
    /// Generate a new random chat id.
    pub fn new() -> Self {
        ChatId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ChatId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content digest (SHA-256 hex string) of a serialized aggregate.
///
/// Used by the build machine to detect no-op persistence writes: if the
/// digest of the in-memory build matches the last stored digest, the write
/// is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chat thread owned by a build. Messages are opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub name: String,
    pub messages: Vec<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    /// Create an empty chat with the default name.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: ChatId::new(),
            name: DEFAULT_CHAT_NAME.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the chat still carries the default, never-renamed name.
    pub fn has_default_name(&self) -> bool {
        self.name == DEFAULT_CHAT_NAME
    }
}

impl Default for Chat {
    fn default() -> Self {
        Self::new()
    }
}

/// CAD source files, entry file, and parameters of a build.
///
/// Invariant: `main` is always a key of `files`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MechanicalAssets {
    /// Path → file content
    pub files: BTreeMap<String, String>,
    /// The designated entry file
    pub main: String,
    /// Parameter name → JSON-compatible value
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Kernel provider tag (e.g. "replicad", "jscad", "openscad")
    pub language: String,
}

impl MechanicalAssets {
    /// Create assets from a single entry file.
    pub fn single_file(
        path: impl Into<String>,
        content: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let mut files = BTreeMap::new();
        files.insert(path.clone(), content.into());
        Self {
            files,
            main: path,
            parameters: BTreeMap::new(),
            language: language.into(),
        }
    }

    /// Content of the entry file.
    pub fn main_content(&self) -> Option<&str> {
        self.files.get(&self.main).map(String::as_str)
    }
}

/// Grouping for per-discipline assets. Only mechanical assets exist today.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assets {
    pub mechanical: Option<MechanicalAssets>,
}

/// The persisted project aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub name: String,
    pub description: String,
    /// Deduplicated, order-preserving tag list
    pub tags: Vec<String>,
    /// Optional thumbnail (data-url or similar opaque string)
    pub thumbnail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker
    pub deleted_at: Option<DateTime<Utc>>,
    pub chats: Vec<Chat>,
    /// Back-reference to the active chat; not ownership
    pub last_chat_id: Option<ChatId>,
    pub assets: Assets,
}

impl Build {
    /// Create a new build with empty assets.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: BuildId::new(),
            name: name.into(),
            description: String::new(),
            tags: Vec::new(),
            thumbnail: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            chats: Vec::new(),
            last_chat_id: None,
            assets: Assets::default(),
        }
    }

    /// Create a new build carrying mechanical assets.
    ///
    /// Fails if the assets' main file is not a key of the file map.
    pub fn with_mechanical_assets(
        name: impl Into<String>,
        assets: MechanicalAssets,
    ) -> Result<Self, BuildError> {
        if !assets.files.contains_key(&assets.main) {
            return Err(BuildError::MainFileNotInFiles { path: assets.main });
        }
        let mut build = Self::new(name);
        build.assets.mechanical = Some(assets);
        Ok(build)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn mechanical_mut(&mut self) -> Result<&mut MechanicalAssets, BuildError> {
        self.assets
            .mechanical
            .as_mut()
            .ok_or(BuildError::NoMechanicalAssets)
    }

    /// Whether the build has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Digest of the serialized aggregate, for no-op write detection.
    pub fn snapshot_digest(&self) -> ContentDigest {
        // Serialization of a Build cannot fail: all fields are plain data.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        ContentDigest::from_bytes(&bytes)
    }

    // -- metadata mutations --------------------------------------------------

    /// Rename the build. Bumps `updated_at`.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.touch();
    }

    /// Replace the description. Bumps `updated_at`.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
        self.touch();
    }

    /// Replace the tag set, deduplicating while preserving first-seen order.
    /// Metadata-only: does NOT bump `updated_at`.
    pub fn set_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = std::collections::HashSet::new();
        self.tags = tags
            .into_iter()
            .map(Into::into)
            .filter(|t| seen.insert(t.clone()))
            .collect();
    }

    /// Replace the thumbnail. Metadata-only: does NOT bump `updated_at`.
    pub fn set_thumbnail(&mut self, thumbnail: Option<String>) {
        self.thumbnail = thumbnail;
    }

    /// Mark the build soft-deleted.
    pub fn mark_deleted(&mut self) {
        self.deleted_at = Some(Utc::now());
    }

    // -- chat mutations ------------------------------------------------------

    /// Append a new chat with the default name and make it active.
    /// Bumps `updated_at`.
    pub fn add_chat(&mut self) -> ChatId {
        let chat = Chat::new();
        let id = chat.id.clone();
        self.chats.push(chat);
        self.last_chat_id = Some(id.clone());
        self.touch();
        id
    }

    /// Rename a chat. Bumps `updated_at`.
    pub fn rename_chat(
        &mut self,
        chat_id: &ChatId,
        name: impl Into<String>,
    ) -> Result<(), BuildError> {
        let chat = self.chat_mut(chat_id)?;
        chat.name = name.into();
        chat.updated_at = Utc::now();
        self.touch();
        Ok(())
    }

    /// Remove a chat. Clears `last_chat_id` if it pointed at the removed
    /// chat. Bumps `updated_at`.
    pub fn remove_chat(&mut self, chat_id: &ChatId) -> Result<(), BuildError> {
        let before = self.chats.len();
        self.chats.retain(|c| &c.id != chat_id);
        if self.chats.len() == before {
            return Err(BuildError::ChatNotFound {
                chat_id: chat_id.0.clone(),
            });
        }
        if self.last_chat_id.as_ref() == Some(chat_id) {
            self.last_chat_id = None;
        }
        self.touch();
        Ok(())
    }

    /// Append an opaque message to a chat. Bumps `updated_at`.
    pub fn append_chat_message(
        &mut self,
        chat_id: &ChatId,
        message: serde_json::Value,
    ) -> Result<(), BuildError> {
        let chat = self.chat_mut(chat_id)?;
        chat.messages.push(message);
        chat.updated_at = Utc::now();
        self.touch();
        Ok(())
    }

    /// Switch the active chat. Metadata-only: does NOT bump `updated_at`.
    pub fn set_last_chat(&mut self, chat_id: &ChatId) -> Result<(), BuildError> {
        if self.chat(chat_id).is_none() {
            return Err(BuildError::ChatNotFound {
                chat_id: chat_id.0.clone(),
            });
        }
        self.last_chat_id = Some(chat_id.clone());
        Ok(())
    }

    /// Look up a chat by id.
    pub fn chat(&self, chat_id: &ChatId) -> Option<&Chat> {
        self.chats.iter().find(|c| &c.id == chat_id)
    }

    fn chat_mut(&mut self, chat_id: &ChatId) -> Result<&mut Chat, BuildError> {
        self.chats
            .iter_mut()
            .find(|c| &c.id == chat_id)
            .ok_or_else(|| BuildError::ChatNotFound {
                chat_id: chat_id.0.clone(),
            })
    }

    // -- asset mutations -----------------------------------------------------

    /// Create or replace a file. The first file ever added becomes the main
    /// file. Bumps `updated_at`.
    pub fn upsert_file(
        &mut self,
        path: impl Into<String>,
        content: impl Into<String>,
        language: impl Into<String>,
    ) {
        let path = path.into();
        match self.assets.mechanical.as_mut() {
            Some(mech) => {
                mech.files.insert(path, content.into());
            }
            None => {
                self.assets.mechanical =
                    Some(MechanicalAssets::single_file(path, content, language));
            }
        }
        self.touch();
    }

    /// Rename a file, carrying its content over. If the renamed file was the
    /// main file, `main` follows it. Bumps `updated_at`.
    pub fn rename_file(
        &mut self,
        from: &str,
        to: impl Into<String>,
    ) -> Result<(), BuildError> {
        let to = to.into();
        let mech = self.mechanical_mut()?;
        if mech.files.contains_key(&to) {
            return Err(BuildError::FileExists { path: to });
        }
        let content = mech
            .files
            .remove(from)
            .ok_or_else(|| BuildError::FileNotFound {
                path: from.to_string(),
            })?;
        mech.files.insert(to.clone(), content);
        if mech.main == from {
            mech.main = to;
        }
        self.touch();
        Ok(())
    }

    /// Remove a file. Removing the main file is rejected to preserve the
    /// main-in-files invariant. Bumps `updated_at`.
    pub fn remove_file(&mut self, path: &str) -> Result<(), BuildError> {
        let mech = self.mechanical_mut()?;
        if mech.main == path {
            return Err(BuildError::CannotRemoveMainFile {
                path: path.to_string(),
            });
        }
        if mech.files.remove(path).is_none() {
            return Err(BuildError::FileNotFound {
                path: path.to_string(),
            });
        }
        self.touch();
        Ok(())
    }

    /// Redesignate the entry file. Bumps `updated_at`.
    pub fn set_main_file(&mut self, path: &str) -> Result<(), BuildError> {
        let mech = self.mechanical_mut()?;
        if !mech.files.contains_key(path) {
            return Err(BuildError::MainFileNotInFiles {
                path: path.to_string(),
            });
        }
        mech.main = path.to_string();
        self.touch();
        Ok(())
    }

    /// Set a single parameter value. Bumps `updated_at`.
    pub fn set_parameter(
        &mut self,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), BuildError> {
        let mech = self.mechanical_mut()?;
        mech.parameters.insert(name.into(), value);
        self.touch();
        Ok(())
    }

    /// Replace the whole parameter map. Bumps `updated_at`.
    pub fn set_parameters(
        &mut self,
        parameters: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), BuildError> {
        let mech = self.mechanical_mut()?;
        mech.parameters = parameters;
        self.touch();
        Ok(())
    }

    /// Change the kernel provider tag. Bumps `updated_at`.
    pub fn set_language(&mut self, language: impl Into<String>) -> Result<(), BuildError> {
        let mech = self.mechanical_mut()?;
        mech.language = language.into();
        self.touch();
        Ok(())
    }
}
