//! Error types for cadflow-state

use thiserror::Error;

/// Errors raised by Build aggregate mutations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The designated main file is not a key of the file map
    #[error("Main file not present in file map: {path}")]
    MainFileNotInFiles { path: String },

    /// Removing the entry file would break the main-in-files invariant
    #[error("Cannot remove the main file: {path}")]
    CannotRemoveMainFile { path: String },

    /// A file operation referenced a path that does not exist
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// A file create/rename collided with an existing path
    #[error("File already exists: {path}")]
    FileExists { path: String },

    /// A chat operation referenced an unknown chat id
    #[error("Chat not found: {chat_id}")]
    ChatNotFound { chat_id: String },

    /// The build has no mechanical assets yet
    #[error("Build has no mechanical assets")]
    NoMechanicalAssets,
}

/// Errors raised by the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No build with the given id
    #[error("Build not found: {build_id}")]
    NotFound { build_id: String },

    /// A create collided with an existing build id
    #[error("Build already exists: {build_id}")]
    AlreadyExists { build_id: String },

    /// Backend (connection/query) failure
    #[error("Store backend failure: {0}")]
    Backend(String),

    /// Serialization failure while mapping to/from the backend
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
