//! Storage backends reachable through the proxy.
//!
//! This module defines the narrow contract the protocol layer consumes to talk to an
//! object store, along with the types exchanged over it. Concrete backends implement the
//! four capability traits below; anything implementing all of them is a
//! [`StorageInteractor`] and can be handed to the server.
//!
//! # Key Components
//!
//! - [`StorageReader`]: open a read stream at an arbitrary byte offset.
//! - [`StorageWriter`]: consume a byte source into a named object.
//! - [`StorageLister`]: enumerate objects by key prefix and find abandoned uploads.
//! - [`StorageMover`]: rename, delete, and abort multipart uploads.
//! - [`ResumableReader`]: a read stream that survives backend disconnects.
//!
//! # See Also
//!
//! - [`protocol`](crate::protocol): Drives these traits on behalf of clients.
use std::{collections::HashMap, io::Read};

use bincode::{Decode, Encode};

pub mod fs;
pub mod retry;

pub use error::StorageError;
pub use fs::FileStorage;
pub use retry::{ResumableReader, RetriesExhausted, RetryPolicy};

/// A byte stream served by a backend.
pub type ObjectStream = Box<dyn Read + Send>;

/// Metadata describing one stored object.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ObjectInfo {
    pub path: String,
    pub size: i64,
}

impl ObjectInfo {
    pub fn new(path: impl Into<String>, size: i64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

pub trait StorageReader {
    /// Opens `name` for reading, positioned at byte `offset`.
    fn cat_file(&self, name: &str, offset: i64) -> Result<ObjectStream, StorageError>;
}

pub trait StorageWriter {
    /// Stores everything readable from `source` under `name`. The object only becomes
    /// visible once `source` reports end of stream; a read error discards it.
    fn put_file(&self, name: &str, source: &mut dyn Read) -> Result<(), StorageError>;
}

pub trait StorageLister {
    /// Lists every object whose key starts with `prefix`, ordered by key.
    fn list_path(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    /// Uploads that were started and never completed, keyed by object key.
    fn list_failed_multipart_uploads(&self) -> Result<HashMap<String, String>, StorageError>;
}

pub trait StorageMover {
    fn move_object(&self, from: &str, to: &str) -> Result<(), StorageError>;

    fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;
}

/// Everything the proxy needs from a backend.
pub trait StorageInteractor:
    StorageReader + StorageWriter + StorageLister + StorageMover + Send + Sync
{
}

impl<T> StorageInteractor for T where
    T: StorageReader + StorageWriter + StorageLister + StorageMover + Send + Sync
{
}

pub mod error {
    use std::io;

    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum StorageError {
        #[error("object '{0}' not found")]
        NotFound(String),

        #[error("invalid object key '{key}': {reason}")]
        InvalidKey { key: String, reason: String },

        #[error("[storage io][{action}]: {cause}")]
        Io {
            action: String,
            #[source]
            cause: io::Error,
        },
    }

    impl StorageError {
        pub(crate) fn io(action: impl Into<String>, cause: io::Error) -> Self {
            StorageError::Io {
                action: action.into(),
                cause,
            }
        }
    }
}
