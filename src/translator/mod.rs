//! Filesystem translators
//!
//! A [`Translator`] is a cursor on one path of some filesystem (local disk,
//! SFTP server, a host application's virtual tree). Navigation returns new
//! cursors; cloning a cursor yields an independent one over the same backing
//! session. SCP and SFTP copy into and out of translators and report progress
//! through [`ProgressReporter`].

mod copy;
mod local;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use copy::{
    copy, ChannelReporter, CopyFailure, CopyOptions, CopyProgress, CopyReport, NoProgress,
    ProgressReporter,
};
pub use local::LocalTranslator;

/// Default size of one read from a translator file.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Error, Debug)]
pub enum TranslatorError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing connection is gone
    #[error("Connection lost: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),
}

impl TranslatorError {
    /// Errors that end every later operation, not just the current item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TranslatorError::Connection(_) | TranslatorError::Timeout(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::File => "file",
            FileType::Directory => "directory",
            FileType::Symlink => "symlink",
            FileType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Generic attribute map shared by every translator.
///
/// Fields a backend does not know stay `None`; `wstat` only applies the
/// fields that are set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttributes {
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Permission bits (`0o7777` range)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<DateTime<Utc>>,
}

impl FileAttributes {
    pub fn new(name: impl Into<String>, file_type: FileType) -> Self {
        Self {
            file_type,
            name: name.into(),
            size: None,
            permissions: None,
            modification_date: None,
            creation_date: None,
        }
    }

    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            size: Some(size),
            ..Self::new(name, FileType::File)
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self::new(name, FileType::Directory)
    }

    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = Some(permissions & 0o7777);
        self
    }

    pub fn with_modification_date(mut self, date: DateTime<Utc>) -> Self {
        self.modification_date = Some(date);
        self
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Permission bits, or `default` when unknown.
    pub fn mode_or(&self, default: u32) -> u32 {
        self.permissions.map(|p| p & 0o7777).unwrap_or(default)
    }
}

/// An open file of a translator.
///
/// Reads return an empty buffer at end of file. Writes are appended at the
/// file's write cursor; `close` waits until every write is confirmed.
#[async_trait]
pub trait TranslatorFile: Send {
    async fn read(&mut self, max: usize) -> Result<Bytes, TranslatorError>;

    async fn write(&mut self, data: Bytes) -> Result<(), TranslatorError>;

    async fn close(&mut self) -> Result<(), TranslatorError>;
}

/// Cursor on one path of a filesystem.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Canonical path of this cursor.
    fn current_path(&self) -> &str;

    fn file_type(&self) -> FileType;

    /// Independent cursor on the same path and session.
    fn clone_box(&self) -> Box<dyn Translator>;

    /// Resolve `path` (absolute, `~`-relative or relative to this cursor) to
    /// a new cursor. Fails with `NotFound` when nothing exists there.
    async fn walk_to(&self, path: &str) -> Result<Box<dyn Translator>, TranslatorError>;

    async fn stat(&self) -> Result<FileAttributes, TranslatorError>;

    /// Entries of this directory, without `.` and `..`.
    async fn directory_files_and_attributes(&self) -> Result<Vec<FileAttributes>, TranslatorError>;

    /// Open this file for reading.
    async fn open(&self) -> Result<Box<dyn TranslatorFile>, TranslatorError>;

    /// Create (or truncate) file `name` inside this directory.
    async fn create(
        &self,
        name: &str,
        attributes: &FileAttributes,
    ) -> Result<Box<dyn TranslatorFile>, TranslatorError>;

    /// Create directory `name` inside this directory and walk into it.
    async fn mkdir(
        &self,
        name: &str,
        attributes: &FileAttributes,
    ) -> Result<Box<dyn Translator>, TranslatorError>;

    /// Remove this file.
    async fn remove(&self) -> Result<(), TranslatorError>;

    /// Remove this (empty) directory.
    async fn rmdir(&self) -> Result<(), TranslatorError>;

    /// Rename this item within its directory when `attributes.name` differs
    /// from its current name, then apply the set fields of `attributes`.
    ///
    /// The cursor keeps its old path; walk to the new name to go on using it.
    async fn wstat(&self, attributes: &FileAttributes) -> Result<(), TranslatorError>;
}

impl Clone for Box<dyn Translator> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Last component of a `/`-separated path.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_map_keys() {
        let attrs = FileAttributes::file("a.txt", 10).with_permissions(0o100644);
        let json = serde_json::to_value(&attrs).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["name"], "a.txt");
        assert_eq!(json["size"], 10);
        assert_eq!(json["permissions"], 0o644);
        assert!(json.get("modificationDate").is_none());

        let date = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let json = serde_json::to_value(FileAttributes::directory("d").with_modification_date(date)).unwrap();
        assert_eq!(json["type"], "directory");
        assert!(json.get("modificationDate").is_some());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(TranslatorError::Connection("gone".into()).is_fatal());
        assert!(TranslatorError::Timeout("read".into()).is_fatal());
        assert!(!TranslatorError::NotFound("x".into()).is_fatal());
        assert!(!TranslatorError::PermissionDenied("x".into()).is_fatal());
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/home/user/file.txt"), "file.txt");
        assert_eq!(base_name("dir/"), "dir");
        assert_eq!(base_name("plain"), "plain");
        assert_eq!(base_name("/"), "/");
    }
}
