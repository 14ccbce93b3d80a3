//! SFTP request layer
//!
//! [`SftpBackend`] is one call per SFTP request. [`RawBackend`] implements it
//! over `russh_sftp`'s raw session with a per-request timeout; tests use an
//! in-memory backend.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use russh_sftp::client::error::Error as SftpClientError;
use russh_sftp::client::RawSftpSession;
use russh_sftp::protocol::{FileAttributes as RemoteAttrs, OpenFlags, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::reactor::Reactor;
use crate::translator::{FileAttributes, FileType, TranslatorError};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// One directory entry as the server reports it (not following links).
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub filename: String,
    pub attrs: RemoteAttrs,
}

#[async_trait]
pub trait SftpBackend: Send + Sync + 'static {
    async fn realpath(&self, path: &str) -> Result<String, TranslatorError>;

    async fn stat(&self, path: &str) -> Result<RemoteAttrs, TranslatorError>;

    async fn lstat(&self, path: &str) -> Result<RemoteAttrs, TranslatorError>;

    async fn setstat(&self, path: &str, attrs: RemoteAttrs) -> Result<(), TranslatorError>;

    /// Returns the server's file handle.
    async fn open(&self, path: &str, flags: OpenFlags, attrs: RemoteAttrs)
        -> Result<String, TranslatorError>;

    async fn close(&self, handle: &str) -> Result<(), TranslatorError>;

    /// Empty at end of file.
    async fn read(&self, handle: &str, offset: u64, len: u32) -> Result<Bytes, TranslatorError>;

    async fn write(&self, handle: &str, offset: u64, data: Bytes) -> Result<(), TranslatorError>;

    async fn opendir(&self, path: &str) -> Result<String, TranslatorError>;

    /// Empty once the listing is exhausted.
    async fn readdir(&self, handle: &str) -> Result<Vec<RemoteEntry>, TranslatorError>;

    async fn mkdir(&self, path: &str, attrs: RemoteAttrs) -> Result<(), TranslatorError>;

    async fn rmdir(&self, path: &str) -> Result<(), TranslatorError>;

    async fn remove(&self, path: &str) -> Result<(), TranslatorError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), TranslatorError>;

    async fn readlink(&self, path: &str) -> Result<String, TranslatorError>;

    async fn symlink(&self, path: &str, target: &str) -> Result<(), TranslatorError>;
}

/// [`SftpBackend`] over a `russh_sftp` raw session.
pub struct RawBackend {
    session: RawSftpSession,
    reactor: Reactor,
    timeout: Duration,
}

impl RawBackend {
    /// Run the SFTP version handshake over `stream`.
    pub async fn connect<S>(stream: S, reactor: Reactor, timeout: Duration) -> Result<Self, TranslatorError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let backend = Self {
            session: RawSftpSession::new(stream),
            reactor,
            timeout,
        };
        let version = backend.call("init", backend.session.init()).await?;
        debug!("SFTP session initialized (version {})", version.version);
        Ok(backend)
    }

    async fn raw<T, F>(&self, what: &str, fut: F) -> Result<Result<T, SftpClientError>, TranslatorError>
    where
        F: Future<Output = Result<T, SftpClientError>>,
    {
        self.reactor
            .timeout(self.timeout, fut)
            .await
            .map_err(|_| TranslatorError::Timeout(what.to_string()))
    }

    async fn call<T, F>(&self, what: &str, fut: F) -> Result<T, TranslatorError>
    where
        F: Future<Output = Result<T, SftpClientError>>,
    {
        self.raw(what, fut).await?.map_err(|e| map_error(e, what))
    }
}

#[async_trait]
impl SftpBackend for RawBackend {
    async fn realpath(&self, path: &str) -> Result<String, TranslatorError> {
        let name = self.call(path, self.session.realpath(path)).await?;
        name.files
            .into_iter()
            .next()
            .map(|f| f.filename)
            .ok_or_else(|| TranslatorError::Protocol(format!("realpath({}) returned no name", path)))
    }

    async fn stat(&self, path: &str) -> Result<RemoteAttrs, TranslatorError> {
        Ok(self.call(path, self.session.stat(path)).await?.attrs)
    }

    async fn lstat(&self, path: &str) -> Result<RemoteAttrs, TranslatorError> {
        Ok(self.call(path, self.session.lstat(path)).await?.attrs)
    }

    async fn setstat(&self, path: &str, attrs: RemoteAttrs) -> Result<(), TranslatorError> {
        self.call(path, self.session.setstat(path, attrs)).await?;
        Ok(())
    }

    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: RemoteAttrs,
    ) -> Result<String, TranslatorError> {
        Ok(self.call(path, self.session.open(path, flags, attrs)).await?.handle)
    }

    async fn close(&self, handle: &str) -> Result<(), TranslatorError> {
        self.call("close", self.session.close(handle)).await?;
        Ok(())
    }

    async fn read(&self, handle: &str, offset: u64, len: u32) -> Result<Bytes, TranslatorError> {
        match self.raw("read", self.session.read(handle, offset, len)).await? {
            Ok(data) => Ok(Bytes::from(data.data)),
            Err(SftpClientError::Status(status)) if status.status_code == StatusCode::Eof => {
                Ok(Bytes::new())
            }
            Err(e) => Err(map_error(e, "read")),
        }
    }

    async fn write(&self, handle: &str, offset: u64, data: Bytes) -> Result<(), TranslatorError> {
        self.call("write", self.session.write(handle, offset, data.to_vec()))
            .await?;
        Ok(())
    }

    async fn opendir(&self, path: &str) -> Result<String, TranslatorError> {
        Ok(self.call(path, self.session.opendir(path)).await?.handle)
    }

    async fn readdir(&self, handle: &str) -> Result<Vec<RemoteEntry>, TranslatorError> {
        match self.raw("readdir", self.session.readdir(handle)).await? {
            Ok(name) => Ok(name
                .files
                .into_iter()
                .map(|f| RemoteEntry {
                    filename: f.filename,
                    attrs: f.attrs,
                })
                .collect()),
            Err(SftpClientError::Status(status)) if status.status_code == StatusCode::Eof => {
                Ok(Vec::new())
            }
            Err(e) => Err(map_error(e, "readdir")),
        }
    }

    async fn mkdir(&self, path: &str, attrs: RemoteAttrs) -> Result<(), TranslatorError> {
        self.call(path, self.session.mkdir(path, attrs)).await?;
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), TranslatorError> {
        self.call(path, self.session.rmdir(path)).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), TranslatorError> {
        self.call(path, self.session.remove(path)).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TranslatorError> {
        self.call(from, self.session.rename(from, to)).await?;
        Ok(())
    }

    async fn readlink(&self, path: &str) -> Result<String, TranslatorError> {
        let name = self.call(path, self.session.readlink(path)).await?;
        name.files
            .into_iter()
            .next()
            .map(|f| f.filename)
            .ok_or_else(|| TranslatorError::Protocol(format!("readlink({}) returned no name", path)))
    }

    async fn symlink(&self, path: &str, target: &str) -> Result<(), TranslatorError> {
        self.call(path, self.session.symlink(path, target)).await?;
        Ok(())
    }
}

fn map_error(err: SftpClientError, what: &str) -> TranslatorError {
    match err {
        SftpClientError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => TranslatorError::NotFound(what.to_string()),
            StatusCode::PermissionDenied => TranslatorError::PermissionDenied(what.to_string()),
            StatusCode::OpUnsupported => TranslatorError::Unsupported(what.to_string()),
            StatusCode::NoConnection | StatusCode::ConnectionLost => {
                TranslatorError::Connection(format!("{}: {}", what, status.error_message))
            }
            _ => TranslatorError::Protocol(format!("{}: {}", what, status.error_message)),
        },
        SftpClientError::Timeout => TranslatorError::Timeout(what.to_string()),
        SftpClientError::IO(msg) => TranslatorError::Connection(msg),
        other => TranslatorError::Protocol(format!("{}: {}", what, other)),
    }
}

pub fn remote_file_type(attrs: &RemoteAttrs) -> FileType {
    match attrs.permissions.map(|p| p & S_IFMT) {
        Some(S_IFDIR) => FileType::Directory,
        Some(S_IFREG) => FileType::File,
        Some(S_IFLNK) => FileType::Symlink,
        _ => FileType::Unknown,
    }
}

/// SFTP attributes to the generic attribute map.
pub fn to_attributes(name: &str, attrs: &RemoteAttrs) -> FileAttributes {
    let file_type = remote_file_type(attrs);
    let mut out = FileAttributes::new(name, file_type);
    out.size = attrs.size;
    out.permissions = attrs.permissions.map(|p| p & 0o7777);
    out.modification_date = attrs
        .mtime
        .and_then(|t| DateTime::from_timestamp(t as i64, 0));
    out
}

/// The settable part of the generic attribute map as SFTP attributes.
pub fn to_remote(attributes: &FileAttributes) -> RemoteAttrs {
    let mut attrs = RemoteAttrs::empty();
    attrs.permissions = attributes.permissions.map(|p| p & 0o7777);
    if let Some(date) = attributes.modification_date {
        let secs = date.timestamp().clamp(0, u32::MAX as i64) as u32;
        // SFTP v3 sets both times together
        attrs.mtime = Some(secs);
        attrs.atime = Some(secs);
    }
    attrs
}
