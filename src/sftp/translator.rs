//! SFTP-backed [`Translator`]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh_sftp::protocol::{FileAttributes as RemoteAttrs, OpenFlags};
use tracing::{debug, info, warn};

use super::backend::{remote_file_type, to_attributes, to_remote, RawBackend, SftpBackend};
use super::path_utils::{
    join_remote_path, normalize_remote_path, parent_remote_path, resolve_remote_path,
};
use super::pipeline::{ReadPipeline, WritePipeline};
use super::SftpOptions;
use crate::ssh::Session;
use crate::translator::{
    base_name, FileAttributes, FileType, Translator, TranslatorError, TranslatorFile,
};

const DUPLEX_BUFFER: usize = 256 * 1024;

struct SftpShared {
    backend: Arc<dyn SftpBackend>,
    /// Canonical home directory
    root: String,
    options: SftpOptions,
}

/// Cursor on one path of a remote SFTP server.
///
/// Clones share the SFTP session.
#[derive(Clone)]
pub struct SftpTranslator {
    shared: Arc<SftpShared>,
    path: String,
    file_type: FileType,
}

impl std::fmt::Debug for SftpTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpTranslator")
            .field("path", &self.path)
            .field("file_type", &self.file_type)
            .finish()
    }
}

impl SftpTranslator {
    /// Start the `sftp` subsystem on `session` and position the cursor at the
    /// remote home directory.
    pub async fn open(session: &Session, options: SftpOptions) -> Result<Self, TranslatorError> {
        let stream = session
            .subsystem("sftp")
            .await
            .map_err(|e| TranslatorError::Connection(e.to_string()))?;
        let backend = RawBackend::connect(
            stream.into_duplex(DUPLEX_BUFFER),
            session.reactor().clone(),
            options.request_timeout(),
        )
        .await?;
        let translator = Self::with_backend(Arc::new(backend), options).await?;
        info!(
            "SFTP session opened on {} (home {})",
            session.id(),
            translator.shared.root
        );
        Ok(translator)
    }

    /// Cursor over an already initialized backend.
    pub async fn with_backend(
        backend: Arc<dyn SftpBackend>,
        options: SftpOptions,
    ) -> Result<Self, TranslatorError> {
        let root = backend.realpath(".").await?;
        let shared = Arc::new(SftpShared {
            backend,
            root: root.clone(),
            options,
        });
        Ok(Self {
            shared,
            path: root,
            file_type: FileType::Directory,
        })
    }

    pub fn root(&self) -> &str {
        &self.shared.root
    }

    pub fn options(&self) -> &SftpOptions {
        &self.shared.options
    }

    fn backend(&self) -> &dyn SftpBackend {
        self.shared.backend.as_ref()
    }

    fn cursor(&self, path: String, file_type: FileType) -> Self {
        Self {
            shared: self.shared.clone(),
            path,
            file_type,
        }
    }

    fn child_path(&self, name: &str) -> Result<String, TranslatorError> {
        if self.file_type != FileType::Directory {
            return Err(TranslatorError::NotADirectory(self.path.clone()));
        }
        Ok(join_remote_path(&self.path, name))
    }

    /// Resolve `path` to a cursor on the concrete type.
    pub async fn walk(&self, path: &str) -> Result<SftpTranslator, TranslatorError> {
        let wanted = resolve_remote_path(&self.shared.root, &self.path, path);
        let canonical = self.backend().realpath(&wanted).await.map_err(|e| match e {
            TranslatorError::Protocol(_) => TranslatorError::NotFound(wanted.clone()),
            other => other,
        })?;
        let attrs = self.backend().stat(&canonical).await?;
        debug!("SFTP walk {} -> {}", wanted, canonical);
        Ok(self.cursor(canonical, remote_file_type(&attrs)))
    }

    /// Target of the symbolic link at `path`.
    pub async fn read_link(&self, path: &str) -> Result<String, TranslatorError> {
        let path = resolve_remote_path(&self.shared.root, &self.path, path);
        self.backend().readlink(&path).await
    }

    /// Create a symbolic link `name` in this directory pointing at `target`.
    pub async fn symlink(&self, name: &str, target: &str) -> Result<(), TranslatorError> {
        let path = self.child_path(name)?;
        self.backend().symlink(&path, target).await
    }

    /// Rename this path; the cursor moves with it.
    ///
    /// Relative targets are siblings of this path.
    pub async fn rename(&mut self, to: &str) -> Result<(), TranslatorError> {
        let parent = parent_remote_path(&self.path);
        let to = normalize_remote_path(&resolve_remote_path(&self.shared.root, &parent, to));
        self.backend().rename(&self.path, &to).await?;
        self.path = to;
        Ok(())
    }

    /// Open this file for writing at its end.
    pub async fn append(&self) -> Result<SftpFile, TranslatorError> {
        let attrs = self.backend().stat(&self.path).await?;
        let handle = self
            .backend()
            .open(&self.path, OpenFlags::WRITE | OpenFlags::APPEND, RemoteAttrs::empty())
            .await?;
        Ok(SftpFile::writer(&self.shared, handle, attrs.size.unwrap_or(0)))
    }

    async fn list(&self) -> Result<Vec<FileAttributes>, TranslatorError> {
        if self.file_type != FileType::Directory {
            return Err(TranslatorError::NotADirectory(self.path.clone()));
        }
        let backend = self.backend();
        let handle = backend.opendir(&self.path).await?;
        let mut out = Vec::new();
        let result = async {
            loop {
                let batch = backend.readdir(&handle).await?;
                if batch.is_empty() {
                    break;
                }
                for entry in batch {
                    if entry.filename == "." || entry.filename == ".." {
                        continue;
                    }
                    out.push(to_attributes(&entry.filename, &entry.attrs));
                }
            }
            Ok::<(), TranslatorError>(())
        }
        .await;
        if let Err(e) = backend.close(&handle).await {
            debug!("SFTP close of directory {} failed: {}", self.path, e);
        }
        result?;
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

#[async_trait]
impl Translator for SftpTranslator {
    fn current_path(&self) -> &str {
        &self.path
    }

    fn file_type(&self) -> FileType {
        self.file_type
    }

    fn clone_box(&self) -> Box<dyn Translator> {
        Box::new(self.clone())
    }

    async fn walk_to(&self, path: &str) -> Result<Box<dyn Translator>, TranslatorError> {
        Ok(Box::new(self.walk(path).await?))
    }

    async fn stat(&self) -> Result<FileAttributes, TranslatorError> {
        let attrs = self.backend().stat(&self.path).await?;
        Ok(to_attributes(base_name(&self.path), &attrs))
    }

    async fn directory_files_and_attributes(&self) -> Result<Vec<FileAttributes>, TranslatorError> {
        self.list().await
    }

    async fn open(&self) -> Result<Box<dyn TranslatorFile>, TranslatorError> {
        if self.file_type == FileType::Directory {
            return Err(TranslatorError::IsADirectory(self.path.clone()));
        }
        let handle = self
            .backend()
            .open(&self.path, OpenFlags::READ, RemoteAttrs::empty())
            .await?;
        Ok(Box::new(SftpFile::reader(&self.shared, handle)))
    }

    async fn create(
        &self,
        name: &str,
        attributes: &FileAttributes,
    ) -> Result<Box<dyn TranslatorFile>, TranslatorError> {
        let path = self.child_path(name)?;
        let mut attrs = RemoteAttrs::empty();
        attrs.permissions = attributes.permissions;
        let handle = self
            .backend()
            .open(
                &path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                attrs,
            )
            .await?;
        Ok(Box::new(SftpFile::writer(&self.shared, handle, 0)))
    }

    async fn mkdir(
        &self,
        name: &str,
        attributes: &FileAttributes,
    ) -> Result<Box<dyn Translator>, TranslatorError> {
        let path = self.child_path(name)?;
        let mut attrs = RemoteAttrs::empty();
        attrs.permissions = attributes.permissions;
        if let Err(e) = self.backend().mkdir(&path, attrs).await {
            // SFTP v3 has no distinct status for this
            if self.backend().lstat(&path).await.is_ok() {
                return Err(TranslatorError::AlreadyExists(path));
            }
            return Err(e);
        }
        Ok(Box::new(self.cursor(path, FileType::Directory)))
    }

    async fn remove(&self) -> Result<(), TranslatorError> {
        if self.file_type == FileType::Directory {
            return Err(TranslatorError::IsADirectory(self.path.clone()));
        }
        self.backend().remove(&self.path).await
    }

    async fn rmdir(&self) -> Result<(), TranslatorError> {
        if self.file_type != FileType::Directory {
            return Err(TranslatorError::NotADirectory(self.path.clone()));
        }
        self.backend().rmdir(&self.path).await
    }

    async fn wstat(&self, attributes: &FileAttributes) -> Result<(), TranslatorError> {
        let path = match renamed_path(&self.path, &attributes.name)? {
            Some(to) => {
                self.backend().rename(&self.path, &to).await?;
                debug!("SFTP renamed {} -> {}", self.path, to);
                to
            }
            None => self.path.clone(),
        };
        let attrs = to_remote(attributes);
        if attrs.permissions.is_none() && attrs.mtime.is_none() {
            return Ok(());
        }
        self.backend().setstat(&path, attrs).await
    }
}

/// New path when `name` differs from the last component of `path`.
fn renamed_path(path: &str, name: &str) -> Result<Option<String>, TranslatorError> {
    if name.is_empty() || name == base_name(path) {
        return Ok(None);
    }
    if name.contains('/') || name == "." || name == ".." {
        return Err(TranslatorError::Unsupported(format!(
            "rename of {} to {} leaves its directory",
            path, name
        )));
    }
    Ok(Some(join_remote_path(&parent_remote_path(path), name)))
}

/// Open remote file with a pipelined reader or writer.
pub struct SftpFile {
    backend: Arc<dyn SftpBackend>,
    handle: Arc<str>,
    reader: Option<ReadPipeline>,
    writer: Option<WritePipeline>,
    closed: bool,
}

impl SftpFile {
    fn reader(shared: &SftpShared, handle: String) -> Self {
        let handle: Arc<str> = Arc::from(handle);
        let reader = ReadPipeline::new(
            shared.backend.clone(),
            handle.clone(),
            0,
            None,
            shared.options.max_inflight,
            shared.options.block_size,
        );
        Self {
            backend: shared.backend.clone(),
            handle,
            reader: Some(reader),
            writer: None,
            closed: false,
        }
    }

    fn writer(shared: &SftpShared, handle: String, offset: u64) -> Self {
        let handle: Arc<str> = Arc::from(handle);
        let writer = WritePipeline::new(
            shared.backend.clone(),
            handle.clone(),
            offset,
            shared.options.max_inflight,
            shared.options.block_size,
        );
        Self {
            backend: shared.backend.clone(),
            handle,
            reader: None,
            writer: Some(writer),
            closed: false,
        }
    }

    /// Bytes acknowledged by the server so far.
    pub fn confirmed(&self) -> Option<u64> {
        self.writer.as_ref().map(|w| w.confirmed())
    }
}

#[async_trait]
impl TranslatorFile for SftpFile {
    async fn read(&mut self, max: usize) -> Result<Bytes, TranslatorError> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(max).await,
            None => Err(TranslatorError::Unsupported("read on a file opened for writing".into())),
        }
    }

    async fn write(&mut self, data: Bytes) -> Result<(), TranslatorError> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(data).await,
            None => Err(TranslatorError::Unsupported("write on a file opened for reading".into())),
        }
    }

    async fn close(&mut self) -> Result<(), TranslatorError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let flushed = match self.writer.as_mut() {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        };
        self.reader = None;
        let closed = self.backend.close(&self.handle).await;
        if let Err(e) = &closed {
            warn!("SFTP close failed: {}", e);
        }
        flushed.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::testing::{MemoryBackend, HOME};
    use crate::translator::{copy, CopyOptions, CopyProgress, LocalTranslator, ProgressReporter};
    use parking_lot::Mutex;

    async fn translator(backend: &Arc<MemoryBackend>) -> SftpTranslator {
        SftpTranslator::with_backend(backend.clone(), SftpOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_walk_resolves_home_and_relative() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/home/test/src/main.rs", b"fn main() {}");
        backend.put_dir("/etc");
        let root = translator(&backend).await;
        assert_eq!(root.current_path(), HOME);

        let src = root.walk("~/src").await.unwrap();
        assert_eq!(src.current_path(), "/home/test/src");
        assert_eq!(src.file_type(), FileType::Directory);

        let file = src.walk("main.rs").await.unwrap();
        assert_eq!(file.current_path(), "/home/test/src/main.rs");
        assert_eq!(file.file_type(), FileType::File);

        let etc = file.walk("/etc").await.unwrap();
        assert_eq!(etc.current_path(), "/etc");
        assert_eq!(etc.walk("~").await.unwrap().current_path(), HOME);

        let err = root.walk("missing").await.unwrap_err();
        assert!(matches!(err, TranslatorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_listing_skips_dots_and_types_symlinks() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/home/test/a.txt", b"abc");
        backend.put_dir("/home/test/dir");
        backend.put_link("/home/test/link", "/home/test/a.txt");
        let root = translator(&backend).await;

        let entries = root.directory_files_and_attributes().await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.file_type)).collect();
        assert_eq!(
            names,
            vec![
                ("a.txt", FileType::File),
                ("dir", FileType::Directory),
                ("link", FileType::Symlink),
            ]
        );
        assert_eq!(entries[0].size, Some(3));
        assert_eq!(root.read_link("link").await.unwrap(), "/home/test/a.txt");

        let followed = root.walk("link").await.unwrap();
        assert_eq!(followed.current_path(), "/home/test/a.txt");
    }

    #[tokio::test]
    async fn test_empty_write_issues_no_request() {
        let backend = Arc::new(MemoryBackend::new());
        let root = translator(&backend).await;

        let mut file = root.create("empty.txt", &FileAttributes::file("empty.txt", 0)).await.unwrap();
        file.write(Bytes::new()).await.unwrap();
        file.close().await.unwrap();

        assert_eq!(backend.write_requests(), 0);
        assert_eq!(backend.file("/home/test/empty.txt").unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_create_read_back_and_remove() {
        let backend = Arc::new(MemoryBackend::new());
        let root = translator(&backend).await;
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 97) as u8).collect();

        let mut file = root
            .create("blob.bin", &FileAttributes::file("blob.bin", payload.len() as u64).with_permissions(0o600))
            .await
            .unwrap();
        for chunk in payload.chunks(50_000) {
            file.write(Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        file.close().await.unwrap();
        assert_eq!(backend.mode("/home/test/blob.bin"), Some(0o600));

        let cursor = root.walk("blob.bin").await.unwrap();
        let attrs = cursor.stat().await.unwrap();
        assert_eq!(attrs.name, "blob.bin");
        assert_eq!(attrs.size, Some(payload.len() as u64));

        let mut reader = Translator::open(&cursor).await.unwrap();
        let mut back = Vec::new();
        loop {
            let chunk = reader.read(64 * 1024).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            back.extend_from_slice(&chunk);
        }
        reader.close().await.unwrap();
        assert_eq!(back, payload);
        assert!(backend.max_concurrent_reads() <= SftpOptions::default().max_inflight);

        cursor.remove().await.unwrap();
        assert!(!backend.exists("/home/test/blob.bin"));
    }

    #[tokio::test]
    async fn test_mkdir_existing_and_rmdir() {
        let backend = Arc::new(MemoryBackend::new());
        let root = translator(&backend).await;

        let dir = root.mkdir("out", &FileAttributes::directory("out").with_permissions(0o700)).await.unwrap();
        assert_eq!(dir.current_path(), "/home/test/out");
        assert_eq!(backend.mode("/home/test/out"), Some(0o700));

        assert!(matches!(
            root.mkdir("out", &FileAttributes::directory("out")).await,
            Err(TranslatorError::AlreadyExists(_))
        ));

        dir.wstat(&FileAttributes::directory("out").with_permissions(0o750)).await.unwrap();
        assert_eq!(backend.mode("/home/test/out"), Some(0o750));

        dir.rmdir().await.unwrap();
        assert!(!backend.exists("/home/test/out"));
    }

    #[tokio::test]
    async fn test_wstat_without_settable_fields_is_noop() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/home/test/f", b"x");
        let file = translator(&backend).await.walk("f").await.unwrap();
        file.wstat(&FileAttributes::file("f", 1)).await.unwrap();
        assert_eq!(backend.setstat_calls(), 0);
    }

    #[tokio::test]
    async fn test_rename_and_symlink() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/home/test/old", b"data");
        let root = translator(&backend).await;

        let mut file = root.walk("old").await.unwrap();
        file.rename("new").await.unwrap();
        assert_eq!(file.current_path(), "/home/test/new");
        assert_eq!(backend.file("/home/test/new").unwrap(), b"data");

        root.symlink("alias", "/home/test/new").await.unwrap();
        assert_eq!(root.read_link("alias").await.unwrap(), "/home/test/new");
    }

    #[tokio::test]
    async fn test_rename_to_parent_and_absolute() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/home/test/docs/a.txt", b"a");
        backend.put_dir("/tmp");
        let mut file = translator(&backend).await.walk("docs/a.txt").await.unwrap();

        file.rename("../b.txt").await.unwrap();
        assert_eq!(file.current_path(), "/home/test/b.txt");
        file.rename("/tmp/c.txt").await.unwrap();
        assert_eq!(file.current_path(), "/tmp/c.txt");
        file.rename("~/d.txt").await.unwrap();
        assert_eq!(backend.file("/home/test/d.txt").unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_wstat_renames_then_sets_mode() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("/home/test/old.txt", b"abc");
        let file = translator(&backend).await.walk("old.txt").await.unwrap();

        file.wstat(&FileAttributes::file("new.txt", 3).with_permissions(0o600))
            .await
            .unwrap();
        assert!(!backend.exists("/home/test/old.txt"));
        assert_eq!(backend.file("/home/test/new.txt").unwrap(), b"abc");
        assert_eq!(backend.mode("/home/test/new.txt"), Some(0o600));

        let moved = translator(&backend).await.walk("new.txt").await.unwrap();
        assert!(matches!(
            moved.wstat(&FileAttributes::file("../escape.txt", 3)).await,
            Err(TranslatorError::Unsupported(_))
        ));
        assert!(backend.exists("/home/test/new.txt"));
    }

    #[tokio::test]
    async fn test_copy_local_tree_to_remote() {
        let local = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(local.path().join("site/assets")).unwrap();
        std::fs::write(local.path().join("site/index.html"), b"<html></html>").unwrap();
        std::fs::write(local.path().join("site/assets/app.js"), vec![1u8; 70_000]).unwrap();

        let backend = Arc::new(MemoryBackend::new());
        let remote = translator(&backend).await;
        let source = LocalTranslator::new(local.path().join("site")).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter: Arc<dyn ProgressReporter> =
            Arc::new(move |p: &CopyProgress| sink.lock().push(p.clone()));
        let report = copy(&source, &remote, reporter, &CopyOptions::default()).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.files, 2);
        assert_eq!(report.bytes, 70_000 + 13);
        assert_eq!(backend.file("/home/test/site/assets/app.js").unwrap(), vec![1u8; 70_000]);
        assert_eq!(backend.file("/home/test/site/index.html").unwrap(), b"<html></html>");
        let complete = seen.lock().iter().filter(|p| p.is_complete()).count();
        assert_eq!(complete, 2);
    }
}
