//! Local filesystem translator on `tokio::fs`

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{FileAttributes, FileType, Translator, TranslatorError, TranslatorFile};

#[derive(Debug, Clone)]
pub struct LocalTranslator {
    /// What `~` resolves to
    root: PathBuf,
    path: PathBuf,
    display: String,
    file_type: FileType,
}

impl LocalTranslator {
    /// Cursor on `path`, which is also the `~` root.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, TranslatorError> {
        let root = canonical(path.as_ref()).await?;
        Self::at(root.clone(), root).await
    }

    /// Cursor on the user's home directory.
    pub async fn home() -> Result<Self, TranslatorError> {
        let home = dirs::home_dir()
            .ok_or_else(|| TranslatorError::NotFound("home directory".to_string()))?;
        Self::new(home).await
    }

    async fn at(root: PathBuf, path: PathBuf) -> Result<Self, TranslatorError> {
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(e, &path))?;
        Ok(Self {
            root,
            display: path.to_string_lossy().to_string(),
            path,
            file_type: file_type_of(&metadata.file_type()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling path named `name`, when that differs from this one.
    fn renamed_path(&self, name: &str) -> Result<Option<PathBuf>, TranslatorError> {
        let current = self.path.file_name().map(|n| n.to_string_lossy());
        if name.is_empty() || current.as_deref() == Some(name) {
            return Ok(None);
        }
        let single = Path::new(name).components().count() == 1
            && !name.contains(['/', '\\'])
            && name != "."
            && name != "..";
        match self.path.parent() {
            Some(parent) if single => Ok(Some(parent.join(name))),
            _ => Err(TranslatorError::Unsupported(format!(
                "rename of {} to {} leaves its directory",
                self.display, name
            ))),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if path == "~" {
            self.root.clone()
        } else if let Some(rest) = path.strip_prefix("~/") {
            self.root.join(rest)
        } else {
            // absolute paths replace the base on join
            self.path.join(path)
        }
    }

    fn expect_directory(&self) -> Result<(), TranslatorError> {
        if self.file_type != FileType::Directory {
            return Err(TranslatorError::NotADirectory(self.display.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Translator for LocalTranslator {
    fn current_path(&self) -> &str {
        &self.display
    }

    fn file_type(&self) -> FileType {
        self.file_type
    }

    fn clone_box(&self) -> Box<dyn Translator> {
        Box::new(self.clone())
    }

    async fn walk_to(&self, path: &str) -> Result<Box<dyn Translator>, TranslatorError> {
        let target = canonical(&self.resolve(path)).await?;
        debug!("Local walk {} -> {}", self.display, target.display());
        Ok(Box::new(Self::at(self.root.clone(), target).await?))
    }

    async fn stat(&self) -> Result<FileAttributes, TranslatorError> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| io_error(e, &self.path))?;
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.display.clone());
        Ok(attributes_of(name, &metadata, file_type_of(&metadata.file_type())))
    }

    async fn directory_files_and_attributes(&self) -> Result<Vec<FileAttributes>, TranslatorError> {
        self.expect_directory()?;
        let mut dir = tokio::fs::read_dir(&self.path)
            .await
            .map_err(|e| io_error(e, &self.path))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = match tokio::fs::symlink_metadata(entry.path()).await {
                Ok(m) => m,
                // raced with a removal
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let file_type = file_type_of(&metadata.file_type());
            entries.push(attributes_of(name, &metadata, file_type));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open(&self) -> Result<Box<dyn TranslatorFile>, TranslatorError> {
        if self.file_type == FileType::Directory {
            return Err(TranslatorError::IsADirectory(self.display.clone()));
        }
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| io_error(e, &self.path))?;
        Ok(Box::new(LocalFile { file }))
    }

    async fn create(
        &self,
        name: &str,
        attributes: &FileAttributes,
    ) -> Result<Box<dyn TranslatorFile>, TranslatorError> {
        self.expect_directory()?;
        let path = self.path.join(name);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| io_error(e, &path))?;
        if let Some(mode) = attributes.permissions {
            set_mode(&path, mode).await?;
        }
        Ok(Box::new(LocalFile { file }))
    }

    async fn mkdir(
        &self,
        name: &str,
        attributes: &FileAttributes,
    ) -> Result<Box<dyn Translator>, TranslatorError> {
        self.expect_directory()?;
        let path = self.path.join(name);
        tokio::fs::create_dir(&path)
            .await
            .map_err(|e| io_error(e, &path))?;
        if let Some(mode) = attributes.permissions {
            set_mode(&path, mode).await?;
        }
        Ok(Box::new(Self::at(self.root.clone(), path).await?))
    }

    async fn remove(&self) -> Result<(), TranslatorError> {
        if self.file_type == FileType::Directory {
            return Err(TranslatorError::IsADirectory(self.display.clone()));
        }
        tokio::fs::remove_file(&self.path)
            .await
            .map_err(|e| io_error(e, &self.path))
    }

    async fn rmdir(&self) -> Result<(), TranslatorError> {
        self.expect_directory()?;
        tokio::fs::remove_dir(&self.path)
            .await
            .map_err(|e| io_error(e, &self.path))
    }

    async fn wstat(&self, attributes: &FileAttributes) -> Result<(), TranslatorError> {
        let path = match self.renamed_path(&attributes.name)? {
            Some(to) => {
                tokio::fs::rename(&self.path, &to)
                    .await
                    .map_err(|e| io_error(e, &self.path))?;
                debug!("Renamed {} -> {}", self.display, to.display());
                to
            }
            None => self.path.clone(),
        };
        if let Some(mode) = attributes.permissions {
            set_mode(&path, mode).await?;
        }
        if let Some(date) = attributes.modification_date {
            let modified: SystemTime = date.into();
            tokio::task::spawn_blocking(move || {
                std::fs::File::open(&path)
                    .and_then(|f| f.set_modified(modified))
                    .map_err(|e| io_error(e, &path))
            })
            .await
            .map_err(|e| TranslatorError::Io(std::io::Error::other(e)))??;
        }
        Ok(())
    }
}

struct LocalFile {
    file: tokio::fs::File,
}

#[async_trait]
impl TranslatorFile for LocalFile {
    async fn read(&mut self, max: usize) -> Result<Bytes, TranslatorError> {
        let mut buf = vec![0u8; max];
        let n = self.file.read(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write(&mut self, data: Bytes) -> Result<(), TranslatorError> {
        self.file.write_all(&data).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TranslatorError> {
        self.file.flush().await?;
        Ok(())
    }
}

async fn canonical(path: &Path) -> Result<PathBuf, TranslatorError> {
    tokio::fs::canonicalize(path)
        .await
        .map_err(|e| io_error(e, path))
}

fn io_error(e: std::io::Error, path: &Path) -> TranslatorError {
    let shown = path.display().to_string();
    match e.kind() {
        ErrorKind::NotFound => TranslatorError::NotFound(shown),
        ErrorKind::PermissionDenied => TranslatorError::PermissionDenied(shown),
        ErrorKind::AlreadyExists => TranslatorError::AlreadyExists(shown),
        _ => TranslatorError::Io(e),
    }
}

fn file_type_of(ft: &std::fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_file() {
        FileType::File
    } else {
        FileType::Unknown
    }
}

fn attributes_of(name: String, metadata: &std::fs::Metadata, file_type: FileType) -> FileAttributes {
    let mut attrs = FileAttributes::new(name, file_type);
    if file_type == FileType::File {
        attrs.size = Some(metadata.len());
    }
    attrs.permissions = Some(mode_of(metadata));
    attrs.modification_date = metadata.modified().ok().map(DateTime::<Utc>::from);
    attrs.creation_date = metadata.created().ok().map(DateTime::<Utc>::from);
    attrs
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<(), TranslatorError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
        .await
        .map_err(|e| io_error(e, path))
}

#[cfg(not(unix))]
async fn set_mode(path: &Path, mode: u32) -> Result<(), TranslatorError> {
    let mut permissions = tokio::fs::metadata(path)
        .await
        .map_err(|e| io_error(e, path))?
        .permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    tokio::fs::set_permissions(path, permissions)
        .await
        .map_err(|e| io_error(e, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_walk_and_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"hello").unwrap();

        let root = LocalTranslator::new(dir.path()).await.unwrap();
        assert_eq!(root.file_type(), FileType::Directory);

        let sub = root.walk_to("sub").await.unwrap();
        let entries = sub.directory_files_and_attributes().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, Some(5));

        let file = sub.walk_to("a.txt").await.unwrap();
        assert_eq!(file.file_type(), FileType::File);
        let back = file.walk_to("~/sub").await.unwrap();
        assert_eq!(back.current_path(), sub.current_path());

        assert!(matches!(
            root.walk_to("missing").await,
            Err(TranslatorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_read_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let root = LocalTranslator::new(dir.path()).await.unwrap();

        let mut file = root
            .create("data.bin", &FileAttributes::file("data.bin", 4))
            .await
            .unwrap();
        file.write(Bytes::from_static(b"abcd")).await.unwrap();
        file.close().await.unwrap();

        let cursor = root.walk_to("data.bin").await.unwrap();
        let mut reader = cursor.open().await.unwrap();
        assert_eq!(&reader.read(16).await.unwrap()[..], b"abcd");
        assert!(reader.read(16).await.unwrap().is_empty());

        assert!(matches!(
            root.remove().await,
            Err(TranslatorError::IsADirectory(_))
        ));
        cursor.remove().await.unwrap();
        assert!(!dir.path().join("data.bin").exists());
    }

    #[tokio::test]
    async fn test_mkdir_rmdir_and_wstat() {
        let dir = tempfile::tempdir().unwrap();
        let root = LocalTranslator::new(dir.path()).await.unwrap();

        let created = root
            .mkdir("nested", &FileAttributes::directory("nested"))
            .await
            .unwrap();
        assert_eq!(created.file_type(), FileType::Directory);
        assert!(matches!(
            root.mkdir("nested", &FileAttributes::directory("nested")).await,
            Err(TranslatorError::AlreadyExists(_))
        ));

        let date = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        created
            .wstat(&FileAttributes::directory("nested").with_modification_date(date))
            .await
            .unwrap();
        assert_eq!(created.stat().await.unwrap().modification_date, Some(date));

        created.rmdir().await.unwrap();
        assert!(!dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn test_wstat_renames_within_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), b"abc").unwrap();
        let root = LocalTranslator::new(dir.path()).await.unwrap();
        let file = root.walk_to("old.txt").await.unwrap();

        let date = DateTime::from_timestamp(1_500_000_000, 0).unwrap();
        file.wstat(&FileAttributes::file("new.txt", 3).with_modification_date(date))
            .await
            .unwrap();
        assert!(!dir.path().join("old.txt").exists());
        assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"abc");
        let renamed = root.walk_to("new.txt").await.unwrap();
        assert_eq!(renamed.stat().await.unwrap().modification_date, Some(date));

        assert!(matches!(
            renamed.wstat(&FileAttributes::file("../out.txt", 3)).await,
            Err(TranslatorError::Unsupported(_))
        ));
        assert!(dir.path().join("new.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_applies_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let root = LocalTranslator::new(dir.path()).await.unwrap();
        let mut file = root
            .create("run.sh", &FileAttributes::file("run.sh", 0).with_permissions(0o750))
            .await
            .unwrap();
        file.close().await.unwrap();
        let attrs = root.walk_to("run.sh").await.unwrap().stat().await.unwrap();
        assert_eq!(attrs.permissions, Some(0o750));
    }
}
