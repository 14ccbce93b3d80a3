//! Recursive translator-to-translator copy with progress

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    base_name, FileAttributes, FileType, Translator, TranslatorError, DEFAULT_CHUNK_SIZE,
};

/// `(name, total size, bytes transferred)` for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyProgress {
    pub name: String,
    pub size: u64,
    pub written: u64,
}

impl CopyProgress {
    pub fn is_complete(&self) -> bool {
        self.written >= self.size
    }
}

/// Receives copy progress. `start` is called once per item, before its first
/// `report`.
pub trait ProgressReporter: Send + Sync {
    fn start(&self, _name: &str, _size: u64) {}

    fn report(&self, progress: &CopyProgress);
}

impl<F> ProgressReporter for F
where
    F: Fn(&CopyProgress) + Send + Sync,
{
    fn report(&self, progress: &CopyProgress) {
        self(progress)
    }
}

/// Forwards every report to a channel.
pub struct ChannelReporter(pub mpsc::UnboundedSender<CopyProgress>);

impl ProgressReporter for ChannelReporter {
    fn report(&self, progress: &CopyProgress) {
        let _ = self.0.send(progress.clone());
    }
}

/// Reporter that drops everything.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _progress: &CopyProgress) {}
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub chunk_size: usize,
    /// Copy permissions and modification dates
    pub preserve: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            preserve: true,
        }
    }
}

/// One item that could not be copied.
#[derive(Debug)]
pub struct CopyFailure {
    pub path: String,
    pub error: TranslatorError,
}

#[derive(Debug, Default)]
pub struct CopyReport {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    pub failures: Vec<CopyFailure>,
}

impl CopyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Copy `source` (file or directory tree) into the directory `destination`.
///
/// Per-item failures are collected in the report and the copy moves on; a
/// fatal error stops it and is returned.
pub async fn copy(
    source: &dyn Translator,
    destination: &dyn Translator,
    reporter: Arc<dyn ProgressReporter>,
    options: &CopyOptions,
) -> Result<CopyReport, TranslatorError> {
    if destination.file_type() != FileType::Directory {
        return Err(TranslatorError::NotADirectory(
            destination.current_path().to_string(),
        ));
    }
    let mut report = CopyReport::default();
    let attributes = source.stat().await?;
    copy_entry(source, destination, attributes, reporter.as_ref(), options, &mut report).await?;
    Ok(report)
}

fn copy_entry<'a>(
    source: &'a dyn Translator,
    destination: &'a dyn Translator,
    attributes: FileAttributes,
    reporter: &'a dyn ProgressReporter,
    options: &'a CopyOptions,
    report: &'a mut CopyReport,
) -> BoxFuture<'a, Result<(), TranslatorError>> {
    Box::pin(async move {
        let path = source.current_path().to_string();
        let result = match attributes.file_type {
            FileType::Directory => {
                copy_directory(source, destination, &attributes, reporter, options, report).await
            }
            FileType::File => copy_file(source, destination, &attributes, reporter, options)
                .await
                .map(|written| {
                    report.files += 1;
                    report.bytes += written;
                }),
            other => {
                debug!("Skipping {} ({})", path, other);
                Ok(())
            }
        };
        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Copy of {} failed: {}", path, e);
                report.failures.push(CopyFailure { path, error: e });
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    })
}

async fn copy_directory(
    source: &dyn Translator,
    destination: &dyn Translator,
    attributes: &FileAttributes,
    reporter: &dyn ProgressReporter,
    options: &CopyOptions,
    report: &mut CopyReport,
) -> Result<(), TranslatorError> {
    let target = match destination.mkdir(&attributes.name, attributes).await {
        Ok(target) => target,
        Err(TranslatorError::AlreadyExists(_)) => destination.walk_to(&attributes.name).await?,
        Err(e) => return Err(e),
    };
    report.directories += 1;

    for entry in source.directory_files_and_attributes().await? {
        let child = match source.walk_to(&entry.name).await {
            Ok(child) => child,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                report.failures.push(CopyFailure {
                    path: format!("{}/{}", source.current_path(), entry.name),
                    error: e,
                });
                continue;
            }
        };
        // listings report symlinks unresolved; copy what they point to
        let entry = if entry.file_type == FileType::Symlink {
            FileAttributes {
                name: entry.name.clone(),
                ..child.stat().await.unwrap_or(entry)
            }
        } else {
            entry
        };
        copy_entry(child.as_ref(), target.as_ref(), entry, reporter, options, report).await?;
    }

    if options.preserve {
        if let Err(e) = target.wstat(&preserved(attributes, target.as_ref())).await {
            debug!("Could not preserve attributes on {}: {}", target.current_path(), e);
        }
    }
    Ok(())
}

async fn copy_file(
    source: &dyn Translator,
    destination: &dyn Translator,
    attributes: &FileAttributes,
    reporter: &dyn ProgressReporter,
    options: &CopyOptions,
) -> Result<u64, TranslatorError> {
    let size = attributes.size.unwrap_or(0);
    let mut reader = source.open().await?;
    let mut writer = destination.create(&attributes.name, attributes).await?;
    let mut progress = CopyProgress {
        name: attributes.name.clone(),
        size,
        written: 0,
    };
    reporter.start(&progress.name, size);

    loop {
        let chunk = reader.read(options.chunk_size.max(1)).await?;
        if chunk.is_empty() {
            break;
        }
        progress.written += chunk.len() as u64;
        writer.write(chunk).await?;
        reporter.report(&progress);
    }
    writer.close().await?;
    reader.close().await?;
    if size == 0 {
        reporter.report(&progress);
    }

    if options.preserve {
        let target = destination.walk_to(&attributes.name).await?;
        if let Err(e) = target.wstat(&preserved(attributes, target.as_ref())).await {
            debug!("Could not preserve attributes on {}: {}", target.current_path(), e);
        }
    }
    Ok(progress.written)
}

/// Attributes to apply to `target` without renaming it.
fn preserved(attributes: &FileAttributes, target: &dyn Translator) -> FileAttributes {
    FileAttributes {
        name: base_name(target.current_path()).to_string(),
        size: None,
        creation_date: None,
        ..attributes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::LocalTranslator;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_recursive_copy_reports_progress() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("tree/empty")).unwrap();
        std::fs::write(src.path().join("tree/ten.bin"), [7u8; 10]).unwrap();

        let source = LocalTranslator::new(src.path().join("tree")).await.unwrap();
        let destination = LocalTranslator::new(dst.path()).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter: Arc<dyn ProgressReporter> =
            Arc::new(move |p: &CopyProgress| sink.lock().push(p.clone()));

        let report = copy(&source, &destination, reporter, &CopyOptions::default())
            .await
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(report.files, 1);
        assert_eq!(report.directories, 2);
        assert_eq!(report.bytes, 10);
        assert!(dst.path().join("tree/empty").is_dir());
        assert_eq!(std::fs::read(dst.path().join("tree/ten.bin")).unwrap(), vec![7u8; 10]);

        let complete: Vec<_> = seen.lock().iter().filter(|p| p.is_complete()).cloned().collect();
        assert_eq!(
            complete,
            vec![CopyProgress {
                name: "ten.bin".into(),
                size: 10,
                written: 10
            }]
        );
    }

    #[tokio::test]
    async fn test_destination_must_be_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let file = LocalTranslator::new(dir.path().join("f")).await.unwrap();
        let err = copy(&file, &file, Arc::new(NoProgress), &CopyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TranslatorError::NotADirectory(_)));
    }
}
