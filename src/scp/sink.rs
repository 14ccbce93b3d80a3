//! Translator tree to a remote `scp -t`

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::depth::DepthCounter;
use super::protocol::{Ack, ScpChannel, ScpRecord};
use super::{check_exit, ScpError, ScpOptions, ScpReport};
use crate::channel::Stream;
use crate::translator::{
    CopyProgress, FileAttributes, FileType, ProgressReporter, Translator, TranslatorError,
};

/// Feeds a translator tree to a remote `scp -t`.
pub struct ScpSink {
    channel: ScpChannel,
    depth: DepthCounter,
    options: ScpOptions,
    reporter: Arc<dyn ProgressReporter>,
    report: ScpReport,
}

struct Pending {
    entry: Box<dyn Translator>,
    attributes: FileAttributes,
    /// Depth of the directory this entry lives in
    level: usize,
}

impl ScpSink {
    pub fn new(stream: Stream, options: ScpOptions, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            channel: ScpChannel::new(stream),
            depth: DepthCounter::new(),
            options,
            reporter,
            report: ScpReport::default(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.depth()
    }

    pub async fn run(&mut self, source: &dyn Translator) -> Result<ScpReport, ScpError> {
        self.channel.expect_ok().await?;

        let root = source.stat().await?;
        if root.is_dir() && !self.options.recursive {
            return Err(TranslatorError::IsADirectory(source.current_path().to_string()).into());
        }
        let mut pending = vec![Pending {
            entry: source.clone_box(),
            attributes: root,
            level: 0,
        }];

        while let Some(Pending {
            entry,
            attributes,
            level,
        }) = pending.pop()
        {
            self.leave_to(level).await?;
            match attributes.file_type {
                FileType::Directory => {
                    if !self.enter_directory(&attributes).await? {
                        continue;
                    }
                    let children = match entry.directory_files_and_attributes().await {
                        Ok(children) => children,
                        Err(e) => {
                            self.skip(entry.current_path(), e)?;
                            continue;
                        }
                    };
                    let level = self.depth.depth();
                    let mut walked = Vec::with_capacity(children.len());
                    for child in children {
                        match resolve(entry.as_ref(), child, level).await {
                            Ok(next) => walked.push(next),
                            Err(e) => self.skip(entry.current_path(), e)?,
                        }
                    }
                    // stack: last pushed is sent first
                    pending.extend(walked.into_iter().rev());
                }
                FileType::File => self.send_file(entry.as_ref(), &attributes).await?,
                other => debug!("SCP skipping {} ({})", entry.current_path(), other),
            }
        }

        self.leave_to(0).await?;
        self.channel.send_eof().await?;
        check_exit(self.channel.finish().await?)?;
        Ok(std::mem::take(&mut self.report))
    }

    fn skip(&mut self, path: &str, error: TranslatorError) -> Result<(), ScpError> {
        if error.is_fatal() {
            return Err(error.into());
        }
        warn!("SCP skipping {}: {}", path, error);
        self.report.warnings.push(format!("{}: {}", path, error));
        Ok(())
    }

    async fn leave_to(&mut self, level: usize) -> Result<(), ScpError> {
        for _ in 0..self.depth.levels_above(level) {
            self.channel.send_record(&ScpRecord::EndDirectory).await?;
            self.channel.expect_ok().await?;
            self.depth.leave();
        }
        Ok(())
    }

    /// Send the record and read the answer; `false` when the remote refused
    /// the item.
    async fn announce(&mut self, record: ScpRecord) -> Result<bool, ScpError> {
        self.channel.send_record(&record).await?;
        match self.channel.read_ack().await? {
            Ack::Ok => Ok(true),
            Ack::Warning(message) => {
                warn!("SCP remote refused {:?}: {}", record, message);
                self.report.warnings.push(message);
                Ok(false)
            }
            Ack::Fatal(message) => Err(ScpError::Remote(message)),
        }
    }

    async fn send_times(&mut self, attributes: &FileAttributes) -> Result<bool, ScpError> {
        if !self.options.preserve {
            return Ok(true);
        }
        let Some(date) = attributes.modification_date else {
            return Ok(true);
        };
        let secs = date.timestamp().max(0) as u64;
        self.announce(ScpRecord::Time {
            mtime: secs,
            atime: secs,
        })
        .await
    }

    async fn enter_directory(&mut self, attributes: &FileAttributes) -> Result<bool, ScpError> {
        if !self.send_times(attributes).await? {
            return Ok(false);
        }
        let accepted = self
            .announce(ScpRecord::Directory {
                mode: attributes.mode_or(0o755),
                name: attributes.name.clone(),
            })
            .await?;
        if accepted {
            self.depth.push();
            self.report.directories += 1;
        }
        Ok(accepted)
    }

    async fn send_file(
        &mut self,
        entry: &dyn Translator,
        attributes: &FileAttributes,
    ) -> Result<(), ScpError> {
        let mut reader = match entry.open().await {
            Ok(reader) => reader,
            Err(e) => return self.skip(entry.current_path(), e),
        };
        let size = attributes.size.unwrap_or(0);
        if !self.send_times(attributes).await? {
            return Ok(());
        }
        let accepted = self
            .announce(ScpRecord::File {
                mode: attributes.mode_or(0o644),
                size,
                name: attributes.name.clone(),
            })
            .await?;
        if !accepted {
            return Ok(());
        }

        let mut progress = CopyProgress {
            name: attributes.name.clone(),
            size,
            written: 0,
        };
        self.reporter.start(&progress.name, size);
        while progress.written < size {
            let want = (size - progress.written).min(self.options.chunk_size.max(1) as u64) as usize;
            // the header promised `size` bytes: a failed read desyncs the wire
            let chunk = reader.read(want).await?;
            if chunk.is_empty() {
                return Err(ScpError::Protocol(format!(
                    "{} shrank while sending ({} of {} bytes)",
                    entry.current_path(),
                    progress.written,
                    size
                )));
            }
            progress.written += chunk.len() as u64;
            self.channel.send(chunk).await?;
            self.reporter.report(&progress);
        }
        if size == 0 {
            self.reporter.report(&progress);
        }
        if let Err(e) = reader.close().await {
            debug!("Closing {} failed: {}", entry.current_path(), e);
        }

        self.channel.send(Bytes::from_static(&[0])).await?;
        match self.channel.read_ack().await? {
            Ack::Ok => {
                self.report.files += 1;
                self.report.bytes += size;
            }
            Ack::Warning(message) => {
                warn!("SCP remote failed to store {}: {}", attributes.name, message);
                self.report.warnings.push(message);
            }
            Ack::Fatal(message) => return Err(ScpError::Remote(message)),
        }
        Ok(())
    }
}

/// Walk into a listed child; symlinks are sent as what they point to.
async fn resolve(
    parent: &dyn Translator,
    child: FileAttributes,
    level: usize,
) -> Result<Pending, TranslatorError> {
    let entry = parent.walk_to(&child.name).await?;
    let attributes = if child.file_type == FileType::Symlink {
        FileAttributes {
            name: child.name.clone(),
            ..entry.stat().await?
        }
    } else {
        child
    };
    Ok(Pending {
        entry,
        attributes,
        level,
    })
}
