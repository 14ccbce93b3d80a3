//! Remote `scp -f` into a translator

use std::sync::Arc;

use tracing::{debug, warn};

use super::depth::DepthCounter;
use super::protocol::{to_date, ScpChannel, ScpRecord, ACK_FATAL, ACK_WARNING};
use super::{check_exit, ScpError, ScpOptions, ScpReport};
use crate::channel::Stream;
use crate::translator::{
    base_name, CopyProgress, FileAttributes, ProgressReporter, Translator, TranslatorError,
};

/// Receives what a remote `scp -f` sends and stores it in a translator.
pub struct ScpSource {
    channel: ScpChannel,
    depth: DepthCounter,
    options: ScpOptions,
    reporter: Arc<dyn ProgressReporter>,
    report: ScpReport,
    /// Times from a `T` record, applied to the next item
    times: Option<(u64, u64)>,
}

struct OpenDir {
    cursor: Box<dyn Translator>,
    /// Attributes to apply once the directory is complete
    attributes: Option<FileAttributes>,
}

impl ScpSource {
    pub fn new(stream: Stream, options: ScpOptions, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            channel: ScpChannel::new(stream),
            depth: DepthCounter::new(),
            options,
            reporter,
            report: ScpReport::default(),
            times: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.depth()
    }

    pub async fn run(&mut self, destination: &dyn Translator) -> Result<ScpReport, ScpError> {
        if !destination.stat().await?.is_dir() {
            return Err(TranslatorError::NotADirectory(destination.current_path().to_string()).into());
        }
        let mut stack = vec![OpenDir {
            cursor: destination.clone_box(),
            attributes: None,
        }];

        self.channel.send_ok().await?;
        while let Some(code) = self.channel.read_byte().await? {
            match code {
                ACK_WARNING => {
                    let message = self.channel.read_line().await?;
                    warn!("SCP remote: {}", message);
                    self.report.warnings.push(message);
                    continue;
                }
                ACK_FATAL => return Err(ScpError::Remote(self.channel.read_line().await?)),
                _ => {}
            }
            let line = format!("{}{}", code as char, self.channel.read_line().await?);
            let record = match ScpRecord::parse(&line) {
                Ok(record) => record,
                Err(e) => {
                    let _ = self.channel.send_error(true, &e.to_string()).await;
                    return Err(e);
                }
            };
            debug!("SCP received {:?}", record);

            match record {
                ScpRecord::Time { mtime, atime } => {
                    self.times = Some((mtime, atime));
                    self.channel.send_ok().await?;
                }
                ScpRecord::Directory { mode, name } => {
                    let attributes = self.attributes(FileAttributes::directory(&name), mode);
                    let parent = current(&stack)?;
                    let cursor = match parent.mkdir(&name, &attributes).await {
                        Ok(cursor) => cursor,
                        Err(TranslatorError::AlreadyExists(_)) => parent.walk_to(&name).await?,
                        Err(e) => {
                            // the remote would send the directory's contents regardless
                            let _ = self.channel.send_error(true, &e.to_string()).await;
                            return Err(e.into());
                        }
                    };
                    self.depth.push();
                    self.report.directories += 1;
                    stack.push(OpenDir {
                        cursor,
                        attributes: self.options.preserve.then_some(attributes),
                    });
                    self.channel.send_ok().await?;
                }
                ScpRecord::EndDirectory => {
                    if !self.depth.leave() {
                        return Err(ScpError::Protocol("end of directory at top level".into()));
                    }
                    if let Some(OpenDir {
                        cursor,
                        attributes: Some(attributes),
                    }) = stack.pop()
                    {
                        let attributes = FileAttributes {
                            name: base_name(cursor.current_path()).to_string(),
                            ..attributes
                        };
                        if let Err(e) = cursor.wstat(&attributes).await {
                            debug!("Could not set times on {}: {}", cursor.current_path(), e);
                        }
                    }
                    self.channel.send_ok().await?;
                }
                ScpRecord::File { mode, size, name } => {
                    let attributes = self.attributes(FileAttributes::file(&name, size), mode);
                    self.receive_file(current(&stack)?, attributes).await?;
                }
            }
        }

        if self.depth.depth() != 0 {
            return Err(ScpError::Protocol(format!(
                "stream ended inside {} open directories",
                self.depth.depth()
            )));
        }
        check_exit(self.channel.finish().await?)?;
        Ok(std::mem::take(&mut self.report))
    }

    fn attributes(&mut self, base: FileAttributes, mode: u32) -> FileAttributes {
        let mut attributes = base.with_permissions(mode);
        if let Some((mtime, _)) = self.times.take() {
            attributes.modification_date = to_date(mtime);
        }
        attributes
    }

    async fn receive_file(
        &mut self,
        parent: &dyn Translator,
        attributes: FileAttributes,
    ) -> Result<(), ScpError> {
        let size = attributes.size.unwrap_or(0);
        let mut file = match parent.create(&attributes.name, &attributes).await {
            Ok(file) => file,
            Err(e) if e.is_fatal() => {
                let _ = self.channel.send_error(true, &e.to_string()).await;
                return Err(e.into());
            }
            Err(e) => {
                // refusing the header makes the remote skip the body
                warn!("SCP cannot create {}: {}", attributes.name, e);
                self.report.warnings.push(format!("{}: {}", attributes.name, e));
                self.channel.send_error(false, &e.to_string()).await?;
                return Ok(());
            }
        };
        self.channel.send_ok().await?;

        let mut progress = CopyProgress {
            name: attributes.name.clone(),
            size,
            written: 0,
        };
        self.reporter.start(&progress.name, size);
        let mut failure = None;
        while progress.written < size {
            let want = (size - progress.written).min(self.options.chunk_size.max(1) as u64) as usize;
            let chunk = self.channel.read_body(want).await?;
            progress.written += chunk.len() as u64;
            // keep draining after a local failure so the wire stays in sync
            if failure.is_none() {
                if let Err(e) = file.write(chunk).await {
                    failure = Some(e);
                }
            }
            self.reporter.report(&progress);
        }
        if size == 0 {
            self.reporter.report(&progress);
        }
        if let Err(e) = file.close().await {
            failure.get_or_insert(e);
        }
        self.channel.expect_ok().await?;

        match failure {
            None => {
                if self.options.preserve {
                    self.preserve(parent, &attributes).await;
                }
                self.report.files += 1;
                self.report.bytes += size;
                self.channel.send_ok().await
            }
            Some(e) if e.is_fatal() => {
                let _ = self.channel.send_error(true, &e.to_string()).await;
                Err(e.into())
            }
            Some(e) => {
                warn!("SCP failed to store {}: {}", attributes.name, e);
                self.report.warnings.push(format!("{}: {}", attributes.name, e));
                self.channel.send_error(false, &e.to_string()).await
            }
        }
    }

    async fn preserve(&self, parent: &dyn Translator, attributes: &FileAttributes) {
        let applied = match parent.walk_to(&attributes.name).await {
            Ok(target) => target
                .wstat(&FileAttributes {
                    name: base_name(target.current_path()).to_string(),
                    size: None,
                    ..attributes.clone()
                })
                .await,
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            debug!("Could not preserve attributes of {}: {}", attributes.name, e);
        }
    }
}

fn current(stack: &[OpenDir]) -> Result<&dyn Translator, ScpError> {
    stack
        .last()
        .map(|dir| dir.cursor.as_ref())
        .ok_or_else(|| ScpError::Protocol("no open directory".into()))
}
