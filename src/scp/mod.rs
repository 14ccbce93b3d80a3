//! SCP copy over an exec channel
//!
//! [`upload`] runs `scp -t` on the server and feeds it a translator tree
//! ([`ScpSink`]); [`download`] runs `scp -f` and writes what the server sends
//! into a translator ([`ScpSource`]). Directory nesting on the wire is tracked
//! by a [`DepthCounter`].

mod depth;
mod protocol;
mod sink;
mod source;

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

pub use depth::DepthCounter;
pub use protocol::{Ack, ScpChannel, ScpRecord, ACK_FATAL, ACK_OK, ACK_WARNING};
pub use sink::ScpSink;
pub use source::ScpSource;

use crate::channel::{ExitStatus, StreamError};
use crate::ssh::{Session, SshError};
use crate::translator::{ProgressReporter, Translator, TranslatorError, DEFAULT_CHUNK_SIZE};

#[derive(Error, Debug)]
pub enum ScpError {
    #[error("SSH error: {0}")]
    Ssh(#[from] SshError),

    #[error("Channel error: {0}")]
    Stream(#[from] StreamError),

    #[error("{0}")]
    Translator(#[from] TranslatorError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Fatal error reported by the remote scp
    #[error("Remote scp: {0}")]
    Remote(String),

    /// The remote scp refused one item
    #[error("Remote scp rejected item: {0}")]
    Rejected(String),

    #[error("Unexpected end of scp stream")]
    UnexpectedEof,

    #[error("Remote scp exited with status {0}")]
    Exit(u32),
}

#[derive(Debug, Clone)]
pub struct ScpOptions {
    /// Allow directories (`-r`)
    pub recursive: bool,
    /// Transfer modes and times (`-p`)
    pub preserve: bool,
    pub chunk_size: usize,
}

impl Default for ScpOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            preserve: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ScpOptions {
    fn command(&self, mode: &str, path: &str) -> String {
        let mut command = format!("scp {}", mode);
        if self.recursive {
            command.push_str(" -r");
        }
        if self.preserve {
            command.push_str(" -p");
        }
        command.push(' ');
        command.push_str(&shell_quote(path));
        command
    }
}

#[derive(Debug, Default)]
pub struct ScpReport {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    /// Non-fatal messages from either side, one per skipped item
    pub warnings: Vec<String>,
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn check_exit(status: Option<ExitStatus>) -> Result<(), ScpError> {
    match status {
        Some(ExitStatus::Code(0)) | None => Ok(()),
        Some(ExitStatus::Code(code)) => Err(ScpError::Exit(code)),
        Some(ExitStatus::Signal(signal)) => Err(ScpError::Remote(format!("killed by {}", signal))),
    }
}

/// Copy `source` (file, or directory with `recursive`) to `target` on the
/// server.
pub async fn upload(
    session: &Session,
    source: &dyn Translator,
    target: &str,
    options: &ScpOptions,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<ScpReport, ScpError> {
    let command = options.command("-t", target);
    info!("SCP upload {} -> {}:{}", source.current_path(), session.host(), target);
    let stream = session.exec(&command).await?;
    let mut sink = ScpSink::new(stream, options.clone(), reporter);
    sink.run(source).await
}

/// Copy `remote` from the server into the directory `destination`.
pub async fn download(
    session: &Session,
    remote: &str,
    destination: &dyn Translator,
    options: &ScpOptions,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<ScpReport, ScpError> {
    let command = options.command("-f", remote);
    info!("SCP download {}:{} -> {}", session.host(), remote, destination.current_path());
    let stream = session.exec(&command).await?;
    let mut source = ScpSource::new(stream, options.clone(), reporter);
    source.run(destination).await
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_command_lines() {
        let options = ScpOptions::default();
        assert_eq!(options.command("-t", "/srv/www"), "scp -t -r '/srv/www'");
        let options = ScpOptions {
            recursive: false,
            preserve: true,
            ..ScpOptions::default()
        };
        assert_eq!(options.command("-f", "it's.txt"), "scp -f -p 'it'\\''s.txt'");
    }

    #[test]
    fn test_exit_status_mapping() {
        assert!(check_exit(None).is_ok());
        assert!(check_exit(Some(ExitStatus::Code(0))).is_ok());
        assert!(matches!(check_exit(Some(ExitStatus::Code(1))), Err(ScpError::Exit(1))));
        assert!(matches!(
            check_exit(Some(ExitStatus::Signal("TERM".into()))),
            Err(ScpError::Remote(_))
        ));
    }
}
