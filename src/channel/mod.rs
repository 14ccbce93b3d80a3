//! Multiplexed channel streams
//!
//! Every service (shell, exec, SFTP, SCP, forwards) runs on a [`Stream`]: a
//! pump task that owns exactly one protocol channel, applies send-window flow
//! control and only pushes inbound data while the consumer has [`Demand`].

mod flow;
mod registry;
mod stream;
mod transport;

use thiserror::Error;

pub use flow::FlowWindow;
pub use registry::{ChannelEntry, ChannelKind, ChannelRegistry};
pub use stream::{Demand, ExitStatus, Stream, StreamWriter};
pub use transport::{ChannelEvent, ChannelTransport, MemoryChannel, DEFAULT_MAX_PACKET};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Nothing available right now; retry on the next loop turn.
    #[error("Operation would block")]
    WouldBlock,

    #[error("Channel closed")]
    Closed,

    #[error("Stream cancelled")]
    Cancelled,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io(err.to_string())
    }
}

impl From<russh::Error> for StreamError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => StreamError::Closed,
            other => StreamError::Channel(other.to_string()),
        }
    }
}

impl From<StreamError> for crate::ssh::SshError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(msg) => crate::ssh::SshError::Io(std::io::Error::other(msg)),
            other => crate::ssh::SshError::Channel(other.to_string()),
        }
    }
}
