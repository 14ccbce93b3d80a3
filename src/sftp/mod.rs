//! SFTP service
//!
//! One `sftp` subsystem channel per [`SftpTranslator`] tree. Requests go
//! through an [`SftpBackend`]; file reads and writes are pipelined up to
//! [`SftpOptions::max_inflight`] outstanding blocks.

mod backend;
pub mod path_utils;
mod pipeline;
#[cfg(test)]
pub(crate) mod testing;
mod translator;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use backend::{remote_file_type, to_attributes, to_remote, RawBackend, RemoteEntry, SftpBackend};
pub use pipeline::{ReadPipeline, WritePipeline};
pub use translator::{SftpFile, SftpTranslator};

/// Default outstanding requests per open file
pub const DEFAULT_MAX_INFLIGHT: usize = 20;
/// Default request block size
pub const DEFAULT_BLOCK_SIZE: u32 = 32 * 1024;

fn default_max_inflight() -> usize {
    DEFAULT_MAX_INFLIGHT
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SftpOptions {
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,

    #[serde(default = "default_block_size")]
    pub block_size: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for SftpOptions {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            block_size: default_block_size(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SftpOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults_from_partial_json() {
        let options: SftpOptions = serde_json::from_str(r#"{"max_inflight": 4}"#).unwrap();
        assert_eq!(options.max_inflight, 4);
        assert_eq!(options.block_size, 32 * 1024);
        assert_eq!(options.request_timeout(), Duration::from_secs(30));
        assert_eq!(SftpOptions::default().max_inflight, 20);
    }
}
