//! In-process SSH agent
//!
//! Holds an append-only ring of [`Signer`]s and answers ssh-agent requests
//! for them. Keys are looked up by public blob equality, never by position.
//! The agent is served over any async byte stream ([`SshAgent::serve`]),
//! which is how the agent authenticator talks to it, or on a Unix socket.

pub mod protocol;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use protocol::{rsa_hash_for_flags, Identity, Request, Response, MAX_MESSAGE_LEN};

use crate::keys::{KeyError, KeyType, PublicKey, RemotePublicKey, SharedSigner, Signer};
use crate::wire::WireError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Malformed agent message: {0}")]
    Malformed(String),

    #[error("Agent message of {0} bytes exceeds the limit")]
    TooLarge(usize),

    #[error("No matching key in agent")]
    KeyNotFound,

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WireError> for AgentError {
    fn from(e: WireError) -> Self {
        AgentError::Malformed(e.to_string())
    }
}

#[derive(Default)]
pub struct SshAgent {
    keys: RwLock<Vec<SharedSigner>>,
}

impl std::fmt::Debug for SshAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshAgent").field("keys", &self.keys.read().len()).finish()
    }
}

impl SshAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `signer` to the ring.
    pub fn load_key(&self, signer: SharedSigner) {
        debug!(
            "Agent loaded {} key{}",
            signer.key_type(),
            signer.comment().map(|c| format!(" ({})", c)).unwrap_or_default()
        );
        self.keys.write().push(signer);
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.keys
            .read()
            .iter()
            .filter_map(|key| match key.public_blob() {
                Ok(blob) => Some(Identity {
                    blob,
                    comment: key.comment().unwrap_or_default().to_string(),
                }),
                Err(e) => {
                    warn!("Agent skipping key without public blob: {}", e);
                    None
                }
            })
            .collect()
    }

    /// The ring entry whose public blob equals `blob`.
    ///
    /// The requested blob is decoded and re-encoded first so an equivalent
    /// but differently framed encoding still matches.
    pub fn find(&self, blob: &[u8]) -> Option<SharedSigner> {
        let canonical = RemotePublicKey::from_blob(blob)
            .and_then(|key| key.public_blob())
            .unwrap_or_else(|_| blob.to_vec());
        self.keys
            .read()
            .iter()
            .find(|key| key.public_blob().map(|b| b == canonical).unwrap_or(false))
            .cloned()
    }

    /// Sign `data` with the key matching `blob`; `flags` pick the RSA hash.
    pub fn sign(&self, blob: &[u8], data: &[u8], flags: u32) -> Result<Vec<u8>, AgentError> {
        let signer = self.find(blob).ok_or(AgentError::KeyNotFound)?;
        let hash = match signer.key_type() {
            KeyType::Rsa => rsa_hash_for_flags(flags),
            _ => None,
        };
        Ok(signer.sign(data, hash)?)
    }

    /// Answer one unframed request. Every failure becomes `SSH_AGENT_FAILURE`.
    pub fn handle_request(&self, message: &[u8]) -> Vec<u8> {
        let response = match Request::parse(message) {
            Ok(Request::RequestIdentities) => Response::Identities(self.identities()),
            Ok(Request::Sign { key_blob, data, flags }) => match self.sign(&key_blob, &data, flags) {
                Ok(signature) => Response::Signature(signature),
                Err(e) => {
                    debug!("Agent sign request failed: {}", e);
                    Response::Failure
                }
            },
            Ok(Request::Unknown(kind)) => {
                debug!("Agent request type {} not supported", kind);
                Response::Failure
            }
            Err(e) => {
                debug!("Agent request rejected: {}", e);
                Response::Failure
            }
        };
        response.encode()
    }

    /// Serve length-framed requests on `stream` until the client hangs up.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let len = match stream.read_u32().await {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if len > MAX_MESSAGE_LEN {
                return Err(AgentError::TooLarge(len));
            }
            let mut message = vec![0u8; len];
            stream.read_exact(&mut message).await?;
            trace!("Agent request of {} bytes", len);

            let reply = self.handle_request(&message);
            stream.write_u32(reply.len() as u32).await?;
            stream.write_all(&reply).await?;
            stream.flush().await?;
        }
    }
}

#[cfg(unix)]
mod unix {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use tokio::net::UnixListener;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    use super::{AgentError, SshAgent};
    use crate::reactor::Reactor;

    /// A running agent socket; stops and removes the socket on drop.
    pub struct AgentListener {
        path: PathBuf,
        shutdown: CancellationToken,
    }

    impl AgentListener {
        pub fn path(&self) -> &Path {
            &self.path
        }

        pub fn stop(&self) {
            if !self.shutdown.is_cancelled() {
                self.shutdown.cancel();
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    impl Drop for AgentListener {
        fn drop(&mut self) {
            self.stop();
        }
    }

    impl SshAgent {
        /// Listen on a Unix socket at `path`, usable as `SSH_AUTH_SOCK`.
        pub fn serve_unix(
            self: &Arc<Self>,
            path: impl AsRef<Path>,
            reactor: &Reactor,
        ) -> Result<AgentListener, AgentError> {
            let path = path.as_ref().to_path_buf();
            // a stale socket from an earlier run blocks the bind
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let listener = UnixListener::bind(&path)?;
            info!("Agent listening on {}", path.display());

            let shutdown = CancellationToken::new();
            let token = shutdown.clone();
            let agent = self.clone();
            let spawner = reactor.clone();
            reactor.spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((socket, _)) => {
                                let agent = agent.clone();
                                let token = token.clone();
                                spawner.spawn(async move {
                                    tokio::select! {
                                        result = agent.serve(socket) => {
                                            if let Err(e) = result {
                                                debug!("Agent client ended: {}", e);
                                            }
                                        }
                                        _ = token.cancelled() => {}
                                    }
                                });
                            }
                            Err(e) => {
                                warn!("Agent socket accept failed: {}", e);
                                break;
                            }
                        },
                    }
                }
                debug!("Agent socket closed");
            });

            Ok(AgentListener { path, shutdown })
        }
    }
}

#[cfg(unix)]
pub use unix::AgentListener;
