//! ssh-agent wire protocol (draft-miller-ssh-agent)
//!
//! Every message is `byte type || payload`; on a socket each message is
//! preceded by its u32 length. Integers are big-endian, strings are
//! `u32 length || bytes`.

use russh::keys::ssh_key::HashAlg;

use super::AgentError;
use crate::wire::{SshReader, SshWriter};

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
pub const SSH_AGENT_SIGN_RESPONSE: u8 = 14;

/// Sign request flags selecting the RSA hash
pub const SSH_AGENT_RSA_SHA2_256: u32 = 0x02;
pub const SSH_AGENT_RSA_SHA2_512: u32 = 0x04;

/// Largest framed message accepted from a client
pub const MAX_MESSAGE_LEN: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    RequestIdentities,
    Sign {
        key_blob: Vec<u8>,
        data: Vec<u8>,
        flags: u32,
    },
    /// Any message type this agent does not implement
    Unknown(u8),
}

impl Request {
    pub fn parse(message: &[u8]) -> Result<Self, AgentError> {
        let mut reader = SshReader::new(message);
        match reader.get_u8()? {
            SSH_AGENTC_REQUEST_IDENTITIES => Ok(Request::RequestIdentities),
            SSH_AGENTC_SIGN_REQUEST => {
                let key_blob = reader.get_string()?.to_vec();
                let data = reader.get_string()?.to_vec();
                // some clients omit the flags word
                let flags = if reader.is_empty() { 0 } else { reader.get_u32()? };
                Ok(Request::Sign { key_blob, data, flags })
            }
            other => Ok(Request::Unknown(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = SshWriter::new();
        match self {
            Request::RequestIdentities => {
                writer.put_u8(SSH_AGENTC_REQUEST_IDENTITIES);
            }
            Request::Sign { key_blob, data, flags } => {
                writer
                    .put_u8(SSH_AGENTC_SIGN_REQUEST)
                    .put_string(key_blob)
                    .put_string(data)
                    .put_u32(*flags);
            }
            Request::Unknown(kind) => {
                writer.put_u8(*kind);
            }
        }
        writer.into_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub blob: Vec<u8>,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Identities(Vec<Identity>),
    /// Wire-form signature: `string(algorithm) || string(raw)`
    Signature(Vec<u8>),
    Failure,
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = SshWriter::new();
        match self {
            Response::Identities(identities) => {
                writer
                    .put_u8(SSH_AGENT_IDENTITIES_ANSWER)
                    .put_u32(identities.len() as u32);
                for identity in identities {
                    writer
                        .put_string(&identity.blob)
                        .put_string(identity.comment.as_bytes());
                }
            }
            Response::Signature(signature) => {
                writer.put_u8(SSH_AGENT_SIGN_RESPONSE).put_string(signature);
            }
            Response::Failure => {
                writer.put_u8(SSH_AGENT_FAILURE);
            }
        }
        writer.into_vec()
    }

    pub fn parse(message: &[u8]) -> Result<Self, AgentError> {
        let mut reader = SshReader::new(message);
        match reader.get_u8()? {
            SSH_AGENT_IDENTITIES_ANSWER => {
                let count = reader.get_u32()?;
                let mut identities = Vec::new();
                for _ in 0..count {
                    let blob = reader.get_string()?.to_vec();
                    let comment = String::from_utf8_lossy(reader.get_string()?).into_owned();
                    identities.push(Identity { blob, comment });
                }
                Ok(Response::Identities(identities))
            }
            SSH_AGENT_SIGN_RESPONSE => Ok(Response::Signature(reader.get_string()?.to_vec())),
            SSH_AGENT_FAILURE => Ok(Response::Failure),
            other => Err(AgentError::Malformed(format!("unexpected response type {}", other))),
        }
    }
}

/// RSA hash requested by the sign flags; SHA-512 wins when both are set.
pub fn rsa_hash_for_flags(flags: u32) -> Option<HashAlg> {
    if flags & SSH_AGENT_RSA_SHA2_512 != 0 {
        Some(HashAlg::Sha512)
    } else if flags & SSH_AGENT_RSA_SHA2_256 != 0 {
        Some(HashAlg::Sha256)
    } else {
        None
    }
}
