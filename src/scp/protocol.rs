//! SCP wire format
//!
//! Control records are single text lines (`C`, `D`, `E`, `T`). Every record
//! and every file body is answered with an ack byte: `\0` ok, `\1` warning
//! followed by a message line, `\2` fatal followed by a message line.

use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tracing::trace;

use super::ScpError;
use crate::channel::{ExitStatus, Stream};

pub const ACK_OK: u8 = 0;
pub const ACK_WARNING: u8 = 1;
pub const ACK_FATAL: u8 = 2;

/// Longest control line accepted from the peer.
const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Warning(String),
    Fatal(String),
}

/// One control record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpRecord {
    /// `D<mode> 0 <name>`: enter a new directory
    Directory { mode: u32, name: String },
    /// `E`: leave the current directory
    EndDirectory,
    /// `C<mode> <size> <name>`: a file body of `size` bytes follows
    File { mode: u32, size: u64, name: String },
    /// `T<mtime> 0 <atime> 0`: times for the next record
    Time { mtime: u64, atime: u64 },
}

impl ScpRecord {
    pub fn encode(&self) -> String {
        match self {
            ScpRecord::Directory { mode, name } => format!("D{:04o} 0 {}\n", mode & 0o7777, name),
            ScpRecord::EndDirectory => "E\n".to_string(),
            ScpRecord::File { mode, size, name } => {
                format!("C{:04o} {} {}\n", mode & 0o7777, size, name)
            }
            ScpRecord::Time { mtime, atime } => format!("T{} 0 {} 0\n", mtime, atime),
        }
    }

    /// Parse one control line, without its trailing newline.
    pub fn parse(line: &str) -> Result<Self, ScpError> {
        let bad = || ScpError::Protocol(format!("malformed record: {:?}", line));
        let (tag, rest) = line.split_at(line.chars().next().map(char::len_utf8).ok_or_else(bad)?);
        match tag {
            "E" if rest.is_empty() => Ok(ScpRecord::EndDirectory),
            "C" | "D" => {
                let mut fields = rest.splitn(3, ' ');
                let mode = fields
                    .next()
                    .and_then(|m| u32::from_str_radix(m, 8).ok())
                    .ok_or_else(bad)?;
                let size: u64 = fields.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
                let name = fields.next().filter(|n| valid_name(n)).ok_or_else(bad)?;
                if tag == "D" {
                    Ok(ScpRecord::Directory {
                        mode,
                        name: name.to_string(),
                    })
                } else {
                    Ok(ScpRecord::File {
                        mode,
                        size,
                        name: name.to_string(),
                    })
                }
            }
            "T" => {
                let fields: Vec<u64> = rest
                    .split(' ')
                    .map(|f| f.parse().map_err(|_| bad()))
                    .collect::<Result<_, _>>()?;
                match fields.as_slice() {
                    [mtime, _, atime, _] => Ok(ScpRecord::Time {
                        mtime: *mtime,
                        atime: *atime,
                    }),
                    _ => Err(bad()),
                }
            }
            _ => Err(bad()),
        }
    }
}

/// A peer-supplied name must stay inside the current directory.
fn valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

pub fn to_date(secs: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs.min(i64::MAX as u64) as i64, 0)
}

/// Framed access to the channel of a running `scp` process.
pub struct ScpChannel {
    stream: Stream,
    buffer: BytesMut,
}

impl ScpChannel {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), ScpError> {
        self.stream.write(data).await?;
        Ok(())
    }

    pub async fn send_record(&self, record: &ScpRecord) -> Result<(), ScpError> {
        trace!("SCP send {:?}", record);
        self.send(record.encode()).await
    }

    pub async fn send_ok(&self) -> Result<(), ScpError> {
        self.send(Bytes::from_static(&[ACK_OK])).await
    }

    /// Report a failure to the peer.
    pub async fn send_error(&self, fatal: bool, message: &str) -> Result<(), ScpError> {
        let code = if fatal { ACK_FATAL } else { ACK_WARNING };
        let mut out = Vec::with_capacity(message.len() + 2);
        out.push(code);
        out.extend_from_slice(message.replace('\n', " ").as_bytes());
        out.push(b'\n');
        self.send(out).await
    }

    /// Pull more bytes into the buffer; `false` at end of stream.
    async fn fill(&mut self, polled: bool) -> Result<bool, ScpError> {
        let next = if polled {
            self.stream.read_polled().await?
        } else {
            self.stream.read().await?
        };
        match next {
            Some(data) => {
                self.buffer.extend_from_slice(&data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Next byte, or `None` at end of stream.
    pub async fn read_byte(&mut self) -> Result<Option<u8>, ScpError> {
        while self.buffer.is_empty() {
            if !self.fill(false).await? {
                return Ok(None);
            }
        }
        Ok(Some(self.buffer.get_u8()))
    }

    /// One line without its newline.
    pub async fn read_line(&mut self) -> Result<String, ScpError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(pos + 1);
                return Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
            }
            if self.buffer.len() > MAX_LINE {
                return Err(ScpError::Protocol("control line too long".into()));
            }
            if !self.fill(false).await? {
                return Err(ScpError::UnexpectedEof);
            }
        }
    }

    pub async fn read_ack(&mut self) -> Result<Ack, ScpError> {
        match self.read_byte().await? {
            Some(ACK_OK) => Ok(Ack::Ok),
            Some(ACK_WARNING) => Ok(Ack::Warning(self.read_line().await?)),
            Some(ACK_FATAL) => Ok(Ack::Fatal(self.read_line().await?)),
            Some(other) => {
                // some servers print a bare message instead of a coded ack
                let mut text = vec![other];
                text.extend_from_slice(self.read_line().await?.as_bytes());
                Ok(Ack::Fatal(String::from_utf8_lossy(&text).into_owned()))
            }
            None => Err(ScpError::UnexpectedEof),
        }
    }

    /// Read an ack and turn anything but `Ok` into an error.
    pub async fn expect_ok(&mut self) -> Result<(), ScpError> {
        match self.read_ack().await? {
            Ack::Ok => Ok(()),
            Ack::Warning(message) => Err(ScpError::Rejected(message)),
            Ack::Fatal(message) => Err(ScpError::Remote(message)),
        }
    }

    /// Up to `max` bytes of a file body, using polled reads.
    pub async fn read_body(&mut self, max: usize) -> Result<Bytes, ScpError> {
        if self.buffer.is_empty() && !self.fill(true).await? {
            return Err(ScpError::UnexpectedEof);
        }
        let n = self.buffer.len().min(max);
        Ok(self.buffer.split_to(n).freeze())
    }

    pub async fn send_eof(&self) -> Result<(), ScpError> {
        self.stream.send_eof().await?;
        Ok(())
    }

    /// Drain what is left of the channel and return the exit status.
    pub async fn finish(&mut self) -> Result<Option<ExitStatus>, ScpError> {
        self.buffer.clear();
        Ok(self.stream.finish().await?)
    }
}
