//! Binary wire format shared with the inference peer.
//!
//! # Wire format
//!
//! ```text
//! GREETING (Peer -> Client):     "[Server] Ready."
//!
//! PROBE:
//!   Client -> Peer: "[Client] Resource query..."
//!   Peer -> Client: [4 bytes BE: f32 load][4 bytes BE: i32 connection class]
//!
//! TRANSFER:
//!   Client -> Peer: "[Client] File transfer..."
//!   Client -> Peer: [4 bytes BE: file count]
//!   PER FILE:
//!     Client -> Peer: [208 bytes: file header]
//!     Peer -> Client: [<= 1200 bytes: header ack]
//!     PER CHUNK (one per quantum):
//!       Client -> Peer: [chunk payload]
//!       Peer -> Client: [12 bytes: chunk ack]
//!     Peer -> Client: [2 bytes: final ack, "OK" continues]
//!
//! RESULTS (file count times):
//!   Peer -> Client: [<= 1200 bytes: file name]
//!   Client -> Peer: "OK"
//!   Peer -> Client: [<= 1200 bytes: result]
//!
//! FILE HEADER (208 bytes, integers BE):
//!   [128: name, zero padded][4: name_len][8: file_size][4: file_index]
//!   [32: reserved][32: checksum, hex MD5]
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{
    BUFFER_SIZE, CHECKSUM_LEN, CHUNK_ACK_LEN, FINAL_ACK_LEN, HEADER_LEN, NAME_FIELD_LEN,
    PROBE_REPLY_LEN, RESERVED_LEN,
};
use crate::error::ProtocolError;

const NAME_LEN_OFFSET: usize = NAME_FIELD_LEN;
const FILE_SIZE_OFFSET: usize = NAME_LEN_OFFSET + 4;
const FILE_INDEX_OFFSET: usize = FILE_SIZE_OFFSET + 8;
const RESERVED_OFFSET: usize = FILE_INDEX_OFFSET + 4;
const CHECKSUM_OFFSET: usize = RESERVED_OFFSET + RESERVED_LEN;

/// Hex-encoded MD5 digest as carried in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; CHECKSUM_LEN]);

impl Checksum {
    /// Parses a 32-character hex digest.
    pub fn from_hex(hex: &str) -> Result<Self, ProtocolError> {
        let bytes: [u8; CHECKSUM_LEN] = hex.as_bytes().try_into().map_err(|_| {
            ProtocolError::Violation(format!(
                "checksum must be {CHECKSUM_LEN} hex characters, got {}",
                hex.len()
            ))
        })?;
        Self::from_bytes(bytes)
    }

    fn from_bytes(bytes: [u8; CHECKSUM_LEN]) -> Result<Self, ProtocolError> {
        if !bytes.iter().all(u8::is_ascii_hexdigit) {
            return Err(ProtocolError::Violation(format!(
                "checksum is not hex: {:?}",
                String::from_utf8_lossy(&bytes)
            )));
        }
        Ok(Self(bytes))
    }

    /// Raw ASCII bytes as written on the wire.
    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Only ASCII hex digits are ever stored.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Truncates `name` to fit the header's name field without splitting a
/// UTF-8 sequence.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= NAME_FIELD_LEN {
        return name;
    }
    let mut end = NAME_FIELD_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Per-file header sent before the file body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// File name, at most [`NAME_FIELD_LEN`] bytes of UTF-8.
    pub name: String,
    /// Total file size in bytes.
    pub file_size: u64,
    /// Position of the file in the run, starting at 0.
    pub file_index: u32,
    /// Opaque padding, carried verbatim.
    pub reserved: [u8; RESERVED_LEN],
    pub checksum: Checksum,
}

impl FileHeader {
    /// Builds a header with zeroed reserved bytes, truncating `name` to the
    /// name field width.
    pub fn new(name: &str, file_size: u64, file_index: u32, checksum: Checksum) -> Self {
        Self {
            name: truncate_name(name).to_string(),
            file_size,
            file_index,
            reserved: [0u8; RESERVED_LEN],
            checksum,
        }
    }

    /// Length of the name as encoded (after truncation).
    pub fn name_len(&self) -> u32 {
        truncate_name(&self.name).len() as u32
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let name = truncate_name(&self.name).as_bytes();
        buf[..name.len()].copy_from_slice(name);
        buf[NAME_LEN_OFFSET..FILE_SIZE_OFFSET].copy_from_slice(&(name.len() as u32).to_be_bytes());
        buf[FILE_SIZE_OFFSET..FILE_INDEX_OFFSET].copy_from_slice(&self.file_size.to_be_bytes());
        buf[FILE_INDEX_OFFSET..RESERVED_OFFSET].copy_from_slice(&self.file_index.to_be_bytes());
        buf[RESERVED_OFFSET..CHECKSUM_OFFSET].copy_from_slice(&self.reserved);
        buf[CHECKSUM_OFFSET..].copy_from_slice(self.checksum.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let name_len = u32::from_be_bytes(field(buf, NAME_LEN_OFFSET)) as usize;
        if name_len > NAME_FIELD_LEN {
            return Err(ProtocolError::Violation(format!(
                "name length {name_len} exceeds {NAME_FIELD_LEN}"
            )));
        }
        let name = std::str::from_utf8(&buf[..name_len])
            .map_err(|e| ProtocolError::Violation(format!("invalid UTF-8 name: {e}")))?
            .to_string();

        Ok(Self {
            name,
            file_size: u64::from_be_bytes(field(buf, FILE_SIZE_OFFSET)),
            file_index: u32::from_be_bytes(field(buf, FILE_INDEX_OFFSET)),
            reserved: field(buf, RESERVED_OFFSET),
            checksum: Checksum::from_bytes(field(buf, CHECKSUM_OFFSET))?,
        })
    }
}

/// Copies a fixed-width field out of an encoded header.
fn field<const N: usize>(buf: &[u8; HEADER_LEN], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

/// Peer resource report returned by the probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReply {
    /// Peer CPU load in percent.
    pub load: f32,
    /// Peer connection class as reported by the peer.
    pub conn_class: i32,
}

impl ProbeReply {
    pub fn encode(&self) -> [u8; PROBE_REPLY_LEN] {
        let mut buf = [0u8; PROBE_REPLY_LEN];
        buf[..4].copy_from_slice(&self.load.to_be_bytes());
        buf[4..].copy_from_slice(&self.conn_class.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; PROBE_REPLY_LEN]) -> Self {
        let mut load = [0u8; 4];
        let mut class = [0u8; 4];
        load.copy_from_slice(&buf[..4]);
        class.copy_from_slice(&buf[4..]);
        Self {
            load: f32::from_be_bytes(load),
            conn_class: i32::from_be_bytes(class),
        }
    }
}

/// Writes a literal message and flushes.
pub async fn write_literal<W: AsyncWrite + Unpin>(
    writer: &mut W,
    literal: &[u8],
) -> Result<(), ProtocolError> {
    writer.write_all(literal).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly `literal.len()` bytes and checks they equal `literal`.
pub async fn expect_literal<R: AsyncRead + Unpin>(
    reader: &mut R,
    literal: &[u8],
) -> Result<(), ProtocolError> {
    let mut buf = vec![0u8; literal.len()];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(ProtocolError::from_read)?;
    if buf != literal {
        return Err(ProtocolError::Violation(format!(
            "expected {:?}, got {:?}",
            String::from_utf8_lossy(literal),
            String::from_utf8_lossy(&buf)
        )));
    }
    Ok(())
}

/// Reads one variable-size message with a single receive of at most
/// [`BUFFER_SIZE`] bytes.
///
/// The protocol has no framing for these messages; whatever the first
/// receive returns is the message.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Err(ProtocolError::Closed);
    }
    buf.truncate(n);
    Ok(buf)
}

/// Reads one variable-size message and checks it equals `expected` exactly.
///
/// A shorter or longer message is a violation; nothing past the message is
/// left unread on the stream.
pub async fn expect_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected: &[u8],
) -> Result<(), ProtocolError> {
    let msg = read_message(reader).await?;
    if msg != expected {
        return Err(ProtocolError::Violation(format!(
            "expected {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&msg)
        )));
    }
    Ok(())
}

pub async fn write_file_count<W: AsyncWrite + Unpin>(
    writer: &mut W,
    count: u32,
) -> Result<(), ProtocolError> {
    writer.write_u32(count).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_file_count<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32, ProtocolError> {
    reader.read_u32().await.map_err(ProtocolError::from_read)
}

pub async fn write_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &FileHeader,
) -> Result<(), ProtocolError> {
    writer.write_all(&header.encode()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<FileHeader, ProtocolError> {
    let mut buf = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(ProtocolError::from_read)?;
    FileHeader::decode(&buf)
}

pub async fn write_probe_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: &ProbeReply,
) -> Result<(), ProtocolError> {
    writer.write_all(&reply.encode()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_probe_reply<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ProbeReply, ProtocolError> {
    let mut buf = [0u8; PROBE_REPLY_LEN];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(ProtocolError::from_read)?;
    Ok(ProbeReply::decode(&buf))
}

pub async fn read_chunk_ack<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<[u8; CHUNK_ACK_LEN], ProtocolError> {
    let mut buf = [0u8; CHUNK_ACK_LEN];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(ProtocolError::from_read)?;
    Ok(buf)
}

pub async fn read_final_ack<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<[u8; FINAL_ACK_LEN], ProtocolError> {
    let mut buf = [0u8; FINAL_ACK_LEN];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(ProtocolError::from_read)?;
    Ok(buf)
}
