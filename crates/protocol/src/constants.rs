/// Default TCP port the inference peer listens on.
pub const DEFAULT_PORT: u16 = 50000;

/// Upper bound for every variable-size message read from the peer.
///
/// Header acknowledgments, result names and result payloads are read with a
/// single receive of at most this many bytes.
pub const BUFFER_SIZE: usize = 1200;

/// Readiness greeting sent by the peer right after accepting a connection.
pub const GREETING: &[u8] = b"[Server] Ready.";

/// Resource query sent by the probe.
pub const RESOURCE_QUERY: &[u8] = b"[Client] Resource query...";

/// Announces that a file transfer follows on this connection.
pub const TRANSFER_INTENT: &[u8] = b"[Client] File transfer...";

/// Positive acknowledgment, used both as the per-file final ack and as the
/// client's reply to each result name.
pub const ACK_OK: &[u8; 2] = b"OK";

/// Size of the per-chunk acknowledgment.
pub const CHUNK_ACK_LEN: usize = 12;

/// Size of the per-file final acknowledgment.
pub const FINAL_ACK_LEN: usize = 2;

/// Size of the probe reply (`f32` load + `i32` connection class).
pub const PROBE_REPLY_LEN: usize = 8;

/// Width of the zero-padded name field in the file header.
pub const NAME_FIELD_LEN: usize = 128;

/// Width of the reserved block in the file header.
pub const RESERVED_LEN: usize = 32;

/// Width of the checksum field (hex-encoded MD5).
pub const CHECKSUM_LEN: usize = 32;

/// Total size of an encoded file header.
pub const HEADER_LEN: usize = NAME_FIELD_LEN + 4 + 8 + 4 + RESERVED_LEN + CHECKSUM_LEN;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_len_is_fixed() {
        assert_eq!(HEADER_LEN, 208);
    }

    #[test]
    fn ack_ok_matches_final_ack_len() {
        assert_eq!(ACK_OK.len(), FINAL_ACK_LEN);
    }
}
