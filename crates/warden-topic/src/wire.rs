//! Binary framing for the Topic control protocol.
//!
//! The hosted engine speaks a fixed, size-limited packet layout over
//! loopback TCP; both the outbound command frame and the reply frame
//! must be reproduced byte-for-byte.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::TopicError;

/// Leading run of zero bytes every command frame starts with.
pub const PREAMBLE_LEN: usize = 8;
/// Marker byte following the preamble.
pub const MARKER: u8 = 0x02;
/// Tag byte identifying a "topic" packet.
pub const TAG_TOPIC: u8 = 0x83;
/// Delimiter prepended to the command string inside the payload.
pub const QUERY_DELIM: u8 = b'?';
/// Fixed bytes before the payload: preamble + marker + tag + u16 length.
pub const HEADER_LEN: usize = PREAMBLE_LEN + 2 + 2;
/// Fixed header the engine prepends to every reply.
pub const REPLY_HEADER_LEN: usize = 5;
/// Reply type byte for plain text replies.
pub const REPLY_TEXT: u8 = 0x06;

/// Longest command string that still fits the u16 length field once the
/// delimiter byte is counted in.
pub const MAX_COMMAND_BYTES: usize = u16::MAX as usize - 1;

/// Encode a command string into a complete topic frame.
///
/// Length-field overflow is a hard error before any bytes touch a socket.
pub fn encode_command(command: &str) -> Result<Vec<u8>, TopicError> {
    let len = command.len();
    if len > MAX_COMMAND_BYTES {
        return Err(TopicError::CommandTooLong { len });
    }

    // Length covers the delimiter plus the command; the trailing NUL is
    // outside the counted payload.
    let counted = (len + 1) as u16;

    let mut frame = Vec::with_capacity(HEADER_LEN + len + 2);
    frame.extend_from_slice(&[0u8; PREAMBLE_LEN]);
    frame.push(MARKER);
    frame.push(TAG_TOPIC);
    frame.extend_from_slice(&counted.to_be_bytes());
    frame.push(QUERY_DELIM);
    frame.extend_from_slice(command.as_bytes());
    frame.push(0);
    Ok(frame)
}

/// Decode a complete command frame back to the command string.
pub fn decode_command(frame: &[u8]) -> Result<String, TopicError> {
    if frame.len() < HEADER_LEN + 2 {
        return Err(TopicError::Truncated {
            expected: HEADER_LEN + 2,
            actual: frame.len(),
        });
    }
    if frame[..PREAMBLE_LEN].iter().any(|b| *b != 0) {
        return Err(TopicError::BadPreamble);
    }
    if frame[PREAMBLE_LEN] != MARKER {
        return Err(TopicError::BadMarker(frame[PREAMBLE_LEN]));
    }
    if frame[PREAMBLE_LEN + 1] != TAG_TOPIC {
        return Err(TopicError::BadTag(frame[PREAMBLE_LEN + 1]));
    }

    let counted =
        u16::from_be_bytes([frame[PREAMBLE_LEN + 2], frame[PREAMBLE_LEN + 3]]) as usize;
    if counted == 0 {
        return Err(TopicError::MissingDelimiter);
    }

    let payload_end = HEADER_LEN + counted;
    if frame.len() < payload_end + 1 {
        return Err(TopicError::Truncated {
            expected: payload_end + 1,
            actual: frame.len(),
        });
    }
    if frame[HEADER_LEN] != QUERY_DELIM {
        return Err(TopicError::MissingDelimiter);
    }

    let command = &frame[HEADER_LEN + 1..payload_end];
    String::from_utf8(command.to_vec()).map_err(|_| TopicError::InvalidUtf8)
}

/// Read one command frame off a stream, bounding the counted payload by
/// `max_command_bytes`.
pub async fn read_command<R>(stream: &mut R, max_command_bytes: usize) -> Result<String, TopicError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;

    if header[..PREAMBLE_LEN].iter().any(|b| *b != 0) {
        return Err(TopicError::BadPreamble);
    }
    if header[PREAMBLE_LEN] != MARKER {
        return Err(TopicError::BadMarker(header[PREAMBLE_LEN]));
    }
    if header[PREAMBLE_LEN + 1] != TAG_TOPIC {
        return Err(TopicError::BadTag(header[PREAMBLE_LEN + 1]));
    }

    let counted =
        u16::from_be_bytes([header[PREAMBLE_LEN + 2], header[PREAMBLE_LEN + 3]]) as usize;
    if counted == 0 {
        return Err(TopicError::MissingDelimiter);
    }
    if counted > max_command_bytes.saturating_add(1) {
        return Err(TopicError::CommandTooLong { len: counted - 1 });
    }

    // Counted payload plus the trailing NUL.
    let mut payload = vec![0u8; counted + 1];
    stream.read_exact(&mut payload).await?;
    if payload[0] != QUERY_DELIM {
        return Err(TopicError::MissingDelimiter);
    }

    String::from_utf8(payload[1..counted].to_vec()).map_err(|_| TopicError::InvalidUtf8)
}

/// Build a reply frame the way the engine does: fixed 5-byte header,
/// text, trailing NUL.
pub fn build_reply(text: &str) -> Vec<u8> {
    let counted = (text.len() + 1).min(u16::MAX as usize) as u16;
    let mut frame = Vec::with_capacity(REPLY_HEADER_LEN + text.len() + 1);
    frame.push(MARKER);
    frame.push(TAG_TOPIC);
    frame.extend_from_slice(&counted.to_be_bytes());
    frame.push(REPLY_TEXT);
    frame.extend_from_slice(text.as_bytes());
    frame.push(0);
    frame
}

/// Parse raw reply bytes: strip trailing NULs, drop the fixed header,
/// trim, return the logical reply string.
pub fn parse_reply(raw: &[u8]) -> Result<String, TopicError> {
    let mut end = raw.len();
    while end > 0 && raw[end - 1] == 0 {
        end -= 1;
    }
    let trimmed = &raw[..end];
    if trimmed.len() < REPLY_HEADER_LEN {
        return Err(TopicError::EmptyReply);
    }

    let body = &trimmed[REPLY_HEADER_LEN..];
    let text = std::str::from_utf8(body).map_err(|_| TopicError::InvalidUtf8)?;
    Ok(text.trim().to_string())
}
