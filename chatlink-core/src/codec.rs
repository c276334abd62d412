//! Framing: `sender:body` text frames and fixed-width file headers.

/// Protocol version. v1 reads text frames into 4096-byte buffers and uses a 256-byte file name field.
pub const PROTOCOL_VERSION: u8 = 1;

pub const DEFAULT_PORT: u16 = 60000;

/// Max bytes taken by one text-frame read, and the file chunk size.
pub const BUFFER_SIZE: usize = 4096;

/// Width of the padded file name field, separator included.
pub const NAME_FIELD_WIDTH: usize = 256;
pub const SIZE_FIELD_WIDTH: usize = 4;
pub const FILE_HEADER_LEN: usize = NAME_FIELD_WIDTH + SIZE_FIELD_WIDTH;

const SEPARATOR: char = ':';
const PADDING: u8 = b' ';

/// One chat line as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFrame {
    pub sender: String,
    pub body: String,
}

/// Announces a file body of exactly `byte_length` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub file_name: String,
    pub byte_length: u32,
}

/// Sender names are colon-free; the first colon on the wire ends the sender.
pub fn validate_sender(sender: &str) -> Result<(), FrameEncodeError> {
    if sender.contains(SEPARATOR) {
        return Err(FrameEncodeError::InvalidSender(sender.to_owned()));
    }
    Ok(())
}

/// Encode `sender:body`. No length prefix and no escaping.
pub fn encode_text(sender: &str, body: &str) -> Result<Vec<u8>, FrameEncodeError> {
    validate_sender(sender)?;
    let mut out = Vec::with_capacity(sender.len() + 1 + body.len());
    out.extend_from_slice(sender.as_bytes());
    out.push(SEPARATOR as u8);
    out.extend_from_slice(body.as_bytes());
    Ok(out)
}

/// Decode one text frame. `Ok(None)` means the frame is ignorable (empty sender or empty body).
pub fn decode_text(bytes: &[u8]) -> Result<Option<TextFrame>, FrameDecodeError> {
    let text = std::str::from_utf8(bytes)?;
    let (sender, body) = text.split_once(SEPARATOR).unwrap_or((text, ""));
    if sender.is_empty() || body.is_empty() {
        return Ok(None);
    }
    Ok(Some(TextFrame {
        sender: sender.to_owned(),
        body: body.to_owned(),
    }))
}

/// Encode the file header: `name:` padded with spaces to `NAME_FIELD_WIDTH`, then 4 bytes LE length.
pub fn encode_file_header(file_name: &str, byte_length: u32) -> Result<Vec<u8>, FrameEncodeError> {
    if file_name.is_empty() {
        return Err(FrameEncodeError::EmptyFileName);
    }
    if file_name.contains(SEPARATOR) {
        return Err(FrameEncodeError::FileNameHasSeparator(file_name.to_owned()));
    }
    let name = file_name.as_bytes();
    if name.len() >= NAME_FIELD_WIDTH {
        return Err(FrameEncodeError::FileNameTooLong {
            len: name.len(),
            max: NAME_FIELD_WIDTH - 1,
        });
    }
    let mut out = Vec::with_capacity(FILE_HEADER_LEN);
    out.extend_from_slice(name);
    out.push(SEPARATOR as u8);
    out.resize(NAME_FIELD_WIDTH, PADDING);
    out.extend_from_slice(&byte_length.to_le_bytes());
    Ok(out)
}

/// Decode the two header fields. The name is everything before the first colon; padding is dropped.
pub fn decode_file_header(
    name_field: &[u8],
    size_field: &[u8],
) -> Result<FileHeader, FrameDecodeError> {
    if name_field.len() != NAME_FIELD_WIDTH || size_field.len() != SIZE_FIELD_WIDTH {
        return Err(FrameDecodeError::ShortHeader {
            name_len: name_field.len(),
            size_len: size_field.len(),
        });
    }
    let end = name_field
        .iter()
        .position(|&b| b == SEPARATOR as u8)
        .ok_or(FrameDecodeError::MissingSeparator)?;
    let file_name = std::str::from_utf8(&name_field[..end])?;
    if file_name.is_empty() {
        return Err(FrameDecodeError::EmptyFileName);
    }
    let byte_length = u32::from_le_bytes([size_field[0], size_field[1], size_field[2], size_field[3]]);
    Ok(FileHeader {
        file_name: file_name.to_owned(),
        byte_length,
    })
}

/// Error building a frame from local input.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("sender {0:?} must not contain ':'")]
    InvalidSender(String),
    #[error("file name is {len} bytes, at most {max} fit the header")]
    FileNameTooLong { len: usize, max: usize },
    #[error("file name {0:?} must not contain ':'")]
    FileNameHasSeparator(String),
    #[error("file name is empty")]
    EmptyFileName,
}

/// Error decoding bytes received from the peer.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("file name field has no ':' terminator")]
    MissingSeparator,
    #[error("file name field is empty")]
    EmptyFileName,
    #[error("file header fields are {name_len} + {size_len} bytes")]
    ShortHeader { name_len: usize, size_len: usize },
}
