//! File streaming: fixed-width header, then the raw body in sequential chunks.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::codec::{
    self, FileHeader, FrameDecodeError, FrameEncodeError, FILE_HEADER_LEN, NAME_FIELD_WIDTH,
};
use crate::endpoint::{Endpoint, SendError};

/// Bytes moved so far out of the announced total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_done: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    /// Whole percent, 100 for an empty file.
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        (self.bytes_done.min(self.total_bytes) * 100 / self.total_bytes) as u8
    }
}

/// Send `path`: header first, then the body in `chunk_size` pieces straight from disk.
/// `on_progress` runs after every chunk.
pub fn send_file(
    endpoint: &Endpoint,
    path: &Path,
    chunk_size: usize,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<FileHeader, TransferError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::InvalidName(path.display().to_string()))?;
    let mut file = File::open(path).map_err(TransferError::Open)?;
    let total = file.metadata().map_err(TransferError::Open)?.len();
    let byte_length = u32::try_from(total).map_err(|_| TransferError::TooLarge(total))?;
    let header = codec::encode_file_header(file_name, byte_length)?;

    endpoint.send(&header)?;
    log::info!(
        "sending {} ({} bytes) to {}",
        file_name,
        total,
        endpoint.peer()
    );

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut sent = 0u64;
    while sent < total {
        let n = match file.read(&mut buf) {
            Ok(0) => {
                return Err(TransferError::Read(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shrank while sending",
                )))
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Read(e)),
        };
        // The header already fixed the length; a file that grew is cut off there.
        let n = n.min((total - sent) as usize);
        endpoint.send(&buf[..n])?;
        sent += n as u64;
        on_progress(TransferProgress {
            bytes_done: sent,
            total_bytes: total,
        });
    }
    log::info!("sent {} to {}", file_name, endpoint.peer());
    Ok(FileHeader {
        file_name: file_name.to_owned(),
        byte_length,
    })
}

/// Read the next file header off the stream.
pub fn read_header(endpoint: &Endpoint) -> Result<FileHeader, TransferError> {
    let header = endpoint
        .receive_exact(FILE_HEADER_LEN)
        .map_err(|_| TransferError::Closed)?;
    let (name, size) = header.split_at(NAME_FIELD_WIDTH);
    Ok(codec::decode_file_header(name, size)?)
}

/// Where a received file lands: only the final path component of the sender's name is kept.
pub fn destination_for(download_dir: &Path, file_name: &str) -> Result<PathBuf, TransferError> {
    match Path::new(file_name).file_name() {
        Some(name) => Ok(download_dir.join(name)),
        None => Err(TransferError::InvalidName(file_name.to_owned())),
    }
}

/// Write exactly `expected_size` bytes from the stream into a new file at `destination`.
/// Reads never go past the body, so the next header stays on the socket.
/// A failed transfer removes the partial file. If the file cannot be created
/// (it already exists, say) the body is skipped and the stream stays framed.
pub fn receive_file(
    endpoint: &Endpoint,
    destination: &Path,
    expected_size: u64,
    chunk_size: usize,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<(), TransferError> {
    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
    {
        Ok(file) => file,
        Err(e) => {
            log::warn!("cannot create {}: {}", destination.display(), e);
            skip_body(endpoint, expected_size, chunk_size)?;
            return Err(TransferError::Create(e));
        }
    };
    let result = copy_body(endpoint, &mut file, expected_size, chunk_size, on_progress);
    drop(file);
    if result.is_err() {
        if let Err(e) = fs::remove_file(destination) {
            log::warn!("could not remove partial {}: {}", destination.display(), e);
        }
    }
    result
}

/// Read and discard a body of `expected_size` bytes.
pub fn skip_body(endpoint: &Endpoint, expected_size: u64, chunk_size: usize) -> Result<(), TransferError> {
    copy_body(endpoint, &mut io::sink(), expected_size, chunk_size, &mut |_| {})
}

fn copy_body(
    endpoint: &Endpoint,
    file: &mut dyn Write,
    expected_size: u64,
    chunk_size: usize,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<(), TransferError> {
    let chunk_size = chunk_size.max(1) as u64;
    let mut received = 0u64;
    while received < expected_size {
        let want = chunk_size.min(expected_size - received) as usize;
        let chunk = endpoint
            .receive(want)
            .map_err(|_| TransferError::Truncated {
                received,
                expected: expected_size,
            })?;
        file.write_all(&chunk).map_err(TransferError::Write)?;
        received += chunk.len() as u64;
        on_progress(TransferProgress {
            bytes_done: received,
            total_bytes: expected_size,
        });
    }
    file.flush().map_err(TransferError::Write)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("cannot open file: {0}")]
    Open(#[source] io::Error),
    #[error("error reading file: {0}")]
    Read(#[source] io::Error),
    #[error("{0}")]
    Header(#[from] FrameEncodeError),
    #[error("bad file header: {0}")]
    BadHeader(#[from] FrameDecodeError),
    #[error("file is {0} bytes, the protocol carries at most 4294967295")]
    TooLarge(u64),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("peer disconnected")]
    Closed,
    #[error("peer vanished after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
    #[error("cannot create destination: {0}")]
    Create(#[source] io::Error),
    #[error("error writing file: {0}")]
    Write(#[source] io::Error),
}

impl TransferError {
    /// Whether the byte stream lost its framing. Errors raised before the header
    /// went out, and receive errors whose body was skipped, leave the connection usable.
    pub fn desynchronizes(&self) -> bool {
        !matches!(
            self,
            TransferError::Open(_)
                | TransferError::Header(_)
                | TransferError::TooLarge(_)
                | TransferError::InvalidName(_)
                | TransferError::Create(_)
        )
    }
}
