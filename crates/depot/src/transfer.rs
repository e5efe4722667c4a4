//! Chunked transfer protocol.
//!
//! A transfer is an ordered sequence of [`Frame`]s. Uploads open with exactly
//! one metadata frame naming the file, followed by zero or more data frames,
//! and close with a commit frame carrying the total size. A stream that ends
//! without the commit was abandoned and must not be stored. Downloads are data
//! frames only, terminated by the end of the stream. Each
//! data frame carries at most the session's frame cap, which defaults to
//! [`MAX_FRAME_SIZE`]: the transport's message ceiling minus headroom for the
//! envelope.
//!
//! Both ends count bytes independently of the storage backend so that the
//! persisted size can be checked against what went over the wire.
//!
//! ```text
//! upload:   Metadata{name} Data(..) Data(..) ... Commit{size} <end>
//! download: Data(..) Data(..) ... <end>
//! ```

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::TransferError;

/// Largest message the transport is configured to carry.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Bytes reserved for envelope framing in every message.
pub const FRAME_OVERHEAD: usize = 1024;

/// Largest data payload a single frame may carry.
pub const MAX_FRAME_SIZE: usize = MAX_MESSAGE_SIZE - FRAME_OVERHEAD;

/// Frame cap that fits in messages of `max_message_size` bytes, if any does.
pub fn frame_size_for(max_message_size: usize) -> Option<usize> {
    max_message_size
        .checked_sub(FRAME_OVERHEAD)
        .filter(|&cap| cap > 0)
}

/// One unit of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Identifies the file; first and only once on uploads.
    Metadata {
        /// Entry name.
        name: String,
    },
    /// A slice of file content.
    Data(Vec<u8>),
    /// Closes an upload; `size` is the total of all data frames sent.
    Commit {
        /// Bytes sent.
        size: u64,
    },
}

/// Split `data` into payloads of at most `cap` bytes, in order.
///
/// Empty input yields no payloads.
pub fn chunks(data: &[u8], cap: usize) -> Chunks<'_> {
    Chunks {
        rest: data,
        cap: cap.max(1),
    }
}

/// Iterator returned by [`chunks`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    rest: &'a [u8],
    cap: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let n = self.rest.len().min(self.cap);
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Some(head)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.rest.len().div_ceil(self.cap);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks<'_> {}

/// Reads a source sequentially in blocks of the frame cap.
///
/// Every block but the last is exactly `cap` bytes, regardless of how the
/// underlying reader splits its reads.
#[derive(Debug)]
pub struct ChunkReader<R> {
    reader: R,
    cap: usize,
    bytes_read: u64,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    /// Wrap `reader`, producing blocks of at most `cap` bytes.
    pub fn new(reader: R, cap: usize) -> Self {
        Self {
            reader,
            cap: cap.max(1),
            bytes_read: 0,
            done: false,
        }
    }

    /// The next block, or `None` once the source is exhausted.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        // Grows with the data rather than reserving the whole cap up front.
        let mut buf = Vec::new();
        let filled = (&mut self.reader)
            .take(self.cap as u64)
            .read_to_end(&mut buf)
            .await?;
        if filled < self.cap {
            self.done = true;
        }

        if filled == 0 {
            return Ok(None);
        }
        self.bytes_read += filled as u64;
        Ok(Some(buf))
    }

    /// Total bytes handed out so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Accumulates data frames in arrival order.
#[derive(Debug)]
pub struct Reassembler {
    buf: Vec<u8>,
    cap: usize,
    frames: u64,
}

impl Reassembler {
    /// Start an empty buffer accepting frames of at most `cap` bytes.
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            frames: 0,
        }
    }

    /// Append one data frame.
    pub fn push(&mut self, data: &[u8]) -> Result<(), TransferError> {
        if data.len() > self.cap {
            return Err(TransferError::FrameTooLarge {
                size: data.len(),
                cap: self.cap,
            });
        }
        self.buf.extend_from_slice(data);
        self.frames += 1;
        Ok(())
    }

    /// Bytes accumulated so far.
    pub fn bytes(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Data frames accepted so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// The reassembled content.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Compare the bytes counted during a transfer against the size the sink
/// reports after persisting them.
pub fn check_size(transferred: u64, persisted: u64) -> Result<(), TransferError> {
    if transferred == persisted {
        Ok(())
    } else {
        Err(TransferError::SizeMismatch {
            transferred,
            persisted,
        })
    }
}

/// Receiving side of an upload.
///
/// Enforces the frame order: the session can only be started from a metadata
/// frame, after which data frames are accepted until the commit frame. Nothing
/// may follow the commit.
#[derive(Debug)]
pub struct UploadSession {
    name: String,
    content: Reassembler,
    committed: bool,
}

impl UploadSession {
    /// Start a session from the stream's first frame.
    pub fn begin(first: Frame, cap: usize) -> Result<Self, TransferError> {
        match first {
            Frame::Metadata { name } => Ok(Self {
                name,
                content: Reassembler::new(cap),
                committed: false,
            }),
            Frame::Data(_) | Frame::Commit { .. } => Err(TransferError::MissingMetadata),
        }
    }

    /// The file name announced by the metadata frame.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Feed the next frame, returning the payload size it added.
    pub fn accept(&mut self, frame: Frame) -> Result<usize, TransferError> {
        if self.committed {
            return Err(TransferError::FrameAfterCommit);
        }
        match frame {
            Frame::Data(data) => {
                self.content.push(&data)?;
                Ok(data.len())
            }
            Frame::Commit { size } => {
                let received = self.content.bytes();
                if size != received {
                    return Err(TransferError::CommitMismatch {
                        declared: size,
                        received,
                    });
                }
                self.committed = true;
                Ok(0)
            }
            Frame::Metadata { .. } => Err(TransferError::UnexpectedMetadata),
        }
    }

    /// Whether the commit frame has been accepted.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Bytes received so far.
    pub fn bytes_received(&self) -> u64 {
        self.content.bytes()
    }

    /// Data frames received so far.
    pub fn frames_received(&self) -> u64 {
        self.content.frames()
    }

    /// End the session, yielding the name and the full content.
    ///
    /// Fails with [`TransferError::Uncommitted`] if the stream ended before the
    /// commit frame.
    pub fn finish(self) -> Result<(String, Vec<u8>), TransferError> {
        if !self.committed {
            return Err(TransferError::Uncommitted);
        }
        Ok((self.name, self.content.into_inner()))
    }
}
