//! Wire unit for parent/child worker communication.
//!
//! A message is a fixed 32-byte header followed by exactly `header.size`
//! raw payload bytes, both transmitted verbatim in the native
//! representation. Parent and child are always the same forked process
//! image, so the two ends cannot disagree on field order, width or byte
//! order; the format is not portable across builds or architectures and
//! makes no attempt to be.
//!
//! Partial transfers are the default assumption: a single send/recv may
//! move fewer bytes than requested, and the transfer resumes from the
//! cursor (`io_offset`) on the next readiness event until
//! [`Message::io_completed`] holds.

use std::fmt;
use std::os::unix::io::AsRawFd;

use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, recv, send};

use crate::error::{FpoolError, Result};

/// Wire revision of the header layout.
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of the encoded header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Fixed-order message header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes.
    pub size: u64,
    /// Reserved, currently unused.
    pub flags: u64,
    /// Caller-assigned correlation id.
    pub id: u64,
    /// 0 on success, negative errno otherwise.
    pub status: i32,
    /// Application-defined opcode.
    pub cmd: i32,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.size.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.flags.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.id.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.status.to_ne_bytes());
        buf[28..32].copy_from_slice(&self.cmd.to_ne_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let u64_at = |offset: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[offset..offset + 8]);
            u64::from_ne_bytes(bytes)
        };
        let i32_at = |offset: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&buf[offset..offset + 4]);
            i32::from_ne_bytes(bytes)
        };
        Self {
            size: u64_at(0),
            flags: u64_at(8),
            id: u64_at(16),
            status: i32_at(24),
            cmd: i32_at(28),
        }
    }
}

/// A single request or reply with a resumable transfer cursor.
///
/// Messages are value-like: ownership moves into a queue slot, then to
/// the IO thread, then into the completion callback. No component keeps
/// one after handing it off.
#[derive(Debug)]
pub struct Message {
    pub header: Header,
    data: Vec<u8>,
    io_offset: usize,
    head_buf: [u8; HEADER_SIZE],
}

impl Default for Message {
    fn default() -> Self {
        Self {
            header: Header::default(),
            data: Vec::new(),
            io_offset: 0,
            head_buf: [0u8; HEADER_SIZE],
        }
    }
}

impl Message {
    /// Empty message with a zeroed header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Message with a zero-filled payload of `size` bytes.
    pub fn with_size(size: u64) -> Self {
        let mut msg = Self::default();
        msg.header.size = size;
        msg.data = vec![0u8; size as usize];
        msg
    }

    /// Header-only echo of `other`, used to carry a status code without
    /// payload.
    pub fn copy_header(other: &Message) -> Self {
        let mut msg = Self::default();
        msg.header = other.header;
        msg.header.size = 0;
        msg
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable payload bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Cumulative bytes moved so far, header and payload combined.
    pub fn transferred(&self) -> usize {
        self.io_offset
    }

    /// True once header and payload have been fully transferred.
    pub fn io_completed(&self) -> bool {
        self.io_offset == HEADER_SIZE + self.header.size as usize
    }

    /// Feed the next pending outbound chunk into `sink` and advance the
    /// cursor by however many bytes it accepted.
    ///
    /// `sink` gets the remaining slice of the current region (encoded
    /// header first, then payload) and returns the number of bytes it
    /// consumed. Returns the advance, 0 once the transfer is complete.
    pub fn write_with<F>(&mut self, mut sink: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Result<usize>,
    {
        if self.io_completed() {
            return Ok(0);
        }
        let written = if self.io_offset < HEADER_SIZE {
            self.head_buf = self.header.encode();
            sink(&self.head_buf[self.io_offset..])?
        } else {
            let offset = self.io_offset - HEADER_SIZE;
            sink(&self.data[offset..])?
        };
        if written == 0 {
            return Err(FpoolError::ChannelClosed);
        }
        self.io_offset += written;
        Ok(written)
    }

    /// Pull the next inbound chunk from `source` and advance the cursor
    /// by however many bytes it produced.
    ///
    /// Once the header region is complete it is decoded and the payload
    /// buffer allocated to `header.size`. A `source` returning 0 means
    /// the peer closed the channel mid-message.
    pub fn read_with<F>(&mut self, mut source: F) -> Result<usize>
    where
        F: FnMut(&mut [u8]) -> Result<usize>,
    {
        if self.io_completed() {
            return Ok(0);
        }
        let read = if self.io_offset < HEADER_SIZE {
            source(&mut self.head_buf[self.io_offset..])?
        } else {
            let offset = self.io_offset - HEADER_SIZE;
            source(&mut self.data[offset..])?
        };
        if read == 0 {
            return Err(FpoolError::ChannelClosed);
        }
        self.io_offset += read;
        if self.io_offset == HEADER_SIZE {
            self.header = Header::decode(&self.head_buf);
            self.data = vec![0u8; self.header.size as usize];
        }
        Ok(read)
    }

    /// Send pending bytes to a connected socket, resuming from the
    /// cursor. `MSG_NOSIGNAL` keeps a dead peer from raising SIGPIPE.
    pub fn write_some<F: AsRawFd>(&mut self, fd: &F) -> Result<usize> {
        let raw = fd.as_raw_fd();
        self.write_with(|buf| {
            loop {
                match send(raw, buf, MsgFlags::MSG_NOSIGNAL) {
                    Ok(n) => return Ok(n),
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(errno.into()),
                }
            }
        })
    }

    /// Receive pending bytes from a connected socket, resuming from the
    /// cursor.
    pub fn read_some<F: AsRawFd>(&mut self, fd: &F) -> Result<usize> {
        let raw = fd.as_raw_fd();
        self.read_with(|buf| {
            loop {
                match recv(raw, buf, MsgFlags::empty()) {
                    Ok(n) => return Ok(n),
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(errno.into()),
                }
            }
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cmd: {}, id: {}, size: {}",
            self.header.cmd, self.header.id, self.header.size
        )
    }
}
