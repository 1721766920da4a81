// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Big-endian primitives and the bounds-checked command and reply cursors.
//!
//! Commands are assembled into a [`CommandBuffer`], a fixed-capacity append
//! cursor. Length fields whose value is only known once the payload behind
//! them has been written are reserved with [`CommandBuffer::reserve`] and
//! filled in later with [`CommandBuffer::patch`] or
//! [`CommandBuffer::patch_size_since`]. Replies are consumed with a
//! [`ReplyReader`], which refuses to read past the end of its slice.

use thiserror::Error;

/// Default capacity of a [`CommandBuffer`].
pub const DEFAULT_COMMAND_CAPACITY: usize = 2048;

/// Error returned while assembling a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[expect(missing_docs)]
pub enum CommandBuildError {
    #[error("command buffer overflow: {needed} bytes needed, capacity {capacity}")]
    BufferOverflow { needed: usize, capacity: usize },
    #[error("field of {size} bytes does not fit in a {width}-byte size prefix")]
    FieldTooLarge { size: usize, width: usize },
    #[error("patch token at offset {offset} lies outside the written command")]
    InvalidPatchToken { offset: usize },
}

/// Error returned while taking a reply apart.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[expect(missing_docs)]
pub enum ResponseError {
    #[error(
        "truncated response: {needed} bytes needed at offset {offset}, {available} available"
    )]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("response header declares {size} bytes, shorter than the header itself")]
    InvalidHeaderSize { size: u32 },
    #[error("response parameter area declares {declared} bytes, {available} available")]
    ParameterSizeMismatch { declared: u32, available: usize },
}

/// Writes `value` big-endian at `offset`. Panics if the slot is out of range.
pub fn write_be16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Writes `value` big-endian at `offset`. Panics if the slot is out of range.
pub fn write_be32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Reads a big-endian `u16` at `offset`. Panics if the slot is out of range.
pub fn read_be16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Reads a big-endian `u32` at `offset`. Panics if the slot is out of range.
pub fn read_be32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Width of a reserved length field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PatchWidth {
    /// A `UINT16` size field.
    U16,
    /// A `UINT32` size field.
    U32,
}

impl PatchWidth {
    fn bytes(self) -> usize {
        match self {
            PatchWidth::U16 => 2,
            PatchWidth::U32 => 4,
        }
    }
}

/// A region reserved by [`CommandBuffer::reserve`], to be filled in later.
#[must_use]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PatchToken {
    offset: usize,
    width: PatchWidth,
}

impl PatchToken {
    /// Offset of the reserved region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Offset of the first byte after the reserved region.
    pub fn end(&self) -> usize {
        self.offset + self.width.bytes()
    }
}

/// Fixed-capacity append cursor used to assemble a single command.
pub struct CommandBuffer {
    bytes: Box<[u8]>,
    len: usize,
}

impl CommandBuffer {
    /// A buffer of [`DEFAULT_COMMAND_CAPACITY`] bytes.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_COMMAND_CAPACITY)
    }

    /// A buffer that holds at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Rewinds the cursor so the buffer can hold the next command.
    pub fn clear(&mut self) {
        self.bytes[..self.len].fill(0);
        self.len = 0;
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Total bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes left before the buffer overflows.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    fn claim(&mut self, width: usize) -> Result<&mut [u8], CommandBuildError> {
        let end = self
            .len
            .checked_add(width)
            .filter(|&end| end <= self.capacity())
            .ok_or(CommandBuildError::BufferOverflow {
                needed: self.len.saturating_add(width),
                capacity: self.capacity(),
            })?;
        let slot = &mut self.bytes[self.len..end];
        self.len = end;
        Ok(slot)
    }

    /// Appends one byte.
    pub fn write_u8(&mut self, value: u8) -> Result<(), CommandBuildError> {
        self.claim(1)?[0] = value;
        Ok(())
    }

    /// Appends a big-endian `u16`.
    pub fn write_u16(&mut self, value: u16) -> Result<(), CommandBuildError> {
        self.claim(2)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Appends a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) -> Result<(), CommandBuildError> {
        self.claim(4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Appends `data` unchanged.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), CommandBuildError> {
        self.claim(data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Skips `width` bytes and returns a token to fill them in later.
    pub fn reserve(&mut self, width: PatchWidth) -> Result<PatchToken, CommandBuildError> {
        let offset = self.len;
        self.claim(width.bytes())?;
        Ok(PatchToken { offset, width })
    }

    /// Writes `value` into a reserved region without moving the cursor.
    pub fn patch(&mut self, token: PatchToken, value: u32) -> Result<(), CommandBuildError> {
        if token.end() > self.len {
            return Err(CommandBuildError::InvalidPatchToken {
                offset: token.offset,
            });
        }

        match token.width {
            PatchWidth::U16 => {
                let value = u16::try_from(value).map_err(|_| CommandBuildError::FieldTooLarge {
                    size: value as usize,
                    width: 2,
                })?;
                write_be16(&mut self.bytes, token.offset, value);
            }
            PatchWidth::U32 => write_be32(&mut self.bytes, token.offset, value),
        }

        Ok(())
    }

    /// Patches a reserved size prefix with the number of bytes written after it.
    pub fn patch_size_since(&mut self, token: PatchToken) -> Result<(), CommandBuildError> {
        let size = self
            .len
            .checked_sub(token.end())
            .ok_or(CommandBuildError::InvalidPatchToken {
                offset: token.offset,
            })?;
        let size = u32::try_from(size).map_err(|_| CommandBuildError::FieldTooLarge {
            size,
            width: token.width.bytes(),
        })?;
        self.patch(token, size)
    }

    /// The logical contents, `[0, cursor)`.
    pub fn finalize(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds-checked big-endian reader over a reply.
///
/// Offsets reported in errors are relative to the start of the reply so they
/// line up with a hex dump of the whole buffer.
#[derive(Debug, Clone)]
pub struct ReplyReader<'a> {
    data: &'a [u8],
    offset: usize,
    base: usize,
}

impl<'a> ReplyReader<'a> {
    /// A reader over a whole reply.
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_base(data, 0)
    }

    /// A reader over `data`, which starts `base` bytes into the reply.
    pub fn with_base(data: &'a [u8], base: usize) -> Self {
        Self {
            data,
            offset: 0,
            base,
        }
    }

    /// Absolute offset of the next byte.
    pub fn position(&self) -> usize {
        self.base + self.offset
    }

    /// Bytes not read yet.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Whether every byte has been read.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Reads the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ResponseError> {
        if len > self.remaining() {
            return Err(ResponseError::Truncated {
                offset: self.position(),
                needed: len,
                available: self.remaining(),
            });
        }
        let data = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(data)
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8, ResponseError> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Reads a big-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, ResponseError> {
        let bytes = self.read_bytes(2)?;
        Ok(read_be16(bytes, 0))
    }

    /// Reads a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, ResponseError> {
        let bytes = self.read_bytes(4)?;
        Ok(read_be32(bytes, 0))
    }

    /// Reads a size-prefixed field and returns its content.
    ///
    /// On a truncated field the reader is left where it was.
    pub fn read_tpm2b(&mut self) -> Result<&'a [u8], ResponseError> {
        let start = self.offset;
        let size = self.read_u16()?;
        self.read_bytes(size.into()).inspect_err(|_| {
            self.offset = start;
        })
    }

    /// Splits off the next `len` bytes as an independent reader.
    pub fn sub_reader(&mut self, len: usize) -> Result<ReplyReader<'a>, ResponseError> {
        let base = self.position();
        let data = self.read_bytes(len)?;
        Ok(ReplyReader::with_base(data, base))
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let data = &self.data[self.offset..];
        self.offset = self.data.len();
        data
    }
}
