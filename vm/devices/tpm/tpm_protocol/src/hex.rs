// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Decoder for captured command dumps written as free-form hex text.
//!
//! Accepted input is pairs of hex digits in either case. Whitespace and
//! commas separate groups, and a group may start with `0x` or `0X`. Any other
//! character is ignored, and a single digit that is not followed directly by
//! a second one is dropped.

use crate::buffer::CommandBuffer;
use crate::buffer::CommandBuildError;
use crate::buffer::read_be32;
use crate::tpm20proto::HEADER_SIZE;

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decodes `text` into `buf`, replacing its contents, and returns the number
/// of bytes decoded.
///
/// A dump that does not fit fails as a whole with
/// [`CommandBuildError::BufferOverflow`].
pub fn decode_hex_dump(text: &str, buf: &mut CommandBuffer) -> Result<usize, CommandBuildError> {
    buf.clear();

    let bytes = text.as_bytes();
    let mut high: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if high.is_none() && c == b'0' && matches!(bytes.get(i + 1), Some(b'x' | b'X')) {
            i += 2;
            continue;
        }

        match (nibble(c), high) {
            (Some(low), Some(h)) => {
                if let Err(err) = buf.write_u8((h << 4) | low) {
                    buf.clear();
                    return Err(err);
                }
                high = None;
            }
            (Some(n), None) => high = Some(n),
            (None, _) => high = None,
        }
        i += 1;
    }

    Ok(buf.len())
}

/// The size recorded in a decoded command's header, if it has one.
pub fn declared_command_size(command: &[u8]) -> Option<u32> {
    (command.len() >= HEADER_SIZE).then(|| read_be32(command, 2))
}

/// Splits a multi-command dump into blocks separated by blank lines.
pub fn split_hex_blocks(text: &str) -> impl Iterator<Item = String> + '_ {
    let mut lines = text.lines().peekable();
    std::iter::from_fn(move || {
        while lines.peek().is_some_and(|line| line.trim().is_empty()) {
            lines.next();
        }
        lines.peek()?;

        let mut block = String::new();
        while let Some(line) = lines.next_if(|line| !line.trim().is_empty()) {
            block.push_str(line);
            block.push('\n');
        }
        Some(block)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLUSH_CONTEXT: [u8; 14] = [
        0x80, 0x01, 0x00, 0x00, 0x00, 0x0e, 0x00, 0x00, 0x01, 0x65, 0x80, 0x00, 0x00, 0x01,
    ];

    #[test]
    fn test_decode_spaced() {
        let mut buf = CommandBuffer::new();
        let len = decode_hex_dump("80 01 00 00 00 0e 00 00 01 65 80 00 00 01", &mut buf).unwrap();
        assert_eq!(len, 14);
        assert_eq!(buf.finalize(), FLUSH_CONTEXT);
        assert_eq!(declared_command_size(buf.finalize()), Some(14));
    }

    #[test]
    fn test_decode_prefixed_and_commas() {
        let mut buf = CommandBuffer::new();
        let text = "0x80,0x01, 0X00,0x00,0x00,0x0E,\n\t0x00,0x00,0x01,0x65,0x80,0x00,0x00,0x01";
        decode_hex_dump(text, &mut buf).unwrap();
        assert_eq!(buf.finalize(), FLUSH_CONTEXT);

        decode_hex_dump("8001 0000 000E 0000 0165 8000 0001", &mut buf).unwrap();
        assert_eq!(buf.finalize(), FLUSH_CONTEXT);
    }

    #[test]
    fn test_decode_ignores_noise() {
        let mut buf = CommandBuffer::new();
        // A lone digit before a separator is dropped.
        decode_hex_dump("tag: 80 01 | f 0a", &mut buf).unwrap();
        assert_eq!(buf.finalize(), &[0x80, 0x01, 0x0a]);

        decode_hex_dump("", &mut buf).unwrap();
        assert!(buf.finalize().is_empty());
        assert_eq!(declared_command_size(buf.finalize()), None);
    }

    #[test]
    fn test_decode_prefix_only_at_byte_boundary() {
        let mut buf = CommandBuffer::new();
        // The "0x" straddling "a0" and "x1" is not a prefix.
        decode_hex_dump("a0x1 0x20", &mut buf).unwrap();
        assert_eq!(buf.finalize(), &[0xa0, 0x20]);
    }

    #[test]
    fn test_decode_overflow() {
        let mut buf = CommandBuffer::with_capacity(4);
        assert_eq!(
            decode_hex_dump("01 02 03 04 05", &mut buf),
            Err(CommandBuildError::BufferOverflow {
                needed: 5,
                capacity: 4
            })
        );
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_split_blocks() {
        let text = "\n80 01 00 00\n00 0c\n\n\n  \n80 01\r\n00 00 00 0a\n";
        let blocks: Vec<_> = split_hex_blocks(text).collect();
        assert_eq!(blocks, vec!["80 01 00 00\n00 0c\n", "80 01\n00 00 00 0a\n"]);
    }
}
