// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Replays captured command dumps.
//!
//! The decoded bytes are sent unmodified. Only the response header is looked
//! at, since the shape of an arbitrary captured command is unknown. Captures
//! often depend on the provisioning state of the TPM they were taken from, so
//! a non-success response code is reported rather than treated as an error.

use crate::RawReply;
use crate::TestContext;
use crate::TpmCommandError;
use crate::TpmEngine;
use thiserror::Error;
use tpm_protocol::buffer::CommandBuildError;
use tpm_protocol::hex::declared_command_size;
use tpm_protocol::hex::decode_hex_dump;
use tpm_protocol::tpm20proto::CommandCodeEnum;
use tpm_protocol::tpm20proto::HEADER_SIZE;

/// Error returned by [`replay_hex`].
#[derive(Error, Debug)]
#[expect(missing_docs)]
pub enum ReplayError {
    #[error("failed to decode hex dump")]
    Decode(#[source] CommandBuildError),
    #[error("hex dump decodes to {0} bytes, shorter than a command header")]
    TooShort(usize),
    #[error("failed to send replayed command")]
    Send(#[source] TpmCommandError),
}

/// What a replayed command produced.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    /// The decoded command bytes.
    pub command: Vec<u8>,
    /// Command code from the decoded header, if it is a known one.
    pub command_code: Option<CommandCodeEnum>,
    /// The command's own size field, when it disagrees with the decoded
    /// length.
    pub size_mismatch: Option<u32>,
    /// The TPM response.
    pub reply: RawReply,
}

impl ReplayOutcome {
    /// Whether the TPM returned `TPM_RC_SUCCESS`.
    pub fn succeeded(&self) -> bool {
        self.reply.response_code.raw == 0
    }
}

/// Decodes `text` into the context's command buffer and sends it.
pub fn replay_hex<E: TpmEngine>(
    ctx: &mut TestContext<E>,
    text: &str,
) -> Result<ReplayOutcome, ReplayError> {
    let len = decode_hex_dump(text, ctx.command_buffer()).map_err(ReplayError::Decode)?;
    if len < HEADER_SIZE {
        return Err(ReplayError::TooShort(len));
    }

    let command = ctx.last_command().to_vec();
    let command_code = CommandCodeEnum::from_u32(u32::from_be_bytes([
        command[6], command[7], command[8], command[9],
    ]));

    let size_mismatch = declared_command_size(&command).filter(|&size| size as usize != len);
    if let Some(declared) = size_mismatch {
        tracing::warn!(
            declared,
            decoded = len,
            "replayed command size field does not match its length, sending anyway"
        );
    }

    let reply = ctx.send_raw().map_err(ReplayError::Send)?;
    tracing::info!(
        ?command_code,
        response_code = %reply.response_code,
        "replayed command"
    );

    Ok(ReplayOutcome {
        command,
        command_code,
        size_mismatch,
        reply,
    })
}
