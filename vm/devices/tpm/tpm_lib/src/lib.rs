// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM test engine built on `tpm_protocol`.
//!
//! A [`TestContext`] owns one command buffer and one reply buffer and drives a
//! [`TpmEngine`] one command at a time. The key-hierarchy and NV workflows,
//! hex replay and the test registry are all expressed against it.

#![forbid(unsafe_code)]

pub mod hierarchy;
pub mod nv;
pub mod profile;
pub mod replay;
pub mod suite;
mod tpm_helper;

#[cfg(test)]
mod mock_tpm;

pub use tpm_helper::RawReply;
pub use tpm_helper::TestContext;
pub use tpm_helper::TpmCommandError;

use thiserror::Error;
use tpm_protocol::tpm20proto::CommandCodeEnum;

/// The synchronous command execution boundary.
///
/// An engine takes one complete command and writes the complete response into
/// `reply`, returning the number of response bytes. Only one command is ever
/// outstanding.
pub trait TpmEngine {
    /// Transport error.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Executes `command`, writing the response into `reply`.
    fn execute_command(&mut self, command: &[u8], reply: &mut [u8])
    -> Result<usize, Self::Error>;
}

/// Failure of a workflow step.
#[derive(Error, Debug)]
#[expect(missing_docs)]
pub enum WorkflowError {
    #[error("TPM command error - command code: {command_code:?}")]
    TpmCommandError {
        command_code: CommandCodeEnum,
        #[source]
        error: TpmCommandError,
    },
    #[error("{step} requires {requires}, which is not available")]
    MissingDependency {
        step: &'static str,
        requires: &'static str,
    },
    #[error("{what} mismatch: expected {expected}, got {actual}")]
    VerificationMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },
    #[error("{0:?} returned a zero object handle")]
    InvalidHandle(CommandCodeEnum),
}

impl WorkflowError {
    /// Wraps a command failure with the command that produced it.
    pub fn command(command_code: CommandCodeEnum) -> impl FnOnce(TpmCommandError) -> Self {
        move |error| WorkflowError::TpmCommandError {
            command_code,
            error,
        }
    }

    /// The TPM response code, if the failure was a rejected command.
    pub fn response_code(&self) -> Option<u32> {
        match self {
            WorkflowError::TpmCommandError { error, .. } => error.response_code(),
            _ => None,
        }
    }
}
