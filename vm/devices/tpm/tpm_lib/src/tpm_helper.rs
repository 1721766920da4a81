// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The module includes the helper functions for sending TPM commands.

use crate::TpmEngine;
use thiserror::Error;
use tpm_protocol::buffer::CommandBuffer;
use tpm_protocol::buffer::CommandBuildError;
use tpm_protocol::buffer::ResponseError;
use tpm_protocol::command;
use tpm_protocol::marshal::NvPublic;
use tpm_protocol::marshal::PcrSelection;
use tpm_protocol::marshal::PublicTemplate;
use tpm_protocol::marshal::SensitiveCreate;
use tpm_protocol::response;
use tpm_protocol::response::CapabilityReply;
use tpm_protocol::response::CreatePrimaryReply;
use tpm_protocol::response::CreateReply;
use tpm_protocol::response::HashReply;
use tpm_protocol::response::LoadReply;
use tpm_protocol::response::PcrReadReply;
use tpm_protocol::response::Reply;
use tpm_protocol::response::Signature;
use tpm_protocol::tpm20proto::AlgIdEnum;
use tpm_protocol::tpm20proto::CommandCodeEnum;
use tpm_protocol::tpm20proto::DecodedResponseCode;
use tpm_protocol::tpm20proto::ReservedHandle;
use tpm_protocol::tpm20proto::StartupType;

// The size of command and response buffers.
// DEVNOTE: Large enough for every command this crate builds and for the
// largest response a TPM returns to them.
const TPM_PAGE_SIZE: usize = 4096;

/// Error returned by the [`TestContext`] command helpers.
#[derive(Error, Debug)]
#[expect(missing_docs)]
pub enum TpmCommandError {
    #[error("failed to execute the TPM command")]
    TpmExecuteCommand(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid response from the TPM command")]
    InvalidResponse(#[source] ResponseError),
    #[error("invalid response from the TPM command, object {object_handle:#x} was created")]
    InvalidObjectResponse {
        object_handle: u32,
        #[source]
        error: ResponseError,
    },
    #[error("TPM command failed, response code: {response_code:#x} ({decoded})")]
    TpmCommandFailed {
        response_code: u32,
        decoded: DecodedResponseCode,
    },
    #[error("failed to create the TPM command struct")]
    TpmCommandCreationFailed(#[source] CommandBuildError),
}

impl TpmCommandError {
    fn failed(response_code: u32) -> Self {
        TpmCommandError::TpmCommandFailed {
            response_code,
            decoded: DecodedResponseCode::new(response_code),
        }
    }

    /// The response code of a command the TPM rejected.
    pub fn response_code(&self) -> Option<u32> {
        match self {
            TpmCommandError::TpmCommandFailed { response_code, .. } => Some(*response_code),
            _ => None,
        }
    }

    /// The handle of an object the TPM created although its reply could not
    /// be parsed. The caller owns the object and must flush it.
    pub fn object_handle(&self) -> Option<u32> {
        match self {
            TpmCommandError::InvalidObjectResponse { object_handle, .. } => Some(*object_handle),
            _ => None,
        }
    }
}

/// A response kept whole, as returned for replayed commands.
#[derive(Debug, Clone)]
pub struct RawReply {
    /// Session tag from the header.
    pub session_tag: u16,
    /// Response code from the header.
    pub response_code: DecodedResponseCode,
    /// The whole response.
    pub bytes: Vec<u8>,
}

/// State for one sequential run of TPM commands.
///
/// The command and reply buffers are reused by every command sent through the
/// context. Workflows that need to run concurrently each need their own.
pub struct TestContext<E: TpmEngine> {
    /// An TPM engine instance.
    tpm_engine: E,
    command_buffer: CommandBuffer,
    /// Buffer used to hold the command response.
    reply_buffer: Box<[u8]>,
}

impl<E: TpmEngine> TestContext<E> {
    /// A context driving `tpm_engine`.
    pub fn new(tpm_engine: E) -> Self {
        Self {
            tpm_engine,
            command_buffer: CommandBuffer::with_capacity(TPM_PAGE_SIZE),
            reply_buffer: vec![0u8; TPM_PAGE_SIZE].into_boxed_slice(),
        }
    }

    /// The engine commands are sent through.
    pub fn engine(&self) -> &E {
        &self.tpm_engine
    }

    /// Mutable access to the engine.
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.tpm_engine
    }

    /// Consumes the context, returning the engine.
    pub fn into_engine(self) -> E {
        self.tpm_engine
    }

    /// The buffer the next command is assembled in.
    pub fn command_buffer(&mut self) -> &mut CommandBuffer {
        &mut self.command_buffer
    }

    /// The last command sent.
    pub fn last_command(&self) -> &[u8] {
        self.command_buffer.finalize()
    }

    /// Sends the command currently in the command buffer and parses the reply
    /// header, whatever the response code.
    fn exchange(&mut self) -> Result<Reply<'_>, TpmCommandError> {
        let command = self.command_buffer.finalize();
        let len = self
            .tpm_engine
            .execute_command(command, &mut self.reply_buffer)
            .map_err(|e| TpmCommandError::TpmExecuteCommand(Box::new(e)))?;

        let received = self
            .reply_buffer
            .get(..len)
            .ok_or(TpmCommandError::InvalidResponse(ResponseError::Truncated {
                offset: 0,
                needed: len,
                available: self.reply_buffer.len(),
            }))?;

        Reply::parse(received).map_err(TpmCommandError::InvalidResponse)
    }

    /// Builds a command, sends it and extracts the typed result.
    fn submit<T>(
        &mut self,
        command_code: CommandCodeEnum,
        build: impl FnOnce(&mut CommandBuffer) -> Result<usize, CommandBuildError>,
        parse: impl FnOnce(&Reply<'_>) -> Result<T, ResponseError>,
    ) -> Result<T, TpmCommandError> {
        let len = build(&mut self.command_buffer).map_err(TpmCommandError::TpmCommandCreationFailed)?;
        tracing::debug!(?command_code, len, "sending TPM command");

        let reply = self.exchange().inspect_err(|error| {
            tracing::error!(
                ?command_code,
                err = error as &dyn std::error::Error,
                "failed to exchange TPM command"
            );
        })?;
        if !reply.is_success() {
            tracing::debug!(
                ?command_code,
                response_code = %reply.decoded_response_code(),
                "TPM command rejected"
            );
            return Err(TpmCommandError::failed(reply.response_code()));
        }

        parse(&reply).map_err(|error| {
            tracing::error!(
                ?command_code,
                err = &error as &dyn std::error::Error,
                "invalid TPM response"
            );
            TpmCommandError::InvalidResponse(error)
        })
    }

    /// [`Self::submit`] for commands that create a transient object. The
    /// object handle is read ahead of the parameters, so a reply whose
    /// parameters are invalid still reports the handle to flush.
    fn submit_object<T>(
        &mut self,
        command_code: CommandCodeEnum,
        build: impl FnOnce(&mut CommandBuffer) -> Result<usize, CommandBuildError>,
        parse: impl FnOnce(&Reply<'_>) -> Result<T, ResponseError>,
    ) -> Result<T, TpmCommandError> {
        let mut object_handle = None;
        let result = self.submit(command_code, build, |reply| {
            object_handle = response::parse_object_handle(reply).ok();
            parse(reply)
        });
        match (result, object_handle) {
            (Err(TpmCommandError::InvalidResponse(error)), Some(object_handle))
                if object_handle != 0 =>
            {
                tracing::warn!(
                    ?command_code,
                    object_handle,
                    "TPM created an object but its reply is invalid"
                );
                Err(TpmCommandError::InvalidObjectResponse {
                    object_handle,
                    error,
                })
            }
            (result, _) => result,
        }
    }

    // === TPM commands === //

    /// Helper function to send Startup command.
    ///
    /// # Arguments
    /// * `startup_type`: The requested type to the command.
    ///
    pub fn startup(&mut self, startup_type: StartupType) -> Result<(), TpmCommandError> {
        self.submit(
            CommandCodeEnum::Startup,
            |buf| command::startup(buf, startup_type),
            |_| Ok(()),
        )
    }

    /// Helper function to send SelfTest command.
    ///
    /// # Arguments
    /// * `full_test`: Perform full test or not.
    ///
    pub fn self_test(&mut self, full_test: bool) -> Result<(), TpmCommandError> {
        self.submit(
            CommandCodeEnum::SelfTest,
            |buf| command::self_test(buf, full_test),
            |_| Ok(()),
        )
    }

    /// Helper function to send GetRandom command.
    pub fn get_random(&mut self, bytes_requested: u16) -> Result<Vec<u8>, TpmCommandError> {
        self.submit(
            CommandCodeEnum::GetRandom,
            |buf| command::get_random(buf, bytes_requested),
            response::parse_get_random,
        )
    }

    /// Helper function to send PCR_Read command.
    pub fn pcr_read(&mut self, selections: &[PcrSelection]) -> Result<PcrReadReply, TpmCommandError> {
        self.submit(
            CommandCodeEnum::PCR_Read,
            |buf| command::pcr_read(buf, selections),
            response::parse_pcr_read,
        )
    }

    /// Helper function to send GetCapability command.
    ///
    /// # Arguments
    /// * `capability`: Group selector, e.g. `TPM_CAP_TPM_PROPERTIES`.
    /// * `property`: First property of the group to return.
    /// * `property_count`: Number of properties to return.
    ///
    pub fn get_capability(
        &mut self,
        capability: u32,
        property: u32,
        property_count: u32,
    ) -> Result<CapabilityReply, TpmCommandError> {
        self.submit(
            CommandCodeEnum::GetCapability,
            |buf| command::get_capability(buf, capability, property, property_count),
            response::parse_get_capability,
        )
    }

    /// Helper function to send Hash command.
    pub fn hash(
        &mut self,
        data: &[u8],
        hash_alg: AlgIdEnum,
        hierarchy: ReservedHandle,
    ) -> Result<HashReply, TpmCommandError> {
        self.submit(
            CommandCodeEnum::Hash,
            |buf| command::hash(buf, data, hash_alg, hierarchy),
            response::parse_hash,
        )
    }

    /// Helper function to send NV_DefineSpace command.
    ///
    /// # Arguments
    /// * `auth_handle`: The authorization handle used in the command.
    /// * `auth_value`: Authorization value of the new index.
    /// * `nv_public`: Public area of the new index.
    ///
    pub fn nv_define_space(
        &mut self,
        auth_handle: ReservedHandle,
        auth_value: &[u8],
        nv_public: &NvPublic,
    ) -> Result<(), TpmCommandError> {
        self.submit(
            CommandCodeEnum::NV_DefineSpace,
            |buf| command::nv_define_space(buf, auth_handle, auth_value, nv_public),
            |_| Ok(()),
        )
    }

    /// Helper function to send NV_Write command.
    ///
    /// # Arguments
    /// * `auth_handle`: The authorization handle used in the command.
    /// * `nv_index`: The index to write.
    /// * `data`: The bytes to write.
    /// * `offset`: Offset into the index.
    ///
    pub fn nv_write(
        &mut self,
        auth_handle: u32,
        nv_index: u32,
        data: &[u8],
        offset: u16,
    ) -> Result<(), TpmCommandError> {
        self.submit(
            CommandCodeEnum::NV_Write,
            |buf| command::nv_write(buf, auth_handle, nv_index, data, offset),
            |_| Ok(()),
        )
    }

    /// Helper function to send NV_Read command.
    pub fn nv_read(
        &mut self,
        auth_handle: u32,
        nv_index: u32,
        size: u16,
        offset: u16,
    ) -> Result<Vec<u8>, TpmCommandError> {
        self.submit(
            CommandCodeEnum::NV_Read,
            |buf| command::nv_read(buf, auth_handle, nv_index, size, offset),
            response::parse_nv_read,
        )
    }

    /// Helper function to send CreatePrimary command with an empty sensitive
    /// area.
    ///
    /// # Arguments
    /// * `primary_handle`: The hierarchy to create the key under.
    /// * `template`: Public template of the key.
    ///
    pub fn create_primary(
        &mut self,
        primary_handle: ReservedHandle,
        template: &PublicTemplate,
    ) -> Result<CreatePrimaryReply, TpmCommandError> {
        self.submit_object(
            CommandCodeEnum::CreatePrimary,
            |buf| {
                command::create_primary(buf, primary_handle, &SensitiveCreate::default(), template)
            },
            response::parse_create_primary,
        )
    }

    /// Helper function to send Create command with an empty sensitive area.
    pub fn create(
        &mut self,
        parent_handle: u32,
        template: &PublicTemplate,
    ) -> Result<CreateReply, TpmCommandError> {
        self.submit(
            CommandCodeEnum::Create,
            |buf| command::create(buf, parent_handle, &SensitiveCreate::default(), template),
            response::parse_create,
        )
    }

    /// Helper function to send Load command.
    ///
    /// # Arguments
    /// * `parent_handle`: The parent the blobs were created under.
    /// * `in_private` - The private part of the key to be loaded.
    /// * `in_public` - The public part of the key to be loaded.
    ///
    pub fn load(
        &mut self,
        parent_handle: u32,
        in_private: &[u8],
        in_public: &[u8],
    ) -> Result<LoadReply, TpmCommandError> {
        self.submit_object(
            CommandCodeEnum::Load,
            |buf| command::load(buf, parent_handle, in_private, in_public),
            response::parse_load,
        )
    }

    /// Helper function to send Sign command using the key's default scheme.
    pub fn sign(&mut self, key_handle: u32, digest: &[u8]) -> Result<Signature, TpmCommandError> {
        self.submit(
            CommandCodeEnum::Sign,
            |buf| command::sign(buf, key_handle, digest),
            response::parse_sign,
        )
    }

    /// Helper function to send FlushContext command.
    ///
    /// # Arguments
    /// * `flush_handle` - The handle to flush.
    ///
    pub fn flush_context(&mut self, flush_handle: u32) -> Result<(), TpmCommandError> {
        self.submit(
            CommandCodeEnum::FlushContext,
            |buf| command::flush_context(buf, flush_handle),
            |_| Ok(()),
        )
    }

    /// Sends the bytes already placed in the command buffer as they are.
    ///
    /// A non-success response code is returned in the reply, not as an error.
    pub fn send_raw(&mut self) -> Result<RawReply, TpmCommandError> {
        tracing::debug!(len = self.command_buffer.len(), "sending raw TPM command");
        let reply = self.exchange()?;
        let session_tag = reply.header.session_tag.get();
        let response_code = reply.decoded_response_code();
        let size = reply.size();
        Ok(RawReply {
            session_tag,
            response_code,
            bytes: self.reply_buffer[..size].to_vec(),
        })
    }
}
