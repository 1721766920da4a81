// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command builders.
//!
//! Every builder clears the [`CommandBuffer`] it is given, writes the header
//! tag, reserves the total size, writes the command code, handles, the
//! authorization area (for `TPM_ST_SESSIONS` commands) and parameters, and
//! finally patches the size with the cursor position. The assembled command is
//! available through [`CommandBuffer::finalize`].

use crate::buffer::CommandBuffer;
use crate::buffer::CommandBuildError;
use crate::buffer::PatchToken;
use crate::buffer::PatchWidth;
use crate::marshal::NvPublic;
use crate::marshal::PcrSelection;
use crate::marshal::PublicTemplate;
use crate::marshal::SensitiveCreate;
use crate::marshal::write_password_session;
use crate::marshal::write_pcr_selection_list;
use crate::marshal::write_tpm2b;
use crate::tpm20proto::AlgIdEnum;
use crate::tpm20proto::CommandCodeEnum;
use crate::tpm20proto::ReservedHandle;
use crate::tpm20proto::SessionTagEnum;
use crate::tpm20proto::StartupType;
use crate::tpm20proto::TPM20_RH_NULL;

/// A command whose header has been written and whose size is still pending.
struct CommandFrame<'a> {
    buf: &'a mut CommandBuffer,
    size: PatchToken,
}

impl<'a> CommandFrame<'a> {
    fn begin(
        buf: &'a mut CommandBuffer,
        session_tag: SessionTagEnum,
        command_code: CommandCodeEnum,
    ) -> Result<Self, CommandBuildError> {
        buf.clear();
        buf.write_u16(session_tag.into())?;
        let size = buf.reserve(PatchWidth::U32)?;
        buf.write_u32(command_code.into())?;
        Ok(Self { buf, size })
    }

    fn finish(self) -> Result<usize, CommandBuildError> {
        let len = self.buf.len();
        self.buf.patch(self.size, len as u32)?;
        Ok(len)
    }
}

/// `TPM2_Startup`
pub fn startup(
    buf: &mut CommandBuffer,
    startup_type: StartupType,
) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(buf, SessionTagEnum::NoSessions, CommandCodeEnum::Startup)?;
    frame.buf.write_u16(startup_type as u16)?;
    frame.finish()
}

/// `TPM2_SelfTest`
pub fn self_test(buf: &mut CommandBuffer, full_test: bool) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(buf, SessionTagEnum::NoSessions, CommandCodeEnum::SelfTest)?;
    frame.buf.write_u8(full_test.into())?;
    frame.finish()
}

/// `TPM2_GetRandom`
pub fn get_random(buf: &mut CommandBuffer, bytes_requested: u16) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(buf, SessionTagEnum::NoSessions, CommandCodeEnum::GetRandom)?;
    frame.buf.write_u16(bytes_requested)?;
    frame.finish()
}

/// `TPM2_PCR_Read`
pub fn pcr_read(
    buf: &mut CommandBuffer,
    selections: &[PcrSelection],
) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(buf, SessionTagEnum::NoSessions, CommandCodeEnum::PCR_Read)?;
    write_pcr_selection_list(frame.buf, selections)?;
    frame.finish()
}

/// `TPM2_GetCapability`
pub fn get_capability(
    buf: &mut CommandBuffer,
    capability: u32,
    property: u32,
    property_count: u32,
) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(
        buf,
        SessionTagEnum::NoSessions,
        CommandCodeEnum::GetCapability,
    )?;
    frame.buf.write_u32(capability)?;
    frame.buf.write_u32(property)?;
    frame.buf.write_u32(property_count)?;
    frame.finish()
}

/// `TPM2_Hash`
pub fn hash(
    buf: &mut CommandBuffer,
    data: &[u8],
    hash_alg: AlgIdEnum,
    hierarchy: ReservedHandle,
) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(buf, SessionTagEnum::NoSessions, CommandCodeEnum::Hash)?;
    write_tpm2b(frame.buf, data)?;
    frame.buf.write_u16(hash_alg.into())?;
    frame.buf.write_u32(hierarchy.get())?;
    frame.finish()
}

/// `TPM2_NV_DefineSpace`
///
/// # Arguments
/// * `auth_handle`: Hierarchy authorizing the definition, owner or platform.
/// * `auth_value`: Authorization value of the new index.
/// * `public`: Public area of the new index.
///
pub fn nv_define_space(
    buf: &mut CommandBuffer,
    auth_handle: ReservedHandle,
    auth_value: &[u8],
    public: &NvPublic,
) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(
        buf,
        SessionTagEnum::Sessions,
        CommandCodeEnum::NV_DefineSpace,
    )?;
    frame.buf.write_u32(auth_handle.get())?;
    write_password_session(frame.buf)?;
    write_tpm2b(frame.buf, auth_value)?;
    public.write_tpm2b(frame.buf)?;
    frame.finish()
}

/// `TPM2_NV_Write`
pub fn nv_write(
    buf: &mut CommandBuffer,
    auth_handle: u32,
    nv_index: u32,
    data: &[u8],
    offset: u16,
) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(buf, SessionTagEnum::Sessions, CommandCodeEnum::NV_Write)?;
    frame.buf.write_u32(auth_handle)?;
    frame.buf.write_u32(nv_index)?;
    write_password_session(frame.buf)?;
    write_tpm2b(frame.buf, data)?;
    frame.buf.write_u16(offset)?;
    frame.finish()
}

/// `TPM2_NV_Read`
pub fn nv_read(
    buf: &mut CommandBuffer,
    auth_handle: u32,
    nv_index: u32,
    size: u16,
    offset: u16,
) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(buf, SessionTagEnum::Sessions, CommandCodeEnum::NV_Read)?;
    frame.buf.write_u32(auth_handle)?;
    frame.buf.write_u32(nv_index)?;
    write_password_session(frame.buf)?;
    frame.buf.write_u16(size)?;
    frame.buf.write_u16(offset)?;
    frame.finish()
}

/// `TPM2_CreatePrimary` with no outside info and an empty creation PCR list.
pub fn create_primary(
    buf: &mut CommandBuffer,
    primary_handle: ReservedHandle,
    sensitive: &SensitiveCreate,
    template: &PublicTemplate,
) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(
        buf,
        SessionTagEnum::Sessions,
        CommandCodeEnum::CreatePrimary,
    )?;
    frame.buf.write_u32(primary_handle.get())?;
    write_password_session(frame.buf)?;
    sensitive.write_tpm2b(frame.buf)?;
    template.write_tpm2b(frame.buf)?;
    write_creation_tail(frame.buf)?;
    frame.finish()
}

/// `TPM2_Create` with no outside info and an empty creation PCR list.
pub fn create(
    buf: &mut CommandBuffer,
    parent_handle: u32,
    sensitive: &SensitiveCreate,
    template: &PublicTemplate,
) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(buf, SessionTagEnum::Sessions, CommandCodeEnum::Create)?;
    frame.buf.write_u32(parent_handle)?;
    write_password_session(frame.buf)?;
    sensitive.write_tpm2b(frame.buf)?;
    template.write_tpm2b(frame.buf)?;
    write_creation_tail(frame.buf)?;
    frame.finish()
}

/// Empty `outsideInfo` followed by an empty `creationPCR` list.
fn write_creation_tail(buf: &mut CommandBuffer) -> Result<(), CommandBuildError> {
    write_tpm2b(buf, &[])?;
    write_pcr_selection_list(buf, &[])
}

/// `TPM2_Load`
///
/// `in_private` and `in_public` are the contents of the `TPM2B_PRIVATE` and
/// `TPM2B_PUBLIC` returned by `TPM2_Create`, without their size prefixes.
pub fn load(
    buf: &mut CommandBuffer,
    parent_handle: u32,
    in_private: &[u8],
    in_public: &[u8],
) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(buf, SessionTagEnum::Sessions, CommandCodeEnum::Load)?;
    frame.buf.write_u32(parent_handle)?;
    write_password_session(frame.buf)?;
    write_tpm2b(frame.buf, in_private)?;
    write_tpm2b(frame.buf, in_public)?;
    frame.finish()
}

/// `TPM2_Sign` using the key's default scheme and a null hashcheck ticket.
pub fn sign(
    buf: &mut CommandBuffer,
    key_handle: u32,
    digest: &[u8],
) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(buf, SessionTagEnum::Sessions, CommandCodeEnum::Sign)?;
    frame.buf.write_u32(key_handle)?;
    write_password_session(frame.buf)?;
    write_tpm2b(frame.buf, digest)?;
    // inScheme
    frame.buf.write_u16(AlgIdEnum::NULL.into())?;
    // validation
    frame.buf.write_u16(SessionTagEnum::Hashcheck.into())?;
    frame.buf.write_u32(TPM20_RH_NULL.get())?;
    write_tpm2b(frame.buf, &[])?;
    frame.finish()
}

/// `TPM2_FlushContext`
pub fn flush_context(buf: &mut CommandBuffer, flush_handle: u32) -> Result<usize, CommandBuildError> {
    let frame = CommandFrame::begin(
        buf,
        SessionTagEnum::NoSessions,
        CommandCodeEnum::FlushContext,
    )?;
    frame.buf.write_u32(flush_handle)?;
    frame.finish()
}
