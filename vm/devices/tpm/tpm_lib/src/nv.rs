// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NV storage workflow: define an index, write it, read it back.

use crate::TestContext;
use crate::TpmEngine;
use crate::WorkflowError;
use crate::profile::AlgorithmProfile;
use tpm_protocol::TPM_NV_INDEX_TEST;
use tpm_protocol::marshal::NvPublic;
use tpm_protocol::nv_test_attributes;
use tpm_protocol::tpm20proto::AlgIdEnum;
use tpm_protocol::tpm20proto::CommandCodeEnum;
use tpm_protocol::tpm20proto::ResponseCode;
use tpm_protocol::tpm20proto::TPM20_RH_OWNER;
use tpm_protocol::tpm20proto::TpmaNvBits;

/// An NV index and the public area it is defined with.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NvIndexDescriptor {
    /// NV index handle.
    pub index: u32,
    /// Name algorithm.
    pub name_alg: AlgIdEnum,
    /// `TPMA_NV`
    pub attributes: TpmaNvBits,
    /// Data area size in bytes.
    pub data_size: u16,
}

impl NvIndexDescriptor {
    /// The 8 byte test index, owner and auth readable and writable.
    pub fn test_index(profile: &AlgorithmProfile) -> Self {
        Self {
            index: TPM_NV_INDEX_TEST.get(),
            name_alg: profile.hash,
            attributes: nv_test_attributes(),
            data_size: 8,
        }
    }

    fn public(&self) -> NvPublic {
        NvPublic {
            nv_index: self.index,
            name_alg: self.name_alg,
            attributes: self.attributes,
            auth_policy: Vec::new(),
            data_size: self.data_size,
        }
    }
}

/// Progress of an [`NvWorkflow`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NvState {
    /// Not defined by this workflow.
    Undefined,
    /// The index exists.
    Defined,
    /// Data has been written.
    Written,
    /// Read-back matched the written data.
    Verified,
}

/// How DefineSpace ended up succeeding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DefineOutcome {
    /// The index was defined by this run.
    Created,
    /// The TPM reported `TPM_RC_NV_DEFINED`.
    AlreadyDefined,
}

/// Defines, writes and reads back one NV index.
pub struct NvWorkflow {
    descriptor: NvIndexDescriptor,
    state: NvState,
    written: Vec<u8>,
}

impl NvWorkflow {
    /// A workflow for `descriptor`, starting `Undefined`.
    pub fn new(descriptor: NvIndexDescriptor) -> Self {
        Self {
            descriptor,
            state: NvState::Undefined,
            written: Vec::new(),
        }
    }

    /// Where the workflow stands.
    pub fn state(&self) -> NvState {
        self.state
    }

    /// The index being exercised.
    pub fn descriptor(&self) -> &NvIndexDescriptor {
        &self.descriptor
    }

    /// Defines the index under the owner hierarchy with an empty auth value.
    /// An index that already exists counts as defined.
    pub fn define<E: TpmEngine>(
        &mut self,
        ctx: &mut TestContext<E>,
    ) -> Result<DefineOutcome, WorkflowError> {
        let outcome = match ctx.nv_define_space(TPM20_RH_OWNER, &[], &self.descriptor.public()) {
            Ok(()) => DefineOutcome::Created,
            Err(error) if error.response_code() == Some(ResponseCode::NvDefined as u32) => {
                tracing::warn!(
                    nv_index = self.descriptor.index,
                    "nv index already defined, reusing it"
                );
                DefineOutcome::AlreadyDefined
            }
            Err(error) => return Err(WorkflowError::command(CommandCodeEnum::NV_DefineSpace)(error)),
        };

        self.state = NvState::Defined;
        Ok(outcome)
    }

    /// Writes `data` at offset zero with owner authorization.
    pub fn write<E: TpmEngine>(
        &mut self,
        ctx: &mut TestContext<E>,
        data: &[u8],
    ) -> Result<(), WorkflowError> {
        if self.state == NvState::Undefined {
            return Err(WorkflowError::MissingDependency {
                step: "NV_Write",
                requires: "a defined nv index",
            });
        }

        ctx.nv_write(TPM20_RH_OWNER.get(), self.descriptor.index, data, 0)
            .map_err(WorkflowError::command(CommandCodeEnum::NV_Write))?;

        self.written = data.to_vec();
        self.state = NvState::Written;
        Ok(())
    }

    /// Reads the full declared size back and compares it with what was
    /// written.
    pub fn read_and_verify<E: TpmEngine>(
        &mut self,
        ctx: &mut TestContext<E>,
    ) -> Result<Vec<u8>, WorkflowError> {
        if self.state != NvState::Written && self.state != NvState::Verified {
            return Err(WorkflowError::MissingDependency {
                step: "NV_Read",
                requires: "written nv data",
            });
        }

        let data = ctx
            .nv_read(
                TPM20_RH_OWNER.get(),
                self.descriptor.index,
                self.descriptor.data_size,
                0,
            )
            .map_err(WorkflowError::command(CommandCodeEnum::NV_Read))?;

        // Only the written prefix is compared against.
        if data.get(..self.written.len()) != Some(self.written.as_slice()) {
            return Err(WorkflowError::VerificationMismatch {
                what: "nv data",
                expected: format!("{:02x?}", self.written),
                actual: format!("{:02x?}", data),
            });
        }

        self.state = NvState::Verified;
        Ok(data)
    }

    /// Define, write and verify in one go.
    pub fn run<E: TpmEngine>(
        &mut self,
        ctx: &mut TestContext<E>,
        data: &[u8],
    ) -> Result<DefineOutcome, WorkflowError> {
        let outcome = self.define(ctx)?;
        self.write(ctx, data)?;
        self.read_and_verify(ctx)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_tpm::MockTpm;
    use tpm_protocol::TPM_NV_TEST_DATA;

    fn workflow() -> NvWorkflow {
        NvWorkflow::new(NvIndexDescriptor::test_index(&AlgorithmProfile::default()))
    }

    #[test]
    fn test_define_is_idempotent() {
        let mut ctx = TestContext::new(MockTpm::new());

        let mut first = workflow();
        assert_eq!(first.define(&mut ctx).unwrap(), DefineOutcome::Created);
        let mut second = workflow();
        assert_eq!(
            second.define(&mut ctx).unwrap(),
            DefineOutcome::AlreadyDefined
        );
        assert_eq!(second.state(), NvState::Defined);

        second.write(&mut ctx, TPM_NV_TEST_DATA).unwrap();
        assert_eq!(second.read_and_verify(&mut ctx).unwrap(), b"ABCDEFGH");
        assert_eq!(second.state(), NvState::Verified);
    }

    #[test]
    fn test_define_failure_aborts() {
        let mut ctx = TestContext::new(MockTpm::new());
        ctx.engine_mut()
            .fail_command(CommandCodeEnum::NV_DefineSpace, ResponseCode::NvSpace as u32);

        let mut nv = workflow();
        let err = nv.run(&mut ctx, TPM_NV_TEST_DATA).unwrap_err();
        assert_eq!(err.response_code(), Some(0x14b));
        assert_eq!(nv.state(), NvState::Undefined);
        assert_eq!(ctx.engine().commands(), vec![CommandCodeEnum::NV_DefineSpace]);
    }

    #[test]
    fn test_write_requires_define() {
        let mut ctx = TestContext::new(MockTpm::new());
        let mut nv = workflow();
        assert!(matches!(
            nv.write(&mut ctx, TPM_NV_TEST_DATA),
            Err(WorkflowError::MissingDependency { .. })
        ));
        assert!(nv.read_and_verify(&mut ctx).is_err());
        assert!(ctx.engine().commands().is_empty());
    }

    #[test]
    fn test_read_back_mismatch() {
        let mut ctx = TestContext::new(MockTpm::new());
        let mut nv = workflow();
        nv.define(&mut ctx).unwrap();
        nv.write(&mut ctx, TPM_NV_TEST_DATA).unwrap();
        ctx.engine_mut()
            .corrupt_nv(TPM_NV_INDEX_TEST.get(), 3, b'x');

        assert!(matches!(
            nv.read_and_verify(&mut ctx),
            Err(WorkflowError::VerificationMismatch { what: "nv data", .. })
        ));
        assert_eq!(nv.state(), NvState::Written);
    }

    #[test]
    fn test_nv_define_command_bytes() {
        let mut ctx = TestContext::new(MockTpm::new());
        workflow().define(&mut ctx).unwrap();
        let command = ctx.last_command();
        assert_eq!(command.len(), 45);
        // nvIndex, nameAlg, attributes at the start of the TPM2B_NV_PUBLIC.
        assert_eq!(
            command[31..41],
            [0x01, 0x50, 0x00, 0x02, 0x00, 0x0b, 0x00, 0x06, 0x00, 0x06]
        );
    }
}
