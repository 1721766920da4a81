// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 2.0 command and response codec.
//!
//! Commands are assembled into a caller-owned [`buffer::CommandBuffer`] by the
//! builders in [`command`], and replies are taken apart by [`response`]. The
//! crate does no I/O; sending the bytes is left to the caller.

pub mod buffer;
pub mod command;
pub mod hex;
pub mod marshal;
pub mod response;
pub mod tpm20proto;

use tpm20proto::ReservedHandle;
use tpm20proto::TPM20_HT_NV_INDEX;
use tpm20proto::TpmaNvBits;
use tpm20proto::TpmaObjectBits;

/// NV index used by the NV storage workflow when none is given.
pub const TPM_NV_INDEX_TEST: ReservedHandle = ReservedHandle::new(TPM20_HT_NV_INDEX, 0x50_0002);

/// Payload written to and read back from [`TPM_NV_INDEX_TEST`].
pub const TPM_NV_TEST_DATA: &[u8; 8] = b"ABCDEFGH";

/// Attributes of a restricted decryption key used as a storage parent.
pub fn storage_key_attributes() -> TpmaObjectBits {
    TpmaObjectBits::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_restricted(true)
        .with_decrypt(true)
}

/// Attributes of an unrestricted signing key.
pub fn signing_key_attributes() -> TpmaObjectBits {
    TpmaObjectBits::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_sign_encrypt(true)
}

/// Attributes of the test NV index: read and write with either owner or
/// index authorization.
pub fn nv_test_attributes() -> TpmaNvBits {
    TpmaNvBits::new()
        .with_nv_ownerwrite(true)
        .with_nv_authwrite(true)
        .with_nv_ownerread(true)
        .with_nv_authread(true)
}

pub use buffer::CommandBuffer;
pub use buffer::CommandBuildError;
pub use buffer::ResponseError;
pub use response::Reply;
pub use tpm20proto::AlgIdEnum;
pub use tpm20proto::CommandCodeEnum;
pub use tpm20proto::DecodedResponseCode;
pub use tpm20proto::ResponseCode;
pub use tpm20proto::TPM20_RH_NULL;
pub use tpm20proto::TPM20_RH_OWNER;
pub use tpm20proto::TPM20_RS_PW;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_descriptors() {
        assert_eq!(TPM_NV_INDEX_TEST.get(), 0x0150_0002);
        assert_eq!(u32::from(storage_key_attributes()), 0x0003_0072);
        assert_eq!(u32::from(signing_key_attributes()), 0x0004_0072);
        assert_eq!(u32::from(nv_test_attributes()), 0x0006_0006);
    }
}
