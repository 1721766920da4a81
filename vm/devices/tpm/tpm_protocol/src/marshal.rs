// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Marshalling of the structures nested inside command parameters:
//! size-prefixed fields, the password session, public templates, NV public
//! areas and PCR selections.

use crate::buffer::CommandBuffer;
use crate::buffer::CommandBuildError;
use crate::buffer::PatchWidth;
use crate::buffer::ReplyReader;
use crate::buffer::ResponseError;
use crate::tpm20proto::AlgIdEnum;
use crate::tpm20proto::CmdAuth;
use crate::tpm20proto::EccCurve;
use crate::tpm20proto::TpmaNvBits;
use crate::tpm20proto::TpmaObjectBits;
use zerocopy::IntoBytes;

/// Size of the authorization area body for one empty password session.
pub const PASSWORD_SESSION_SIZE: u32 = 9;

/// Writes a `TPM2B`: a `u16` size followed by exactly that many bytes.
pub fn write_tpm2b(buf: &mut CommandBuffer, content: &[u8]) -> Result<(), CommandBuildError> {
    let size = u16::try_from(content.len()).map_err(|_| CommandBuildError::FieldTooLarge {
        size: content.len(),
        width: 2,
    })?;
    buf.write_u16(size)?;
    buf.write_bytes(content)
}

/// Decodes the `TPM2B` at `offset` in `bytes`.
///
/// Returns the content and the offset just past it. Fails without reading
/// anything if the declared size runs past the end of `bytes`.
pub fn read_tpm2b(bytes: &[u8], offset: usize) -> Result<(&[u8], usize), ResponseError> {
    let tail = bytes.get(offset..).ok_or(ResponseError::Truncated {
        offset,
        needed: 2,
        available: 0,
    })?;
    let mut reader = ReplyReader::with_base(tail, offset);
    let content = reader.read_tpm2b()?;
    Ok((content, reader.position()))
}

/// Writes a sized structure: reserves the `u16` size, runs `body`, then
/// patches the size with however many bytes `body` wrote.
pub fn write_sized<F>(buf: &mut CommandBuffer, body: F) -> Result<(), CommandBuildError>
where
    F: FnOnce(&mut CommandBuffer) -> Result<(), CommandBuildError>,
{
    let size = buf.reserve(PatchWidth::U16)?;
    body(buf)?;
    buf.patch_size_since(size)
}

/// Appends an authorization area holding a single empty password session.
///
/// Returns the number of bytes written, always 13.
pub fn write_password_session(buf: &mut CommandBuffer) -> Result<usize, CommandBuildError> {
    let start = buf.len();
    buf.write_u32(PASSWORD_SESSION_SIZE)?;
    buf.write_bytes(CmdAuth::password().as_bytes())?;
    Ok(buf.len() - start)
}

/// `TPMT_SYM_DEF_OBJECT`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SymmetricDefinition {
    /// No symmetric protection.
    Null,
    /// A block cipher in the given mode.
    Block {
        /// Cipher, e.g. AES or SM4.
        algorithm: AlgIdEnum,
        /// Key size in bits.
        key_bits: u16,
        /// Block mode, e.g. CFB.
        mode: AlgIdEnum,
    },
}

impl SymmetricDefinition {
    fn encode(&self, buf: &mut CommandBuffer) -> Result<(), CommandBuildError> {
        match *self {
            SymmetricDefinition::Null => buf.write_u16(AlgIdEnum::NULL.into()),
            SymmetricDefinition::Block {
                algorithm,
                key_bits,
                mode,
            } => {
                buf.write_u16(algorithm.into())?;
                buf.write_u16(key_bits)?;
                buf.write_u16(mode.into())
            }
        }
    }
}

/// A scheme selector with its hash, used for signing schemes and KDFs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchemeDefinition {
    /// `TPM_ALG_NULL`, the key default.
    Null,
    /// An explicit scheme.
    Scheme {
        /// Scheme algorithm, e.g. RSASSA or ECDSA.
        scheme: AlgIdEnum,
        /// Hash used by the scheme.
        hash: AlgIdEnum,
    },
}

impl SchemeDefinition {
    fn encode(&self, buf: &mut CommandBuffer) -> Result<(), CommandBuildError> {
        match *self {
            SchemeDefinition::Null => buf.write_u16(AlgIdEnum::NULL.into()),
            SchemeDefinition::Scheme { scheme, hash } => {
                buf.write_u16(scheme.into())?;
                buf.write_u16(hash.into())
            }
        }
    }
}

/// Algorithm-specific part of a public template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicParameters {
    /// `TPMS_RSA_PARMS`
    Rsa {
        /// Protection for child keys, `Null` for signing keys.
        symmetric: SymmetricDefinition,
        /// Signing scheme.
        scheme: SchemeDefinition,
        /// Modulus size in bits.
        key_bits: u16,
        /// Zero selects the default exponent.
        exponent: u32,
    },
    /// `TPMS_ECC_PARMS`
    Ecc {
        /// Protection for child keys, `Null` for signing keys.
        symmetric: SymmetricDefinition,
        /// Signing scheme.
        scheme: SchemeDefinition,
        /// Named curve.
        curve: EccCurve,
        /// Key derivation scheme.
        kdf: SchemeDefinition,
    },
}

impl PublicParameters {
    /// `TPM_ALG_RSA` or `TPM_ALG_ECC`.
    pub fn algorithm(&self) -> AlgIdEnum {
        match self {
            PublicParameters::Rsa { .. } => AlgIdEnum::RSA,
            PublicParameters::Ecc { .. } => AlgIdEnum::ECC,
        }
    }
}

/// `TPMT_PUBLIC` for key generation. The unique field is always empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicTemplate {
    /// Algorithm used to compute the object name.
    pub name_alg: AlgIdEnum,
    /// `TPMA_OBJECT`
    pub attributes: TpmaObjectBits,
    /// Policy digest, empty for none.
    pub auth_policy: Vec<u8>,
    /// Algorithm-specific parameters.
    pub parameters: PublicParameters,
}

impl PublicTemplate {
    /// Writes the `TPMT_PUBLIC` body, without the outer size prefix.
    pub fn encode(&self, buf: &mut CommandBuffer) -> Result<(), CommandBuildError> {
        buf.write_u16(self.parameters.algorithm().into())?;
        buf.write_u16(self.name_alg.into())?;
        buf.write_u32(self.attributes.into())?;
        write_tpm2b(buf, &self.auth_policy)?;

        match &self.parameters {
            PublicParameters::Rsa {
                symmetric,
                scheme,
                key_bits,
                exponent,
            } => {
                symmetric.encode(buf)?;
                scheme.encode(buf)?;
                buf.write_u16(*key_bits)?;
                buf.write_u32(*exponent)?;
                // unique.rsa
                write_tpm2b(buf, &[])
            }
            PublicParameters::Ecc {
                symmetric,
                scheme,
                curve,
                kdf,
            } => {
                symmetric.encode(buf)?;
                scheme.encode(buf)?;
                buf.write_u16((*curve).into())?;
                kdf.encode(buf)?;
                // unique.ecc x and y
                write_tpm2b(buf, &[])?;
                write_tpm2b(buf, &[])
            }
        }
    }

    /// Writes the template as a `TPM2B_PUBLIC`.
    pub fn write_tpm2b(&self, buf: &mut CommandBuffer) -> Result<(), CommandBuildError> {
        write_sized(buf, |buf| self.encode(buf))
    }
}

/// `TPMS_SENSITIVE_CREATE`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensitiveCreate {
    /// Authorization value for the new object.
    pub user_auth: Vec<u8>,
    /// Sensitive data for a sealed object, empty otherwise.
    pub data: Vec<u8>,
}

impl SensitiveCreate {
    /// Writes the structure as a `TPM2B_SENSITIVE_CREATE`.
    pub fn write_tpm2b(&self, buf: &mut CommandBuffer) -> Result<(), CommandBuildError> {
        write_sized(buf, |buf| {
            write_tpm2b(buf, &self.user_auth)?;
            write_tpm2b(buf, &self.data)
        })
    }
}

/// `TPMS_NV_PUBLIC`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvPublic {
    /// The index handle.
    pub nv_index: u32,
    /// Algorithm used to compute the index name.
    pub name_alg: AlgIdEnum,
    /// `TPMA_NV`
    pub attributes: TpmaNvBits,
    /// Policy digest, empty for none.
    pub auth_policy: Vec<u8>,
    /// Data area size in bytes.
    pub data_size: u16,
}

impl NvPublic {
    /// Writes the structure as a `TPM2B_NV_PUBLIC`.
    pub fn write_tpm2b(&self, buf: &mut CommandBuffer) -> Result<(), CommandBuildError> {
        write_sized(buf, |buf| {
            buf.write_u32(self.nv_index)?;
            buf.write_u16(self.name_alg.into())?;
            buf.write_u32(self.attributes.into())?;
            write_tpm2b(buf, &self.auth_policy)?;
            buf.write_u16(self.data_size)
        })
    }
}

/// `TPMS_PCR_SELECTION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSelection {
    /// Bank hash algorithm.
    pub hash: u16,
    /// One bit per PCR, PCR 0 in the low bit of the first byte.
    pub bitmap: Vec<u8>,
}

impl PcrSelection {
    /// Selects a single PCR of the `hash` bank using a `size_of_select` byte map.
    pub fn single(hash: AlgIdEnum, pcr: u8, size_of_select: u8) -> Self {
        let mut bitmap = vec![0u8; size_of_select.into()];
        if let Some(byte) = bitmap.get_mut(usize::from(pcr / 8)) {
            *byte |= 1 << (pcr % 8);
        }
        Self {
            hash: hash.into(),
            bitmap,
        }
    }

    /// Indices of the selected PCRs.
    pub fn selected(&self) -> impl Iterator<Item = u32> + '_ {
        self.bitmap.iter().enumerate().flat_map(|(i, byte)| {
            (0..8u32)
                .filter(move |bit| byte & (1 << bit) != 0)
                .map(move |bit| i as u32 * 8 + bit)
        })
    }

    pub(crate) fn decode(reader: &mut ReplyReader<'_>) -> Result<Self, ResponseError> {
        let hash = reader.read_u16()?;
        let size = reader.read_u8()?;
        let bitmap = reader.read_bytes(size.into())?.to_vec();
        Ok(Self { hash, bitmap })
    }
}

/// Writes a `TPML_PCR_SELECTION`.
pub fn write_pcr_selection_list(
    buf: &mut CommandBuffer,
    selections: &[PcrSelection],
) -> Result<(), CommandBuildError> {
    buf.write_u32(selections.len() as u32)?;
    for selection in selections {
        let size = u8::try_from(selection.bitmap.len()).map_err(|_| {
            CommandBuildError::FieldTooLarge {
                size: selection.bitmap.len(),
                width: 1,
            }
        })?;
        buf.write_u16(selection.hash)?;
        buf.write_u8(size)?;
        buf.write_bytes(&selection.bitmap)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::read_be16;

    #[test]
    fn test_tpm2b_round_trip() {
        let mut buf = CommandBuffer::new();
        write_tpm2b(&mut buf, b"ABCDEFGH").unwrap();
        write_tpm2b(&mut buf, &[]).unwrap();
        let bytes = buf.finalize();
        assert_eq!(&bytes[..2], &[0x00, 0x08]);

        let (content, next) = read_tpm2b(bytes, 0).unwrap();
        assert_eq!(content, b"ABCDEFGH");
        assert_eq!(next, 10);
        let (content, next) = read_tpm2b(bytes, next).unwrap();
        assert!(content.is_empty());
        assert_eq!(next, bytes.len());
    }

    #[test]
    fn test_tpm2b_truncated() {
        let mut buf = CommandBuffer::new();
        write_tpm2b(&mut buf, &[0x5a; 32]).unwrap();
        let bytes = buf.finalize();

        for len in 0..bytes.len() {
            assert!(
                matches!(
                    read_tpm2b(&bytes[..len], 0),
                    Err(ResponseError::Truncated { .. })
                ),
                "length {len} should be rejected"
            );
        }
        assert!(read_tpm2b(bytes, bytes.len() + 3).is_err());
    }

    #[test]
    fn test_tpm2b_too_large() {
        let mut buf = CommandBuffer::with_capacity(0x20000);
        let content = vec![0u8; 0x10000];
        assert_eq!(
            write_tpm2b(&mut buf, &content),
            Err(CommandBuildError::FieldTooLarge {
                size: 0x10000,
                width: 2
            })
        );
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_password_session() {
        let mut buf = CommandBuffer::new();
        assert_eq!(write_password_session(&mut buf).unwrap(), 13);
        assert_eq!(
            buf.finalize(),
            &[0, 0, 0, 9, 0x40, 0, 0, 9, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_rsa_template_size_prefix() {
        let template = PublicTemplate {
            name_alg: AlgIdEnum::SHA256,
            attributes: TpmaObjectBits::from(0x0003_0072),
            auth_policy: Vec::new(),
            parameters: PublicParameters::Rsa {
                symmetric: SymmetricDefinition::Block {
                    algorithm: AlgIdEnum::AES,
                    key_bits: 128,
                    mode: AlgIdEnum::CFB,
                },
                scheme: SchemeDefinition::Null,
                key_bits: 2048,
                exponent: 0,
            },
        };

        let mut buf = CommandBuffer::new();
        template.write_tpm2b(&mut buf).unwrap();
        const EXPECTED: [u8; 28] = [
            0x00, 0x1a, // size
            0x00, 0x01, // RSA
            0x00, 0x0b, // SHA256
            0x00, 0x03, 0x00, 0x72, // attributes
            0x00, 0x00, // authPolicy
            0x00, 0x06, 0x00, 0x80, 0x00, 0x43, // AES-128-CFB
            0x00, 0x10, // scheme NULL
            0x08, 0x00, // 2048 bits
            0x00, 0x00, 0x00, 0x00, // exponent
            0x00, 0x00, // unique
        ];
        assert_eq!(buf.finalize(), &EXPECTED);
        assert_eq!(read_be16(buf.finalize(), 0) as usize, buf.len() - 2);
    }

    #[test]
    fn test_ecc_template_size_prefix() {
        let template = PublicTemplate {
            name_alg: AlgIdEnum::SHA256,
            attributes: TpmaObjectBits::from(0x0004_0072),
            auth_policy: Vec::new(),
            parameters: PublicParameters::Ecc {
                symmetric: SymmetricDefinition::Null,
                scheme: SchemeDefinition::Scheme {
                    scheme: AlgIdEnum::ECDSA,
                    hash: AlgIdEnum::SHA256,
                },
                curve: EccCurve::NIST_P256,
                kdf: SchemeDefinition::Null,
            },
        };

        let mut buf = CommandBuffer::new();
        template.write_tpm2b(&mut buf).unwrap();
        let bytes = buf.finalize();
        assert_eq!(read_be16(bytes, 0) as usize, bytes.len() - 2);
        assert_eq!(&bytes[2..4], &[0x00, 0x23]);
        assert_eq!(
            &bytes[12..],
            &[
                0x00, 0x10, 0x00, 0x18, 0x00, 0x0b, 0x00, 0x03, 0x00, 0x10, 0x00, 0x00, 0x00,
                0x00
            ]
        );
    }

    #[test]
    fn test_nv_public() {
        let public = NvPublic {
            nv_index: 0x0150_0002,
            name_alg: AlgIdEnum::SHA256,
            attributes: TpmaNvBits::from(0x0006_0006),
            auth_policy: Vec::new(),
            data_size: 8,
        };
        let mut buf = CommandBuffer::new();
        public.write_tpm2b(&mut buf).unwrap();
        assert_eq!(
            buf.finalize(),
            &[
                0x00, 0x0e, 0x01, 0x50, 0x00, 0x02, 0x00, 0x0b, 0x00, 0x06, 0x00, 0x06, 0x00,
                0x00, 0x00, 0x08
            ]
        );
    }

    #[test]
    fn test_pcr_selection() {
        let selection = PcrSelection::single(AlgIdEnum::SHA256, 0, 3);
        assert_eq!(selection.bitmap, vec![0x01, 0x00, 0x00]);
        assert_eq!(selection.selected().collect::<Vec<_>>(), vec![0]);

        let selection = PcrSelection::single(AlgIdEnum::SHA256, 17, 3);
        assert_eq!(selection.selected().collect::<Vec<_>>(), vec![17]);

        let mut buf = CommandBuffer::new();
        write_pcr_selection_list(&mut buf, &[PcrSelection::single(AlgIdEnum::SHA256, 0, 3)])
            .unwrap();
        assert_eq!(
            buf.finalize(),
            &[0, 0, 0, 1, 0x00, 0x0b, 3, 0x01, 0x00, 0x00]
        );
    }
}
