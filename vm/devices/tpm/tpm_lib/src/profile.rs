// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Algorithm profiles.
//!
//! A profile fixes the hash, asymmetric and symmetric algorithms used by every
//! test in a run, so the same workflows cover SHA-256 with RSA or NIST P-256 as
//! well as SM3 with SM2.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tpm_protocol::marshal::PublicParameters;
use tpm_protocol::marshal::PublicTemplate;
use tpm_protocol::marshal::SchemeDefinition;
use tpm_protocol::marshal::SymmetricDefinition;
use tpm_protocol::signing_key_attributes;
use tpm_protocol::storage_key_attributes;
use tpm_protocol::tpm20proto::AlgIdEnum;
use tpm_protocol::tpm20proto::EccCurve;

const RSA_2K_MODULUS_BITS: u16 = 2048;
const SYMMETRIC_KEY_BITS: u16 = 128;

/// Message hashed by the hash test.
pub const HASH_TEST_MESSAGE: &[u8] = b"123456";

const SHA256_OF_TEST_MESSAGE: [u8; 32] = [
    0x8d, 0x96, 0x9e, 0xef, 0x6e, 0xca, 0xd3, 0xc2, 0x9a, 0x3a, 0x62, 0x92, 0x80, 0xe6, 0x86, 0xcf,
    0x0c, 0x3f, 0x5d, 0x5a, 0x86, 0xaf, 0xf3, 0xca, 0x12, 0x02, 0x0c, 0x92, 0x3a, 0xdc, 0x6c, 0x92,
];

const SM3_OF_TEST_MESSAGE: [u8; 32] = [
    0x20, 0x7c, 0xf4, 0x10, 0x53, 0x2f, 0x92, 0xa4, 0x7d, 0xee, 0x24, 0x5c, 0xe9, 0xb1, 0x1f, 0xf7,
    0x1f, 0x57, 0x8e, 0xbd, 0x76, 0x3e, 0xb3, 0xbb, 0xea, 0x44, 0xeb, 0xd0, 0x43, 0xd0, 0x18, 0xfb,
];

/// Key algorithm of a profile.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AsymmetricAlgorithm {
    /// RSA keys.
    Rsa,
    /// ECC keys on a named curve.
    Ecc {
        /// Named curve.
        curve: EccCurve,
        /// Signing scheme.
        sign_scheme: AlgIdEnum,
    },
}

/// Hash and key algorithms used together by every test.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AlgorithmProfile {
    /// Name accepted on the command line.
    pub name: &'static str,
    /// Hash for names, PCR banks and digests.
    pub hash: AlgIdEnum,
    /// Key algorithm.
    pub asymmetric: AsymmetricAlgorithm,
    /// Block cipher protecting storage keys.
    pub symmetric: AlgIdEnum,
}

/// A profile name that matched none of [`AlgorithmProfile::ALL`].
#[derive(Error, Debug)]
#[error("unknown algorithm profile '{0}', expected one of sha256-rsa, sha256-ecc, sm3-sm2")]
pub struct UnknownProfile(String);

impl AlgorithmProfile {
    /// SHA-256 with RSA 2048.
    pub const SHA256_RSA: Self = Self {
        name: "sha256-rsa",
        hash: AlgIdEnum::SHA256,
        asymmetric: AsymmetricAlgorithm::Rsa,
        symmetric: AlgIdEnum::AES,
    };

    /// SHA-256 with ECDSA on NIST P-256.
    pub const SHA256_ECC: Self = Self {
        name: "sha256-ecc",
        hash: AlgIdEnum::SHA256,
        asymmetric: AsymmetricAlgorithm::Ecc {
            curve: EccCurve::NIST_P256,
            sign_scheme: AlgIdEnum::ECDSA,
        },
        symmetric: AlgIdEnum::AES,
    };

    /// SM3 with SM2 on the SM2 curve.
    pub const SM3_SM2: Self = Self {
        name: "sm3-sm2",
        hash: AlgIdEnum::SM3_256,
        asymmetric: AsymmetricAlgorithm::Ecc {
            curve: EccCurve::SM2_P256,
            sign_scheme: AlgIdEnum::SM2,
        },
        symmetric: AlgIdEnum::SM4,
    };

    /// Every built-in profile.
    pub const ALL: [Self; 3] = [Self::SHA256_RSA, Self::SHA256_ECC, Self::SM3_SM2];

    /// Digest size of the profile hash.
    pub fn digest_size(&self) -> usize {
        // Every profile hash is a 256-bit digest.
        self.hash.digest_size().unwrap_or(32)
    }

    /// Expected digest of [`HASH_TEST_MESSAGE`].
    pub fn expected_test_digest(&self) -> &'static [u8] {
        match self.hash {
            AlgIdEnum::SM3_256 => &SM3_OF_TEST_MESSAGE,
            _ => &SHA256_OF_TEST_MESSAGE,
        }
    }

    fn storage_symmetric(&self) -> SymmetricDefinition {
        SymmetricDefinition::Block {
            algorithm: self.symmetric,
            key_bits: SYMMETRIC_KEY_BITS,
            mode: AlgIdEnum::CFB,
        }
    }

    /// Template of a restricted decryption key used as the hierarchy parent.
    pub fn storage_template(&self) -> PublicTemplate {
        let parameters = match self.asymmetric {
            AsymmetricAlgorithm::Rsa => PublicParameters::Rsa {
                symmetric: self.storage_symmetric(),
                scheme: SchemeDefinition::Null,
                key_bits: RSA_2K_MODULUS_BITS,
                exponent: 0,
            },
            AsymmetricAlgorithm::Ecc { curve, .. } => PublicParameters::Ecc {
                symmetric: self.storage_symmetric(),
                scheme: SchemeDefinition::Null,
                curve,
                kdf: SchemeDefinition::Null,
            },
        };

        PublicTemplate {
            name_alg: self.hash,
            attributes: storage_key_attributes(),
            auth_policy: Vec::new(),
            parameters,
        }
    }

    /// Template of an unrestricted signing key.
    pub fn signing_template(&self) -> PublicTemplate {
        let parameters = match self.asymmetric {
            AsymmetricAlgorithm::Rsa => PublicParameters::Rsa {
                symmetric: SymmetricDefinition::Null,
                scheme: SchemeDefinition::Scheme {
                    scheme: AlgIdEnum::RSASSA,
                    hash: self.hash,
                },
                key_bits: RSA_2K_MODULUS_BITS,
                exponent: 0,
            },
            AsymmetricAlgorithm::Ecc { curve, sign_scheme } => PublicParameters::Ecc {
                symmetric: SymmetricDefinition::Null,
                scheme: SchemeDefinition::Scheme {
                    scheme: sign_scheme,
                    hash: self.hash,
                },
                curve,
                kdf: SchemeDefinition::Null,
            },
        };

        PublicTemplate {
            name_alg: self.hash,
            attributes: signing_key_attributes(),
            auth_policy: Vec::new(),
            parameters,
        }
    }

    /// Signature algorithm a key built from [`Self::signing_template`] uses.
    pub fn signature_algorithm(&self) -> AlgIdEnum {
        match self.asymmetric {
            AsymmetricAlgorithm::Rsa => AlgIdEnum::RSASSA,
            AsymmetricAlgorithm::Ecc { sign_scheme, .. } => sign_scheme,
        }
    }
}

impl Default for AlgorithmProfile {
    fn default() -> Self {
        Self::SHA256_RSA
    }
}

impl fmt::Display for AlgorithmProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl FromStr for AlgorithmProfile {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|profile| profile.name.eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownProfile(s.to_owned()))
    }
}
