// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 2.0 protocol constants, enumerations and fixed-layout wire types.
//!
//! Everything on the wire is big-endian. Fixed-layout structures use the
//! zerocopy big-endian integer types so they can be read straight out of a
//! reply buffer.

#![expect(missing_docs)]

use bitfield_struct::bitfield;
use std::fmt;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[expect(non_camel_case_types)]
mod packed_nums {
    pub type u16_be = zerocopy::U16<zerocopy::BigEndian>;
    pub type u32_be = zerocopy::U32<zerocopy::BigEndian>;
}

pub use packed_nums::*;

/// Workaround to allow constructing a zerocopy U32 in a const context.
const fn new_u32_be(val: u32) -> u32_be {
    u32_be::from_bytes(val.to_be_bytes())
}

/// Workaround to allow constructing a zerocopy U16 in a const context.
const fn new_u16_be(val: u16) -> u16_be {
    u16_be::from_bytes(val.to_be_bytes())
}

/// Size of the fixed command and response headers.
pub const HEADER_SIZE: usize = 10;

/// Size of the `parameterSize` field that follows the handle area of a
/// response carrying `TPM_ST_SESSIONS`.
pub const PARAMETER_SIZE_FIELD: usize = 4;

// Handle types, the most significant octet of a handle.
pub const TPM20_HT_NV_INDEX: u8 = 0x01;
pub const TPM20_HT_PERMANENT: u8 = 0x40;
pub const TPM20_HT_TRANSIENT: u8 = 0x80;
pub const TPM20_HT_PERSISTENT: u8 = 0x81;

pub const TPM20_RH_OWNER: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x01);
pub const TPM20_RH_NULL: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x07);
pub const TPM20_RH_ENDORSEMENT: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x0b);
pub const TPM20_RH_PLATFORM: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x0c);
/// Password authorization session.
pub const TPM20_RS_PW: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x09);

// Capability selectors.
pub const TPM20_CAP_ALGS: u32 = 0x0000_0000;
pub const TPM20_CAP_HANDLES: u32 = 0x0000_0001;
pub const TPM20_CAP_TPM_PROPERTIES: u32 = 0x0000_0006;

/// First fixed TPM property (`TPM_PT_FIXED`).
pub const TPM20_PT_FIXED: u32 = 0x0000_0100;

/// A handle whose value is fixed by the TPM specification.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReservedHandle(pub u32_be);

impl ReservedHandle {
    /// Builds a handle out of its type octet and the low 24 bits.
    pub const fn new(kind: u8, offset: u32) -> ReservedHandle {
        ReservedHandle(new_u32_be(((kind as u32) << 24) | (offset & 0x00ff_ffff)))
    }

    /// The raw handle value.
    pub fn get(&self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for ReservedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.get())
    }
}

impl PartialEq<ReservedHandle> for u32 {
    fn eq(&self, other: &ReservedHandle) -> bool {
        other.0.get() == *self
    }
}

impl From<ReservedHandle> for u32 {
    fn from(handle: ReservedHandle) -> u32 {
        handle.get()
    }
}

/// Structure tags that appear in command and response headers and in tickets.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionTagEnum {
    // No structure type specified
    Null = 0x8000,

    // A command/response for a command defined in this specification. The
    // command/response has no attached sessions. If a command has an
    // error and the command tag value is either TPM_ST_NO_SESSIONS or
    // TPM_ST_SESSIONS, then this tag value is used in the response code.
    NoSessions = 0x8001,

    // A command/response for a command defined in this specification. The
    // command/response has one or more attached sessions and the sessionOffset
    // field is present.
    Sessions = 0x8002,
    Creation = 0x8021,
    Verified = 0x8022,
    AuthSecret = 0x8023,
    Hashcheck = 0x8024,
    AuthSigned = 0x8025,
}

impl SessionTagEnum {
    pub fn from_u16(val: u16) -> Option<SessionTagEnum> {
        let ret = match val {
            0x8000 => Self::Null,
            0x8001 => Self::NoSessions,
            0x8002 => Self::Sessions,
            0x8021 => Self::Creation,
            0x8022 => Self::Verified,
            0x8023 => Self::AuthSecret,
            0x8024 => Self::Hashcheck,
            0x8025 => Self::AuthSigned,
            _ => return None,
        };

        Some(ret)
    }
}

impl From<SessionTagEnum> for u16 {
    fn from(tag: SessionTagEnum) -> u16 {
        tag as u16
    }
}

/// Command codes issued by this crate, plus the ones commonly seen in
/// captured traffic so replayed dumps can be labelled.
#[expect(non_camel_case_types)]
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandCodeEnum {
    EvictControl = 0x00000120,
    Clear = 0x00000126,
    NV_DefineSpace = 0x0000012a,
    CreatePrimary = 0x00000131,
    NV_Write = 0x00000137,
    SelfTest = 0x00000143,
    Startup = 0x00000144,
    Shutdown = 0x00000145,
    NV_Read = 0x0000014e,
    Create = 0x00000153,
    Load = 0x00000157,
    Quote = 0x00000158,
    RSA_Decrypt = 0x00000159,
    Sign = 0x0000015d,
    Unseal = 0x0000015e,
    FlushContext = 0x00000165,
    NV_ReadPublic = 0x00000169,
    ReadPublic = 0x00000173,
    StartAuthSession = 0x00000176,
    GetCapability = 0x0000017a,
    GetRandom = 0x0000017b,
    Hash = 0x0000017d,
    PCR_Read = 0x0000017e,
    PCR_Extend = 0x00000182,
}

impl CommandCodeEnum {
    pub fn from_u32(val: u32) -> Option<CommandCodeEnum> {
        let ret = match val {
            0x00000120 => Self::EvictControl,
            0x00000126 => Self::Clear,
            0x0000012a => Self::NV_DefineSpace,
            0x00000131 => Self::CreatePrimary,
            0x00000137 => Self::NV_Write,
            0x00000143 => Self::SelfTest,
            0x00000144 => Self::Startup,
            0x00000145 => Self::Shutdown,
            0x0000014e => Self::NV_Read,
            0x00000153 => Self::Create,
            0x00000157 => Self::Load,
            0x00000158 => Self::Quote,
            0x00000159 => Self::RSA_Decrypt,
            0x0000015d => Self::Sign,
            0x0000015e => Self::Unseal,
            0x00000165 => Self::FlushContext,
            0x00000169 => Self::NV_ReadPublic,
            0x00000173 => Self::ReadPublic,
            0x00000176 => Self::StartAuthSession,
            0x0000017a => Self::GetCapability,
            0x0000017b => Self::GetRandom,
            0x0000017d => Self::Hash,
            0x0000017e => Self::PCR_Read,
            0x00000182 => Self::PCR_Extend,
            _ => return None,
        };

        Some(ret)
    }
}

impl From<CommandCodeEnum> for u32 {
    fn from(code: CommandCodeEnum) -> u32 {
        code as u32
    }
}

const FLAG_FMT1: u32 = 0x0080;
const FLAG_VER1: u32 = 0x0100;
const FLAG_WARN: u32 = 0x0800 + FLAG_VER1;

/// Format-1 codes carry a parameter number in bits 11:8 when this is set.
const FMT1_PARAMETER: u32 = 0x0040;
/// Format-1 codes refer to a session rather than a handle when this is set.
const FMT1_SESSION: u32 = 0x0800;

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    Success = 0x000,
    /// Asymmetric algorithm not supported or not correct.
    Asymmetric = FLAG_FMT1 + 0x001,
    /// Inconsistent attributes.
    Attributes = FLAG_FMT1 + 0x002,
    /// Hash algorithm not supported or not appropriate.
    Hash = FLAG_FMT1 + 0x003,
    /// Value is out of range or is not correct for the context.
    Value = FLAG_FMT1 + 0x004,
    /// Hierarchy is not enabled or is not correct for the use.
    Hierarchy = FLAG_FMT1 + 0x005,
    /// Key size is not supported.
    KeySize = FLAG_FMT1 + 0x007,
    /// Mode of operation not supported.
    Mode = FLAG_FMT1 + 0x009,
    /// The type of the value is not appropriate for the use.
    Type = FLAG_FMT1 + 0x00a,
    /// The handle is not correct for the use.
    Handle = FLAG_FMT1 + 0x00b,
    /// Unsupported key derivation function.
    Kdf = FLAG_FMT1 + 0x00c,
    /// Value was out of allowed range.
    Range = FLAG_FMT1 + 0x00d,
    /// The authorization HMAC check failed.
    AuthFail = FLAG_FMT1 + 0x00e,
    /// Unsupported or incompatible scheme.
    Scheme = FLAG_FMT1 + 0x012,
    /// Structure is the wrong size.
    Size = FLAG_FMT1 + 0x015,
    /// Unsupported symmetric algorithm or key size.
    Symmetric = FLAG_FMT1 + 0x016,
    /// Incorrect structure tag.
    Tag = FLAG_FMT1 + 0x017,
    /// The TPM was unable to unmarshal a value because there were not
    /// enough bytes in the input buffer.
    Insufficient = FLAG_FMT1 + 0x01a,
    /// Integrity check fail.
    Integrity = FLAG_FMT1 + 0x01f,
    /// Curve not supported.
    Curve = FLAG_FMT1 + 0x026,
    /// TPM not initialized by TPM2_Startup or already initialized.
    Initialize = FLAG_VER1,
    /// TPM is in failure mode.
    Failure = FLAG_VER1 + 0x001,
    /// Improper use of a sequence handle.
    Sequence = FLAG_VER1 + 0x003,
    /// Command commandSize value is inconsistent with contents of the
    /// command buffer.
    CommandSize = FLAG_VER1 + 0x042,
    /// Command code not supported.
    CommandCode = FLAG_VER1 + 0x043,
    /// The value of authorizationSize is out of range or the number of octets
    /// in the authorization area is greater than required.
    AuthSize = FLAG_VER1 + 0x044,
    /// Use of an authorization session with a context command.
    AuthContext = FLAG_VER1 + 0x045,
    /// NV offset+size is out of range.
    NvRange = FLAG_VER1 + 0x046,
    /// Requested allocation size is larger than allowed.
    NvSize = FLAG_VER1 + 0x047,
    /// NV access locked.
    NvLocked = FLAG_VER1 + 0x048,
    /// NV access authorization fails in command actions.
    NvAuthorization = FLAG_VER1 + 0x049,
    /// The NV index is used before being initialized or the state saved by
    /// TPM20_CC_Shutdown could not be restored.
    NvUninitialized = FLAG_VER1 + 0x04a,
    /// Insufficient space for NV allocation.
    NvSpace = FLAG_VER1 + 0x04b,
    /// NV index or persistent object already defined.
    NvDefined = FLAG_VER1 + 0x04c,
    /// The command requires a self test that has not run.
    NeedsTest = FLAG_VER1 + 0x053,
    /// ...
    Sensitive = FLAG_VER1 + 0x055,
    /// Gap for session context ID is too large.
    ContextGap = FLAG_WARN + 0x001,
    /// Out of memory for object contexts.
    ObjectMemory = FLAG_WARN + 0x002,
    /// Out of memory for session contexts.
    SessionMemory = FLAG_WARN + 0x003,
    /// Out of shared object/session memory or need space for internal
    /// operations.
    Memory = FLAG_WARN + 0x004,
    /// Out of session handles - a session must be flushed before a new
    /// session may be created.
    SessionHandles = FLAG_WARN + 0x005,
    /// Out of object handles - the handle space for objects is depleted and
    /// a reboot is required.
    ObjectHandles = FLAG_WARN + 0x006,
    /// The TPM has suspended operation on the command. Forward progress was
    /// made and the command may be retried.
    Yielded = FLAG_WARN + 0x008,
    /// The command was cancelled. The command may be retried.
    Cancelled = FLAG_WARN + 0x009,
    /// TPM is performing self tests.
    Testing = FLAG_WARN + 0x00a,
    /// The TPM is rate-limiting accesses to prevent wearout of NV.
    NvRate = FLAG_WARN + 0x020,
    /// Commands are not being accepted because the TPM is in DA lockout
    /// mode.
    Lockout = FLAG_WARN + 0x021,
    /// The TPM was not able to start the command. Retry might work.
    Retry = FLAG_WARN + 0x022,
    /// The command may require writing of NV and NV is not current
    /// accessible.
    NvUnavailable = FLAG_WARN + 0x023,
}

impl ResponseCode {
    pub fn from_u32(val: u32) -> Option<ResponseCode> {
        let ret = match val {
            x if x == ResponseCode::Success as u32 => ResponseCode::Success,
            x if x == ResponseCode::Asymmetric as u32 => ResponseCode::Asymmetric,
            x if x == ResponseCode::Attributes as u32 => ResponseCode::Attributes,
            x if x == ResponseCode::Hash as u32 => ResponseCode::Hash,
            x if x == ResponseCode::Value as u32 => ResponseCode::Value,
            x if x == ResponseCode::Hierarchy as u32 => ResponseCode::Hierarchy,
            x if x == ResponseCode::KeySize as u32 => ResponseCode::KeySize,
            x if x == ResponseCode::Mode as u32 => ResponseCode::Mode,
            x if x == ResponseCode::Type as u32 => ResponseCode::Type,
            x if x == ResponseCode::Handle as u32 => ResponseCode::Handle,
            x if x == ResponseCode::Kdf as u32 => ResponseCode::Kdf,
            x if x == ResponseCode::Range as u32 => ResponseCode::Range,
            x if x == ResponseCode::AuthFail as u32 => ResponseCode::AuthFail,
            x if x == ResponseCode::Scheme as u32 => ResponseCode::Scheme,
            x if x == ResponseCode::Size as u32 => ResponseCode::Size,
            x if x == ResponseCode::Symmetric as u32 => ResponseCode::Symmetric,
            x if x == ResponseCode::Tag as u32 => ResponseCode::Tag,
            x if x == ResponseCode::Insufficient as u32 => ResponseCode::Insufficient,
            x if x == ResponseCode::Integrity as u32 => ResponseCode::Integrity,
            x if x == ResponseCode::Curve as u32 => ResponseCode::Curve,
            x if x == ResponseCode::Initialize as u32 => ResponseCode::Initialize,
            x if x == ResponseCode::Failure as u32 => ResponseCode::Failure,
            x if x == ResponseCode::Sequence as u32 => ResponseCode::Sequence,
            x if x == ResponseCode::CommandSize as u32 => ResponseCode::CommandSize,
            x if x == ResponseCode::CommandCode as u32 => ResponseCode::CommandCode,
            x if x == ResponseCode::AuthSize as u32 => ResponseCode::AuthSize,
            x if x == ResponseCode::AuthContext as u32 => ResponseCode::AuthContext,
            x if x == ResponseCode::NvRange as u32 => ResponseCode::NvRange,
            x if x == ResponseCode::NvSize as u32 => ResponseCode::NvSize,
            x if x == ResponseCode::NvLocked as u32 => ResponseCode::NvLocked,
            x if x == ResponseCode::NvAuthorization as u32 => ResponseCode::NvAuthorization,
            x if x == ResponseCode::NvUninitialized as u32 => ResponseCode::NvUninitialized,
            x if x == ResponseCode::NvSpace as u32 => ResponseCode::NvSpace,
            x if x == ResponseCode::NvDefined as u32 => ResponseCode::NvDefined,
            x if x == ResponseCode::NeedsTest as u32 => ResponseCode::NeedsTest,
            x if x == ResponseCode::Sensitive as u32 => ResponseCode::Sensitive,
            x if x == ResponseCode::ContextGap as u32 => ResponseCode::ContextGap,
            x if x == ResponseCode::ObjectMemory as u32 => ResponseCode::ObjectMemory,
            x if x == ResponseCode::SessionMemory as u32 => ResponseCode::SessionMemory,
            x if x == ResponseCode::Memory as u32 => ResponseCode::Memory,
            x if x == ResponseCode::SessionHandles as u32 => ResponseCode::SessionHandles,
            x if x == ResponseCode::ObjectHandles as u32 => ResponseCode::ObjectHandles,
            x if x == ResponseCode::Yielded as u32 => ResponseCode::Yielded,
            x if x == ResponseCode::Cancelled as u32 => ResponseCode::Cancelled,
            x if x == ResponseCode::Testing as u32 => ResponseCode::Testing,
            x if x == ResponseCode::NvRate as u32 => ResponseCode::NvRate,
            x if x == ResponseCode::Lockout as u32 => ResponseCode::Lockout,
            x if x == ResponseCode::Retry as u32 => ResponseCode::Retry,
            x if x == ResponseCode::NvUnavailable as u32 => ResponseCode::NvUnavailable,
            _ => return None,
        };
        Some(ret)
    }

    /// The name the TPM specification uses for this code.
    pub fn name(&self) -> &'static str {
        match self {
            ResponseCode::Success => "TPM_RC_SUCCESS",
            ResponseCode::Asymmetric => "TPM_RC_ASYMMETRIC",
            ResponseCode::Attributes => "TPM_RC_ATTRIBUTES",
            ResponseCode::Hash => "TPM_RC_HASH",
            ResponseCode::Value => "TPM_RC_VALUE",
            ResponseCode::Hierarchy => "TPM_RC_HIERARCHY",
            ResponseCode::KeySize => "TPM_RC_KEY_SIZE",
            ResponseCode::Mode => "TPM_RC_MODE",
            ResponseCode::Type => "TPM_RC_TYPE",
            ResponseCode::Handle => "TPM_RC_HANDLE",
            ResponseCode::Kdf => "TPM_RC_KDF",
            ResponseCode::Range => "TPM_RC_RANGE",
            ResponseCode::AuthFail => "TPM_RC_AUTH_FAIL",
            ResponseCode::Scheme => "TPM_RC_SCHEME",
            ResponseCode::Size => "TPM_RC_SIZE",
            ResponseCode::Symmetric => "TPM_RC_SYMMETRIC",
            ResponseCode::Tag => "TPM_RC_TAG",
            ResponseCode::Insufficient => "TPM_RC_INSUFFICIENT",
            ResponseCode::Integrity => "TPM_RC_INTEGRITY",
            ResponseCode::Curve => "TPM_RC_CURVE",
            ResponseCode::Initialize => "TPM_RC_INITIALIZE",
            ResponseCode::Failure => "TPM_RC_FAILURE",
            ResponseCode::Sequence => "TPM_RC_SEQUENCE",
            ResponseCode::CommandSize => "TPM_RC_COMMAND_SIZE",
            ResponseCode::CommandCode => "TPM_RC_COMMAND_CODE",
            ResponseCode::AuthSize => "TPM_RC_AUTHSIZE",
            ResponseCode::AuthContext => "TPM_RC_AUTH_CONTEXT",
            ResponseCode::NvRange => "TPM_RC_NV_RANGE",
            ResponseCode::NvSize => "TPM_RC_NV_SIZE",
            ResponseCode::NvLocked => "TPM_RC_NV_LOCKED",
            ResponseCode::NvAuthorization => "TPM_RC_NV_AUTHORIZATION",
            ResponseCode::NvUninitialized => "TPM_RC_NV_UNINITIALIZED",
            ResponseCode::NvSpace => "TPM_RC_NV_SPACE",
            ResponseCode::NvDefined => "TPM_RC_NV_DEFINED",
            ResponseCode::NeedsTest => "TPM_RC_NEEDS_TEST",
            ResponseCode::Sensitive => "TPM_RC_SENSITIVE",
            ResponseCode::ContextGap => "TPM_RC_CONTEXT_GAP",
            ResponseCode::ObjectMemory => "TPM_RC_OBJECT_MEMORY",
            ResponseCode::SessionMemory => "TPM_RC_SESSION_MEMORY",
            ResponseCode::Memory => "TPM_RC_MEMORY",
            ResponseCode::SessionHandles => "TPM_RC_SESSION_HANDLES",
            ResponseCode::ObjectHandles => "TPM_RC_OBJECT_HANDLES",
            ResponseCode::Yielded => "TPM_RC_YIELDED",
            ResponseCode::Cancelled => "TPM_RC_CANCELED",
            ResponseCode::Testing => "TPM_RC_TESTING",
            ResponseCode::NvRate => "TPM_RC_NV_RATE",
            ResponseCode::Lockout => "TPM_RC_LOCKOUT",
            ResponseCode::Retry => "TPM_RC_RETRY",
            ResponseCode::NvUnavailable => "TPM_RC_NV_UNAVAILABLE",
        }
    }
}

/// Where a format-1 response code points inside the failing command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseCodeLocation {
    Parameter(u8),
    Handle(u8),
    Session(u8),
}

/// A response code split into its base error and the location it refers to.
///
/// Displays as e.g. `TPM_RC_SIZE (parameter 1)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DecodedResponseCode {
    pub raw: u32,
    pub base: Option<ResponseCode>,
    pub location: Option<ResponseCodeLocation>,
}

impl DecodedResponseCode {
    pub fn new(raw: u32) -> Self {
        if raw & FLAG_FMT1 == 0 {
            return Self {
                raw,
                base: ResponseCode::from_u32(raw),
                location: None,
            };
        }

        let base = ResponseCode::from_u32(FLAG_FMT1 + (raw & 0x3f));
        let number = ((raw >> 8) & 0xf) as u8;
        let location = if raw & FMT1_PARAMETER != 0 {
            Some(ResponseCodeLocation::Parameter(number))
        } else if number == 0 {
            None
        } else if raw & FMT1_SESSION != 0 {
            Some(ResponseCodeLocation::Session(number & 0x7))
        } else {
            Some(ResponseCodeLocation::Handle(number & 0x7))
        };

        Self {
            raw,
            base,
            location,
        }
    }
}

impl fmt::Display for DecodedResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base {
            Some(base) => f.write_str(base.name())?,
            None => write!(f, "TPM_RC_UNKNOWN({:#x})", self.raw)?,
        }
        match self.location {
            Some(ResponseCodeLocation::Parameter(n)) => write!(f, " (parameter {n})"),
            Some(ResponseCodeLocation::Handle(n)) => write!(f, " (handle {n})"),
            Some(ResponseCodeLocation::Session(n)) => write!(f, " (session {n})"),
            None => Ok(()),
        }
    }
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq)]
pub struct AlgId(pub u16_be);

impl PartialEq<AlgId> for u16 {
    fn eq(&self, other: &AlgId) -> bool {
        other.0.get() == *self
    }
}

impl AlgId {
    pub const fn new(val: u16) -> AlgId {
        AlgId(new_u16_be(val))
    }
}

impl From<AlgIdEnum> for AlgId {
    fn from(x: AlgIdEnum) -> Self {
        AlgId::new(x as u16)
    }
}

#[expect(non_camel_case_types, clippy::upper_case_acronyms)]
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AlgIdEnum {
    RSA = 0x0001,
    SHA = 0x0004,
    HMAC = 0x0005,
    AES = 0x0006,
    KEYEDHASH = 0x0008,
    SHA256 = 0x000b,
    SHA384 = 0x000c,
    SHA512 = 0x000d,
    NULL = 0x0010,
    SM3_256 = 0x0012,
    SM4 = 0x0013,
    RSASSA = 0x0014,
    RSAPSS = 0x0016,
    ECDSA = 0x0018,
    SM2 = 0x001b,
    ECSCHNORR = 0x001c,
    KDF1_SP800_56A = 0x0020,
    ECC = 0x0023,
    CFB = 0x0043,
}

impl AlgIdEnum {
    pub fn from_u16(val: u16) -> Option<AlgIdEnum> {
        let ret = match val {
            0x0001 => Self::RSA,
            0x0004 => Self::SHA,
            0x0005 => Self::HMAC,
            0x0006 => Self::AES,
            0x0008 => Self::KEYEDHASH,
            0x000b => Self::SHA256,
            0x000c => Self::SHA384,
            0x000d => Self::SHA512,
            0x0010 => Self::NULL,
            0x0012 => Self::SM3_256,
            0x0013 => Self::SM4,
            0x0014 => Self::RSASSA,
            0x0016 => Self::RSAPSS,
            0x0018 => Self::ECDSA,
            0x001b => Self::SM2,
            0x001c => Self::ECSCHNORR,
            0x0020 => Self::KDF1_SP800_56A,
            0x0023 => Self::ECC,
            0x0043 => Self::CFB,
            _ => return None,
        };

        Some(ret)
    }

    /// Digest size in bytes for hash algorithms.
    pub fn digest_size(&self) -> Option<usize> {
        match self {
            Self::SHA => Some(20),
            Self::SHA256 | Self::SM3_256 => Some(32),
            Self::SHA384 => Some(48),
            Self::SHA512 => Some(64),
            _ => None,
        }
    }
}

impl From<AlgIdEnum> for u16 {
    fn from(alg: AlgIdEnum) -> u16 {
        alg as u16
    }
}

/// `TPM_ECC_CURVE`
#[expect(non_camel_case_types)]
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EccCurve {
    NIST_P256 = 0x0003,
    NIST_P384 = 0x0004,
    SM2_P256 = 0x0020,
}

impl From<EccCurve> for u16 {
    fn from(curve: EccCurve) -> u16 {
        curve as u16
    }
}

/// `TPM_SU`
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StartupType {
    Clear = 0x0000,
    State = 0x0001,
}

/// `TPMA_OBJECT`
#[repr(transparent)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq)]
pub struct TpmaObject(pub u32_be);

impl TpmaObject {
    const fn new(val: u32) -> Self {
        Self(new_u32_be(val))
    }
}

impl From<TpmaObjectBits> for TpmaObject {
    fn from(x: TpmaObjectBits) -> Self {
        let val: u32 = x.into();
        Self::new(val)
    }
}

impl From<u32> for TpmaObject {
    fn from(x: u32) -> Self {
        Self::new(x)
    }
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TpmaObjectBits {
    _reserved0: bool,
    pub fixed_tpm: bool,
    pub st_clear: bool,
    _reserved1: bool,
    pub fixed_parent: bool,
    pub sensitive_data_origin: bool,
    pub user_with_auth: bool,
    pub admin_with_policy: bool,
    #[bits(2)]
    _reserved2: u8,
    pub no_da: bool,
    pub encrypted_duplication: bool,
    #[bits(4)]
    _reserved3: u8,
    pub restricted: bool,
    pub decrypt: bool,
    pub sign_encrypt: bool,
    #[bits(13)]
    _reserved4: u16,
}

/// `TPMA_NV`
#[repr(transparent)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq)]
pub struct TpmaNv(pub u32_be);

impl TpmaNv {
    const fn new(val: u32) -> Self {
        Self(new_u32_be(val))
    }
}

impl From<TpmaNvBits> for TpmaNv {
    fn from(x: TpmaNvBits) -> Self {
        let val: u32 = x.into();
        Self::new(val)
    }
}

impl From<u32> for TpmaNv {
    fn from(x: u32) -> Self {
        Self::new(x)
    }
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TpmaNvBits {
    pub nv_ppwrite: bool,
    pub nv_ownerwrite: bool,
    pub nv_authwrite: bool,
    pub nv_policywrite: bool,
    // bits 7:4: `TPM_NT`, 0 is an ordinary index
    #[bits(4)]
    pub nt: u8,
    // bits 9:8 are reserved
    #[bits(2)]
    _reserved1: u8,
    pub nv_policy_delete: bool,
    pub nv_writelocked: bool,
    pub nv_writeall: bool,
    pub nv_writedefine: bool,
    pub nv_write_stclear: bool,
    pub nv_globallock: bool,
    pub nv_ppread: bool,
    pub nv_ownerread: bool,
    pub nv_authread: bool,
    pub nv_policyread: bool,
    // bits 24:20 are reserved
    #[bits(5)]
    _reserved2: u8,
    pub nv_no_da: bool,
    pub nv_orderly: bool,
    pub nv_clear_stclear: bool,
    pub nv_readlocked: bool,
    pub nv_written: bool,
    pub nv_platformcreate: bool,
    pub nv_read_stclear: bool,
}

/// Password session entry of a command authorization area.
///
/// Only the empty password is ever sent, so nonce and auth value sizes are
/// always zero and no variable-length content follows them.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CmdAuth {
    pub handle: ReservedHandle,
    pub nonce_2b: u16_be,
    pub session: u8,
    pub auth_2b: u16_be,
}

impl CmdAuth {
    pub fn password() -> Self {
        CmdAuth {
            handle: TPM20_RS_PW,
            nonce_2b: new_u16_be(0),
            session: 0,
            auth_2b: new_u16_be(0),
        }
    }
}

/// Fixed 10 byte response header.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReplyHeader {
    pub session_tag: u16_be,
    pub size: u32_be,
    pub response_code: u32_be,
}

impl ReplyHeader {
    pub fn new(session_tag: u16, size: u32, response_code: u32) -> Self {
        ReplyHeader {
            session_tag: new_u16_be(session_tag),
            size: new_u32_be(size),
            response_code: new_u32_be(response_code),
        }
    }

    /// Response code decoded for display.
    pub fn decoded_response_code(&self) -> DecodedResponseCode {
        DecodedResponseCode::new(self.response_code.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_handles() {
        assert_eq!(TPM20_RH_OWNER.get(), 0x4000_0001);
        assert_eq!(TPM20_RH_NULL.get(), 0x4000_0007);
        assert_eq!(TPM20_RS_PW.get(), 0x4000_0009);
        assert!(0x4000_0001 == TPM20_RH_OWNER);
    }

    #[test]
    fn test_object_attributes() {
        let storage: u32 = TpmaObjectBits::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_restricted(true)
            .with_decrypt(true)
            .into();
        assert_eq!(storage, 0x0003_0072);

        let signing: u32 = TpmaObjectBits::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_sign_encrypt(true)
            .into();
        assert_eq!(signing, 0x0004_0072);
    }

    #[test]
    fn test_nv_attributes() {
        let attributes: u32 = TpmaNvBits::new()
            .with_nv_ownerwrite(true)
            .with_nv_authwrite(true)
            .with_nv_ownerread(true)
            .with_nv_authread(true)
            .into();
        assert_eq!(attributes, 0x0006_0006);
    }

    #[test]
    fn test_response_code_names() {
        assert_eq!(DecodedResponseCode::new(0).to_string(), "TPM_RC_SUCCESS");
        assert_eq!(
            DecodedResponseCode::new(0x100).to_string(),
            "TPM_RC_INITIALIZE"
        );
        assert_eq!(
            DecodedResponseCode::new(0x14c).to_string(),
            "TPM_RC_NV_DEFINED"
        );
        assert_eq!(
            DecodedResponseCode::new(0x1d5).to_string(),
            "TPM_RC_SIZE (parameter 1)"
        );
        assert_eq!(
            DecodedResponseCode::new(0x1c4).to_string(),
            "TPM_RC_VALUE (parameter 1)"
        );
        assert_eq!(DecodedResponseCode::new(0x95).to_string(), "TPM_RC_SIZE");
        assert_eq!(
            DecodedResponseCode::new(0x98e).to_string(),
            "TPM_RC_AUTH_FAIL (session 1)"
        );
        assert_eq!(
            DecodedResponseCode::new(0x18b).to_string(),
            "TPM_RC_HANDLE (handle 1)"
        );
        assert_eq!(
            DecodedResponseCode::new(0x1234_5678 & !0x80).to_string(),
            "TPM_RC_UNKNOWN(0x12345678)"
        );
    }

    #[test]
    fn test_round_trip_enums() {
        for code in [
            CommandCodeEnum::Startup,
            CommandCodeEnum::CreatePrimary,
            CommandCodeEnum::FlushContext,
            CommandCodeEnum::NV_Read,
        ] {
            assert_eq!(CommandCodeEnum::from_u32(code as u32), Some(code));
        }
        assert_eq!(AlgIdEnum::from_u16(0x000b), Some(AlgIdEnum::SHA256));
        assert_eq!(SessionTagEnum::from_u16(0x8024), Some(SessionTagEnum::Hashcheck));
        assert_eq!(AlgIdEnum::SM3_256.digest_size(), Some(32));
    }

    #[test]
    fn test_password_session_layout() {
        let auth = CmdAuth::password();
        assert_eq!(auth.as_bytes(), &[0x40, 0x00, 0x00, 0x09, 0, 0, 0, 0, 0]);
    }
}
