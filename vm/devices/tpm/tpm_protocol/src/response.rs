// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Response header parsing and the per-command reply extractors.
//!
//! A [`Reply`] is the header plus the bytes it declares. Extractors take a
//! successful reply and produce owned, typed results, failing with
//! [`ResponseError::Truncated`] instead of reading past the end. List-shaped
//! replies (capabilities, PCR digests) keep every complete entry and flag the
//! truncation instead.

use crate::buffer::ReplyReader;
use crate::buffer::ResponseError;
use crate::marshal::PcrSelection;
use crate::tpm20proto::AlgIdEnum;
use crate::tpm20proto::DecodedResponseCode;
use crate::tpm20proto::HEADER_SIZE;
use crate::tpm20proto::PARAMETER_SIZE_FIELD;
use crate::tpm20proto::ReplyHeader;
use crate::tpm20proto::ResponseCode;
use crate::tpm20proto::SessionTagEnum;
use crate::tpm20proto::TPM20_CAP_ALGS;
use crate::tpm20proto::TPM20_CAP_HANDLES;
use crate::tpm20proto::TPM20_CAP_TPM_PROPERTIES;
use zerocopy::FromBytes;

/// A response header and the bytes that follow it, trimmed to the declared
/// response size.
#[derive(Debug, Clone, Copy)]
pub struct Reply<'a> {
    /// The fixed 10-byte header.
    pub header: ReplyHeader,
    body: &'a [u8],
}

impl<'a> Reply<'a> {
    /// Parses the fixed header. Fails if fewer than 10 bytes are present, if
    /// the declared size is below the header size, or if the declared size
    /// runs past the bytes received.
    pub fn parse(response: &'a [u8]) -> Result<Self, ResponseError> {
        let (header, _) =
            ReplyHeader::read_from_prefix(response).map_err(|_| ResponseError::Truncated {
                offset: 0,
                needed: HEADER_SIZE,
                available: response.len(),
            })?;

        let size = header.size.get();
        let declared = size as usize;
        if declared < HEADER_SIZE {
            return Err(ResponseError::InvalidHeaderSize { size });
        }
        if declared > response.len() {
            return Err(ResponseError::Truncated {
                offset: 0,
                needed: declared,
                available: response.len(),
            });
        }

        Ok(Self {
            header,
            body: &response[HEADER_SIZE..declared],
        })
    }

    /// Raw `responseCode`.
    pub fn response_code(&self) -> u32 {
        self.header.response_code.get()
    }

    /// Whether the TPM returned `TPM_RC_SUCCESS`.
    pub fn is_success(&self) -> bool {
        self.response_code() == ResponseCode::Success as u32
    }

    /// The response code broken into its fields.
    pub fn decoded_response_code(&self) -> DecodedResponseCode {
        self.header.decoded_response_code()
    }

    /// The session tag, if it is a known one.
    pub fn session_tag(&self) -> Option<SessionTagEnum> {
        SessionTagEnum::from_u16(self.header.session_tag.get())
    }

    /// Declared total size of the response.
    pub fn size(&self) -> usize {
        self.header.size.get() as usize
    }

    /// Everything after the header.
    pub fn body(&self) -> &'a [u8] {
        self.body
    }

    /// Splits the body into the handle area and the parameter area.
    ///
    /// With `TPM_ST_SESSIONS` the handle area is followed by `parameterSize`
    /// and the parameter area is exactly that long; the session area after it
    /// is skipped. Without sessions the parameters run to the end.
    fn areas(&self, handle_count: usize) -> Result<(ReplyReader<'a>, ReplyReader<'a>), ResponseError> {
        let mut reader = ReplyReader::with_base(self.body, HEADER_SIZE);
        let handles = reader.sub_reader(handle_count * 4)?;

        if self.session_tag() == Some(SessionTagEnum::Sessions) {
            let declared = reader.read_u32()?;
            let available = reader.remaining();
            if declared as usize > available {
                return Err(ResponseError::ParameterSizeMismatch {
                    declared,
                    available,
                });
            }
            let parameters = reader.sub_reader(declared as usize)?;
            Ok((handles, parameters))
        } else {
            let base = reader.position();
            Ok((handles, ReplyReader::with_base(reader.rest(), base)))
        }
    }

    /// Parameter area of a reply without a handle area.
    pub fn parameters(&self) -> Result<ReplyReader<'a>, ResponseError> {
        Ok(self.areas(0)?.1)
    }

    /// The single returned handle and the parameter area behind it.
    pub fn handle_and_parameters(&self) -> Result<(u32, ReplyReader<'a>), ResponseError> {
        let (mut handles, parameters) = self.areas(1)?;
        Ok((handles.read_u32()?, parameters))
    }
}

/// Offset of the parameter area for a reply carrying `handle_count` handles.
pub fn parameter_offset(session_tag: SessionTagEnum, handle_count: usize) -> usize {
    let offset = HEADER_SIZE + handle_count * 4;
    match session_tag {
        SessionTagEnum::Sessions => offset + PARAMETER_SIZE_FIELD,
        _ => offset,
    }
}

/// `TPM2_GetRandom` reply.
pub fn parse_get_random(reply: &Reply<'_>) -> Result<Vec<u8>, ResponseError> {
    let mut parameters = reply.parameters()?;
    Ok(parameters.read_tpm2b()?.to_vec())
}

/// `TPM2_PCR_Read` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrReadReply {
    /// Incremented by the TPM whenever a PCR changes.
    pub update_counter: u32,
    /// PCRs the digests belong to.
    pub selections: Vec<PcrSelection>,
    /// Digest count announced by the TPM.
    pub declared_digests: u32,
    /// Digests that were actually present.
    pub digests: Vec<Vec<u8>>,
    /// The reply ended before every announced entry was present.
    pub truncated: bool,
}

/// Parses a `TPM2_PCR_Read` reply. A reply that ends early is returned
/// with `truncated` set.
pub fn parse_pcr_read(reply: &Reply<'_>) -> Result<PcrReadReply, ResponseError> {
    let mut parameters = reply.parameters()?;
    let update_counter = parameters.read_u32()?;

    let mut result = PcrReadReply {
        update_counter,
        selections: Vec::new(),
        declared_digests: 0,
        digests: Vec::new(),
        truncated: false,
    };

    let selection_count = parameters.read_u32()?;
    for _ in 0..selection_count {
        match PcrSelection::decode(&mut parameters) {
            Ok(selection) => result.selections.push(selection),
            Err(_) => {
                // The digest list cannot be located without every selection.
                result.truncated = true;
                return Ok(result);
            }
        }
    }

    let Ok(declared_digests) = parameters.read_u32() else {
        result.truncated = true;
        return Ok(result);
    };
    result.declared_digests = declared_digests;

    for _ in 0..declared_digests {
        match parameters.read_tpm2b() {
            Ok(digest) => result.digests.push(digest.to_vec()),
            Err(_) => {
                result.truncated = true;
                break;
            }
        }
    }

    Ok(result)
}

/// `TPMS_TAGGED_PROPERTY`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TaggedProperty {
    /// `TPM_PT` selector.
    pub property: u32,
    /// Property value.
    pub value: u32,
}

/// `TPMS_ALG_PROPERTY`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AlgProperty {
    /// `TPM_ALG_ID`
    pub alg: u16,
    /// `TPMA_ALGORITHM` bits.
    pub properties: u32,
}

/// The decoded list of a `TPMS_CAPABILITY_DATA`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityData {
    /// `TPM_CAP_TPM_PROPERTIES`
    Properties(Vec<TaggedProperty>),
    /// `TPM_CAP_ALGS`
    Algorithms(Vec<AlgProperty>),
    /// `TPM_CAP_HANDLES`
    Handles(Vec<u32>),
    /// A capability this parser does not decode; raw bytes after the
    /// capability selector.
    Other(Vec<u8>),
}

impl CapabilityData {
    /// Number of decoded entries.
    pub fn len(&self) -> usize {
        match self {
            CapabilityData::Properties(v) => v.len(),
            CapabilityData::Algorithms(v) => v.len(),
            CapabilityData::Handles(v) => v.len(),
            CapabilityData::Other(_) => 0,
        }
    }

    /// Whether no entries were decoded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `TPM2_GetCapability` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityReply {
    /// More entries are available after the last one returned.
    pub more_data: bool,
    /// The capability selector echoed back.
    pub capability: u32,
    /// Entry count announced by the TPM.
    pub declared_count: u32,
    /// Entries that were actually present.
    pub data: CapabilityData,
    /// The reply ended before every announced entry was present.
    pub truncated: bool,
}

fn read_list<'a, T>(
    parameters: &mut ReplyReader<'a>,
    count: u32,
    mut read: impl FnMut(&mut ReplyReader<'a>) -> Result<T, ResponseError>,
) -> (Vec<T>, bool) {
    let mut entries = Vec::new();
    for _ in 0..count {
        // Only whole entries are taken. A partial one ends the list.
        let mut attempt = parameters.clone();
        match read(&mut attempt) {
            Ok(entry) => {
                entries.push(entry);
                *parameters = attempt;
            }
            Err(_) => return (entries, true),
        }
    }
    (entries, false)
}

/// Parses a `TPM2_GetCapability` reply. A reply that ends early is
/// returned with `truncated` set.
pub fn parse_get_capability(reply: &Reply<'_>) -> Result<CapabilityReply, ResponseError> {
    let mut parameters = reply.parameters()?;
    let more_data = parameters.read_u8()? != 0;
    let capability = parameters.read_u32()?;

    if !matches!(
        capability,
        TPM20_CAP_ALGS | TPM20_CAP_HANDLES | TPM20_CAP_TPM_PROPERTIES
    ) {
        return Ok(CapabilityReply {
            more_data,
            capability,
            declared_count: 0,
            data: CapabilityData::Other(parameters.rest().to_vec()),
            truncated: false,
        });
    }

    let declared_count = parameters.read_u32()?;
    let (data, truncated) = match capability {
        TPM20_CAP_ALGS => {
            let (entries, truncated) = read_list(&mut parameters, declared_count, |r| {
                Ok(AlgProperty {
                    alg: r.read_u16()?,
                    properties: r.read_u32()?,
                })
            });
            (CapabilityData::Algorithms(entries), truncated)
        }
        TPM20_CAP_HANDLES => {
            let (entries, truncated) =
                read_list(&mut parameters, declared_count, |r| r.read_u32());
            (CapabilityData::Handles(entries), truncated)
        }
        _ => {
            let (entries, truncated) = read_list(&mut parameters, declared_count, |r| {
                Ok(TaggedProperty {
                    property: r.read_u32()?,
                    value: r.read_u32()?,
                })
            });
            (CapabilityData::Properties(entries), truncated)
        }
    };

    Ok(CapabilityReply {
        more_data,
        capability,
        declared_count,
        data,
        truncated,
    })
}

/// `TPMT_TK_HASHCHECK`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashcheckTicket {
    /// Ticket structure tag.
    pub tag: u16,
    /// Hierarchy the ticket was produced under.
    pub hierarchy: u32,
    /// Ticket HMAC.
    pub digest: Vec<u8>,
}

/// `TPM2_Hash` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashReply {
    /// The message digest.
    pub digest: Vec<u8>,
    /// Absent when the TPM stopped after the digest.
    pub validation: Option<HashcheckTicket>,
}

/// Parses a `TPM2_Hash` reply.
pub fn parse_hash(reply: &Reply<'_>) -> Result<HashReply, ResponseError> {
    let mut parameters = reply.parameters()?;
    let digest = parameters.read_tpm2b()?.to_vec();

    let validation = if parameters.is_empty() {
        None
    } else {
        Some(HashcheckTicket {
            tag: parameters.read_u16()?,
            hierarchy: parameters.read_u32()?,
            digest: parameters.read_tpm2b()?.to_vec(),
        })
    };

    Ok(HashReply { digest, validation })
}

/// The first handle of the handle area.
///
/// Read on its own so that an object the TPM created stays reachable when the
/// parameters behind it cannot be parsed.
pub fn parse_object_handle(reply: &Reply<'_>) -> Result<u32, ResponseError> {
    ReplyReader::with_base(reply.body(), HEADER_SIZE).read_u32()
}

/// `TPM2_CreatePrimary` reply. Creation data, hash and ticket are not kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePrimaryReply {
    /// Handle of the loaded primary.
    pub object_handle: u32,
    /// `TPM2B_PUBLIC` contents of the primary.
    pub out_public: Vec<u8>,
}

/// Parses a `TPM2_CreatePrimary` reply.
pub fn parse_create_primary(reply: &Reply<'_>) -> Result<CreatePrimaryReply, ResponseError> {
    let (object_handle, mut parameters) = reply.handle_and_parameters()?;
    let out_public = parameters.read_tpm2b()?.to_vec();
    Ok(CreatePrimaryReply {
        object_handle,
        out_public,
    })
}

/// `TPM2_Create` reply: the key blob pair needed by `TPM2_Load`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReply {
    /// `TPM2B_PRIVATE` contents.
    pub out_private: Vec<u8>,
    /// `TPM2B_PUBLIC` contents.
    pub out_public: Vec<u8>,
}

/// Parses a `TPM2_Create` reply.
pub fn parse_create(reply: &Reply<'_>) -> Result<CreateReply, ResponseError> {
    let mut parameters = reply.parameters()?;
    let out_private = parameters.read_tpm2b()?.to_vec();
    let out_public = parameters.read_tpm2b()?.to_vec();
    Ok(CreateReply {
        out_private,
        out_public,
    })
}

/// `TPM2_Load` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReply {
    /// Handle of the loaded object.
    pub object_handle: u32,
    /// Object name, empty if the reply omitted it.
    pub name: Vec<u8>,
}

/// Parses a `TPM2_Load` reply.
pub fn parse_load(reply: &Reply<'_>) -> Result<LoadReply, ResponseError> {
    let (object_handle, mut parameters) = reply.handle_and_parameters()?;
    // The name is informational; a reply that stops after the handle is
    // still usable.
    let name = if parameters.is_empty() {
        Vec::new()
    } else {
        parameters.read_tpm2b()?.to_vec()
    };
    Ok(LoadReply {
        object_handle,
        name,
    })
}

/// `TPMT_SIGNATURE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    /// RSASSA and RSAPSS.
    Rsa {
        /// Signature algorithm.
        sig_alg: u16,
        /// Digest algorithm.
        hash: u16,
        /// Signature bytes.
        sig: Vec<u8>,
    },
    /// ECDSA, SM2 and EC-Schnorr.
    Ecc {
        /// Signature algorithm.
        sig_alg: u16,
        /// Digest algorithm.
        hash: u16,
        /// Signature `r` component.
        r: Vec<u8>,
        /// Signature `s` component.
        s: Vec<u8>,
    },
    /// `TPM_ALG_NULL`
    Null,
    /// Algorithms without a dedicated layout, read as the tag followed by
    /// one sized buffer.
    Other {
        /// Signature algorithm.
        sig_alg: u16,
        /// The sized buffer.
        sig: Vec<u8>,
    },
}

impl Signature {
    /// The signature algorithm tag.
    pub fn sig_alg(&self) -> u16 {
        match self {
            Signature::Rsa { sig_alg, .. }
            | Signature::Ecc { sig_alg, .. }
            | Signature::Other { sig_alg, .. } => *sig_alg,
            Signature::Null => AlgIdEnum::NULL.into(),
        }
    }

    /// Total signature bytes.
    pub fn len(&self) -> usize {
        match self {
            Signature::Rsa { sig, .. } | Signature::Other { sig, .. } => sig.len(),
            Signature::Ecc { r, s, .. } => r.len() + s.len(),
            Signature::Null => 0,
        }
    }

    /// Whether the signature carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses a `TPM2_Sign` reply.
pub fn parse_sign(reply: &Reply<'_>) -> Result<Signature, ResponseError> {
    let mut parameters = reply.parameters()?;
    let sig_alg = parameters.read_u16()?;

    let signature = match AlgIdEnum::from_u16(sig_alg) {
        Some(AlgIdEnum::RSASSA | AlgIdEnum::RSAPSS) => Signature::Rsa {
            sig_alg,
            hash: parameters.read_u16()?,
            sig: parameters.read_tpm2b()?.to_vec(),
        },
        Some(AlgIdEnum::ECDSA | AlgIdEnum::SM2 | AlgIdEnum::ECSCHNORR) => Signature::Ecc {
            sig_alg,
            hash: parameters.read_u16()?,
            r: parameters.read_tpm2b()?.to_vec(),
            s: parameters.read_tpm2b()?.to_vec(),
        },
        Some(AlgIdEnum::NULL) => Signature::Null,
        _ => Signature::Other {
            sig_alg,
            sig: parameters.read_tpm2b()?.to_vec(),
        },
    };

    Ok(signature)
}

/// `TPM2_NV_Read` reply.
pub fn parse_nv_read(reply: &Reply<'_>) -> Result<Vec<u8>, ResponseError> {
    let mut parameters = reply.parameters()?;
    Ok(parameters.read_tpm2b()?.to_vec())
}
