// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory TPM used by the unit tests.
//!
//! Understands just enough of each command to track handles and NV contents
//! and to produce replies with the layouts a real TPM uses.

use crate::TpmEngine;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use thiserror::Error;
use tpm_protocol::buffer::ReplyReader;
use tpm_protocol::buffer::ResponseError;
use tpm_protocol::tpm20proto::AlgIdEnum;
use tpm_protocol::tpm20proto::CommandCodeEnum;
use tpm_protocol::tpm20proto::ResponseCode;
use tpm_protocol::tpm20proto::SessionTagEnum;
use tpm_protocol::tpm20proto::TPM20_CAP_ALGS;
use tpm_protocol::tpm20proto::TPM20_CAP_HANDLES;
use tpm_protocol::tpm20proto::TPM20_CAP_TPM_PROPERTIES;

const TRANSIENT_FIRST: u32 = 0x8000_0000;
const TPM_RC_P: u32 = 0x040;
const TPM_RC_1: u32 = 0x100;
const TPM_RC_2: u32 = 0x200;
/// `TPM_SPEC_FAMILY`, "2.0".
const FAMILY_INDICATOR: u32 = 0x322e_3000;

#[derive(Error, Debug)]
pub enum MockTpmError {
    #[error("mock TPM is disconnected")]
    Disconnected,
    #[error("reply of {0} bytes does not fit the reply buffer")]
    ReplyTooLarge(usize),
}

struct NvIndex {
    data: Vec<u8>,
    written: bool,
}

/// Successful reply contents.
#[derive(Default)]
struct Response {
    sessions: bool,
    handle: Option<u32>,
    parameters: Vec<u8>,
}

impl Response {
    fn no_sessions(parameters: Vec<u8>) -> Self {
        Self {
            parameters,
            ..Default::default()
        }
    }

    fn sessions(handle: Option<u32>, parameters: Vec<u8>) -> Self {
        Self {
            sessions: true,
            handle,
            parameters,
        }
    }
}

fn tpm2b(data: &[u8]) -> Vec<u8> {
    let mut out = (data.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(data);
    out
}

fn insufficient(_: ResponseError) -> u32 {
    ResponseCode::Insufficient as u32
}

fn handle_error(n: u32) -> u32 {
    ResponseCode::Handle as u32 + n
}

pub struct MockTpm {
    commands: Vec<u32>,
    failures: HashMap<u32, u32>,
    malformed: HashSet<u32>,
    nv: BTreeMap<u32, NvIndex>,
    objects: BTreeMap<u32, Vec<u8>>,
    next_handle: u32,
    flushed: Vec<u32>,
    disconnected: bool,
    zero_handles: bool,
    zero_random: bool,
}

impl MockTpm {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            failures: HashMap::new(),
            malformed: HashSet::new(),
            nv: BTreeMap::new(),
            objects: BTreeMap::new(),
            next_handle: TRANSIENT_FIRST,
            flushed: Vec::new(),
            disconnected: false,
            zero_handles: false,
            zero_random: false,
        }
    }

    /// Command codes received, in order.
    pub fn commands(&self) -> Vec<CommandCodeEnum> {
        self.commands
            .iter()
            .filter_map(|&cc| CommandCodeEnum::from_u32(cc))
            .collect()
    }

    /// Answers every later `command_code` with `response_code`.
    pub fn fail_command(&mut self, command_code: CommandCodeEnum, response_code: u32) {
        self.failures.insert(command_code.into(), response_code);
    }

    /// Carries out every later `command_code` but answers it with a
    /// parameterSize that overruns the reply.
    pub fn malform_reply(&mut self, command_code: CommandCodeEnum) {
        self.malformed.insert(command_code.into());
    }

    pub fn disconnect(&mut self) {
        self.disconnected = true;
    }

    pub fn return_zero_handles(&mut self) {
        self.zero_handles = true;
    }

    pub fn zero_random(&mut self) {
        self.zero_random = true;
    }

    /// Handles released by FlushContext, in order.
    pub fn flushed(&self) -> Vec<u32> {
        self.flushed.clone()
    }

    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn corrupt_nv(&mut self, nv_index: u32, offset: usize, value: u8) {
        if let Some(byte) = self
            .nv
            .get_mut(&nv_index)
            .and_then(|index| index.data.get_mut(offset))
        {
            *byte = value;
        }
    }

    fn allocate_handle(&mut self, public: Vec<u8>) -> u32 {
        if self.zero_handles {
            return 0;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.objects.insert(handle, public);
        handle
    }

    fn skip_auth_area(reader: &mut ReplyReader<'_>) -> Result<(), u32> {
        let size = reader.read_u32().map_err(insufficient)?;
        reader.read_bytes(size as usize).map_err(insufficient)?;
        Ok(())
    }

    fn dispatch(&mut self, command_code: u32, reader: &mut ReplyReader<'_>) -> Result<Response, u32> {
        let Some(command_code) = CommandCodeEnum::from_u32(command_code) else {
            return Err(ResponseCode::CommandCode as u32);
        };

        match command_code {
            CommandCodeEnum::Startup | CommandCodeEnum::SelfTest => {
                Ok(Response::no_sessions(Vec::new()))
            }
            CommandCodeEnum::GetRandom => {
                let n = reader.read_u16().map_err(insufficient)?;
                let data: Vec<u8> = if self.zero_random {
                    vec![0; n.into()]
                } else {
                    (0..n).map(|i| (i as u8).wrapping_add(1)).collect()
                };
                Ok(Response::no_sessions(tpm2b(&data)))
            }
            CommandCodeEnum::PCR_Read => self.pcr_read(reader),
            CommandCodeEnum::GetCapability => self.get_capability(reader),
            CommandCodeEnum::Hash => Self::hash(reader),
            CommandCodeEnum::NV_DefineSpace => self.nv_define_space(reader),
            CommandCodeEnum::NV_Write => self.nv_write(reader),
            CommandCodeEnum::NV_Read => self.nv_read(reader),
            CommandCodeEnum::CreatePrimary => self.create_primary(reader),
            CommandCodeEnum::Create => self.create(reader),
            CommandCodeEnum::Load => self.load(reader),
            CommandCodeEnum::Sign => self.sign(reader),
            CommandCodeEnum::FlushContext => {
                let handle = reader.read_u32().map_err(insufficient)?;
                if self.objects.remove(&handle).is_none() {
                    return Err(handle_error(TPM_RC_1));
                }
                self.flushed.push(handle);
                Ok(Response::no_sessions(Vec::new()))
            }
            _ => Err(ResponseCode::CommandCode as u32),
        }
    }

    fn pcr_read(&mut self, reader: &mut ReplyReader<'_>) -> Result<Response, u32> {
        let count = reader.read_u32().map_err(insufficient)?;
        let mut selections = Vec::new();
        let mut digests = Vec::new();
        for _ in 0..count {
            let hash = reader.read_u16().map_err(insufficient)?;
            let size = reader.read_u8().map_err(insufficient)?;
            let bitmap = reader.read_bytes(size.into()).map_err(insufficient)?;
            let digest_size = AlgIdEnum::from_u16(hash)
                .and_then(|alg| alg.digest_size())
                .ok_or(ResponseCode::Hash as u32 + TPM_RC_P + TPM_RC_1)?;
            let selected = bitmap.iter().map(|b| b.count_ones()).sum::<u32>();
            digests.extend((0..selected).map(|_| vec![0u8; digest_size]));

            selections.extend_from_slice(&hash.to_be_bytes());
            selections.push(size);
            selections.extend_from_slice(bitmap);
        }

        let mut parameters = 1u32.to_be_bytes().to_vec();
        parameters.extend_from_slice(&count.to_be_bytes());
        parameters.extend_from_slice(&selections);
        parameters.extend_from_slice(&(digests.len() as u32).to_be_bytes());
        for digest in &digests {
            parameters.extend(tpm2b(digest));
        }
        Ok(Response::no_sessions(parameters))
    }

    fn get_capability(&mut self, reader: &mut ReplyReader<'_>) -> Result<Response, u32> {
        let capability = reader.read_u32().map_err(insufficient)?;
        let property = reader.read_u32().map_err(insufficient)?;
        let count = reader.read_u32().map_err(insufficient)?;

        let mut parameters = vec![0u8];
        parameters.extend_from_slice(&capability.to_be_bytes());
        match capability {
            TPM20_CAP_TPM_PROPERTIES => {
                let entries = count.min(2);
                parameters.extend_from_slice(&entries.to_be_bytes());
                for p in property..property + entries {
                    let value = if p == 0x100 { FAMILY_INDICATOR } else { 0 };
                    parameters.extend_from_slice(&p.to_be_bytes());
                    parameters.extend_from_slice(&value.to_be_bytes());
                }
            }
            TPM20_CAP_ALGS => {
                let algs = [(AlgIdEnum::RSA, 0x9u32), (AlgIdEnum::SHA256, 0x4)];
                parameters.extend_from_slice(&(algs.len() as u32).to_be_bytes());
                for (alg, properties) in algs {
                    parameters.extend_from_slice(&u16::from(alg).to_be_bytes());
                    parameters.extend_from_slice(&properties.to_be_bytes());
                }
            }
            TPM20_CAP_HANDLES => {
                parameters.extend_from_slice(&(self.objects.len() as u32).to_be_bytes());
                for handle in self.objects.keys() {
                    parameters.extend_from_slice(&handle.to_be_bytes());
                }
            }
            _ => return Err(ResponseCode::Value as u32 + TPM_RC_P + TPM_RC_1),
        }
        Ok(Response::no_sessions(parameters))
    }

    fn hash(reader: &mut ReplyReader<'_>) -> Result<Response, u32> {
        let data = reader.read_tpm2b().map_err(insufficient)?;
        let alg = reader.read_u16().map_err(insufficient)?;
        let hierarchy = reader.read_u32().map_err(insufficient)?;

        let unsupported = ResponseCode::Hash as u32 + TPM_RC_P + TPM_RC_2;
        let digest = match (AlgIdEnum::from_u16(alg), data) {
            (Some(AlgIdEnum::SHA256), b"123456") => {
                hex::decode("8d969eef6ecad3c29a3a629280e686cf0c3f5d5a86aff3ca12020c923adc6c92")
                    .unwrap()
            }
            (Some(AlgIdEnum::SM3_256), b"123456") => {
                hex::decode("207cf410532f92a47dee245ce9b11ff71f578ebd763eb3bbea44ebd043d018fb")
                    .unwrap()
            }
            (Some(alg), _) => vec![0; alg.digest_size().ok_or(unsupported)?],
            (None, _) => return Err(unsupported),
        };

        let mut parameters = tpm2b(&digest);
        parameters.extend_from_slice(&u16::from(SessionTagEnum::Hashcheck).to_be_bytes());
        parameters.extend_from_slice(&hierarchy.to_be_bytes());
        parameters.extend(tpm2b(&[]));
        Ok(Response::no_sessions(parameters))
    }

    fn nv_define_space(&mut self, reader: &mut ReplyReader<'_>) -> Result<Response, u32> {
        let _auth_handle = reader.read_u32().map_err(insufficient)?;
        Self::skip_auth_area(reader)?;
        let _auth = reader.read_tpm2b().map_err(insufficient)?;
        let public = reader.read_tpm2b().map_err(insufficient)?;

        let mut public = ReplyReader::new(public);
        let nv_index = public.read_u32().map_err(insufficient)?;
        let _name_alg = public.read_u16().map_err(insufficient)?;
        let _attributes = public.read_u32().map_err(insufficient)?;
        let _policy = public.read_tpm2b().map_err(insufficient)?;
        let data_size = public.read_u16().map_err(insufficient)?;

        if self.nv.contains_key(&nv_index) {
            return Err(ResponseCode::NvDefined as u32);
        }
        self.nv.insert(
            nv_index,
            NvIndex {
                data: vec![0xff; data_size.into()],
                written: false,
            },
        );
        Ok(Response::sessions(None, Vec::new()))
    }

    fn nv_write(&mut self, reader: &mut ReplyReader<'_>) -> Result<Response, u32> {
        let _auth_handle = reader.read_u32().map_err(insufficient)?;
        let nv_index = reader.read_u32().map_err(insufficient)?;
        Self::skip_auth_area(reader)?;
        let data = reader.read_tpm2b().map_err(insufficient)?;
        let offset: usize = reader.read_u16().map_err(insufficient)?.into();

        let index = self.nv.get_mut(&nv_index).ok_or(handle_error(TPM_RC_2))?;
        let slot = index
            .data
            .get_mut(offset..offset + data.len())
            .ok_or(ResponseCode::NvRange as u32)?;
        slot.copy_from_slice(data);
        index.written = true;
        Ok(Response::sessions(None, Vec::new()))
    }

    fn nv_read(&mut self, reader: &mut ReplyReader<'_>) -> Result<Response, u32> {
        let _auth_handle = reader.read_u32().map_err(insufficient)?;
        let nv_index = reader.read_u32().map_err(insufficient)?;
        Self::skip_auth_area(reader)?;
        let size: usize = reader.read_u16().map_err(insufficient)?.into();
        let offset: usize = reader.read_u16().map_err(insufficient)?.into();

        let index = self.nv.get(&nv_index).ok_or(handle_error(TPM_RC_2))?;
        if !index.written {
            return Err(ResponseCode::NvUninitialized as u32);
        }
        let data = index
            .data
            .get(offset..offset + size)
            .ok_or(ResponseCode::NvRange as u32)?;
        Ok(Response::sessions(None, tpm2b(data)))
    }

    fn create_primary(&mut self, reader: &mut ReplyReader<'_>) -> Result<Response, u32> {
        let _hierarchy = reader.read_u32().map_err(insufficient)?;
        Self::skip_auth_area(reader)?;
        let _sensitive = reader.read_tpm2b().map_err(insufficient)?;
        let public = reader.read_tpm2b().map_err(insufficient)?.to_vec();

        let mut parameters = tpm2b(&public);
        // creationData, creationHash
        parameters.extend(tpm2b(&[]));
        parameters.extend(tpm2b(&[]));
        let handle = self.allocate_handle(public);
        Ok(Response::sessions(Some(handle), parameters))
    }

    fn create(&mut self, reader: &mut ReplyReader<'_>) -> Result<Response, u32> {
        let parent = reader.read_u32().map_err(insufficient)?;
        if !self.objects.contains_key(&parent) {
            return Err(handle_error(TPM_RC_1));
        }
        Self::skip_auth_area(reader)?;
        let _sensitive = reader.read_tpm2b().map_err(insufficient)?;
        let public = reader.read_tpm2b().map_err(insufficient)?;

        let mut private = b"wrapped:".to_vec();
        private.extend_from_slice(&parent.to_be_bytes());
        let mut parameters = tpm2b(&private);
        parameters.extend(tpm2b(public));
        parameters.extend(tpm2b(&[]));
        Ok(Response::sessions(None, parameters))
    }

    fn load(&mut self, reader: &mut ReplyReader<'_>) -> Result<Response, u32> {
        let parent = reader.read_u32().map_err(insufficient)?;
        if !self.objects.contains_key(&parent) {
            return Err(handle_error(TPM_RC_1));
        }
        Self::skip_auth_area(reader)?;
        let _private = reader.read_tpm2b().map_err(insufficient)?;
        let public = reader.read_tpm2b().map_err(insufficient)?.to_vec();

        let mut name = vec![0x00, 0x0b];
        name.extend_from_slice(&[0x11; 32]);
        let handle = self.allocate_handle(public);
        Ok(Response::sessions(Some(handle), tpm2b(&name)))
    }

    fn sign(&mut self, reader: &mut ReplyReader<'_>) -> Result<Response, u32> {
        let key = reader.read_u32().map_err(insufficient)?;
        let public = self.objects.get(&key).ok_or(handle_error(TPM_RC_1))?;
        Self::skip_auth_area(reader)?;
        let _digest = reader.read_tpm2b().map_err(insufficient)?;

        // Pick the signing scheme out of the key's TPMT_PUBLIC.
        let mut public = ReplyReader::new(public);
        let scheme = (|| {
            let _type = public.read_u16()?;
            let _name_alg = public.read_u16()?;
            let _attributes = public.read_u32()?;
            let _policy = public.read_tpm2b()?;
            if public.read_u16()? != u16::from(AlgIdEnum::NULL) {
                // keyBits, mode
                public.read_bytes(4)?;
            }
            let scheme = public.read_u16()?;
            let hash = if scheme != u16::from(AlgIdEnum::NULL) {
                public.read_u16()?
            } else {
                0
            };
            Ok::<_, ResponseError>((scheme, hash))
        })();
        let (scheme, hash) = scheme.map_err(insufficient)?;

        let mut parameters = scheme.to_be_bytes().to_vec();
        match AlgIdEnum::from_u16(scheme) {
            Some(AlgIdEnum::RSASSA | AlgIdEnum::RSAPSS) => {
                parameters.extend_from_slice(&hash.to_be_bytes());
                parameters.extend(tpm2b(&[0xa5; 256]));
            }
            Some(AlgIdEnum::ECDSA | AlgIdEnum::SM2 | AlgIdEnum::ECSCHNORR) => {
                parameters.extend_from_slice(&hash.to_be_bytes());
                parameters.extend(tpm2b(&[0x5a; 32]));
                parameters.extend(tpm2b(&[0xa5; 32]));
            }
            _ => return Err(ResponseCode::Scheme as u32 + TPM_RC_P + TPM_RC_2),
        }
        Ok(Response::sessions(None, parameters))
    }
}

impl TpmEngine for MockTpm {
    type Error = MockTpmError;

    fn execute_command(
        &mut self,
        command: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, Self::Error> {
        if self.disconnected {
            return Err(MockTpmError::Disconnected);
        }

        let mut reader = ReplyReader::new(command);
        let header = (|| {
            let _tag = reader.read_u16()?;
            let _size = reader.read_u32()?;
            reader.read_u32()
        })();

        let malformed = header
            .as_ref()
            .is_ok_and(|command_code| self.malformed.contains(command_code));
        let result = match header {
            Ok(command_code) => {
                self.commands.push(command_code);
                match self.failures.get(&command_code) {
                    Some(&response_code) => Err(response_code),
                    None => self.dispatch(command_code, &mut reader),
                }
            }
            Err(_) => Err(ResponseCode::CommandSize as u32),
        };

        let mut out = Vec::new();
        match result {
            Err(response_code) => {
                out.extend_from_slice(&u16::from(SessionTagEnum::NoSessions).to_be_bytes());
                out.extend_from_slice(&10u32.to_be_bytes());
                out.extend_from_slice(&response_code.to_be_bytes());
            }
            Ok(response) => {
                let tag = if response.sessions {
                    SessionTagEnum::Sessions
                } else {
                    SessionTagEnum::NoSessions
                };
                out.extend_from_slice(&u16::from(tag).to_be_bytes());
                out.extend_from_slice(&[0; 4]);
                out.extend_from_slice(&0u32.to_be_bytes());
                if let Some(handle) = response.handle {
                    out.extend_from_slice(&handle.to_be_bytes());
                }
                if response.sessions && malformed {
                    out.extend_from_slice(&0x40u32.to_be_bytes());
                } else if response.sessions {
                    out.extend_from_slice(&(response.parameters.len() as u32).to_be_bytes());
                    out.extend_from_slice(&response.parameters);
                    // nonce, continueSession, hmac
                    out.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x00]);
                } else {
                    out.extend_from_slice(&response.parameters);
                }
                let size = out.len() as u32;
                out[2..6].copy_from_slice(&size.to_be_bytes());
            }
        }

        let slot = reply
            .get_mut(..out.len())
            .ok_or(MockTpmError::ReplyTooLarge(out.len()))?;
        slot.copy_from_slice(&out);
        Ok(out.len())
    }
}
