// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM character device engine.

use std::io;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use tpm_lib::TpmEngine;

/// A TPM reached through a Linux character device, normally the kernel
/// resource manager at `/dev/tpmrm0`.
pub struct Tpm {
    device: fs_err::File,
}

impl Tpm {
    pub fn open(path: &Path) -> io::Result<Self> {
        let device = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self { device })
    }
}

impl TpmEngine for Tpm {
    type Error = io::Error;

    fn execute_command(&mut self, command: &[u8], reply: &mut [u8]) -> io::Result<usize> {
        self.device.write_all(command)?;
        // The driver hands back the whole response in a single read.
        let len = self.device.read(reply)?;
        tracing::trace!(len, "read TPM response");
        Ok(len)
    }
}
