// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Secret-injection preparation for confidential-execution guests.

use crate::fw_table::FirmwareTable;
use crate::importer::MemoryEncrypt;
use guid::Guid;
use std::sync::OnceLock;
use thiserror::Error;

/// Fatal failures while preparing firmware for confidential execution.
/// Partially encrypted firmware is unsafe to boot from, so the
/// initialization driver must not continue past either of these.
#[derive(Debug, Error)]
pub enum Error {
    /// The reset vector could not be located or saved.
    #[error("failed to locate and save the firmware reset vector")]
    ResetVector(#[source] anyhow::Error),
    /// In-place encryption of the firmware image failed.
    #[error("failed to encrypt the firmware image")]
    Encrypt(#[source] anyhow::Error),
}

/// Prepares firmware for secret injection and holds the metadata table used
/// later to target the injected secrets.
///
/// The table is extracted at most once: once held, further calls to
/// [`prepare_bank`](Self::prepare_bank) leave it untouched regardless of the
/// image passed.
#[derive(Debug, Default)]
pub struct SecretInjection {
    table: OnceLock<FirmwareTable>,
}

impl SecretInjection {
    /// Creates an orchestrator with no table held yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Readies `image` for confidential execution.
    ///
    /// Extracts the metadata table if none is held yet, then saves the reset
    /// vector and encrypts the image in place, in that order: the reset
    /// vector is read from plaintext, so it must be captured before
    /// encryption runs.
    pub fn prepare_bank(
        &self,
        image: &mut [u8],
        memcrypt: &mut dyn MemoryEncrypt,
    ) -> Result<(), Error> {
        if self.table.get().is_none() {
            if let Some(table) = FirmwareTable::extract(image) {
                let _ = self.table.set(table);
            }
        }
        memcrypt
            .save_reset_vector(image)
            .map_err(Error::ResetVector)?;
        memcrypt.encrypt_in_place(image).map_err(Error::Encrypt)?;
        Ok(())
    }

    /// The extracted metadata table, if the firmware carried one.
    pub fn table(&self) -> Option<&FirmwareTable> {
        self.table.get()
    }

    /// Looks up `guid` in the extracted table.
    pub fn find_entry(&self, guid: Guid) -> Option<&[u8]> {
        self.table.get()?.find(guid)
    }
}
