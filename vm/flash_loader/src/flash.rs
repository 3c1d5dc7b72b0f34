// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Placement of flash-backed system firmware below 4 GiB.

use crate::confidential;
use crate::confidential::SecretInjection;
use crate::importer::FlashMapper;
use crate::importer::MemoryEncrypt;
use thiserror::Error;

/// Size of one flash sector. Bank sizes must be a multiple of this.
pub const FLASH_SECTOR_SIZE: u64 = 0x1000;

/// Conventional cap on the combined size of all flash banks.
pub const DEFAULT_MAX_FIRMWARE_SIZE: u64 = 8 * 1024 * 1024;

const FOUR_GB: u64 = 0x1_0000_0000;

// The tail of bank 0 is shadowed read-only directly below 1 MiB for firmware
// that expects a copy of itself in the legacy window.
const SHADOW_TOP: u64 = 0x100000;
const MAX_SHADOW_SIZE: u64 = 0x20000; // 128 KiB

/// Fatal flash placement errors. The initialization driver is responsible
/// for turning these into a failed machine start; none of them are
/// recoverable at runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// A later bank is backed while an earlier one is not.
    #[error("flash bank {index} has backing storage but bank {} does not", .index - 1)]
    BankGap {
        /// Index of the backed bank.
        index: usize,
    },
    /// A bank's size is zero or not sector aligned.
    #[error(
        "flash bank {debug_tag} has invalid size {size:#x}; must be a non-zero multiple of {:#x}",
        FLASH_SECTOR_SIZE
    )]
    InvalidSize {
        /// The offending bank.
        debug_tag: String,
        /// The offending size in bytes.
        size: u64,
    },
    /// The running total of bank sizes exceeds the configured budget.
    #[error("combined size of flash banks {total:#x} exceeds maximum firmware size {max:#x}")]
    ExceedsMaximum {
        /// The running total including the offending bank.
        total: u64,
        /// The configured budget.
        max: u64,
    },
    /// The address-space binder failed to realize a bank or shadow window.
    #[error("failed to map flash bank {debug_tag}")]
    Mapper {
        /// The offending bank.
        debug_tag: String,
        #[source]
        source: anyhow::Error,
    },
    /// Secret-injection preparation of bank 0 failed.
    #[error("failed to prepare flash bank {debug_tag} for confidential execution")]
    Confidential {
        /// The offending bank.
        debug_tag: String,
        #[source]
        source: confidential::Error,
    },
}

/// One system flash bank and its backing contents.
#[derive(Debug)]
pub struct FlashBank {
    debug_tag: String,
    backing: Option<Vec<u8>>,
    base: Option<u64>,
}

impl FlashBank {
    /// Creates a bank. A `backing` of `None` leaves the bank inactive; a
    /// machine may expose more banks than its configuration populates.
    pub fn new(debug_tag: impl Into<String>, backing: Option<Vec<u8>>) -> Self {
        Self {
            debug_tag: debug_tag.into(),
            backing,
            base: None,
        }
    }

    /// The human readable name used for reporting.
    pub fn debug_tag(&self) -> &str {
        &self.debug_tag
    }

    /// Whether the bank has backing storage.
    pub fn is_backed(&self) -> bool {
        self.backing.is_some()
    }

    /// The bank's guest physical base address, assigned by
    /// [`map_flash_banks`].
    pub fn base(&self) -> Option<u64> {
        self.base
    }

    /// The bank's contents.
    pub fn data(&self) -> Option<&[u8]> {
        self.backing.as_deref()
    }
}

/// Checks one candidate bank size against the sector size.
fn validate_bank_size(debug_tag: &str, size: u64) -> Result<(), Error> {
    if size == 0 || size % FLASH_SECTOR_SIZE != 0 {
        return Err(Error::InvalidSize {
            debug_tag: debug_tag.to_owned(),
            size,
        });
    }
    Ok(())
}

/// Maps `banks` from 4 GiB downward and realizes them through `mapper`.
///
/// Banks are placed back to front: bank 0 ends exactly at 4 GiB and later
/// banks sit progressively lower with no gaps. Placement stops at the first
/// bank without backing storage; zero backed banks is a no-op, leaving the
/// caller to fall back to a non-flash firmware path. Each bank's size must
/// be a non-zero multiple of [`FLASH_SECTOR_SIZE`], and the combined size
/// must not exceed `max_firmware_size`.
///
/// For bank 0, the last 128 KiB of content is additionally shadowed
/// read-only below 1 MiB, and, when `memcrypt` is active, the bank is handed
/// to `secrets` for metadata table extraction and in-place encryption before
/// this returns.
pub fn map_flash_banks(
    banks: &mut [FlashBank],
    max_firmware_size: u64,
    mapper: &mut dyn FlashMapper,
    memcrypt: &mut dyn MemoryEncrypt,
    secrets: &SecretInjection,
) -> Result<(), Error> {
    // A backed bank after an unbacked one is a configuration error; reject
    // it before any bank is placed.
    for index in 1..banks.len() {
        if banks[index].is_backed() && !banks[index - 1].is_backed() {
            return Err(Error::BankGap { index });
        }
    }

    let mut total_size: u64 = 0;
    for (index, bank) in banks.iter_mut().enumerate() {
        let FlashBank {
            debug_tag,
            backing,
            base,
        } = bank;
        let Some(data) = backing.as_mut() else { break };
        let size = data.len() as u64;
        validate_bank_size(debug_tag, size)?;
        // Banks sit entirely below 4 GiB, so the placement ceiling also
        // caps the budget.
        total_size = total_size
            .checked_add(size)
            .filter(|&total| total <= max_firmware_size.min(FOUR_GB))
            .ok_or(Error::ExceedsMaximum {
                total: total_size.saturating_add(size),
                max: max_firmware_size.min(FOUR_GB),
            })?;

        let bank_base = FOUR_GB - total_size;
        *base = Some(bank_base);
        tracing::debug!(index, base = bank_base, size, "mapping flash bank");
        mapper
            .map_bank(
                index,
                bank_base,
                (size / FLASH_SECTOR_SIZE) as u32,
                debug_tag,
            )
            .map_err(|source| Error::Mapper {
                debug_tag: debug_tag.clone(),
                source,
            })?;

        if index == 0 {
            // The shadow is a point-in-time copy taken before any
            // encryption of the bank.
            let shadow_size = size.min(MAX_SHADOW_SIZE) as usize;
            let shadow_base = SHADOW_TOP - shadow_size as u64;
            tracing::debug!(shadow_base, shadow_size, "mapping firmware shadow window");
            mapper
                .map_shadow(shadow_base, &data[data.len() - shadow_size..], "isa-bios")
                .map_err(|source| Error::Mapper {
                    debug_tag: debug_tag.clone(),
                    source,
                })?;

            if memcrypt.active() {
                secrets
                    .prepare_bank(data, memcrypt)
                    .map_err(|source| Error::Confidential {
                        debug_tag: debug_tag.clone(),
                        source,
                    })?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fw_table::testutil;

    #[derive(Default)]
    struct TestMapper {
        banks: Vec<(usize, u64, u32, String)>,
        shadows: Vec<(u64, Vec<u8>)>,
        fail: bool,
    }

    impl FlashMapper for TestMapper {
        fn map_bank(
            &mut self,
            index: usize,
            base: u64,
            sector_count: u32,
            debug_tag: &str,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("mapper failure");
            }
            self.banks
                .push((index, base, sector_count, debug_tag.to_owned()));
            Ok(())
        }

        fn map_shadow(&mut self, base: u64, data: &[u8], _debug_tag: &str) -> anyhow::Result<()> {
            self.shadows.push((base, data.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestMemcrypt {
        active: bool,
        calls: Vec<&'static str>,
    }

    impl MemoryEncrypt for TestMemcrypt {
        fn active(&self) -> bool {
            self.active
        }

        fn save_reset_vector(&mut self, _image: &[u8]) -> anyhow::Result<()> {
            self.calls.push("save_reset_vector");
            Ok(())
        }

        fn encrypt_in_place(&mut self, image: &mut [u8]) -> anyhow::Result<()> {
            self.calls.push("encrypt");
            for b in image.iter_mut() {
                *b ^= 0xff;
            }
            Ok(())
        }
    }

    fn bank(debug_tag: &str, size: usize) -> FlashBank {
        FlashBank::new(debug_tag, Some(vec![0u8; size]))
    }

    fn map(
        banks: &mut [FlashBank],
        max: u64,
        mapper: &mut TestMapper,
        memcrypt: &mut TestMemcrypt,
    ) -> Result<(), Error> {
        let secrets = SecretInjection::new();
        map_flash_banks(banks, max, mapper, memcrypt, &secrets)
    }

    #[test]
    fn maps_descending_without_gaps() {
        let mut banks = [bank("flash0", 0x200000), bank("flash1", 0x100000)];
        let mut mapper = TestMapper::default();
        map(
            &mut banks,
            DEFAULT_MAX_FIRMWARE_SIZE,
            &mut mapper,
            &mut TestMemcrypt::default(),
        )
        .unwrap();

        assert_eq!(banks[0].base(), Some(FOUR_GB - 0x200000));
        assert_eq!(banks[1].base(), Some(FOUR_GB - 0x300000));
        assert_eq!(
            mapper.banks,
            vec![
                (0, FOUR_GB - 0x200000, 0x200, "flash0".to_owned()),
                (1, FOUR_GB - 0x300000, 0x100, "flash1".to_owned()),
            ]
        );
        // Bank 0 ends exactly at 4 GiB; bank 1 ends exactly where bank 0
        // starts.
        assert_eq!(banks[0].base().unwrap() + 0x200000, FOUR_GB);
        assert_eq!(banks[1].base().unwrap() + 0x100000, banks[0].base().unwrap());
    }

    #[test]
    fn stops_at_first_unbacked_bank() {
        let mut banks = [
            bank("flash0", 0x100000),
            FlashBank::new("flash1", None),
            FlashBank::new("flash2", None),
        ];
        let mut mapper = TestMapper::default();
        map(
            &mut banks,
            DEFAULT_MAX_FIRMWARE_SIZE,
            &mut mapper,
            &mut TestMemcrypt::default(),
        )
        .unwrap();
        assert_eq!(mapper.banks.len(), 1);
        assert_eq!(banks[1].base(), None);
    }

    #[test]
    fn zero_banks_is_a_noop() {
        let mut banks = [FlashBank::new("flash0", None), FlashBank::new("flash1", None)];
        let mut mapper = TestMapper::default();
        map(
            &mut banks,
            DEFAULT_MAX_FIRMWARE_SIZE,
            &mut mapper,
            &mut TestMemcrypt::default(),
        )
        .unwrap();
        assert!(mapper.banks.is_empty());
        assert!(mapper.shadows.is_empty());
    }

    #[test]
    fn rejects_gap_before_placing() {
        let mut banks = [FlashBank::new("flash0", None), bank("flash1", 0x100000)];
        let mut mapper = TestMapper::default();
        let err = map(
            &mut banks,
            DEFAULT_MAX_FIRMWARE_SIZE,
            &mut mapper,
            &mut TestMemcrypt::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BankGap { index: 1 }));
        assert!(mapper.banks.is_empty());
        assert_eq!(banks[1].base(), None);
    }

    #[test]
    fn rejects_unaligned_size() {
        let mut banks = [bank("flash0", 0x100001)];
        let err = map(
            &mut banks,
            DEFAULT_MAX_FIRMWARE_SIZE,
            &mut TestMapper::default(),
            &mut TestMemcrypt::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSize { size: 0x100001, .. }));
    }

    #[test]
    fn rejects_empty_backing() {
        let mut banks = [bank("flash0", 0)];
        let err = map(
            &mut banks,
            DEFAULT_MAX_FIRMWARE_SIZE,
            &mut TestMapper::default(),
            &mut TestMemcrypt::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSize { size: 0, .. }));
    }

    #[test]
    fn budget_boundary() {
        // A total exactly equal to the budget passes.
        let mut banks = [bank("flash0", 0x2000), bank("flash1", 0x1000)];
        map(
            &mut banks,
            0x3000,
            &mut TestMapper::default(),
            &mut TestMemcrypt::default(),
        )
        .unwrap();

        // Anything beyond it fails, reported with the running total.
        let mut banks = [bank("flash0", 0x2000), bank("flash1", 0x1000)];
        let err = map(
            &mut banks,
            0x2fff,
            &mut TestMapper::default(),
            &mut TestMemcrypt::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ExceedsMaximum {
                total: 0x3000,
                max: 0x2fff
            }
        ));
    }

    #[test]
    fn rejects_total_above_placement_ceiling() {
        // An unbounded budget still cannot push banks below address zero.
        let mut banks = [
            bank("flash0", 0x8000_0000),
            bank("flash1", 0x8000_0000),
            bank("flash2", 0x8000_0000),
        ];
        let mut mapper = TestMapper::default();
        let err = map(&mut banks, u64::MAX, &mut mapper, &mut TestMemcrypt::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ExceedsMaximum {
                total: 0x1_8000_0000,
                max: FOUR_GB
            }
        ));
        // The first two banks fill the space below 4 GiB exactly; the third
        // was never placed.
        assert_eq!(banks[1].base(), Some(0));
        assert_eq!(banks[2].base(), None);
        assert_eq!(mapper.banks.len(), 2);
    }

    #[test]
    fn shadow_window_covers_bank_tail() {
        let mut banks = [FlashBank::new("flash0", {
            let mut data = vec![0u8; 0x200000];
            let len = data.len();
            data[len - 0x20000..].fill(0x5a);
            data[len - 0x20001] = 0xa5;
            Some(data)
        })];
        let mut mapper = TestMapper::default();
        map(
            &mut banks,
            DEFAULT_MAX_FIRMWARE_SIZE,
            &mut mapper,
            &mut TestMemcrypt::default(),
        )
        .unwrap();

        let (base, data) = &mapper.shadows[0];
        assert_eq!(*base, 0x100000 - 0x20000);
        assert_eq!(data.len(), 0x20000);
        assert!(data.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn small_bank_shrinks_shadow() {
        let mut banks = [bank("flash0", 0x10000)];
        let mut mapper = TestMapper::default();
        map(
            &mut banks,
            DEFAULT_MAX_FIRMWARE_SIZE,
            &mut mapper,
            &mut TestMemcrypt::default(),
        )
        .unwrap();
        let (base, data) = &mapper.shadows[0];
        assert_eq!(*base, 0x100000 - 0x10000);
        assert_eq!(data.len(), 0x10000);
    }

    #[test]
    fn mapper_failure_is_fatal() {
        let mut banks = [bank("flash0", 0x1000)];
        let mut mapper = TestMapper {
            fail: true,
            ..Default::default()
        };
        let err = map(
            &mut banks,
            DEFAULT_MAX_FIRMWARE_SIZE,
            &mut mapper,
            &mut TestMemcrypt::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Mapper { .. }));
    }

    #[test]
    fn inactive_memcrypt_leaves_bank_alone() {
        let mut banks = [bank("flash0", 0x1000)];
        let mut memcrypt = TestMemcrypt::default();
        map(
            &mut banks,
            DEFAULT_MAX_FIRMWARE_SIZE,
            &mut TestMapper::default(),
            &mut memcrypt,
        )
        .unwrap();
        assert!(memcrypt.calls.is_empty());
        assert!(banks[0].data().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn confidential_bank_is_prepared_after_shadowing() {
        let guid = guid::Guid::from_static_str("4c2eb0c0-223d-4111-bc8b-5fa72ce1a161");
        let tail = testutil::image(&[testutil::entry(b"AB", guid)]);
        // Pad at the front to a sector multiple; the table must stay anchored
        // at the end of the image.
        let mut image = vec![0u8; tail.len().next_multiple_of(FLASH_SECTOR_SIZE as usize) - tail.len()];
        image.extend_from_slice(&tail);

        let mut banks = [FlashBank::new("flash0", Some(image))];
        let mut mapper = TestMapper::default();
        let mut memcrypt = TestMemcrypt {
            active: true,
            ..Default::default()
        };
        let secrets = SecretInjection::new();
        map_flash_banks(
            &mut banks,
            DEFAULT_MAX_FIRMWARE_SIZE,
            &mut mapper,
            &mut memcrypt,
            &secrets,
        )
        .unwrap();

        assert_eq!(memcrypt.calls, vec!["save_reset_vector", "encrypt"]);
        assert_eq!(secrets.find_entry(guid).unwrap(), b"AB");

        // The shadow holds the pre-encryption contents; the bank itself was
        // encrypted in place.
        let bank_tail = &banks[0].data().unwrap()[banks[0].data().unwrap().len() - 0x1000..];
        let shadow_tail = &mapper.shadows[0].1[mapper.shadows[0].1.len() - 0x1000..];
        assert!(bank_tail.iter().zip(shadow_tail).all(|(&b, &s)| b == s ^ 0xff));
    }
}
