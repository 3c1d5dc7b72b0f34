// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Extraction of the GUIDed metadata table embedded at the tail of a
//! firmware image.
//!
//! Firmware built for secret injection carries a footer-anchored table of
//! GUID-keyed entries just below the reset vector code at the end of the
//! image. Each entry is laid out as `[payload][len: u16][guid: 16 bytes]`,
//! with `len` covering the whole entry including its own trailer, so the
//! table forms a backward-linked list walked from its tail.

use guid::Guid;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Footer GUID identifying a firmware image that embeds the metadata table.
pub const TABLE_FOOTER_GUID: Guid = Guid::from_static_str("96b582de-1fb2-45f7-baea-a366c55a082d");

// The final 32 bytes of the image hold reset vector code; the table footer
// sits immediately below them.
const RESET_VECTOR_TAIL: usize = 32;

/// Trailing descriptor shared by the table footer and every entry.
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
struct EntryTrailer {
    /// Length of the whole entry, trailer included.
    len: u16,
    /// On-disk little-endian GUID.
    guid: [u8; 16],
}

const TRAILER_SIZE: usize = size_of::<EntryTrailer>();

impl EntryTrailer {
    fn guid(&self) -> Guid {
        self.guid.into()
    }
}

/// An owned copy of the GUIDed metadata table extracted from a firmware
/// image.
#[derive(Debug)]
pub struct FirmwareTable {
    data: Vec<u8>,
}

impl FirmwareTable {
    /// Extracts the table from `image`.
    ///
    /// Returns `None` when the image carries no table: too short to hold a
    /// footer, footer GUID mismatch, or an empty table. These are all
    /// expected for firmware that does not participate in secret injection.
    /// The image is untrusted, so every read is bounds checked.
    pub fn extract(image: &[u8]) -> Option<Self> {
        let below_reset = &image[..image.len().checked_sub(RESET_VECTOR_TAIL)?];
        let Ok((_, footer)) = EntryTrailer::read_from_suffix(below_reset) else {
            return None;
        };
        if footer.guid() != TABLE_FOOTER_GUID {
            tracing::debug!("no metadata table footer in firmware image");
            return None;
        }

        // The footer's length covers its own trailer, which is not part of
        // the table contents.
        let total_len = usize::from(footer.len).checked_sub(TRAILER_SIZE)?;
        if total_len == 0 {
            return None;
        }
        let end = below_reset.len() - TRAILER_SIZE;
        let start = end.checked_sub(total_len)?;

        tracing::debug!(total_len, "extracted firmware metadata table");
        Some(Self {
            data: below_reset[start..end].to_vec(),
        })
    }

    /// Looks up the entry tagged `guid` and returns its payload.
    ///
    /// Entries are walked back to front. A malformed entry ends the walk
    /// with a warning: the table is firmware-supplied content, and a bad
    /// length field must surface as "not found" rather than an out-of-range
    /// read or an unterminated loop.
    pub fn find(&self, guid: Guid) -> Option<&[u8]> {
        let mut cursor = self.data.len();
        while cursor > 0 {
            let Ok((_, trailer)) = EntryTrailer::read_from_suffix(&self.data[..cursor]) else {
                tracing::warn!(cursor, "firmware metadata table truncated mid-entry");
                return None;
            };
            let len = usize::from(trailer.len);
            if len < TRAILER_SIZE {
                tracing::warn!(len, "firmware metadata table entry shorter than its trailer");
                return None;
            }
            let Some(start) = cursor.checked_sub(len) else {
                tracing::warn!(len, cursor, "firmware metadata table entry overruns table start");
                return None;
            };
            if trailer.guid() == guid {
                return Some(&self.data[start..cursor - TRAILER_SIZE]);
            }
            cursor = start;
        }
        None
    }
}
