// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides the [`Guid`] type, a 128-bit identifier in the Windows/EFI field
//! layout.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::str::FromStr;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Windows format GUID.
///
/// The first three fields are stored in native (little-endian) byte order, so
/// the in-memory representation matches the on-disk form used by firmware:
/// [`IntoBytes::as_bytes`] yields the wire encoding directly.
#[repr(C)]
#[derive(
    Copy,
    Clone,
    Default,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
#[allow(missing_docs)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    /// The all-zero GUID.
    pub const ZERO: Self = Guid {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// Creates a new GUID from a string, panicking if the input is invalid.
    /// Accepted formats are "{00000000-0000-0000-0000-000000000000}" and
    /// "00000000-0000-0000-0000-000000000000".
    ///
    /// # Note
    ///
    /// This is a const function, intended to initialize GUID constants at
    /// compile time. For parsing non-constant input, use `from_str` instead.
    pub const fn from_static_str(value: &'static str) -> Guid {
        match Self::parse(value.as_bytes()) {
            Ok(guid) => guid,
            Err(ParseError::Length) => panic!("invalid GUID length"),
            Err(ParseError::Format) => panic!("invalid GUID format"),
            Err(ParseError::Digit) => panic!("invalid GUID digit"),
        }
    }

    /// Helper used by `from_static_str`, `from_str`, and `TryFrom<&[u8]>`.
    const fn parse(value: &[u8]) -> Result<Self, ParseError> {
        // Slicing is not possible in const fn, so track an index offset for
        // the optional braces.
        let offset = match value.len() {
            36 => 0,
            38 => {
                if value[0] != b'{' || value[37] != b'}' {
                    return Err(ParseError::Format);
                }
                1
            }
            _ => return Err(ParseError::Length),
        };

        // Decode the 32 hex digits into 16 big-endian bytes, skipping the
        // four dashes at their fixed positions.
        let mut bytes = [0u8; 16];
        let mut digits = 0;
        let mut i = 0;
        while i < 36 {
            if matches!(i, 8 | 13 | 18 | 23) {
                if value[offset + i] != b'-' {
                    return Err(ParseError::Format);
                }
            } else {
                let nibble = match hex_digit(value[offset + i]) {
                    Some(v) => v,
                    None => return Err(ParseError::Digit),
                };
                bytes[digits / 2] = bytes[digits / 2] << 4 | nibble;
                digits += 1;
            }
            i += 1;
        }

        Ok(Guid {
            data1: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_be_bytes([bytes[4], bytes[5]]),
            data3: u16::from_be_bytes([bytes[6], bytes[7]]),
            data4: [
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ],
        })
    }

    /// Returns true if this is the all-zero GUID.
    pub fn is_zero(&self) -> bool {
        self == &Self::ZERO
    }
}

const fn hex_digit(value: u8) -> Option<u8> {
    Some(match value {
        b'0'..=b'9' => value - b'0',
        b'a'..=b'f' => 10 + value - b'a',
        b'A'..=b'F' => 10 + value - b'A',
        _ => return None,
    })
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// An error parsing a GUID.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ParseError {
    #[error("invalid GUID length")]
    Length,
    #[error("invalid GUID format")]
    Format,
    #[error("invalid GUID digit")]
    Digit,
}

impl FromStr for Guid {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.as_bytes())
    }
}

impl TryFrom<&[u8]> for Guid {
    type Error = ParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Guid::parse(value)
    }
}

impl From<Guid> for [u8; 16] {
    fn from(value: Guid) -> Self {
        zerocopy::transmute!(value)
    }
}

impl From<[u8; 16]> for Guid {
    fn from(value: [u8; 16]) -> Self {
        zerocopy::transmute!(value)
    }
}
