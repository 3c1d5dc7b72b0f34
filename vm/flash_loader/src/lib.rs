// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Flash-backed system firmware placement.
//!
//! Maps one or more flash banks into the guest physical address space below
//! 4 GiB, shadows the tail of the firmware into the legacy window below
//! 1 MiB, and, for confidential-execution guests, extracts the GUIDed
//! metadata table embedded in bank 0 and drives in-place encryption of the
//! firmware image.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod confidential;
pub mod flash;
pub mod fw_table;
pub mod importer;
