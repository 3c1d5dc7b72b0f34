// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits describing the host capabilities flash placement relies on.

/// Binds flash banks into the guest physical address space.
pub trait FlashMapper {
    /// Makes bank `index`, spanning `sector_count` flash sectors starting at
    /// `base`, visible for guest access.
    ///
    /// `debug_tag` is a human readable string used to identify the bank for
    /// debugging and reporting.
    fn map_bank(
        &mut self,
        index: usize,
        base: u64,
        sector_count: u32,
        debug_tag: &str,
    ) -> anyhow::Result<()>;

    /// Maps a read-only, point-in-time copy of `data` at `base`. The copy
    /// does not alias the bank it was taken from.
    fn map_shadow(&mut self, base: u64, data: &[u8], debug_tag: &str) -> anyhow::Result<()>;
}

/// Memory encryption capability for confidential-execution guests.
pub trait MemoryEncrypt {
    /// Returns whether memory encryption is active for this guest.
    fn active(&self) -> bool;

    /// Locates and preserves the boot entry state from the plaintext
    /// firmware `image`.
    fn save_reset_vector(&mut self, image: &[u8]) -> anyhow::Result<()>;

    /// Encrypts `image` in place.
    fn encrypt_in_place(&mut self, image: &mut [u8]) -> anyhow::Result<()>;
}
