#![forbid(unsafe_code)]

//! Checksums for pointer slots and whole-page records.

/// Incremental checksum over a byte stream.
pub trait Checksum {
    /// Clears all accumulated state.
    fn reset(&mut self);
    /// Feeds bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of a page-sized record, salted with the page id so a record copied
/// to the wrong page never validates.
pub fn page_crc32(page_no: u64, salt: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// 16-bit checksum of one generation-safe pointer slot.
pub fn gsp_checksum(generation: u64, pointer: u64) -> u16 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&generation.to_be_bytes());
    hasher.update(&pointer.to_be_bytes()[2..]);
    let crc = hasher.finalize();
    ((crc >> 16) ^ (crc & 0xffff)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_trait_roundtrip() {
        let mut c = Crc32Fast::default();
        c.update(b"hello");
        let first = c.finalize();
        c.update(b" world");
        let second = c.finalize();
        assert_ne!(first, second);
        c.reset();
        c.update(b"hello world");
        assert_eq!(c.finalize(), second);
    }

    #[test]
    fn page_crc32_changes_with_components() {
        let payload = vec![0u8; 16];
        let crc_a = page_crc32(1, 2, &payload);
        assert_eq!(crc_a, page_crc32(1, 2, &payload));

        let mut different = payload.clone();
        different[0] = 1;
        assert_ne!(crc_a, page_crc32(1, 2, &different));
        assert_ne!(crc_a, page_crc32(3, 2, &payload));
    }

    #[test]
    fn gsp_checksum_depends_on_both_fields() {
        let base = gsp_checksum(7, 42);
        assert_eq!(base, gsp_checksum(7, 42));
        assert_ne!(base, gsp_checksum(8, 42));
        assert_ne!(base, gsp_checksum(7, 43));
    }
}
