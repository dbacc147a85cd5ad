//! Key and value encoding contract.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::node::{DynamicSizeNode, FixedSizeNode, NodeFormat};
use crate::types::{Result, TreeError};

/// Describes how typed keys and values are stored in a tree.
///
/// Encoded keys are ordered by [`Layout::compare_encoded`]. When both
/// [`Layout::KEY_SIZE`] and [`Layout::VALUE_SIZE`] are set every encoding
/// must have exactly that length and nodes use the packed fixed-size format;
/// otherwise nodes use the dynamic format and large values are offloaded.
pub trait Layout: Send + Sync + 'static {
    /// Key type.
    type Key: Clone + fmt::Debug + Send + Sync;
    /// Value type.
    type Value: Clone + fmt::Debug + Send + Sync;

    /// Identifier persisted in the meta page.
    const IDENTIFIER: u32;
    /// Incompatible format revision.
    const MAJOR_VERSION: u32;
    /// Compatible format revision.
    const MINOR_VERSION: u32;
    /// Encoded key length, if fixed.
    const KEY_SIZE: Option<usize>;
    /// Encoded value length, if fixed.
    const VALUE_SIZE: Option<usize>;

    /// Encode `key` into `out` using an order-preserving representation.
    fn encode_key(key: &Self::Key, out: &mut Vec<u8>);
    /// Decode a key from its encoded representation.
    fn decode_key(bytes: &[u8]) -> Result<Self::Key>;
    /// Encode `value` into `out`.
    fn encode_value(value: &Self::Value, out: &mut Vec<u8>);
    /// Decode a value from `bytes`.
    fn decode_value(bytes: &[u8]) -> Result<Self::Value>;

    /// Compare two encoded keys.
    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Node format for `L` at `page_size`.
pub fn node_format<L: Layout>(page_size: usize) -> Result<Arc<dyn NodeFormat>> {
    Ok(match (L::KEY_SIZE, L::VALUE_SIZE) {
        (Some(key_size), Some(value_size)) => {
            Arc::new(FixedSizeNode::new(page_size, key_size, value_size)?)
        }
        _ => Arc::new(DynamicSizeNode::new(page_size)?),
    })
}

fn decode_u64(bytes: &[u8], what: &'static str) -> Result<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| TreeError::Corruption(what))?;
    Ok(u64::from_be_bytes(arr))
}

/// `u64` keys and values, both stored big endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Layout;

impl Layout for U64Layout {
    type Key = u64;
    type Value = u64;

    const IDENTIFIER: u32 = 0x7536_3475;
    const MAJOR_VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 0;
    const KEY_SIZE: Option<usize> = Some(8);
    const VALUE_SIZE: Option<usize> = Some(8);

    fn encode_key(key: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn decode_key(bytes: &[u8]) -> Result<u64> {
        decode_u64(bytes, "u64 key length mismatch")
    }

    fn encode_value(value: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode_value(bytes: &[u8]) -> Result<u64> {
        decode_u64(bytes, "u64 value length mismatch")
    }
}

/// Arbitrary byte strings ordered lexicographically.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesLayout;

impl Layout for BytesLayout {
    type Key = Vec<u8>;
    type Value = Vec<u8>;

    const IDENTIFIER: u32 = 0x6279_7465;
    const MAJOR_VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 0;
    const KEY_SIZE: Option<usize> = None;
    const VALUE_SIZE: Option<usize> = None;

    fn encode_key(key: &Vec<u8>, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn decode_key(bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn encode_value(value: &Vec<u8>, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn decode_value(bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Layout of the root-mapping tree of a multi-root file: `u64` root keys
/// mapped to a root id and its generation.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RootMappingLayout;

impl Layout for RootMappingLayout {
    type Key = u64;
    type Value = (u64, u64);

    const IDENTIFIER: u32 = 0x726f_6f74;
    const MAJOR_VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 0;
    const KEY_SIZE: Option<usize> = Some(8);
    const VALUE_SIZE: Option<usize> = Some(16);

    fn encode_key(key: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn decode_key(bytes: &[u8]) -> Result<u64> {
        decode_u64(bytes, "root key length mismatch")
    }

    fn encode_value(value: &(u64, u64), out: &mut Vec<u8>) {
        out.extend_from_slice(&value.0.to_be_bytes());
        out.extend_from_slice(&value.1.to_be_bytes());
    }

    fn decode_value(bytes: &[u8]) -> Result<(u64, u64)> {
        if bytes.len() != 16 {
            return Err(TreeError::Corruption("root mapping value length mismatch"));
        }
        Ok((
            decode_u64(&bytes[..8], "root id")?,
            decode_u64(&bytes[8..], "root generation")?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::node::FormatKind;

    #[test]
    fn big_endian_keys_sort_numerically() {
        let (mut a, mut b) = (Vec::new(), Vec::new());
        U64Layout::encode_key(&255, &mut a);
        U64Layout::encode_key(&256, &mut b);
        assert_eq!(U64Layout::compare_encoded(&a, &b), Ordering::Less);
        assert_eq!(U64Layout::decode_key(&b).ok(), Some(256));
        assert!(U64Layout::decode_key(&b[..4]).is_err());
    }

    #[test]
    fn sizing_mode_picks_node_format() -> Result<()> {
        assert_eq!(node_format::<U64Layout>(512)?.kind(), FormatKind::Fixed);
        assert_eq!(node_format::<BytesLayout>(512)?.kind(), FormatKind::Dynamic);
        let mut value = Vec::new();
        RootMappingLayout::encode_value(&(7, 9), &mut value);
        assert_eq!(RootMappingLayout::decode_value(&value)?, (7, 9));
        Ok(())
    }
}
