//! Page 0: what the file was created with.

use std::ops::Range;

use super::layout::{node_format, Layout};
use super::node::FormatKind;
use crate::primitives::io::FileIo;
use crate::types::{page_crc32, PageId, Result, TreeError};

/// Magic bytes at the start of every tree file.
pub const MAGIC: [u8; 8] = *b"GENBTREE";
/// On-disk format revision of the tree file itself.
pub const FORMAT_VERSION: u32 = 1;

const META_MAGIC: Range<usize> = 0..8;
const META_FORMAT_VERSION: Range<usize> = 8..12;
const META_PAGE_SIZE: Range<usize> = 12..16;
const META_LAYOUT_ID: Range<usize> = 16..20;
const META_LAYOUT_MAJOR: Range<usize> = 20..24;
const META_LAYOUT_MINOR: Range<usize> = 24..28;
const META_NODE_FORMAT: usize = 28;
const META_MULTI_ROOT: usize = 29;
const META_RESERVED: Range<usize> = 30..32;
const META_CRC32: Range<usize> = 32..36;
/// Bytes of page 0 in use.
pub const META_LENGTH: usize = 36;

/// Contents of the meta page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TreeMeta {
    /// Page size the file was created with.
    pub page_size: u32,
    /// [`Layout::IDENTIFIER`] of the data layout.
    pub layout_id: u32,
    /// [`Layout::MAJOR_VERSION`].
    pub layout_major: u32,
    /// [`Layout::MINOR_VERSION`].
    pub layout_minor: u32,
    /// Node format picked from the layout's sizing.
    pub node_format: FormatKind,
    /// Whether the file holds a root-mapping tree above its data trees.
    pub multi_root: bool,
}

impl TreeMeta {
    /// Meta describing a tree of layout `L`.
    pub fn for_layout<L: Layout>(page_size: usize, multi_root: bool) -> Result<Self> {
        Ok(Self {
            page_size: u32::try_from(page_size)
                .map_err(|_| TreeError::InvalidArgument("page size out of range"))?,
            layout_id: L::IDENTIFIER,
            layout_major: L::MAJOR_VERSION,
            layout_minor: L::MINOR_VERSION,
            node_format: node_format::<L>(page_size)?.kind(),
            multi_root,
        })
    }

    /// Encodes into the start of `buf`, zeroing the rest.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < META_LENGTH {
            return Err(TreeError::InvalidArgument("meta buffer too small"));
        }
        buf.fill(0);
        buf[META_MAGIC].copy_from_slice(&MAGIC);
        buf[META_FORMAT_VERSION].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        buf[META_PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        buf[META_LAYOUT_ID].copy_from_slice(&self.layout_id.to_be_bytes());
        buf[META_LAYOUT_MAJOR].copy_from_slice(&self.layout_major.to_be_bytes());
        buf[META_LAYOUT_MINOR].copy_from_slice(&self.layout_minor.to_be_bytes());
        buf[META_NODE_FORMAT] = self.node_format as u8;
        buf[META_MULTI_ROOT] = u8::from(self.multi_root);
        let crc = page_crc32(PageId(0).0, u64::from(FORMAT_VERSION), &buf[..META_CRC32.start]);
        buf[META_CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Decodes and verifies the meta page.
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_LENGTH {
            return Err(TreeError::Corruption("meta page truncated"));
        }
        if buf[META_MAGIC] != MAGIC {
            return Err(TreeError::MetadataMismatch("not a tree file".into()));
        }
        let version = be_u32(&buf[META_FORMAT_VERSION]);
        if version != FORMAT_VERSION {
            return Err(TreeError::MetadataMismatch(format!(
                "file format version {version}, expected {FORMAT_VERSION}"
            )));
        }
        let crc = page_crc32(PageId(0).0, u64::from(version), &buf[..META_CRC32.start]);
        if crc != be_u32(&buf[META_CRC32]) {
            return Err(TreeError::Corruption("meta page crc mismatch"));
        }
        if buf[META_RESERVED].iter().any(|b| *b != 0) {
            return Err(TreeError::Corruption("meta reserved field non-zero"));
        }
        Ok(Self {
            page_size: be_u32(&buf[META_PAGE_SIZE]),
            layout_id: be_u32(&buf[META_LAYOUT_ID]),
            layout_major: be_u32(&buf[META_LAYOUT_MAJOR]),
            layout_minor: be_u32(&buf[META_LAYOUT_MINOR]),
            node_format: FormatKind::from_u8(buf[META_NODE_FORMAT])
                .ok_or(TreeError::Corruption("unknown node format in meta page"))?,
            multi_root: buf[META_MULTI_ROOT] != 0,
        })
    }

    /// Reads the meta page straight from the file, independent of page size.
    pub fn load(io: &dyn FileIo) -> Result<Self> {
        let mut buf = [0u8; META_LENGTH];
        io.read_at(0, &mut buf)?;
        Self::read(&buf)
    }

    /// Compares page size and layout identity against `L` without sizing
    /// its nodes, so a layout that cannot fit the stored page size still
    /// reports a mismatch.
    pub fn verify_identity<L: Layout>(&self, page_size: usize) -> Result<()> {
        let page_size = u32::try_from(page_size)
            .map_err(|_| TreeError::InvalidArgument("page size out of range"))?;
        self.compare_identity(page_size, L::IDENTIFIER, (L::MAJOR_VERSION, L::MINOR_VERSION))
    }

    fn compare_identity(&self, page_size: u32, layout_id: u32, version: (u32, u32)) -> Result<()> {
        if self.page_size != page_size {
            return mismatch("page size", self.page_size.to_string(), page_size.to_string());
        }
        if self.layout_id != layout_id {
            return mismatch(
                "layout identifier",
                format!("{:#x}", self.layout_id),
                format!("{layout_id:#x}"),
            );
        }
        if (self.layout_major, self.layout_minor) != version {
            return mismatch(
                "layout version",
                format!("{}.{}", self.layout_major, self.layout_minor),
                format!("{}.{}", version.0, version.1),
            );
        }
        Ok(())
    }

    /// Fails with [`TreeError::MetadataMismatch`] naming the first field
    /// that differs from `expected`.
    pub fn verify(&self, expected: &TreeMeta) -> Result<()> {
        self.compare_identity(
            expected.page_size,
            expected.layout_id,
            (expected.layout_major, expected.layout_minor),
        )?;
        if self.node_format != expected.node_format {
            return mismatch(
                "node format",
                format!("{:?}", self.node_format),
                format!("{:?}", expected.node_format),
            );
        }
        if self.multi_root != expected.multi_root {
            return mismatch(
                "multi-root flag",
                self.multi_root.to_string(),
                expected.multi_root.to_string(),
            );
        }
        Ok(())
    }
}

fn mismatch(what: &str, found: String, wanted: String) -> Result<()> {
    Err(TreeError::MetadataMismatch(format!(
        "{what} is {found} on disk but {wanted} was requested"
    )))
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    u32::from_be_bytes(arr)
}
