//! Base relocations.

use crate::pe::{IMAGE_DIRECTORY_ENTRY_BASERELOC, ImageSource, PeImage, advance};
use crate::{Error, Result};

pub const IMAGE_REL_BASED_ABSOLUTE: u8 = 0;
pub const IMAGE_REL_BASED_HIGHLOW: u8 = 3;
pub const IMAGE_REL_BASED_DIR64: u8 = 10;

const BLOCK_HEADER_SIZE: u32 = 8;

/// One `IMAGE_BASE_RELOCATION` block with its decoded entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationBlock {
    pub page_rva: u32,
    /// (type, offset within the page)
    pub entries: Vec<(u8, u16)>,
}

/// Read every relocation block. An absent table yields no blocks.
pub fn relocation_blocks<S: ImageSource>(image: &PeImage<S>) -> Result<Vec<RelocationBlock>> {
    let dir = image.headers().directory(IMAGE_DIRECTORY_ENTRY_BASERELOC);
    if !dir.is_present() {
        return Ok(Vec::new());
    }

    let mut blocks = Vec::new();
    let mut cursor = dir.virtual_address;
    let end = dir.virtual_address.saturating_add(dir.size);
    while end.saturating_sub(cursor) >= BLOCK_HEADER_SIZE {
        let page_rva = image.read_u32(cursor)?;
        let size = image.read_u32(cursor + 4)?;
        if size == 0 {
            break;
        }
        if size < BLOCK_HEADER_SIZE || size > end - cursor {
            return Err(Error::ImageFormatInvalid(format!(
                "relocation block at RVA 0x{:X} has bad size 0x{:X}",
                cursor, size
            )));
        }

        let count = (size - BLOCK_HEADER_SIZE) / 2;
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count {
            let raw = image.read_u16(cursor + BLOCK_HEADER_SIZE + i * 2)?;
            entries.push(((raw >> 12) as u8, raw & 0x0FFF));
        }
        blocks.push(RelocationBlock { page_rva, entries });
        cursor += size;
    }
    Ok(blocks)
}

/// Rebases a locally held image to the address it was given in the target.
pub struct RelocationApplier;

impl RelocationApplier {
    /// Patch every absolute address in `image` for a load at `actual_base`.
    /// Returns the number of fields patched.
    pub fn apply(image: &mut PeImage<Vec<u8>>, actual_base: u64) -> Result<usize> {
        let delta = actual_base.wrapping_sub(image.headers().image_base);
        if delta == 0 {
            return Ok(0);
        }

        let blocks = relocation_blocks(image)?;
        let mut patched = 0;
        for block in &blocks {
            for &(kind, offset) in &block.entries {
                let rva = advance(block.page_rva, usize::from(offset))?;
                match kind {
                    IMAGE_REL_BASED_ABSOLUTE => continue,
                    IMAGE_REL_BASED_HIGHLOW => {
                        let value = image.read_u32(rva)?.wrapping_add(delta as u32);
                        image.write(rva, &value.to_le_bytes())?;
                    }
                    IMAGE_REL_BASED_DIR64 => {
                        let value = image.read_u64(rva)?.wrapping_add(delta);
                        image.write(rva, &value.to_le_bytes())?;
                    }
                    _ => return Err(Error::UnsupportedRelocationType { kind, rva }),
                }
                patched += 1;
            }
        }

        log::debug!(
            "Applied {} relocations for delta 0x{:X}",
            patched,
            delta
        );
        Ok(patched)
    }
}
