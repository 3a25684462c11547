//! Import descriptor and thunk parsing.

use crate::pe::{IMAGE_DIRECTORY_ENTRY_IMPORT, ImageSource, PeImage, advance};
use crate::Result;

const IMPORT_DESCRIPTOR_SIZE: u32 = 20;
const MAX_THUNKS: u32 = 0x10000;

/// One `IMAGE_IMPORT_DESCRIPTOR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDescriptor {
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name_rva: u32,
    pub first_thunk: u32,
    pub module_name: String,
}

/// How a single import is identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportThunk {
    Ordinal(u16),
    Name { hint: u16, name: String },
}

/// An import thunk together with the IAT slot it resolves into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub slot_rva: u32,
    pub thunk: ImportThunk,
}

/// All import descriptors, up to the all-zero terminator.
pub fn import_descriptors<S: ImageSource>(image: &PeImage<S>) -> Result<Vec<ImportDescriptor>> {
    let dir = image.headers().directory(IMAGE_DIRECTORY_ENTRY_IMPORT);
    if !dir.is_present() {
        return Ok(Vec::new());
    }

    let mut descriptors = Vec::new();
    let mut rva = dir.virtual_address;
    loop {
        let original_first_thunk = image.read_u32(rva)?;
        let name_rva = image.read_u32(advance(rva, 12)?)?;
        let first_thunk = image.read_u32(advance(rva, 16)?)?;
        if name_rva == 0 || (original_first_thunk == 0 && first_thunk == 0) {
            break;
        }

        descriptors.push(ImportDescriptor {
            original_first_thunk,
            time_date_stamp: image.read_u32(advance(rva, 4)?)?,
            forwarder_chain: image.read_u32(advance(rva, 8)?)?,
            name_rva,
            first_thunk,
            module_name: image.read_c_string(name_rva)?,
        });
        rva = advance(rva, IMPORT_DESCRIPTOR_SIZE as usize)?;
    }
    Ok(descriptors)
}

/// Thunks of a descriptor, read from the lookup table (or the IAT when the
/// image has no separate lookup table).
pub fn import_entries<S: ImageSource>(
    image: &PeImage<S>,
    descriptor: &ImportDescriptor,
) -> Result<Vec<ImportEntry>> {
    let pointer_size = image.headers().pointer_size() as u32;
    let ordinal_flag: u64 = if image.headers().is_pe32_plus {
        1 << 63
    } else {
        1 << 31
    };
    let lookup = if descriptor.original_first_thunk != 0 {
        descriptor.original_first_thunk
    } else {
        descriptor.first_thunk
    };

    let mut entries = Vec::new();
    for i in 0..MAX_THUNKS {
        let value = image.read_pointer(advance(lookup, (i * pointer_size) as usize)?)?;
        if value == 0 {
            break;
        }

        let thunk = if value & ordinal_flag != 0 {
            ImportThunk::Ordinal(value as u16)
        } else {
            let hint_rva = value as u32;
            ImportThunk::Name {
                hint: image.read_u16(hint_rva)?,
                name: image.read_c_string(advance(hint_rva, 2)?)?,
            }
        };

        entries.push(ImportEntry {
            slot_rva: advance(descriptor.first_thunk, (i * pointer_size) as usize)?,
            thunk,
        });
    }
    Ok(entries)
}
