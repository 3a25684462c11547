//! Copying sections into the target and protecting them.

use crate::pe::{ImageSource, PeImage, SectionHeader};
use crate::process::{Protection, RemoteProcess};
use crate::Result;

const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// Indexed by `characteristics >> 28`: shared, execute, read, write.
const SECTION_PROTECTION: [Protection; 16] = [
    Protection::NoAccess,
    Protection::NoAccess,
    Protection::Execute,
    Protection::Execute,
    Protection::ReadOnly,
    Protection::ReadOnly,
    Protection::ExecuteRead,
    Protection::ExecuteRead,
    Protection::ReadWrite,
    Protection::ReadWrite,
    Protection::ExecuteReadWrite,
    Protection::ExecuteReadWrite,
    Protection::ReadWrite,
    Protection::ReadWrite,
    Protection::ExecuteReadWrite,
    Protection::ExecuteReadWrite,
];

/// Page protection the OS loader would give a section.
pub fn section_protection(characteristics: u32) -> Protection {
    let mut characteristics = characteristics;
    let access = IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;
    if characteristics & access == 0 {
        if characteristics & IMAGE_SCN_CNT_CODE != 0 {
            characteristics |= IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ;
        }
        if characteristics & (IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_CNT_UNINITIALIZED_DATA)
            != 0
        {
            characteristics |= IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;
        }
    }
    SECTION_PROTECTION[(characteristics >> 28) as usize]
}

/// Writes section contents of a file-layout image into remote memory.
pub struct SectionMapper<'a, P: RemoteProcess + ?Sized> {
    process: &'a P,
    remote_base: u64,
}

impl<'a, P: RemoteProcess + ?Sized> SectionMapper<'a, P> {
    pub fn new(process: &'a P, remote_base: u64) -> Self {
        Self {
            process,
            remote_base,
        }
    }

    pub fn map_sections<S: ImageSource>(&self, image: &PeImage<S>) -> Result<()> {
        let size_of_image = image.headers().size_of_image;
        for section in &image.headers().sections {
            self.copy_section(image, section, size_of_image)?;
            self.protect_section(section)?;
        }
        Ok(())
    }

    fn copy_section<S: ImageSource>(
        &self,
        image: &PeImage<S>,
        section: &SectionHeader,
        size_of_image: u32,
    ) -> Result<()> {
        if section.size_of_raw_data == 0 {
            log::debug!("Section {} has no raw data", section.name);
            return Ok(());
        }

        let room = size_of_image.saturating_sub(section.virtual_address);
        let len = section
            .size_of_raw_data
            .min(section.mapped_size())
            .min(room) as usize;
        let mut data = vec![0u8; len];
        image
            .source()
            .read_at(u64::from(section.pointer_to_raw_data), &mut data)?;

        let address = self.remote_base + u64::from(section.virtual_address);
        log::debug!(
            "Writing section {} (0x{:X} bytes) to 0x{:X}",
            section.name,
            len,
            address
        );
        self.process.write(address, &data)
    }

    fn protect_section(&self, section: &SectionHeader) -> Result<()> {
        let size = section.mapped_size() as usize;
        if size == 0 {
            return Ok(());
        }

        let address = self.remote_base + u64::from(section.virtual_address);
        let protection = section_protection(section.characteristics);
        self.process.protect(address, size, protection)?;
        Ok(())
    }
}
