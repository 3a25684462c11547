//! PE header parsing over local files or remote images.
//!
//! [`PeImage`] reads through an [`ImageSource`], so the same accessors work
//! for a file read from disk ([`Layout::File`]) and for an image that already
//! sits in a target process ([`Layout::Mapped`], via [`RemoteImage`]).

use crate::arch::Architecture;
use crate::process::RemoteProcess;
use crate::{Error, Result};

pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;
pub const IMAGE_DIRECTORY_ENTRY_TLS: usize = 9;

const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D;
const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550;
const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10B;
const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20B;
const SECTION_HEADER_SIZE: usize = 40;
const MAX_SECTIONS: u16 = 96;

// =============================================================================
// Byte sources
// =============================================================================

/// Random-access bytes an image is parsed from.
pub trait ImageSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl ImageSource for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::ImageFormatInvalid(format!("offset 0x{:X} too large", offset)))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.len())
            .ok_or_else(|| {
                Error::ImageFormatInvalid(format!(
                    "read of 0x{:X} bytes at 0x{:X} past end of image",
                    buf.len(),
                    offset
                ))
            })?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }
}

impl ImageSource for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.as_slice().read_at(offset, buf)
    }
}

impl<S: ImageSource + ?Sized> ImageSource for &S {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }
}

/// An image loaded in a target process, addressed relative to its base.
pub struct RemoteImage<'a, P: RemoteProcess + ?Sized> {
    process: &'a P,
    base: u64,
}

impl<'a, P: RemoteProcess + ?Sized> RemoteImage<'a, P> {
    pub fn new(process: &'a P, base: u64) -> Self {
        Self { process, base }
    }

    pub fn base(&self) -> u64 {
        self.base
    }
}

impl<P: RemoteProcess + ?Sized> ImageSource for RemoteImage<'_, P> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.process.read(self.base + offset, buf)
    }
}

/// How RVAs map onto offsets of the underlying source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// On-disk layout; RVAs are translated through the section table.
    File,
    /// Loaded layout; an RVA is the offset.
    Mapped,
}

// =============================================================================
// Headers
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }

    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva - self.virtual_address < self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Extent of the section in memory.
    pub fn mapped_size(&self) -> u32 {
        if self.virtual_size != 0 {
            self.virtual_size
        } else {
            self.size_of_raw_data
        }
    }
}

/// Parsed DOS, file and optional headers plus the section table.
#[derive(Debug, Clone)]
pub struct NtHeaders {
    pub e_lfanew: u32,
    pub machine: u16,
    pub characteristics: u16,
    pub is_pe32_plus: bool,
    pub entry_point: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub data_directories: Vec<DataDirectory>,
    pub sections: Vec<SectionHeader>,
}

impl NtHeaders {
    pub fn architecture(&self) -> Option<Architecture> {
        Architecture::from_machine(self.machine)
    }

    pub fn pointer_size(&self) -> usize {
        if self.is_pe32_plus { 8 } else { 4 }
    }

    pub fn directory(&self, index: usize) -> DataDirectory {
        self.data_directories.get(index).copied().unwrap_or_default()
    }
}

// =============================================================================
// PeImage
// =============================================================================

/// A parsed PE image over some byte source.
pub struct PeImage<S> {
    source: S,
    layout: Layout,
    headers: NtHeaders,
}

impl<S: ImageSource> PeImage<S> {
    pub fn parse(source: S, layout: Layout) -> Result<Self> {
        let headers = parse_headers(&source)?;
        Ok(Self {
            source,
            layout,
            headers,
        })
    }

    pub fn headers(&self) -> &NtHeaders {
        &self.headers
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Translate an RVA into an offset of the source.
    pub fn rva_to_offset(&self, rva: u32) -> Result<u64> {
        if self.layout == Layout::Mapped || rva < self.headers.size_of_headers {
            return Ok(u64::from(rva));
        }
        self.headers
            .sections
            .iter()
            .find(|s| {
                rva >= s.virtual_address
                    && rva - s.virtual_address < s.mapped_size().max(s.size_of_raw_data)
            })
            .filter(|s| rva - s.virtual_address < s.size_of_raw_data)
            .map(|s| u64::from(rva - s.virtual_address) + u64::from(s.pointer_to_raw_data))
            .ok_or_else(|| {
                Error::ImageFormatInvalid(format!("RVA 0x{:X} has no file backing", rva))
            })
    }

    pub fn read(&self, rva: u32, buf: &mut [u8]) -> Result<()> {
        let offset = self.rva_to_offset(rva)?;
        self.source.read_at(offset, buf)
    }

    pub fn read_u16(&self, rva: u32) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(rva, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, rva: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(rva, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, rva: u32) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(rva, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a pointer-sized value (4 bytes for PE32, 8 for PE32+).
    pub fn read_pointer(&self, rva: u32) -> Result<u64> {
        if self.headers.is_pe32_plus {
            self.read_u64(rva)
        } else {
            self.read_u32(rva).map(u64::from)
        }
    }

    /// Read a NUL-terminated ANSI string.
    pub fn read_c_string(&self, rva: u32) -> Result<String> {
        const MAX_LEN: u32 = 4096;
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        while (out.len() as u32) < MAX_LEN {
            let cursor = advance(rva, out.len())?;
            let len = chunk.len().min((0x1000 - (cursor & 0xFFF)) as usize);
            self.read(cursor, &mut chunk[..len])
                .or_else(|_| self.read_short(cursor, &mut chunk[..len]))?;
            if let Some(end) = chunk[..len].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..end]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&chunk[..len]);
        }
        Err(Error::ImageFormatInvalid(format!(
            "unterminated string at RVA 0x{:X}",
            rva
        )))
    }

    /// Byte-wise fallback for strings that end right before the end of a source.
    fn read_short(&self, rva: u32, buf: &mut [u8]) -> Result<()> {
        for (i, byte) in buf.iter_mut().enumerate() {
            let mut one = [0u8; 1];
            self.read(advance(rva, i)?, &mut one)?;
            *byte = one[0];
            if one[0] == 0 {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// `rva + delta`, rejecting results past the 32-bit RVA space.
pub fn advance(rva: u32, delta: usize) -> Result<u32> {
    u32::try_from(delta)
        .ok()
        .and_then(|delta| rva.checked_add(delta))
        .ok_or_else(|| {
            Error::ImageFormatInvalid(format!("RVA 0x{:X} + 0x{:X} overflows", rva, delta))
        })
}

impl PeImage<Vec<u8>> {
    /// Bytes of a locally held image.
    pub fn bytes(&self) -> &[u8] {
        &self.source
    }

    /// Overwrite bytes at an RVA of a locally held image.
    pub fn write(&mut self, rva: u32, data: &[u8]) -> Result<()> {
        let offset = self.rva_to_offset(rva)? as usize;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.source.len())
            .ok_or_else(|| {
                Error::ImageFormatInvalid(format!("write at RVA 0x{:X} past end of image", rva))
            })?;
        self.source[offset..end].copy_from_slice(data);
        Ok(())
    }
}

fn read_u16_at<S: ImageSource + ?Sized>(source: &S, offset: u64) -> Result<u16> {
    let mut buf = [0u8; 2];
    source.read_at(offset, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32_at<S: ImageSource + ?Sized>(source: &S, offset: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    source.read_at(offset, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn parse_headers<S: ImageSource + ?Sized>(source: &S) -> Result<NtHeaders> {
    let invalid = |msg: &str| Error::ImageFormatInvalid(msg.to_string());

    let mut dos = [0u8; 64];
    source
        .read_at(0, &mut dos)
        .map_err(|_| invalid("image too small for DOS header"))?;
    if u16::from_le_bytes([dos[0], dos[1]]) != IMAGE_DOS_SIGNATURE {
        return Err(invalid("missing MZ signature"));
    }

    let e_lfanew = u32::from_le_bytes([dos[0x3C], dos[0x3D], dos[0x3E], dos[0x3F]]);
    if !(64..=0x1000).contains(&e_lfanew) {
        return Err(invalid("e_lfanew out of range"));
    }
    let nt = u64::from(e_lfanew);

    if read_u32_at(source, nt)? != IMAGE_NT_SIGNATURE {
        return Err(invalid("missing PE signature"));
    }

    let file_header = nt + 4;
    let machine = read_u16_at(source, file_header)?;
    let number_of_sections = read_u16_at(source, file_header + 2)?;
    let size_of_optional_header = read_u16_at(source, file_header + 16)?;
    let characteristics = read_u16_at(source, file_header + 18)?;
    if number_of_sections > MAX_SECTIONS {
        return Err(invalid("too many sections"));
    }

    let optional = file_header + 20;
    let magic = read_u16_at(source, optional)?;
    let is_pe32_plus = match magic {
        IMAGE_NT_OPTIONAL_HDR64_MAGIC => true,
        IMAGE_NT_OPTIONAL_HDR32_MAGIC => false,
        _ => return Err(invalid("unknown optional header magic")),
    };

    let entry_point = read_u32_at(source, optional + 16)?;
    let image_base = if is_pe32_plus {
        let mut buf = [0u8; 8];
        source.read_at(optional + 24, &mut buf)?;
        u64::from_le_bytes(buf)
    } else {
        u64::from(read_u32_at(source, optional + 28)?)
    };
    let section_alignment = read_u32_at(source, optional + 32)?;
    let file_alignment = read_u32_at(source, optional + 36)?;
    let size_of_image = read_u32_at(source, optional + 56)?;
    let size_of_headers = read_u32_at(source, optional + 60)?;

    let (count_offset, directories_offset) = if is_pe32_plus { (108, 112) } else { (92, 96) };
    let directory_count = read_u32_at(source, optional + count_offset)?.min(16);
    let mut data_directories = Vec::with_capacity(directory_count as usize);
    for i in 0..u64::from(directory_count) {
        let offset = optional + directories_offset + i * 8;
        data_directories.push(DataDirectory {
            virtual_address: read_u32_at(source, offset)?,
            size: read_u32_at(source, offset + 4)?,
        });
    }

    let table = optional + u64::from(size_of_optional_header);
    let mut sections = Vec::with_capacity(number_of_sections as usize);
    for i in 0..u64::from(number_of_sections) {
        let mut raw = [0u8; SECTION_HEADER_SIZE];
        source.read_at(table + i * SECTION_HEADER_SIZE as u64, &mut raw)?;
        let field = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let name_len = raw[..8].iter().position(|&b| b == 0).unwrap_or(8);
        sections.push(SectionHeader {
            name: String::from_utf8_lossy(&raw[..name_len]).into_owned(),
            virtual_size: field(8),
            virtual_address: field(12),
            size_of_raw_data: field(16),
            pointer_to_raw_data: field(20),
            characteristics: field(36),
        });
    }

    Ok(NtHeaders {
        e_lfanew,
        machine,
        characteristics,
        is_pe32_plus,
        entry_point,
        image_base,
        section_alignment,
        file_alignment,
        size_of_image,
        size_of_headers,
        data_directories,
        sections,
    })
}
