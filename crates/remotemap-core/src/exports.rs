//! Export directory access.

use crate::pe::{IMAGE_DIRECTORY_ENTRY_EXPORT, ImageSource, PeImage, advance};
use crate::{Error, Result};

/// Symbol half of a forwarder string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ForwarderSymbol {
    Name(String),
    Ordinal(u16),
}

impl std::fmt::Display for ForwarderSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwarderSymbol::Name(name) => f.write_str(name),
            ForwarderSymbol::Ordinal(ordinal) => write!(f, "#{}", ordinal),
        }
    }
}

/// An export that redirects to an export of another module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarder {
    /// Module file name, with `.dll` appended when the forwarder omits it.
    pub module: String,
    pub symbol: ForwarderSymbol,
}

impl Forwarder {
    /// Parse `MODULE.Symbol` or `MODULE.#ordinal`.
    pub fn parse(text: &str) -> Result<Self> {
        let (module, symbol) = text
            .rsplit_once('.')
            .filter(|(module, symbol)| !module.is_empty() && !symbol.is_empty())
            .ok_or_else(|| Error::ImageFormatInvalid(format!("malformed forwarder {:?}", text)))?;

        let module = if module.contains('.') {
            module.to_string()
        } else {
            format!("{}.dll", module)
        };

        let symbol = match symbol.strip_prefix('#') {
            Some(ordinal) => ForwarderSymbol::Ordinal(ordinal.parse().map_err(|_| {
                Error::ImageFormatInvalid(format!("bad forwarder ordinal {:?}", text))
            })?),
            None => ForwarderSymbol::Name(symbol.to_string()),
        };

        Ok(Self { module, symbol })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    Rva(u32),
    Forwarded(Forwarder),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Biased ordinal, as used in import thunks.
    pub ordinal: u16,
    pub target: ExportTarget,
}

/// Parsed `IMAGE_EXPORT_DIRECTORY`. Tables are read lazily from the image.
#[derive(Debug, Clone)]
pub struct ExportDirectory {
    pub directory_rva: u32,
    pub directory_size: u32,
    pub name_rva: u32,
    pub ordinal_base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
}

impl ExportDirectory {
    /// Read the export directory, or `None` when the image exports nothing.
    pub fn read<S: ImageSource>(image: &PeImage<S>) -> Result<Option<Self>> {
        let dir = image.headers().directory(IMAGE_DIRECTORY_ENTRY_EXPORT);
        if !dir.is_present() {
            return Ok(None);
        }
        let rva = dir.virtual_address;
        Ok(Some(Self {
            directory_rva: rva,
            directory_size: dir.size,
            name_rva: image.read_u32(advance(rva, 12)?)?,
            ordinal_base: image.read_u32(advance(rva, 16)?)?,
            number_of_functions: image.read_u32(advance(rva, 20)?)?,
            number_of_names: image.read_u32(advance(rva, 24)?)?,
            address_of_functions: image.read_u32(advance(rva, 28)?)?,
            address_of_names: image.read_u32(advance(rva, 32)?)?,
            address_of_name_ordinals: image.read_u32(advance(rva, 36)?)?,
        }))
    }

    pub fn module_name<S: ImageSource>(&self, image: &PeImage<S>) -> Result<String> {
        image.read_c_string(self.name_rva)
    }

    /// Name at `index` of the name table.
    pub fn name_at<S: ImageSource>(&self, image: &PeImage<S>, index: u32) -> Result<String> {
        let name_rva = image.read_u32(advance(self.address_of_names, index as usize * 4)?)?;
        image.read_c_string(name_rva)
    }

    /// Unbiased function index paired with name table entry `index`.
    pub fn function_index_at<S: ImageSource>(&self, image: &PeImage<S>, index: u32) -> Result<u16> {
        image.read_u16(advance(self.address_of_name_ordinals, index as usize * 2)?)
    }

    /// Export at an unbiased function index.
    pub fn by_index<S: ImageSource>(&self, image: &PeImage<S>, index: u32) -> Result<Option<Export>> {
        if index >= self.number_of_functions {
            return Ok(None);
        }
        let rva = image.read_u32(advance(self.address_of_functions, index as usize * 4)?)?;
        if rva == 0 {
            return Ok(None);
        }

        let target = if rva >= self.directory_rva && rva - self.directory_rva < self.directory_size {
            ExportTarget::Forwarded(Forwarder::parse(&image.read_c_string(rva)?)?)
        } else {
            ExportTarget::Rva(rva)
        };

        Ok(Some(Export {
            ordinal: self.ordinal_base.wrapping_add(index) as u16,
            target,
        }))
    }

    /// Export by biased ordinal.
    pub fn by_ordinal<S: ImageSource>(&self, image: &PeImage<S>, ordinal: u16) -> Result<Option<Export>> {
        match u32::from(ordinal).checked_sub(self.ordinal_base) {
            Some(index) => self.by_index(image, index),
            None => Ok(None),
        }
    }

    /// Export through the name table entry at `hint`, if that entry is `name`.
    pub fn by_hint<S: ImageSource>(
        &self,
        image: &PeImage<S>,
        hint: u16,
        name: &str,
    ) -> Result<Option<Export>> {
        let hint = u32::from(hint);
        if hint == 0 || hint >= self.number_of_names {
            return Ok(None);
        }
        if self.name_at(image, hint)? != name {
            return Ok(None);
        }
        let index = self.function_index_at(image, hint)?;
        self.by_index(image, u32::from(index))
    }

    /// Linear scan of the name table.
    pub fn by_name<S: ImageSource>(&self, image: &PeImage<S>, name: &str) -> Result<Option<Export>> {
        for i in 0..self.number_of_names {
            if self.name_at(image, i)? == name {
                let index = self.function_index_at(image, i)?;
                return self.by_index(image, u32::from(index));
            }
        }
        Ok(None)
    }

    /// Hint-assisted lookup with a linear fallback.
    pub fn find<S: ImageSource>(
        &self,
        image: &PeImage<S>,
        hint: u16,
        name: &str,
    ) -> Result<Option<Export>> {
        match self.by_hint(image, hint, name)? {
            Some(export) => Ok(Some(export)),
            None => self.by_name(image, name),
        }
    }
}
