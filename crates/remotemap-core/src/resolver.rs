//! Import resolution and forwarder chains.
//!
//! The resolver fills the IAT of an image that already sits in the target.
//! Dependencies it has not seen yet are requested from a [`ModuleProvider`],
//! which is how the mapper recurses into itself without the resolver knowing
//! about it.

use std::collections::HashSet;
use std::path::Path;

use crate::apiset::ApiSetTable;
use crate::exports::{Export, ExportDirectory, ExportTarget, ForwarderSymbol};
use crate::imports::{ImportThunk, import_descriptors, import_entries};
use crate::pe::{ImageSource, Layout, PeImage, RemoteImage};
use crate::process::{RemoteProcess, write_protected};
use crate::{Error, Result};

/// Maximum number of forwarder hops followed for a single export.
pub const MAX_FORWARDER_DEPTH: usize = 32;

/// Lowest-level system module. It is always already loaded and never mapped.
pub const SYSTEM_MODULE: &str = "ntdll.dll";

/// Whether `name` refers to [`SYSTEM_MODULE`].
pub fn is_system_module(name: &str) -> bool {
    file_name(name).eq_ignore_ascii_case(SYSTEM_MODULE)
}

fn file_name(name: &str) -> &str {
    name.rsplit(['\\', '/']).next().unwrap_or(name)
}

/// Source of module bases for the resolver.
pub trait ModuleProvider {
    /// Base of a module already mapped in this session.
    fn registered_base(&self, module: &str) -> Option<u64>;

    /// Map `module` on behalf of `importer` and return its base.
    fn map_dependency(&mut self, module: &str, importer: &Path) -> Result<u64>;

    /// Whether the importer named in an API-set exception is `importer`.
    fn same_module(&self, name: &str, importer: &Path) -> bool {
        importer
            .file_name()
            .map(|f| f.to_string_lossy().eq_ignore_ascii_case(file_name(name)))
            .unwrap_or(false)
    }
}

/// Resolves imports and exports of images mapped in a target process.
pub struct ImportResolver<'a, P: RemoteProcess + ?Sized> {
    process: &'a P,
    api_sets: &'a ApiSetTable,
    provider: &'a mut dyn ModuleProvider,
}

impl<'a, P: RemoteProcess + ?Sized> ImportResolver<'a, P> {
    pub fn new(
        process: &'a P,
        api_sets: &'a ApiSetTable,
        provider: &'a mut dyn ModuleProvider,
    ) -> Self {
        Self {
            process,
            api_sets,
            provider,
        }
    }

    /// Fill every IAT slot of the image at `base`. `importer` is the image's
    /// own path. Returns the number of slots written.
    pub fn resolve_imports(&mut self, base: u64, importer: &Path) -> Result<usize> {
        let process = self.process;
        let image = PeImage::parse(RemoteImage::new(process, base), Layout::Mapped)?;
        let pointer_size = image.headers().pointer_size();

        let mut written = 0;
        for descriptor in import_descriptors(&image)? {
            let module = self.redirect(&descriptor.module_name, Some(importer));
            let module_base = self.dependency_base(&module, importer)?;
            log::debug!(
                "Resolving imports from {} (0x{:X})",
                module,
                module_base
            );

            let dependency = PeImage::parse(RemoteImage::new(process, module_base), Layout::Mapped)?;
            let exports = ExportDirectory::read(&dependency)?;

            for entry in import_entries(&image, &descriptor)? {
                let (hint, symbol) = match entry.thunk {
                    ImportThunk::Ordinal(ordinal) => (0, ForwarderSymbol::Ordinal(ordinal)),
                    ImportThunk::Name { hint, name } => (hint, ForwarderSymbol::Name(name)),
                };
                let export = find_export(&dependency, exports.as_ref(), &module, hint, &symbol)?;
                let address = self.follow(&module, module_base, export)?;

                let slot = base + u64::from(entry.slot_rva);
                write_protected(process, slot, &address.to_le_bytes()[..pointer_size])?;
                written += 1;
            }
        }

        log::debug!("Wrote {} IAT slots for {}", written, importer.display());
        Ok(written)
    }

    /// Address of `symbol` exported by the module at `base`, following forwarders.
    pub fn resolve_symbol(&mut self, module: &str, base: u64, symbol: &ForwarderSymbol) -> Result<u64> {
        let image = PeImage::parse(RemoteImage::new(self.process, base), Layout::Mapped)?;
        let exports = ExportDirectory::read(&image)?;
        let export = find_export(&image, exports.as_ref(), module, 0, symbol)?;
        self.follow(module, base, export)
    }

    /// Final address of an export found in `module`, mapped at `base`.
    pub fn follow(&mut self, module: &str, base: u64, export: Export) -> Result<u64> {
        let mut visited = HashSet::new();
        let mut module = module.to_string();
        let mut base = base;
        let mut export = export;

        loop {
            let forwarder = match export.target {
                ExportTarget::Rva(rva) => return Ok(base + u64::from(rva)),
                ExportTarget::Forwarded(forwarder) => forwarder,
            };

            let target = self.redirect(&forwarder.module, Some(Path::new(&module)));
            let key = (target.to_lowercase(), forwarder.symbol.clone());
            if visited.contains(&key) {
                return Err(Error::ForwarderCycle {
                    module: target,
                    symbol: forwarder.symbol.to_string(),
                });
            }
            if visited.len() == MAX_FORWARDER_DEPTH {
                return Err(Error::ForwarderDepthExceeded {
                    module: target,
                    symbol: forwarder.symbol.to_string(),
                });
            }
            visited.insert(key);

            let target_base = self.forwarder_base(&target, &forwarder.module, &forwarder.symbol)?;
            let image = PeImage::parse(RemoteImage::new(self.process, target_base), Layout::Mapped)?;
            let exports = ExportDirectory::read(&image)?;
            export = find_export(&image, exports.as_ref(), &target, 0, &forwarder.symbol)?;
            log::debug!(
                "{} forwards to {}!{}",
                module,
                target,
                forwarder.symbol
            );

            module = target;
            base = target_base;
        }
    }

    /// Real module behind a possibly virtual module name.
    fn redirect(&self, name: &str, importer: Option<&Path>) -> String {
        let provider = &*self.provider;
        match self
            .api_sets
            .resolve(name, importer, |exception, path| provider.same_module(exception, path))
        {
            Some(host) => {
                log::debug!("API set {} -> {}", name, host);
                host
            }
            None => name.to_string(),
        }
    }

    fn dependency_base(&mut self, module: &str, importer: &Path) -> Result<u64> {
        if let Some(base) = self.provider.registered_base(module) {
            return Ok(base);
        }
        if let Some(base) = self.loaded_base(module)? {
            return Ok(base);
        }
        if is_system_module(module) {
            return Err(Error::SystemModuleNotFound(module.to_string()));
        }
        self.provider.map_dependency(module, importer)
    }

    fn forwarder_base(&self, module: &str, written: &str, symbol: &ForwarderSymbol) -> Result<u64> {
        if let Some(base) = self.provider.registered_base(module) {
            return Ok(base);
        }
        if let Some(base) = self.loaded_base(module)? {
            return Ok(base);
        }
        if is_system_module(module) {
            return Err(Error::SystemModuleNotFound(module.to_string()));
        }
        Err(Error::UnknownForwarderModule {
            module: module.to_string(),
            forwarder: format!("{}.{}", written.trim_end_matches(".dll"), symbol),
        })
    }

    /// Base of a module the target's own loader already loaded.
    fn loaded_base(&self, module: &str) -> Result<Option<u64>> {
        let base = self.process.find_module(file_name(module))?;
        if let Some(base) = base {
            log::debug!("{} is loaded in the target at 0x{:X}", module, base);
        }
        Ok(base)
    }
}

fn find_export<S: ImageSource>(
    image: &PeImage<S>,
    exports: Option<&ExportDirectory>,
    module: &str,
    hint: u16,
    symbol: &ForwarderSymbol,
) -> Result<Export> {
    let found = match (exports, symbol) {
        (None, _) => None,
        (Some(dir), ForwarderSymbol::Ordinal(ordinal)) => dir.by_ordinal(image, *ordinal)?,
        (Some(dir), ForwarderSymbol::Name(name)) => dir.find(image, hint, name)?,
    };
    found.ok_or_else(|| Error::ExportNotFound {
        module: module.to_string(),
        export: symbol.to_string(),
    })
}
