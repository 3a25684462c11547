//! Manual mapping of PE modules into a target process.
//!
//! A module is read from disk, rebased, copied section by section and
//! linked against its dependencies without involving the target's loader.
//! Dependencies are mapped the same way, recursively, except for the system
//! module, which is always taken from the target.
//!
//! Nothing is rolled back when a step fails: memory allocated and modules
//! registered up to that point stay in the target.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;

use crate::apiset::ApiSetTable;
use crate::arch::CallingConvention;
use crate::call::{RemoteCallEngine, RemoteCallResult};
use crate::exports::ForwarderSymbol;
use crate::path::PathResolver;
use crate::pe::{ImageSource, Layout, PeImage};
use crate::process::{Protection, RemoteProcess};
use crate::registry::ModuleRegistry;
use crate::relocs::RelocationApplier;
use crate::resolver::{ImportResolver, ModuleProvider, SYSTEM_MODULE, is_system_module};
use crate::sections::SectionMapper;
use crate::tls::tls_callbacks;
use crate::{Error, Result};

/// `fdwReason` passed to TLS callbacks and `DllMain`.
pub const DLL_PROCESS_ATTACH: u64 = 1;

bitflags! {
    /// Options for [`ManualMapper::map_module`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        /// Search the loader directories for relative module paths.
        const PATH_RESOLUTION = 1 << 0;
    }
}

/// Outcome of a successful mapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MappedModule {
    /// Remote base of the module.
    pub base: u64,
    /// Result of the requested export call, if one was requested.
    pub export_result: Option<RemoteCallResult>,
}

#[cfg(windows)]
fn shim_engine_active() -> bool {
    crate::win_process::shim_engine_loaded()
}

#[cfg(not(windows))]
fn shim_engine_active() -> bool {
    false
}

/// One mapping session. Modules mapped through the same mapper share a
/// registry, so every dependency is mapped at most once.
pub struct ManualMapper<'p, P: RemoteProcess + ?Sized> {
    process: &'p P,
    registry: ModuleRegistry,
    api_sets: Arc<ApiSetTable>,
    paths: PathResolver,
}

impl<'p, P: RemoteProcess + ?Sized> ManualMapper<'p, P> {
    /// Session using the controller's API-set schema and the default search order.
    pub fn new(process: &'p P) -> Result<Self> {
        let api_sets = ApiSetTable::from_current_process()?;
        Ok(Self::with_parts(process, Arc::new(api_sets), PathResolver::new()))
    }

    pub fn with_parts(process: &'p P, api_sets: Arc<ApiSetTable>, paths: PathResolver) -> Self {
        Self {
            process,
            registry: ModuleRegistry::new(),
            api_sets,
            paths,
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Map the module at `path` and optionally call one of its exports with
    /// the module base as the only argument. `importer` is the module that
    /// requested this one, if any.
    pub fn map_module(
        &mut self,
        path: &Path,
        export: Option<&str>,
        flags: MapFlags,
        importer: Option<&Path>,
    ) -> Result<MappedModule> {
        if shim_engine_active() {
            return Err(Error::ShimEngineActive);
        }
        if self.process.is_cross_bitness() {
            return Err(Error::CrossBitness);
        }

        let path = self.redirect(path, importer);
        if is_system_module(&path.to_string_lossy()) {
            let base = self
                .process
                .find_module(SYSTEM_MODULE)?
                .ok_or_else(|| Error::SystemModuleNotFound(SYSTEM_MODULE.to_string()))?;
            log::debug!("{} is already loaded at 0x{:X}", SYSTEM_MODULE, base);
            return Ok(MappedModule {
                base,
                export_result: None,
            });
        }

        let path = if flags.contains(MapFlags::PATH_RESOLUTION) {
            self.paths.resolve(&path)?
        } else {
            path
        };
        if let Some(base) = self.registry.lookup(&path) {
            log::debug!("{} already mapped at 0x{:X}", path.display(), base);
            return Ok(MappedModule {
                base,
                export_result: None,
            });
        }

        let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ModuleNotFound(path.display().to_string()),
            _ => Error::IoError(e),
        })?;
        let mut image = PeImage::parse(bytes, Layout::File)?;
        self.validate(&image)?;
        let headers = image.headers().clone();

        let size = headers.size_of_image as usize;
        let base = self
            .process
            .allocate_preferred(headers.image_base, size, Protection::ExecuteReadWrite)?;
        log::debug!(
            "Mapping {} (0x{:X} bytes) at 0x{:X}",
            path.display(),
            size,
            base
        );
        self.registry.register(&path, base)?;

        let callbacks = tls_callbacks(&image)?;

        let header_len = (headers.size_of_headers as usize)
            .min(image.bytes().len())
            .min(size);
        self.process.write(base, &image.bytes()[..header_len])?;

        if base != headers.image_base {
            RelocationApplier::apply(&mut image, base)?;
        }
        SectionMapper::new(self.process, base).map_sections(&image)?;

        let process = self.process;
        let api_sets = Arc::clone(&self.api_sets);
        ImportResolver::new(process, &api_sets, &mut *self).resolve_imports(base, &path)?;

        let engine = RemoteCallEngine::new(process);
        let attach = [base, DLL_PROCESS_ATTACH, 0];
        for rva in callbacks {
            log::debug!("Running TLS callback at RVA 0x{:X}", rva);
            engine.call(base + u64::from(rva), CallingConvention::StdCall, &attach)?;
        }

        if headers.entry_point != 0 {
            let entry = base + u64::from(headers.entry_point);
            log::debug!("Running entry point at 0x{:X}", entry);
            let result = engine.call(entry, CallingConvention::StdCall, &attach)?;
            if result.primary as u32 == 0 {
                return Err(Error::EntryPointFailed { address: entry });
            }
        }

        let export_result = match export {
            Some(name) => {
                let module = path.to_string_lossy().into_owned();
                let address = ImportResolver::new(process, &api_sets, &mut *self).resolve_symbol(
                    &module,
                    base,
                    &ForwarderSymbol::Name(name.to_string()),
                )?;
                log::debug!("Calling export {} at 0x{:X}", name, address);
                Some(engine.call(address, CallingConvention::PlatformDefault, &[base])?)
            }
            None => None,
        };

        log::info!("Mapped {} at 0x{:X}", path.display(), base);
        Ok(MappedModule {
            base,
            export_result,
        })
    }

    fn redirect(&self, path: &Path, importer: Option<&Path>) -> PathBuf {
        let requested = path.to_string_lossy();
        match self
            .api_sets
            .resolve(&requested, importer, |name, candidate| self.same_module(name, candidate))
        {
            Some(host) => {
                log::debug!("API set {} -> {}", requested, host);
                PathBuf::from(host)
            }
            None => path.to_path_buf(),
        }
    }

    fn validate<S: ImageSource>(&self, image: &PeImage<S>) -> Result<()> {
        let headers = image.headers();
        let expected = self.process.architecture();
        if headers.architecture() != Some(expected) {
            return Err(Error::ImageFormatInvalid(format!(
                "machine 0x{:04X} does not match the {:?} target",
                headers.machine, expected
            )));
        }
        if headers.size_of_image == 0 {
            return Err(Error::ImageFormatInvalid("image size is zero".into()));
        }
        Ok(())
    }
}

impl<P: RemoteProcess + ?Sized> ModuleProvider for ManualMapper<'_, P> {
    fn registered_base(&self, module: &str) -> Option<u64> {
        let path = Path::new(module);
        self.registry.lookup(path).or_else(|| {
            self.paths
                .resolve(path)
                .ok()
                .and_then(|resolved| self.registry.lookup(&resolved))
        })
    }

    fn map_dependency(&mut self, module: &str, importer: &Path) -> Result<u64> {
        let path = Path::new(module);
        let first = match self.map_module(path, None, MapFlags::empty(), Some(importer)) {
            Ok(mapped) => return Ok(mapped.base),
            Err(e) => e,
        };

        if self.registered_base(module).is_some() {
            return Err(Error::DependencyMappingFailed {
                module: module.to_string(),
                source: Box::new(first),
            });
        }

        log::debug!("Retrying {} with path resolution ({})", module, first);
        self.map_module(path, None, MapFlags::PATH_RESOLUTION, Some(importer))
            .map(|mapped| mapped.base)
            .map_err(|e| Error::DependencyMappingFailed {
                module: module.to_string(),
                source: Box::new(e),
            })
    }

    fn same_module(&self, name: &str, importer: &Path) -> bool {
        let resolve = |path: &Path| {
            self.paths
                .resolve(path)
                .unwrap_or_else(|_| path.to_path_buf())
        };
        ModuleRegistry::key(&resolve(Path::new(name))) == ModuleRegistry::key(&resolve(importer))
    }
}
