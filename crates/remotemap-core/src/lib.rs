//! Remote function calls and manual PE module mapping.
//!
//! [`RemoteCallEngine`] runs a function inside a target process on a fresh
//! thread and collects every register its result may have been returned in.
//! [`ManualMapper`] loads a DLL and its dependencies into a target without
//! using the target's loader, built on the same engine for running TLS
//! callbacks, entry points and exports.
//!
//! All access to the target goes through the [`RemoteProcess`] trait.
//! [`WindowsProcess`] implements it over a process handle; on Unix hosts
//! [`LocalProcess`] lets the controller act as its own target.

pub mod apiset;
pub mod arch;
pub mod call;
pub mod error;
pub mod exports;
pub mod imports;
pub mod mapper;
pub mod path;
pub mod pe;
pub mod process;
pub mod registry;
pub mod relocs;
pub mod resolver;
pub mod sections;
pub mod stub;
pub mod tls;

#[cfg(all(unix, any(target_arch = "x86_64", target_arch = "x86")))]
pub mod local_process;

#[cfg(windows)]
pub mod win_process;

#[cfg(test)]
mod testing;

pub use apiset::ApiSetTable;
pub use arch::{Architecture, CallingConvention};
pub use call::{RemoteCallEngine, RemoteCallResult};
pub use error::{Error, Result};
pub use mapper::{ManualMapper, MapFlags, MappedModule};
pub use path::PathResolver;
pub use process::{Protection, RemoteProcess, RemoteThread};
pub use registry::ModuleRegistry;
pub use resolver::{ImportResolver, ModuleProvider};

#[cfg(all(unix, any(target_arch = "x86_64", target_arch = "x86")))]
pub use local_process::LocalProcess;

#[cfg(windows)]
pub use win_process::WindowsProcess;
