//! Error types for remotemap.

use thiserror::Error;

use crate::arch::{Architecture, CallingConvention};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Calling convention {convention:?} is not valid on {architecture:?}")]
    InvalidCallingConvention {
        convention: CallingConvention,
        architecture: Architecture,
    },

    #[error("Value 0x{value:X} does not fit in a 32-bit target")]
    ValueOutOfRange { value: u64 },

    #[error("Controller and target process bitness differ")]
    CrossBitness,

    #[error("Failed to allocate 0x{size:X} bytes in target process (error {code})")]
    RemoteAllocationFailed { size: usize, code: u32 },

    #[error("Failed to create remote thread (error {code})")]
    RemoteThreadCreationFailed { code: u32 },

    #[error("Failed to wait for remote thread (error {code})")]
    RemoteThreadWaitFailed { code: u32 },

    #[error("Failed to read 0x{size:X} bytes at 0x{address:X} (error {code})")]
    MemoryReadFailed { address: u64, size: usize, code: u32 },

    #[error("Failed to write 0x{size:X} bytes at 0x{address:X} (error {code})")]
    MemoryWriteFailed { address: u64, size: usize, code: u32 },

    #[error("Unsupported relocation type {kind} at RVA 0x{rva:X}")]
    UnsupportedRelocationType { kind: u8, rva: u32 },

    #[error("Failed to change protection of 0x{size:X} bytes at 0x{address:X} (error {code})")]
    ProtectionChangeFailed { address: u64, size: usize, code: u32 },

    #[error("Export {export} not found in {module}")]
    ExportNotFound { module: String, export: String },

    #[error("Forwarder {forwarder} points to unknown module {module}")]
    UnknownForwarderModule { module: String, forwarder: String },

    #[error("Forwarder cycle detected at {module}!{symbol}")]
    ForwarderCycle { module: String, symbol: String },

    #[error("Forwarder chain starting at {module}!{symbol} is too deep")]
    ForwarderDepthExceeded { module: String, symbol: String },

    #[error("Invalid image: {0}")]
    ImageFormatInvalid(String),

    #[error("Failed to map dependency {module}: {source}")]
    DependencyMappingFailed {
        module: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Module {0} is already registered in this session")]
    ModuleAlreadyRegistered(String),

    #[error("System module {0} is not loaded in the target process")]
    SystemModuleNotFound(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Entry point at 0x{address:X} returned FALSE")]
    EntryPointFailed { address: u64 },

    #[error("Shim engine is active in the controller process")]
    ShimEngineActive,

    #[error("Assembler error: {0}")]
    Assembler(String),

    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<iced_x86::IcedError> for Error {
    fn from(e: iced_x86::IcedError) -> Self {
        Error::Assembler(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
