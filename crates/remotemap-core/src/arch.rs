//! Target architecture and calling convention descriptors.

/// PE machine value for x86.
pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
/// PE machine value for x64.
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

/// Instruction set of a target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86,
    X64,
}

impl Architecture {
    /// Architecture the controller itself was built for.
    #[cfg(target_pointer_width = "64")]
    pub const fn host() -> Self {
        Architecture::X64
    }

    /// Architecture the controller itself was built for.
    #[cfg(target_pointer_width = "32")]
    pub const fn host() -> Self {
        Architecture::X86
    }

    /// Size of a pointer on this architecture in bytes.
    pub const fn pointer_size(self) -> usize {
        match self {
            Architecture::X86 => 4,
            Architecture::X64 => 8,
        }
    }

    /// Bitness as expected by the assembler.
    pub const fn bitness(self) -> u32 {
        match self {
            Architecture::X86 => 32,
            Architecture::X64 => 64,
        }
    }

    /// Map a PE machine value to an architecture.
    pub fn from_machine(machine: u16) -> Option<Self> {
        match machine {
            IMAGE_FILE_MACHINE_I386 => Some(Architecture::X86),
            IMAGE_FILE_MACHINE_AMD64 => Some(Architecture::X64),
            _ => None,
        }
    }

    pub const fn machine(self) -> u16 {
        match self {
            Architecture::X86 => IMAGE_FILE_MACHINE_I386,
            Architecture::X64 => IMAGE_FILE_MACHINE_AMD64,
        }
    }
}

/// How arguments are passed to a remote function and who cleans the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// `cdecl` on x86, the only convention on x64.
    PlatformDefault,
    CDecl,
    StdCall,
    /// x86 only. Argument 0 travels in `ecx`.
    ThisCall,
    /// x86 only. Arguments 0 and 1 travel in `ecx` and `edx`.
    FastCall,
    /// The Microsoft x64 convention. x64 only.
    Architecture64,
}

impl CallingConvention {
    /// Whether this convention can be encoded for `arch`.
    pub fn is_valid_for(self, arch: Architecture) -> bool {
        match arch {
            Architecture::X64 => !matches!(
                self,
                CallingConvention::ThisCall | CallingConvention::FastCall
            ),
            Architecture::X86 => self != CallingConvention::Architecture64,
        }
    }

    /// Number of leading arguments passed in registers on x86.
    pub(crate) fn x86_register_args(self) -> usize {
        match self {
            CallingConvention::ThisCall => 1,
            CallingConvention::FastCall => 2,
            _ => 0,
        }
    }

    /// Whether the caller pops stack arguments on x86.
    pub(crate) fn x86_caller_cleans(self) -> bool {
        matches!(
            self,
            CallingConvention::CDecl | CallingConvention::PlatformDefault
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convention_validity() {
        assert!(!CallingConvention::ThisCall.is_valid_for(Architecture::X64));
        assert!(!CallingConvention::FastCall.is_valid_for(Architecture::X64));
        assert!(CallingConvention::StdCall.is_valid_for(Architecture::X64));
        assert!(!CallingConvention::Architecture64.is_valid_for(Architecture::X86));
        assert!(CallingConvention::FastCall.is_valid_for(Architecture::X86));
    }

    #[test]
    fn test_machine_round_trip() {
        assert_eq!(Architecture::from_machine(0x8664), Some(Architecture::X64));
        assert_eq!(Architecture::from_machine(0x014c), Some(Architecture::X86));
        assert_eq!(Architecture::from_machine(0xAA64), None);
        assert_eq!(Architecture::X64.machine(), IMAGE_FILE_MACHINE_AMD64);
    }
}
