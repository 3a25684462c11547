//! Calling functions inside the target process.

use crate::arch::{Architecture, CallingConvention};
use crate::process::{Protection, RemoteProcess, ScopedAllocation};
use crate::stub::{CallStub, ResultSlots};
use crate::{Error, Result};

const SLOT_SIZE: usize = 8;

/// Every register a call may have returned in, plus the thread's last error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteCallResult {
    /// `eax` on x86, `rax` on x64.
    pub primary: u64,
    /// `edx:eax` on x86, `rax` on x64.
    pub wide: u64,
    /// Raw bits of `st(0)` stored as a double on x86, of `xmm0` on x64.
    pub float_bits: u64,
    pub last_error: u32,
    pub architecture: Architecture,
}

impl RemoteCallResult {
    pub fn return_f64(&self) -> f64 {
        f64::from_bits(self.float_bits)
    }

    pub fn return_f32(&self) -> f32 {
        match self.architecture {
            // the x87 stack was stored as a double
            Architecture::X86 => self.return_f64() as f32,
            Architecture::X64 => f32::from_bits(self.float_bits as u32),
        }
    }
}

/// Runs a generated stub on a new thread in the target for every call.
pub struct RemoteCallEngine<'a, P: RemoteProcess + ?Sized> {
    process: &'a P,
}

impl<'a, P: RemoteProcess + ?Sized> RemoteCallEngine<'a, P> {
    pub fn new(process: &'a P) -> Self {
        Self { process }
    }

    /// Call `address` with `args` and block until it returns.
    pub fn call(
        &self,
        address: u64,
        convention: CallingConvention,
        args: &[u64],
    ) -> Result<RemoteCallResult> {
        if self.process.is_cross_bitness() {
            return Err(Error::CrossBitness);
        }
        let architecture = self.process.architecture();

        let primary = ScopedAllocation::new(self.process, SLOT_SIZE, Protection::ReadWrite)?;
        let wide = ScopedAllocation::new(self.process, SLOT_SIZE, Protection::ReadWrite)?;
        let float = ScopedAllocation::new(self.process, SLOT_SIZE, Protection::ReadWrite)?;
        let last_error = ScopedAllocation::new(self.process, SLOT_SIZE, Protection::ReadWrite)?;

        let code = CallStub {
            architecture,
            convention,
            target: address,
            args,
            slots: ResultSlots {
                primary: primary.address(),
                wide: wide.address(),
                float: float.address(),
                last_error: last_error.address(),
            },
            last_error_routine: self.process.last_error_routine()?,
        }
        .assemble()?;

        let stub = ScopedAllocation::new(self.process, code.len(), Protection::ExecuteReadWrite)?;
        self.process.write(stub.address(), &code)?;

        log::debug!(
            "Calling 0x{:X} ({:?}, {} args) through stub at 0x{:X}",
            address,
            convention,
            args.len(),
            stub.address()
        );
        let thread = self.process.spawn_thread(stub.address(), 0)?;
        self.process.wait(thread)?;

        let result = RemoteCallResult {
            primary: match architecture {
                Architecture::X86 => u64::from(self.process.read_u32(primary.address())?),
                Architecture::X64 => self.process.read_u64(primary.address())?,
            },
            wide: self.process.read_u64(wide.address())?,
            float_bits: self.process.read_u64(float.address())?,
            last_error: self.process.read_u32(last_error.address())?,
            architecture,
        };

        log::info!(
            "Call to 0x{:X} returned 0x{:X} (last error {})",
            address,
            result.primary,
            result.last_error
        );
        Ok(result)
    }
}
