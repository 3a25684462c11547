//! Call stub generation.
//!
//! A stub is a short, position-independent routine that is run as the start
//! routine of a new thread in the target process. It calls the requested
//! function with the requested arguments and stores every register a result
//! may come back in, followed by the thread's last-error value, into four
//! fixed result slots.

use iced_x86::code_asm::*;

use crate::arch::{Architecture, CallingConvention};
use crate::{Error, Result};

/// Shadow space the Microsoft x64 convention reserves for the callee.
const X64_SHADOW_SPACE: u32 = 0x20;

/// Number of integer argument registers in the x64 convention.
const X64_REGISTER_ARGS: usize = 4;

/// Remote addresses the stub writes its results to. Each slot is 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultSlots {
    pub primary: u64,
    pub wide: u64,
    pub float: u64,
    pub last_error: u64,
}

/// Everything needed to generate one call stub.
#[derive(Debug, Clone)]
pub struct CallStub<'a> {
    pub architecture: Architecture,
    pub convention: CallingConvention,
    pub target: u64,
    pub args: &'a [u64],
    pub slots: ResultSlots,
    /// Address of the target's `GetLastError` equivalent.
    pub last_error_routine: u64,
}

impl CallStub<'_> {
    /// Encode the stub. The result does not depend on where it will be placed.
    pub fn assemble(&self) -> Result<Vec<u8>> {
        if !self.convention.is_valid_for(self.architecture) {
            return Err(Error::InvalidCallingConvention {
                convention: self.convention,
                architecture: self.architecture,
            });
        }

        match self.architecture {
            Architecture::X64 => self.assemble_x64(),
            Architecture::X86 => self.assemble_x86(),
        }
    }

    fn assemble_x64(&self) -> Result<Vec<u8>> {
        let mut a = CodeAssembler::new(64)?;

        let stack_args = self.args.len().saturating_sub(X64_REGISTER_ARGS) as u32;
        let frame = (X64_SHADOW_SPACE + stack_args * 8 + 0xF) & !0xF;

        // rsp is 8 mod 16 on entry, push rbp realigns it
        a.push(rbp)?;
        a.mov(rbp, rsp)?;
        a.sub(rsp, frame as i32)?;

        for (index, &arg) in self.args.iter().enumerate().skip(X64_REGISTER_ARGS).rev() {
            let offset = X64_SHADOW_SPACE as usize + (index - X64_REGISTER_ARGS) * 8;
            a.mov(rax, arg)?;
            a.mov(qword_ptr(rsp + offset as i32), rax)?;
        }

        let arg = |index: usize| self.args.get(index).copied().unwrap_or(0);
        a.mov(rcx, arg(0))?;
        a.mov(rdx, arg(1))?;
        a.mov(r8, arg(2))?;
        a.mov(r9, arg(3))?;

        a.mov(rax, self.target)?;
        a.call(rax)?;

        a.mov(rcx, self.slots.primary)?;
        a.mov(qword_ptr(rcx), rax)?;
        a.mov(rcx, self.slots.wide)?;
        a.mov(qword_ptr(rcx), rax)?;
        a.mov(rcx, self.slots.float)?;
        a.movq(qword_ptr(rcx), xmm0)?;

        a.mov(rax, self.last_error_routine)?;
        a.call(rax)?;
        a.mov(rcx, self.slots.last_error)?;
        a.mov(dword_ptr(rcx), eax)?;

        a.mov(rsp, rbp)?;
        a.pop(rbp)?;
        a.xor(eax, eax)?;
        a.ret()?;

        Ok(a.assemble(0)?)
    }

    fn assemble_x86(&self) -> Result<Vec<u8>> {
        let mut a = CodeAssembler::new(32)?;

        let in_registers = self.convention.x86_register_args();
        let pushed = self.args.len().saturating_sub(in_registers);

        a.push(ebp)?;
        a.mov(ebp, esp)?;

        for &arg in self.args.iter().skip(in_registers).rev() {
            a.mov(eax, narrow(arg)?)?;
            a.push(eax)?;
        }

        let arg = |index: usize| narrow(self.args.get(index).copied().unwrap_or(0));
        if in_registers >= 1 {
            a.mov(ecx, arg(0)?)?;
        }
        if in_registers >= 2 {
            a.mov(edx, arg(1)?)?;
        }

        a.mov(eax, narrow(self.target)?)?;
        a.call(eax)?;

        if self.convention.x86_caller_cleans() && pushed > 0 {
            a.add(esp, (pushed * 4) as i32)?;
        }

        a.mov(ecx, narrow(self.slots.primary)?)?;
        a.mov(dword_ptr(ecx), eax)?;
        a.mov(ecx, narrow(self.slots.wide)?)?;
        a.mov(dword_ptr(ecx), eax)?;
        a.mov(dword_ptr(ecx + 4), edx)?;
        a.mov(ecx, narrow(self.slots.float)?)?;
        a.fst(qword_ptr(ecx))?;

        a.mov(eax, narrow(self.last_error_routine)?)?;
        a.call(eax)?;
        a.mov(ecx, narrow(self.slots.last_error)?)?;
        a.mov(dword_ptr(ecx), eax)?;

        a.mov(esp, ebp)?;
        a.pop(ebp)?;
        a.xor(eax, eax)?;
        // thread start routines are stdcall with one argument
        a.ret_1(4i32)?;

        Ok(a.assemble(0)?)
    }
}

fn narrow(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::ValueOutOfRange { value })
}
