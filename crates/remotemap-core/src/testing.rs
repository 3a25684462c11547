//! Test doubles: an in-memory target process and a synthetic image builder.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::arch::{Architecture, IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386};
use crate::process::{Protection, RemoteProcess, RemoteThread};
use crate::{Error, Result};

const PAGE: u64 = 0x1000;

fn page_align(size: u64) -> u64 {
    (size + PAGE - 1) & !(PAGE - 1)
}

// =============================================================================
// FakeProcess
// =============================================================================

/// A target process whose memory is a set of byte vectors. It cannot run code.
pub(crate) struct FakeProcess {
    architecture: Architecture,
    regions: RefCell<BTreeMap<u64, Vec<u8>>>,
    pages: RefCell<BTreeMap<u64, Protection>>,
    next_base: Cell<u64>,
    protections: RefCell<Vec<(u64, usize, Protection)>>,
    freed: RefCell<Vec<u64>>,
    modules: RefCell<HashMap<String, u64>>,
    spawned: RefCell<Vec<(u64, u64)>>,
    pub honor_preferred: Cell<bool>,
    pub fail_allocation: Cell<bool>,
    pub fail_protect: Cell<bool>,
    pub fail_thread: Cell<bool>,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self::with_architecture(Architecture::X64)
    }

    pub fn with_architecture(architecture: Architecture) -> Self {
        Self {
            architecture,
            regions: RefCell::new(BTreeMap::new()),
            pages: RefCell::new(BTreeMap::new()),
            next_base: Cell::new(0x1000_0000),
            protections: RefCell::new(Vec::new()),
            freed: RefCell::new(Vec::new()),
            modules: RefCell::new(HashMap::new()),
            spawned: RefCell::new(Vec::new()),
            honor_preferred: Cell::new(false),
            fail_allocation: Cell::new(false),
            fail_protect: Cell::new(false),
            fail_thread: Cell::new(false),
        }
    }

    pub fn freed(&self) -> Vec<u64> {
        self.freed.borrow().clone()
    }

    pub fn protections(&self) -> Vec<(u64, usize, Protection)> {
        self.protections.borrow().clone()
    }

    pub fn spawned(&self) -> Vec<(u64, u64)> {
        self.spawned.borrow().clone()
    }

    pub fn is_allocated(&self, address: u64) -> bool {
        self.regions.borrow().contains_key(&address)
    }

    pub fn region_count(&self) -> usize {
        self.regions.borrow().len()
    }

    /// Pretend a module is loaded at `base`.
    pub fn add_module(&self, name: &str, base: u64) {
        self.modules.borrow_mut().insert(name.to_lowercase(), base);
    }

    /// Copy a flat-layout image into fresh memory and return its base.
    pub fn load_image(&self, bytes: &[u8]) -> u64 {
        let base = self
            .allocate(bytes.len(), Protection::ExecuteReadWrite)
            .expect("allocate image");
        self.write(base, bytes).expect("write image");
        base
    }

    fn insert_region(&self, base: u64, size: usize, protection: Protection) {
        let size = page_align(size as u64);
        self.regions.borrow_mut().insert(base, vec![0; size as usize]);
        let mut pages = self.pages.borrow_mut();
        for page in (base..base + size).step_by(PAGE as usize) {
            pages.insert(page, protection);
        }
    }

    fn overlaps(&self, base: u64, size: usize) -> bool {
        let end = base + page_align(size as u64);
        self.regions
            .borrow()
            .iter()
            .any(|(&start, data)| start < end && base < start + data.len() as u64)
    }

    fn with_region<T>(
        &self,
        address: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> Option<T> {
        let mut regions = self.regions.borrow_mut();
        let (&base, data) = regions.range_mut(..=address).next_back()?;
        let start = (address - base) as usize;
        let end = start.checked_add(len)?;
        if end > data.len() {
            return None;
        }
        Some(f(&mut data[start..end]))
    }
}

impl RemoteProcess for FakeProcess {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn is_cross_bitness(&self) -> bool {
        false
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<u64> {
        if self.fail_allocation.get() {
            return Err(Error::RemoteAllocationFailed { size, code: 8 });
        }
        let base = self.next_base.get();
        self.next_base.set(base + page_align(size as u64) + PAGE);
        self.insert_region(base, size, protection);
        Ok(base)
    }

    fn allocate_preferred(&self, preferred: u64, size: usize, protection: Protection) -> Result<u64> {
        if self.honor_preferred.get() && !self.fail_allocation.get() && !self.overlaps(preferred, size)
        {
            self.insert_region(preferred, size, protection);
            return Ok(preferred);
        }
        self.allocate(size, protection)
    }

    fn free(&self, address: u64) -> Result<()> {
        let data = self
            .regions
            .borrow_mut()
            .remove(&address)
            .ok_or_else(|| Error::Other(format!("No allocation at 0x{:X}", address)))?;
        let mut pages = self.pages.borrow_mut();
        for page in (address..address + data.len() as u64).step_by(PAGE as usize) {
            pages.remove(&page);
        }
        self.freed.borrow_mut().push(address);
        Ok(())
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        self.with_region(address, len, |data| buf.copy_from_slice(data))
            .ok_or(Error::MemoryReadFailed {
                address,
                size: len,
                code: 299,
            })
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        self.with_region(address, data.len(), |dest| dest.copy_from_slice(data))
            .ok_or(Error::MemoryWriteFailed {
                address,
                size: data.len(),
                code: 299,
            })
    }

    fn query_protection(&self, address: u64) -> Result<Protection> {
        self.pages
            .borrow()
            .get(&(address & !(PAGE - 1)))
            .copied()
            .ok_or_else(|| Error::Other(format!("Unmapped address 0x{:X}", address)))
    }

    fn protect(&self, address: u64, size: usize, protection: Protection) -> Result<Protection> {
        if self.fail_protect.get() {
            return Err(Error::ProtectionChangeFailed {
                address,
                size,
                code: 487,
            });
        }
        let previous = self.query_protection(address)?;
        let first = address & !(PAGE - 1);
        let end = page_align(address + size as u64);
        let mut pages = self.pages.borrow_mut();
        for page in (first..end).step_by(PAGE as usize) {
            pages.insert(page, protection);
        }
        self.protections
            .borrow_mut()
            .push((address, size, protection));
        Ok(previous)
    }

    fn spawn_thread(&self, entry: u64, argument: u64) -> Result<RemoteThread> {
        if self.fail_thread.get() {
            return Err(Error::RemoteThreadCreationFailed { code: 5 });
        }
        let mut spawned = self.spawned.borrow_mut();
        spawned.push((entry, argument));
        Ok(RemoteThread(spawned.len() as u64))
    }

    fn wait(&self, _thread: RemoteThread) -> Result<()> {
        Ok(())
    }

    fn process_path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("fake-target.exe"))
    }

    fn find_module(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.modules.borrow().get(&name.to_lowercase()).copied())
    }

    fn last_error_routine(&self) -> Result<u64> {
        Ok(0x7FFF_0000)
    }
}

// =============================================================================
// ImageBuilder
// =============================================================================

pub(crate) const SCN_CNT_CODE: u32 = 0x0000_0020;
pub(crate) const SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub(crate) const SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
pub(crate) const SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub(crate) const SCN_MEM_READ: u32 = 0x4000_0000;
pub(crate) const SCN_MEM_WRITE: u32 = 0x8000_0000;

const E_LFANEW: usize = 0x80;
const HEADERS_SIZE: u32 = 0x1000;

/// Target of a synthetic export.
#[derive(Debug, Clone)]
pub(crate) enum ExportSpec {
    Rva(u32),
    Forward(String),
}

/// One synthetic import thunk.
#[derive(Debug, Clone)]
pub(crate) enum ImportSpec {
    Name(u16, String),
    Ordinal(u16),
}

pub(crate) fn by_name(name: &str) -> ImportSpec {
    ImportSpec::Name(0, name.to_string())
}

struct BuiltSection {
    name: String,
    va: u32,
    data: Vec<u8>,
    virtual_size: u32,
    characteristics: u32,
    has_raw_data: bool,
}

/// Builds images whose file layout equals their memory layout, so the same
/// bytes can be parsed from disk or loaded straight into a [`FakeProcess`].
pub(crate) struct ImageBuilder {
    pe32_plus: bool,
    image_base: u64,
    entry_point: u32,
    sections: Vec<BuiltSection>,
    directories: [(u32, u32); 16],
    iat_slots: Vec<Vec<u32>>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            pe32_plus: true,
            image_base: 0x1_8000_0000,
            entry_point: 0,
            sections: Vec::new(),
            directories: [(0, 0); 16],
            iat_slots: Vec::new(),
        }
    }

    pub fn pe32() -> Self {
        Self {
            pe32_plus: false,
            image_base: 0x1000_0000,
            ..Self::new()
        }
    }

    pub fn image_base(mut self, base: u64) -> Self {
        self.image_base = base;
        self
    }

    pub fn base(&self) -> u64 {
        self.image_base
    }

    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = rva;
        self
    }

    /// RVA the next section will be placed at.
    pub fn next_rva(&self) -> u32 {
        self.sections
            .last()
            .map(|s| s.va + page_align(s.virtual_size.max(1) as u64) as u32)
            .unwrap_or(HEADERS_SIZE)
    }

    /// IAT slot RVAs for each import descriptor, in declaration order.
    pub fn iat_slots(&self) -> &[Vec<u32>] {
        &self.iat_slots
    }

    pub fn section(mut self, name: &str, data: Vec<u8>, characteristics: u32) -> Self {
        let va = self.next_rva();
        self.sections.push(BuiltSection {
            name: name.to_string(),
            va,
            virtual_size: data.len().max(1) as u32,
            data,
            characteristics,
            has_raw_data: true,
        });
        self
    }

    /// A section with a virtual size but no raw data.
    pub fn bss(mut self, name: &str, size: u32, characteristics: u32) -> Self {
        let va = self.next_rva();
        self.sections.push(BuiltSection {
            name: name.to_string(),
            va,
            data: Vec::new(),
            virtual_size: size,
            characteristics,
            has_raw_data: false,
        });
        self
    }

    pub fn code(self, code: &[u8]) -> Self {
        self.section(
            ".text",
            code.to_vec(),
            SCN_CNT_CODE | SCN_MEM_EXECUTE | SCN_MEM_READ,
        )
    }

    /// Export table with one function per entry, named in the given order.
    pub fn named_exports(self, module: &str, exports: &[(&str, ExportSpec)]) -> Self {
        let functions: Vec<ExportSpec> = exports.iter().map(|(_, spec)| spec.clone()).collect();
        let names: Vec<(&str, u16)> = exports
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (*name, i as u16))
            .collect();
        self.exports(module, &functions, &names)
    }

    /// Export table from a raw function list and (name, function index) pairs.
    pub fn exports(mut self, module: &str, functions: &[ExportSpec], names: &[(&str, u16)]) -> Self {
        let va = self.next_rva();
        let functions_off = 40;
        let names_off = functions_off + 4 * functions.len();
        let ordinals_off = names_off + 4 * names.len();
        let mut data = vec![0u8; ordinals_off + 2 * names.len()];

        let module_rva = va + data.len() as u32;
        push_c_string(&mut data, module);

        for (i, (name, index)) in names.iter().enumerate() {
            let rva = va + data.len() as u32;
            push_c_string(&mut data, name);
            put_u32(&mut data, names_off + 4 * i, rva);
            put_u16(&mut data, ordinals_off + 2 * i, *index);
        }

        for (i, function) in functions.iter().enumerate() {
            let value = match function {
                ExportSpec::Rva(rva) => *rva,
                ExportSpec::Forward(target) => {
                    let rva = va + data.len() as u32;
                    push_c_string(&mut data, target);
                    rva
                }
            };
            put_u32(&mut data, functions_off + 4 * i, value);
        }

        put_u32(&mut data, 12, module_rva);
        put_u32(&mut data, 16, 1);
        put_u32(&mut data, 20, functions.len() as u32);
        put_u32(&mut data, 24, names.len() as u32);
        put_u32(&mut data, 28, va + functions_off as u32);
        put_u32(&mut data, 32, va + names_off as u32);
        put_u32(&mut data, 36, va + ordinals_off as u32);

        self.directories[0] = (va, data.len() as u32);
        self.section(".edata", data, SCN_CNT_INITIALIZED_DATA | SCN_MEM_READ)
    }

    pub fn imports(mut self, imports: &[(&str, Vec<ImportSpec>)]) -> Self {
        let va = self.next_rva();
        let thunk = if self.pe32_plus { 8 } else { 4 };
        let ordinal_flag: u64 = if self.pe32_plus { 1 << 63 } else { 1 << 31 };
        let descriptors_len = 20 * (imports.len() + 1);
        let mut data = vec![0u8; descriptors_len];
        let mut all_slots = Vec::new();

        for (d, (module, thunks)) in imports.iter().enumerate() {
            let ilt_off = data.len();
            data.resize(ilt_off + thunk * (thunks.len() + 1), 0);
            let iat_off = data.len();
            data.resize(iat_off + thunk * (thunks.len() + 1), 0);

            let mut slots = Vec::new();
            for (i, spec) in thunks.iter().enumerate() {
                let value = match spec {
                    ImportSpec::Ordinal(ordinal) => ordinal_flag | u64::from(*ordinal),
                    ImportSpec::Name(hint, name) => {
                        let rva = va + data.len() as u32;
                        data.extend_from_slice(&hint.to_le_bytes());
                        push_c_string(&mut data, name);
                        if data.len() % 2 == 1 {
                            data.push(0);
                        }
                        u64::from(rva)
                    }
                };
                put_thunk(&mut data, ilt_off + thunk * i, value, thunk);
                put_thunk(&mut data, iat_off + thunk * i, value, thunk);
                slots.push(va + (iat_off + thunk * i) as u32);
            }

            let name_rva = va + data.len() as u32;
            push_c_string(&mut data, module);

            let desc = 20 * d;
            put_u32(&mut data, desc, va + ilt_off as u32);
            put_u32(&mut data, desc + 12, name_rva);
            put_u32(&mut data, desc + 16, va + iat_off as u32);
            all_slots.push(slots);
        }

        self.iat_slots = all_slots;
        self.directories[1] = (va, descriptors_len as u32);
        self.section(
            ".idata",
            data,
            SCN_CNT_INITIALIZED_DATA | SCN_MEM_READ | SCN_MEM_WRITE,
        )
    }

    /// Base relocation table from (page RVA, raw type/offset entries) blocks.
    pub fn relocations(mut self, blocks: &[(u32, Vec<u16>)]) -> Self {
        let va = self.next_rva();
        let mut data = Vec::new();
        for (page, entries) in blocks {
            let mut entries = entries.clone();
            if entries.len() % 2 == 1 {
                entries.push(0);
            }
            data.extend_from_slice(&page.to_le_bytes());
            data.extend_from_slice(&(8 + 2 * entries.len() as u32).to_le_bytes());
            for entry in entries {
                data.extend_from_slice(&entry.to_le_bytes());
            }
        }
        self.directories[5] = (va, data.len() as u32);
        self.section(".reloc", data, SCN_CNT_INITIALIZED_DATA | SCN_MEM_READ)
    }

    /// TLS directory whose callback array holds the given RVAs as VAs.
    pub fn tls(mut self, callbacks: &[u32]) -> Self {
        let va = self.next_rva();
        let ptr = if self.pe32_plus { 8 } else { 4 };
        let dir_len = if self.pe32_plus { 40 } else { 24 };
        let mut data = vec![0u8; dir_len + ptr * (callbacks.len() + 1)];
        let array_va = self.image_base + u64::from(va) + dir_len as u64;
        put_thunk(&mut data, 3 * ptr, array_va, ptr);
        for (i, rva) in callbacks.iter().enumerate() {
            put_thunk(
                &mut data,
                dir_len + ptr * i,
                self.image_base + u64::from(*rva),
                ptr,
            );
        }
        self.directories[9] = (va, dir_len as u32);
        self.section(
            ".tls",
            data,
            SCN_CNT_INITIALIZED_DATA | SCN_MEM_READ | SCN_MEM_WRITE,
        )
    }

    pub fn build(&self) -> Vec<u8> {
        let size_of_image = self.next_rva();
        let mut image = vec![0u8; size_of_image as usize];

        image[0] = b'M';
        image[1] = b'Z';
        put_u32(&mut image, 0x3C, E_LFANEW as u32);
        image[E_LFANEW..E_LFANEW + 4].copy_from_slice(b"PE\0\0");

        let file_header = E_LFANEW + 4;
        let (machine, optional_size) = if self.pe32_plus {
            (IMAGE_FILE_MACHINE_AMD64, 240u16)
        } else {
            (IMAGE_FILE_MACHINE_I386, 224u16)
        };
        put_u16(&mut image, file_header, machine);
        put_u16(&mut image, file_header + 2, self.sections.len() as u16);
        put_u16(&mut image, file_header + 16, optional_size);
        put_u16(&mut image, file_header + 18, 0x2022);

        let optional = file_header + 20;
        put_u32(&mut image, optional + 16, self.entry_point);
        put_u32(&mut image, optional + 32, 0x1000);
        put_u32(&mut image, optional + 36, 0x1000);
        put_u32(&mut image, optional + 56, size_of_image);
        put_u32(&mut image, optional + 60, HEADERS_SIZE);
        put_u16(&mut image, optional + 68, 2);
        let directories = if self.pe32_plus {
            put_u16(&mut image, optional, 0x20B);
            image[optional + 24..optional + 32].copy_from_slice(&self.image_base.to_le_bytes());
            put_u32(&mut image, optional + 108, 16);
            optional + 112
        } else {
            put_u16(&mut image, optional, 0x10B);
            put_u32(&mut image, optional + 28, self.image_base as u32);
            put_u32(&mut image, optional + 92, 16);
            optional + 96
        };
        for (i, (rva, size)) in self.directories.iter().enumerate() {
            put_u32(&mut image, directories + 8 * i, *rva);
            put_u32(&mut image, directories + 8 * i + 4, *size);
        }

        let table = optional + optional_size as usize;
        for (i, section) in self.sections.iter().enumerate() {
            let header = table + 40 * i;
            let name = section.name.as_bytes();
            image[header..header + name.len().min(8)].copy_from_slice(&name[..name.len().min(8)]);
            put_u32(&mut image, header + 8, section.virtual_size);
            put_u32(&mut image, header + 12, section.va);
            if section.has_raw_data {
                let raw_size = page_align(section.data.len() as u64) as u32;
                put_u32(&mut image, header + 16, raw_size);
                put_u32(&mut image, header + 20, section.va);
                let start = section.va as usize;
                image[start..start + section.data.len()].copy_from_slice(&section.data);
            }
            put_u32(&mut image, header + 36, section.characteristics);
        }

        image
    }
}

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_thunk(buf: &mut [u8], offset: usize, value: u64, size: usize) {
    buf[offset..offset + size].copy_from_slice(&value.to_le_bytes()[..size]);
}

fn push_c_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}
