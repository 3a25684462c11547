//! API-set schema: virtual module names and the real modules behind them.
//!
//! The table is read once per mapping session and passed to the import
//! resolver explicitly.

use std::collections::HashMap;
use std::path::Path;

use crate::{Error, Result};

/// Real module(s) implementing one virtual module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiSetEntry {
    /// Host used when no exception matches. Empty means no redirection.
    pub default_host: String,
    /// (importer, host) pairs overriding the default.
    pub exceptions: Vec<(String, String)>,
}

/// Parsed API-set schema.
#[derive(Debug, Clone, Default)]
pub struct ApiSetTable {
    entries: HashMap<String, ApiSetEntry>,
}

impl ApiSetTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add or replace an entry. `name` may include `.dll`.
    pub fn insert(&mut self, name: &str, entry: ApiSetEntry) {
        self.entries.insert(normalize(name), entry);
    }

    /// Entry for a virtual module name. Matches either the full name or, for
    /// `api-` and `ext-` names, the name without its trailing version segment.
    pub fn entry(&self, name: &str) -> Option<&ApiSetEntry> {
        let name = normalize(name);
        if let Some(entry) = self.entries.get(&name) {
            return Some(entry);
        }
        if !is_api_set_name(&name) {
            return None;
        }
        let (prefix, _) = name.rsplit_once('-')?;
        self.entries.get(prefix)
    }

    /// Real module for `name` as seen from `importer`, or `None` when `name`
    /// is not redirected. `same_module` decides importer equivalence.
    pub fn resolve<F>(&self, name: &str, importer: Option<&Path>, same_module: F) -> Option<String>
    where
        F: Fn(&str, &Path) -> bool,
    {
        let entry = self.entry(name)?;
        let host = importer
            .and_then(|importer| {
                entry
                    .exceptions
                    .iter()
                    .find(|(exception, _)| same_module(exception, importer))
                    .map(|(_, host)| host)
            })
            .unwrap_or(&entry.default_host);

        if host.is_empty() {
            None
        } else {
            Some(host.clone())
        }
    }

    /// Parse a raw schema as found in process memory.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let version = read_u32(bytes, 0)?;
        match version {
            2 => parse_v2(bytes),
            6 => parse_v6(bytes),
            other => {
                log::warn!("Unsupported API set schema version {}", other);
                Ok(Self::default())
            }
        }
    }

    /// Read the schema the OS mapped into the controller process.
    #[cfg(windows)]
    pub fn from_current_process() -> Result<Self> {
        use std::ffi::c_void;
        use windows::Wdk::System::Threading::{NtQueryInformationProcess, ProcessBasicInformation};
        use windows::Win32::System::Memory::{MEMORY_BASIC_INFORMATION, VirtualQuery};
        use windows::Win32::System::Threading::{GetCurrentProcess, PROCESS_BASIC_INFORMATION};

        #[cfg(target_pointer_width = "64")]
        const PEB_API_SET_MAP: usize = 0x68;
        #[cfg(target_pointer_width = "32")]
        const PEB_API_SET_MAP: usize = 0x38;

        let mut info = PROCESS_BASIC_INFORMATION::default();
        let mut returned = 0u32;
        let status = unsafe {
            NtQueryInformationProcess(
                GetCurrentProcess(),
                ProcessBasicInformation,
                &mut info as *mut _ as *mut c_void,
                std::mem::size_of::<PROCESS_BASIC_INFORMATION>() as u32,
                &mut returned,
            )
        };
        if status.is_err() {
            return Err(Error::Other(format!(
                "NtQueryInformationProcess failed: 0x{:X}",
                status.0
            )));
        }

        let peb = info.PebBaseAddress as usize;
        let map = unsafe { *((peb + PEB_API_SET_MAP) as *const usize) };
        if map == 0 {
            return Ok(Self::default());
        }

        let mut region = MEMORY_BASIC_INFORMATION::default();
        let len = unsafe {
            VirtualQuery(
                Some(map as *const c_void),
                &mut region,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if len == 0 {
            return Err(Error::Other("VirtualQuery on API set map failed".into()));
        }

        let available = region.BaseAddress as usize + region.RegionSize - map;
        let bytes = unsafe { std::slice::from_raw_parts(map as *const u8, available) };
        let table = Self::parse(bytes)?;
        log::debug!("Loaded {} API set entries", table.len());
        Ok(table)
    }

    /// API sets only exist on Windows.
    #[cfg(not(windows))]
    pub fn from_current_process() -> Result<Self> {
        Ok(Self::default())
    }
}

/// Lowercased file name without directory or `.dll` extension.
fn is_api_set_name(name: &str) -> bool {
    name.starts_with("api-") || name.starts_with("ext-")
}

fn normalize(name: &str) -> String {
    let file = name.rsplit(['\\', '/']).next().unwrap_or(name).to_lowercase();
    match file.strip_suffix(".dll") {
        Some(stem) => stem.to_string(),
        None => file,
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::ImageFormatInvalid(format!("API set schema truncated at 0x{:X}", offset)))
}

fn read_utf16(bytes: &[u8], offset: u32, len: u32) -> Result<String> {
    let (offset, len) = (offset as usize, len as usize);
    let raw = bytes
        .get(offset..offset + len)
        .ok_or_else(|| {
            Error::ImageFormatInvalid(format!("API set string at 0x{:X} out of bounds", offset))
        })?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// Windows 7 schema.
fn parse_v2(bytes: &[u8]) -> Result<ApiSetTable> {
    let count = read_u32(bytes, 4)? as usize;
    let mut table = ApiSetTable::default();

    for i in 0..count {
        let entry = 8 + i * 12;
        let name = read_utf16(bytes, read_u32(bytes, entry)?, read_u32(bytes, entry + 4)?)?;
        let data = read_u32(bytes, entry + 8)? as usize;

        let hosts = read_u32(bytes, data)? as usize;
        let mut resolved = ApiSetEntry::default();
        for j in 0..hosts {
            let host = data + 4 + j * 16;
            let importer = read_utf16(bytes, read_u32(bytes, host)?, read_u32(bytes, host + 4)?)?;
            let target = read_utf16(
                bytes,
                read_u32(bytes, host + 8)?,
                read_u32(bytes, host + 12)?,
            )?;
            if j == 0 {
                resolved.default_host = target;
            } else {
                resolved.exceptions.push((importer, target));
            }
        }

        table.insert(&format!("api-{}", name), resolved);
    }
    Ok(table)
}

/// Windows 10 and later schema.
fn parse_v6(bytes: &[u8]) -> Result<ApiSetTable> {
    let count = read_u32(bytes, 12)? as usize;
    let entries = read_u32(bytes, 16)? as usize;
    let mut table = ApiSetTable::default();

    for i in 0..count {
        let entry = entries + i * 24;
        let name_offset = read_u32(bytes, entry + 4)?;
        let hashed_length = read_u32(bytes, entry + 12)?;
        let values = read_u32(bytes, entry + 16)? as usize;
        let value_count = read_u32(bytes, entry + 20)? as usize;

        // the hashed part leaves out the trailing version segment
        let name = read_utf16(bytes, name_offset, hashed_length)?;

        let mut resolved = ApiSetEntry::default();
        for j in 0..value_count {
            let value = values + j * 20;
            let importer = read_utf16(
                bytes,
                read_u32(bytes, value + 4)?,
                read_u32(bytes, value + 8)?,
            )?;
            let host = read_utf16(
                bytes,
                read_u32(bytes, value + 12)?,
                read_u32(bytes, value + 16)?,
            )?;
            if j == 0 {
                resolved.default_host = host;
            } else {
                resolved.exceptions.push((importer, host));
            }
        }

        table.insert(&name, resolved);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::put_u32;

    /// Appends UTF-16 strings to a schema blob and returns (offset, length).
    struct Strings(Vec<u8>);

    impl Strings {
        fn add(&mut self, s: &str) -> (u32, u32) {
            let offset = self.0.len() as u32;
            for unit in s.encode_utf16() {
                self.0.extend_from_slice(&unit.to_le_bytes());
            }
            (offset, self.0.len() as u32 - offset)
        }
    }

    fn same_file(name: &str, path: &Path) -> bool {
        path.file_name()
            .map(|f| f.to_string_lossy().eq_ignore_ascii_case(name))
            .unwrap_or(false)
    }

    fn v6_schema() -> Vec<u8> {
        // header 28, one entry 24, two values 40
        let mut blob = Strings(vec![0u8; 28 + 24 + 40]);
        let (name_off, name_len) = blob.add("api-ms-win-core-synch-l1-2-0");
        let hashed_len = name_len - 4; // without "-0"
        let (k32_off, k32_len) = blob.add("kernel32.dll");
        let (kb_off, kb_len) = blob.add("kernelbase.dll");
        let mut b = blob.0;

        put_u32(&mut b, 0, 6);
        let total_len = b.len() as u32;
        put_u32(&mut b, 4, total_len);
        put_u32(&mut b, 12, 1);
        put_u32(&mut b, 16, 28);

        put_u32(&mut b, 28 + 4, name_off);
        put_u32(&mut b, 28 + 8, name_len);
        put_u32(&mut b, 28 + 12, hashed_len);
        put_u32(&mut b, 28 + 16, 52);
        put_u32(&mut b, 28 + 20, 2);

        // default: kernelbase.dll
        put_u32(&mut b, 52 + 12, kb_off);
        put_u32(&mut b, 52 + 16, kb_len);
        // kernel32.dll importing this set gets kernel32.dll
        put_u32(&mut b, 72 + 4, k32_off);
        put_u32(&mut b, 72 + 8, k32_len);
        put_u32(&mut b, 72 + 12, k32_off);
        put_u32(&mut b, 72 + 16, k32_len);
        b
    }

    fn v2_schema() -> Vec<u8> {
        // header 8, one entry 12, host count 4, one host 16
        let mut blob = Strings(vec![0u8; 8 + 12 + 4 + 16]);
        let (name_off, name_len) = blob.add("ms-win-core-console-l1-1-0");
        let (host_off, host_len) = blob.add("kernel32.dll");
        let mut b = blob.0;

        put_u32(&mut b, 0, 2);
        put_u32(&mut b, 4, 1);
        put_u32(&mut b, 8, name_off);
        put_u32(&mut b, 12, name_len);
        put_u32(&mut b, 16, 20);
        put_u32(&mut b, 20, 1);
        put_u32(&mut b, 24 + 8, host_off);
        put_u32(&mut b, 24 + 12, host_len);
        b
    }

    #[test]
    fn test_parse_v6() {
        let table = ApiSetTable::parse(&v6_schema()).unwrap();
        assert_eq!(table.len(), 1);

        let resolved = table.resolve("API-MS-WIN-CORE-SYNCH-L1-2-0.dll", None, same_file);
        assert_eq!(resolved.as_deref(), Some("kernelbase.dll"));

        // newer minor versions share the hashed prefix
        let resolved = table.resolve("api-ms-win-core-synch-l1-2-1.dll", None, same_file);
        assert_eq!(resolved.as_deref(), Some("kernelbase.dll"));
    }

    #[test]
    fn test_v6_exception_for_importer() {
        let table = ApiSetTable::parse(&v6_schema()).unwrap();
        let resolved = table.resolve(
            "api-ms-win-core-synch-l1-2-0.dll",
            Some(Path::new("KERNEL32.DLL")),
            same_file,
        );
        assert_eq!(resolved.as_deref(), Some("kernel32.dll"));

        let other = table.resolve(
            "api-ms-win-core-synch-l1-2-0.dll",
            Some(Path::new("user32.dll")),
            same_file,
        );
        assert_eq!(other.as_deref(), Some("kernelbase.dll"));
    }

    #[test]
    fn test_parse_v2() {
        let table = ApiSetTable::parse(&v2_schema()).unwrap();
        let resolved = table.resolve("api-ms-win-core-console-l1-1-0.dll", None, same_file);
        assert_eq!(resolved.as_deref(), Some("kernel32.dll"));
    }

    #[test]
    fn test_unknown_names_and_versions() {
        let table = ApiSetTable::parse(&v6_schema()).unwrap();
        assert_eq!(table.resolve("user32.dll", None, same_file), None);

        let mut blob = vec![0u8; 16];
        put_u32(&mut blob, 0, 4);
        assert!(ApiSetTable::parse(&blob).unwrap().is_empty());

        assert!(matches!(
            ApiSetTable::parse(&[1, 2]),
            Err(Error::ImageFormatInvalid(_))
        ));
    }

    #[test]
    fn test_empty_host_is_not_redirected() {
        let mut table = ApiSetTable::new();
        table.insert("ext-ms-win-fake-l1-1-0.dll", ApiSetEntry::default());
        assert_eq!(table.resolve("ext-ms-win-fake-l1-1-0.dll", None, same_file), None);
    }

    #[test]
    fn test_version_fallback_only_for_api_set_names() {
        let mut table = ApiSetTable::new();
        let host = |name: &str| ApiSetEntry {
            default_host: name.to_string(),
            exceptions: Vec::new(),
        };
        table.insert("my", host("other.dll"));
        table.insert("ext-ms-win-fake-l1-1", host("fake.dll"));

        assert_eq!(table.resolve("my-lib.dll", None, same_file), None);
        assert_eq!(
            table.resolve("EXT-MS-WIN-FAKE-L1-1-3.dll", None, same_file),
            Some("fake.dll".to_string())
        );
    }
}
