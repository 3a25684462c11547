use remotemap_core::{Error, Result};
use windows::Win32::Foundation::CloseHandle;
use windows::Win32::System::ProcessStatus::{EnumProcesses, GetModuleBaseNameW};
use windows::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ};

/// Resolve the target PID from either --pid or --name
pub fn resolve_target(pid: Option<u32>, name: Option<&str>, forced: bool) -> Result<u32> {
    match (pid, name) {
        (Some(p), _) => Ok(p),
        (None, Some(n)) => pick(n, find_processes_by_name(n)?, forced),
        (None, None) => Err(Error::Other("Must specify either --pid or --name".into())),
    }
}

fn pick(name: &str, pids: Vec<u32>, forced: bool) -> Result<u32> {
    match pids.as_slice() {
        [] => Err(Error::Other(format!("Process '{}' not found", name))),
        [pid] => Ok(*pid),
        [first, ..] if forced => {
            log::warn!(
                "{} processes named '{}', using PID {}",
                pids.len(),
                name,
                first
            );
            Ok(*first)
        }
        _ => Err(Error::Other(format!(
            "{} processes named '{}' ({:?}), pass --pid or --name-forced",
            pids.len(),
            name,
            pids
        ))),
    }
}

/// Every PID whose executable name matches `name`, with or without `.exe`
fn find_processes_by_name(name: &str) -> Result<Vec<u32>> {
    let search_name = name.to_lowercase();
    let search_name_exe = if search_name.ends_with(".exe") {
        search_name.clone()
    } else {
        format!("{}.exe", search_name)
    };

    let mut found = Vec::new();
    unsafe {
        let mut pids = [0u32; 4096];
        let mut bytes_returned: u32 = 0;

        EnumProcesses(
            pids.as_mut_ptr(),
            (pids.len() * std::mem::size_of::<u32>()) as u32,
            &mut bytes_returned,
        )?;

        let count = bytes_returned as usize / std::mem::size_of::<u32>();

        for &pid in &pids[..count] {
            if pid == 0 {
                continue;
            }

            if let Ok(process) =
                OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid)
            {
                let mut name_buf = [0u16; 260];
                let len = GetModuleBaseNameW(process, None, &mut name_buf);
                let _ = CloseHandle(process);

                if len > 0 {
                    let proc_name =
                        String::from_utf16_lossy(&name_buf[..len as usize]).to_lowercase();
                    if proc_name == search_name || proc_name == search_name_exe {
                        log::debug!("Found process '{}' with PID {}", proc_name, pid);
                        found.push(pid);
                    }
                }
            }
        }
    }

    Ok(found)
}
