#[cfg(windows)]
mod target;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use remotemap_core::{CallingConvention, MappedModule, RemoteCallResult};

#[derive(Parser)]
#[command(name = "remotemap")]
#[command(about = "Call functions in and manually map modules into running processes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[cfg_attr(not(windows), allow(dead_code))]
enum Commands {
    /// Manually map a module into a process
    Map {
        /// Process ID to target
        #[arg(short, long, group = "target")]
        pid: Option<u32>,
        /// Process name to target (e.g., "notepad.exe" or "notepad")
        #[arg(short, long, group = "target")]
        name: Option<String>,
        /// Use the first process when several match --name
        #[arg(long, requires = "name")]
        name_forced: bool,
        /// Module to map
        #[arg(short, long)]
        module: PathBuf,
        /// Export to call after mapping, with the module base as its argument
        #[arg(short, long)]
        export: Option<String>,
        /// Resolve the module path through the DLL search order
        #[arg(long)]
        path_resolution: bool,
    },
    /// Call a function at an address inside a process
    Call {
        /// Process ID to target
        #[arg(short, long, group = "target")]
        pid: Option<u32>,
        /// Process name to target (e.g., "notepad.exe" or "notepad")
        #[arg(short, long, group = "target")]
        name: Option<String>,
        /// Use the first process when several match --name
        #[arg(long, requires = "name")]
        name_forced: bool,
        /// Function address (hex)
        #[arg(short, long, value_parser = parse_hex)]
        address: u64,
        #[arg(short, long, value_enum, default_value_t = Convention::Default)]
        convention: Convention,
        /// Argument value (hex), repeatable
        #[arg(long = "arg", value_parser = parse_hex)]
        args: Vec<u64>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Convention {
    Default,
    Cdecl,
    Stdcall,
    Thiscall,
    Fastcall,
    X64,
}

impl From<Convention> for CallingConvention {
    fn from(value: Convention) -> Self {
        match value {
            Convention::Default => CallingConvention::PlatformDefault,
            Convention::Cdecl => CallingConvention::CDecl,
            Convention::Stdcall => CallingConvention::StdCall,
            Convention::Thiscall => CallingConvention::ThisCall,
            Convention::Fastcall => CallingConvention::FastCall,
            Convention::X64 => CallingConvention::Architecture64,
        }
    }
}

fn parse_hex(value: &str) -> Result<u64, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|e| format!("'{}' is not a hex value: {}", value, e))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(windows)]
fn run(command: Commands) -> remotemap_core::Result<()> {
    use remotemap_core::{ManualMapper, MapFlags, RemoteCallEngine, WindowsProcess};

    match command {
        Commands::Map {
            pid,
            name,
            name_forced,
            module,
            export,
            path_resolution,
        } => {
            let target_pid = target::resolve_target(pid, name.as_deref(), name_forced)?;
            let process = WindowsProcess::open(target_pid)?;

            let mut flags = MapFlags::empty();
            if path_resolution {
                flags |= MapFlags::PATH_RESOLUTION;
            }

            let mut mapper = ManualMapper::new(&process)?;
            let mapped = mapper.map_module(&module, export.as_deref(), flags, None)?;
            print_mapped(&module, &mapped, mapper.registry().len());
        }
        Commands::Call {
            pid,
            name,
            name_forced,
            address,
            convention,
            args,
        } => {
            let target_pid = target::resolve_target(pid, name.as_deref(), name_forced)?;
            let process = WindowsProcess::open(target_pid)?;

            let result = RemoteCallEngine::new(&process).call(address, convention.into(), &args)?;
            println!("\n=== Call 0x{:X} in PID {} ===\n", address, target_pid);
            print_result(&result);
        }
    }
    Ok(())
}

#[cfg(not(windows))]
fn run(_command: Commands) -> remotemap_core::Result<()> {
    Err(remotemap_core::Error::Other(
        "Remote targets are only supported on Windows".into(),
    ))
}

#[cfg_attr(not(windows), allow(dead_code))]
fn print_mapped(module: &std::path::Path, mapped: &MappedModule, modules: usize) {
    println!("\n=== Mapped {} ===\n", module.display());
    println!("  Base: 0x{:X}", mapped.base);
    println!("  Modules mapped in session: {}", modules);
    if let Some(result) = &mapped.export_result {
        println!("\n  Export result:");
        print_result(result);
    }
}

#[cfg_attr(not(windows), allow(dead_code))]
fn print_result(result: &RemoteCallResult) {
    println!("    Primary:    0x{:X}", result.primary);
    println!("    Wide:       0x{:X}", result.wide);
    println!(
        "    Float:      {} (raw 0x{:016X})",
        result.return_f64(),
        result.float_bits
    );
    println!("    Last error: {}", result.last_error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x1F").unwrap(), 0x1F);
        assert_eq!(parse_hex("dead").unwrap(), 0xDEAD);
        assert!(parse_hex("0xZZ").is_err());
    }

    #[test]
    fn test_call_arguments() {
        let cli = Cli::try_parse_from([
            "remotemap",
            "call",
            "--pid",
            "10",
            "--address",
            "0x7FF0",
            "--convention",
            "stdcall",
            "--arg",
            "1",
            "--arg",
            "0x20",
        ])
        .unwrap();

        match cli.command {
            Commands::Call {
                pid,
                address,
                convention,
                args,
                ..
            } => {
                assert_eq!(pid, Some(10));
                assert_eq!(address, 0x7FF0);
                assert_eq!(CallingConvention::from(convention), CallingConvention::StdCall);
                assert_eq!(args, vec![1, 0x20]);
            }
            Commands::Map { .. } => panic!("expected call"),
        }
    }

    #[test]
    fn test_pid_and_name_conflict() {
        let parsed = Cli::try_parse_from([
            "remotemap", "map", "--pid", "1", "--name", "app", "--module", "a.dll",
        ]);
        assert!(parsed.is_err());
    }
}
