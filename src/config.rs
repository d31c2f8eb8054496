/// This file contains all of the logic necessary to formulate a coherent
/// Config data structure that gets passed by reference to the environment and
/// every execution unit. We use the `clap` crate and parse args here
use std::ops::Range;

use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::cover::DEFAULT_DEVICE;
use crate::err::ExecErr;
use crate::misc::{parse_num, parse_range};

// Where the orchestrator expects the input region by default
const DEFAULT_DATA_ADDR: usize = 0x2000_0000;

// Default size of the input region
const DEFAULT_DATA_SIZE: usize = 16 << 20;

// Number of entries the coverage device is configured for
const DEFAULT_COVER_SIZE: usize = 256 << 10;

// Descriptor limit we raise the process to, control pipes live at the top
pub const DEFAULT_MAX_FD: u64 = 250;

// Maximum number of concurrent execution units
pub const MAX_THREADS: usize = 32;

// First coverage descriptor, execution unit N gets `cover_fd + N`. Sits just
// below the two control pipes and the per-thread block
const DEFAULT_COVER_FD: i32 = DEFAULT_MAX_FD as i32 - 2 - MAX_THREADS as i32;

// Struct that contains all of the configurable information the executor core
// needs, replaces the process-wide globals
#[derive(Clone, Debug)]
pub struct Config {
    pub data_addr: usize,
    pub data_size: usize,
    pub cover_size: usize,
    pub cover_fd: i32,
    pub max_fd: u64,
    pub is_kernel_64_bit: bool,
    pub collect_comps: bool,
    pub collect_extra: bool,
    pub device: String,
    pub kernel_text: Option<Range<u64>>,
    pub kernel_data: Option<Range<u64>>,
    pub syscalls: Vec<usize>,
    pub iterations: usize,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_addr: DEFAULT_DATA_ADDR,
            data_size: DEFAULT_DATA_SIZE,
            cover_size: DEFAULT_COVER_SIZE,
            cover_fd: DEFAULT_COVER_FD,
            max_fd: DEFAULT_MAX_FD,
            is_kernel_64_bit: cfg!(target_pointer_width = "64"),
            collect_comps: false,
            collect_extra: false,
            device: DEFAULT_DEVICE.to_string(),
            kernel_text: None,
            kernel_data: None,
            syscalls: Vec::new(),
            iterations: 1,
            verbose: false,
        }
    }
}

fn command() -> Command {
    Command::new("covexec")
    .version("0.0.1")
    .about("Target-side executor core for a coverage-guided kernel fuzzer")
    .arg(Arg::new("data-addr")
        .long("data-addr")
        .value_name("ADDR")
        .help("Fixed address of the shared input region (0x20000000 default)"))
    .arg(Arg::new("data-size")
        .long("data-size")
        .value_name("SIZE")
        .help("Size of the shared input region in bytes (16MiB default)"))
    .arg(Arg::new("cover-size")
        .long("cover-size")
        .value_name("ENTRIES")
        .help("Number of trace entries the coverage device holds (256Ki default)"))
    .arg(Arg::new("cover-fd")
        .long("cover-fd")
        .value_name("FD")
        .help("Descriptor the first execution unit's coverage device is placed on"))
    .arg(Arg::new("max-fd")
        .long("max-fd")
        .value_name("FD")
        .help("Open descriptor limit to raise the process to (250 default)"))
    .arg(Arg::new("kernel-32bit")
        .long("kernel-32bit")
        .help("Target kernel is built with 32-bit trace entries")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("collect-comps")
        .long("collect-comps")
        .help("Arm the coverage device in comparison-trace mode")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("collect-extra")
        .long("collect-extra")
        .help("Request extra (remote) coverage from the device")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("device")
        .long("device")
        .value_name("PATH")
        .help("Path of the coverage character device"))
    .arg(Arg::new("kernel-text")
        .long("kernel-text")
        .value_name("START-END")
        .help("Kernel text range, enables range based PC classification"))
    .arg(Arg::new("kernel-data")
        .long("kernel-data")
        .value_name("START-END")
        .help("Kernel data range, enables range based operand classification"))
    .arg(Arg::new("syscall")
        .long("syscall")
        .value_name("NR")
        .help("Raw call number to execute with zeroed arguments (repeatable)")
        .action(ArgAction::Append))
    .arg(Arg::new("iterations")
        .long("iterations")
        .value_name("COUNT")
        .help("Number of times the program is executed (1 default)"))
    .arg(Arg::new("verbose")
        .long("verbose")
        .help("Print per-call results of every run")
        .action(ArgAction::SetTrue))
}

// Parse an optional numeric argument, keep the default when it's absent
fn num_arg(matches: &ArgMatches, name: &str, default: usize) -> Result<usize, ExecErr> {
    match matches.get_one::<String>(name) {
        None => Ok(default),
        Some(str_repr) => parse_num(str_repr)
            .map_err(|_| ExecErr::from(&format!("Invalid --{} value", name))),
    }
}

fn range_arg(matches: &ArgMatches, name: &str) -> Result<Option<Range<u64>>, ExecErr> {
    match matches.get_one::<String>(name) {
        None => Ok(None),
        Some(str_repr) => parse_range(str_repr)
            .map(Some)
            .map_err(|_| ExecErr::from(&format!("Invalid --{} value", name))),
    }
}

pub fn from_matches(matches: &ArgMatches) -> Result<Config, ExecErr> {
    let defaults = Config::default();

    let data_addr = num_arg(matches, "data-addr", defaults.data_addr)?;
    let data_size = num_arg(matches, "data-size", defaults.data_size)?;
    if data_size == 0 {
        return Err(ExecErr::from("Invalid --data-size value"));
    }

    let cover_size = num_arg(matches, "cover-size", defaults.cover_size)?;
    if cover_size < 2 {
        return Err(ExecErr::from("Invalid --cover-size value"));
    }

    let max_fd = num_arg(matches, "max-fd", defaults.max_fd as usize)? as u64;
    let cover_fd = num_arg(matches, "cover-fd", defaults.cover_fd as usize)?;

    // Every execution unit's descriptor has to fit under the limit
    match cover_fd.checked_add(MAX_THREADS) {
        Some(last_fd) if last_fd as u64 <= max_fd => (),
        _ => return Err(ExecErr::from("Invalid --cover-fd value, exceeds --max-fd")),
    }

    // Has to be a real descriptor number, never wrapped onto a low one
    let Ok(cover_fd) = i32::try_from(cover_fd) else {
        return Err(ExecErr::from("Invalid --cover-fd value, not a descriptor"));
    };

    let iterations = num_arg(matches, "iterations", defaults.iterations)?;

    // Collect the raw calls, an empty program is fine
    let mut syscalls = Vec::new();
    if let Some(values) = matches.get_many::<String>("syscall") {
        for str_repr in values {
            let Ok(nr) = parse_num(str_repr) else {
                return Err(ExecErr::from("Invalid --syscall value"));
            };

            syscalls.push(nr);
        }
    }

    let device = matches
        .get_one::<String>("device")
        .cloned()
        .unwrap_or(defaults.device);

    Ok(Config {
        data_addr,
        data_size,
        cover_size,
        cover_fd,
        max_fd,
        is_kernel_64_bit: !matches.get_flag("kernel-32bit"),
        collect_comps: matches.get_flag("collect-comps"),
        collect_extra: matches.get_flag("collect-extra"),
        device,
        kernel_text: range_arg(matches, "kernel-text")?,
        kernel_data: range_arg(matches, "kernel-data")?,
        syscalls,
        iterations,
        verbose: matches.get_flag("verbose"),
    })
}

pub fn parse_args() -> Result<Config, ExecErr> {
    from_matches(&command().get_matches())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ExecErr> {
        let mut argv = vec!["covexec"];
        argv.extend_from_slice(args);
        let matches = command()
            .try_get_matches_from(argv)
            .map_err(|e| ExecErr::from(&e.to_string()))?;
        from_matches(&matches)
    }

    #[test]
    fn defaults_fit_under_the_descriptor_limit() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.data_addr, DEFAULT_DATA_ADDR);
        assert_eq!(config.data_size, DEFAULT_DATA_SIZE);
        assert_eq!(config.cover_fd, 216);
        assert!((config.cover_fd as u64) + MAX_THREADS as u64 <= config.max_fd);
        assert!(config.syscalls.is_empty());
        assert_eq!(config.iterations, 1);
    }

    #[test]
    fn explicit_values_are_honored() {
        let config = parse(&[
            "--data-addr", "0x30000000",
            "--data-size", "0x2000",
            "--kernel-32bit",
            "--collect-comps",
            "--syscall", "20",
            "--syscall", "0x27",
            "--kernel-text", "0xffff0000-0xffff8000",
        ]).unwrap();

        assert_eq!(config.data_addr, 0x3000_0000);
        assert_eq!(config.data_size, 0x2000);
        assert!(!config.is_kernel_64_bit);
        assert!(config.collect_comps);
        assert_eq!(config.syscalls, vec![20, 0x27]);
        assert_eq!(config.kernel_text, Some(0xffff_0000..0xffff_8000));
        assert_eq!(config.kernel_data, None);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(parse(&["--data-size", "0"]).is_err());
        assert!(parse(&["--cover-size", "nope"]).is_err());
        assert!(parse(&["--cover-fd", "240"]).is_err());
        assert!(parse(&["--kernel-data", "0x10-0x8"]).is_err());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn huge_descriptors_are_errors_not_panics() {
        // Would overflow when the unit range is added on
        let err = parse(&["--cover-fd", "18446744073709551615", "--max-fd", "100"]).unwrap_err();
        assert!(err.message().contains("exceeds --max-fd"));

        // Fits under the limit but would wrap to fd 0 as an i32
        let err = parse(&[
            "--cover-fd", "4294967296",
            "--max-fd", "18446744073709551615",
        ]).unwrap_err();
        assert!(err.message().contains("not a descriptor"));

        let config = parse(&["--cover-fd", "1000", "--max-fd", "1032"]).unwrap();
        assert_eq!(config.cover_fd, 1000);
    }
}
