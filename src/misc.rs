/// This file contains miscellaneous helper functions and the console macros
/// used everywhere else

use crate::err::ExecErr;

#[macro_export]
macro_rules! prompt {
    () => ({
        print!("\x1b[1;35m\u{2726}covexec\u{2726}\x1b[0m\n");
    });
    ($($arg:tt)*) => ({
        print!("\x1b[1;35m\u{2726}covexec\u{2726}\x1b[0m ");
        println!($($arg)*);
    });
}

#[macro_export]
macro_rules! prompt_warn {
    () => ({
        print!("\x1b[1;33m\u{2726}covexec\u{2726}\x1b[0m\n");
    });
    ($($arg:tt)*) => ({
        print!("\x1b[1;33m\u{2726}covexec\u{2726}\x1b[0m ");
        println!($($arg)*);
    });
}

#[macro_export]
macro_rules! fatal {
    ($err:expr) => {
        {
            print!("\n\x1b[1;31mfatal:\x1b[0m ");
            $err.display();
            std::process::exit(-1);
        }
    };
}

// Fallback if sysconf can't tell us
const DEFAULT_PAGE_SIZE: usize = 0x1000;

// Ask the OS for the page size, `sysconf` returns -1 on failure
pub fn page_size() -> usize {
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if result <= 0 {
        return DEFAULT_PAGE_SIZE;
    }

    result as usize
}

// Parse a number that is either decimal or `0x` prefixed hex
pub fn parse_num(value: &str) -> Result<usize, ExecErr> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => value.parse::<usize>(),
    };

    parsed.map_err(|_| ExecErr::from(&format!("Invalid numeric value '{}'", value)))
}

// Parse a `START-END` address range, both ends in `parse_num` format
pub fn parse_range(value: &str) -> Result<std::ops::Range<u64>, ExecErr> {
    let Some((start, end)) = value.split_once('-') else {
        return Err(ExecErr::from(&format!("Invalid range '{}'", value)));
    };

    let start = parse_num(start)? as u64;
    let end = parse_num(end)? as u64;
    if start >= end {
        return Err(ExecErr::from(&format!("Empty range '{}'", value)));
    }

    Ok(start..end)
}
