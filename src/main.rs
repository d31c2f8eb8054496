/// This file contains the `main` program logic which prepares the executor
/// environment, arms one execution unit's coverage buffer and runs the
/// configured raw calls through it

use covexec::config::parse_args;
use covexec::dispatch::{CallDescriptor, MAX_ARGS};
use covexec::env::Environment;
use covexec::executor::{Executor, ProgramCall};
use covexec::{fatal, prompt, prompt_warn};

fn main() {
    // Parse the command line
    let config = parse_args().unwrap_or_else(|error| {
        fatal!(error);
    });

    // Process-wide setup happens exactly once, before any unit starts
    prompt!("Mapping input region @ 0x{:X} - 0x{:X}",
        config.data_addr, config.data_addr + config.data_size);
    let mut env = Environment::new(&config);
    env.initialize(config.data_addr, config.data_size).unwrap_or_else(|error| {
        fatal!(error);
    });
    prompt!("Descriptor limit raised to {}", config.max_fd);

    // All calls read the same zeroed argument vector at the region start
    let zero_args = [0u8; MAX_ARGS * std::mem::size_of::<isize>()];
    env.write_input(0, &zero_args).unwrap_or_else(|error| {
        fatal!(error);
    });

    let program: Vec<ProgramCall> = config.syscalls.iter().map(|&nr| ProgramCall {
        call: CallDescriptor::raw("raw", nr),
        args_offset: 0,
    }).collect();

    if program.is_empty() {
        prompt_warn!("No --syscall given, running an empty program");
    }

    // Bring up the coverage buffer for unit 0
    prompt!("Opening coverage device '{}'...", config.device);
    let mut executor = Executor::open(&config, 0).unwrap_or_else(|error| {
        fatal!(error);
    });

    let cover = executor.cover();
    prompt!("Coverage fd {} mapped, 0x{:X} bytes, data offset {}, {:?} mode",
        cover.fd(), cover.mmap_alloc_size(), cover.data_offset(), cover.mode());

    for iteration in 0..config.iterations {
        let report = unsafe { executor.run(&env, &program) }.unwrap_or_else(|error| {
            fatal!(error);
        });

        prompt!("[{}] run {}: {} entries, {} signals, {} comparisons in {}us",
            report.started.format("%H:%M:%S%.3f"),
            iteration,
            report.cover_size,
            report.signals.len(),
            report.comps.len(),
            report.elapsed().num_microseconds().unwrap_or(i64::MAX));
    }

    executor.release().unwrap_or_else(|error| {
        fatal!(error);
    });

    prompt!("Done");
}
