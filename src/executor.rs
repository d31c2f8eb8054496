//! This file contains the execution unit: one coverage buffer, one device
//! handle, and the unprotect -> reset -> dispatch -> collect -> protect cycle
//! that turns a program into a trace. Each unit lives on its own thread or
//! process and never shares its buffer with another unit.
use std::os::unix::io::RawFd;

use chrono::{DateTime, Local, TimeDelta};

use crate::classify::{self, AddressClassifier};
use crate::config::{Config, MAX_THREADS};
use crate::cover::{open_kcov, Cover, CoverDevice, CoverMode, EntryWidth, KcovDevice};
use crate::dispatch::{execute_syscall, CallDescriptor};
use crate::env::Environment;
use crate::err::ExecErr;
use crate::prompt;
use crate::trace::{Comparison, TraceView};

/// One call of a program, its arguments sit in the shared input region
#[derive(Clone, Copy, Debug)]
pub struct ProgramCall {
    pub call: CallDescriptor,
    pub args_offset: usize,
}

#[derive(Clone, Debug)]
pub struct CallResult {
    pub name: &'static str,
    pub result: isize,
}

/// Everything one program execution produced
#[derive(Clone, Debug)]
pub struct RunReport {
    pub results: Vec<CallResult>,
    pub cover_size: usize,         // Raw entry count from the header
    pub signals: Vec<u64>,         // PC mode only
    pub comps: Vec<Comparison>,    // Comparison mode only
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
}

impl RunReport {
    pub fn elapsed(&self) -> TimeDelta {
        self.finished - self.started
    }
}

// Descriptor execution unit `unit_id` puts its coverage device on
pub fn unit_cover_fd(config: &Config, unit_id: usize) -> Result<RawFd, ExecErr> {
    if unit_id >= MAX_THREADS {
        return Err(ExecErr::from(&format!(
            "execution unit {} exceeds the {} unit limit", unit_id, MAX_THREADS)));
    }

    Ok(config.cover_fd + unit_id as RawFd)
}

pub struct Executor<D: CoverDevice> {
    unit_id: usize,
    cover: Cover<D>,
    classifier: Box<dyn AddressClassifier + Send + Sync>,
    verbose: bool,
}

impl Executor<KcovDevice> {
    /// Open the configured kernel coverage device for `unit_id`
    pub fn open(config: &Config, unit_id: usize) -> Result<Self, ExecErr> {
        let cover = open_kcov(
            &config.device,
            unit_cover_fd(config, unit_id)?,
            config.cover_size,
            EntryWidth::from_kernel(config.is_kernel_64_bit),
            config.collect_extra,
        )?;

        Executor::new(cover, config, unit_id)
    }
}

impl<D: CoverDevice> Executor<D> {
    /// Map, guard and arm an opened buffer
    pub fn new(mut cover: Cover<D>, config: &Config, unit_id: usize) -> Result<Self, ExecErr> {
        unit_cover_fd(config, unit_id)?;

        cover.map()?;
        cover.protect()?;
        cover.enable(config.collect_comps, config.collect_extra)?;

        Ok(Executor {
            unit_id,
            cover,
            classifier: classify::from_config(config),
            verbose: config.verbose,
        })
    }

    pub fn unit_id(&self) -> usize {
        self.unit_id
    }

    pub fn cover(&self) -> &Cover<D> {
        &self.cover
    }

    /// Execute `program` with a fresh trace and report what it did
    ///
    /// # Safety
    ///
    /// Every call is executed as-is, see `execute_syscall`
    pub unsafe fn run(
        &mut self,
        env: &Environment,
        program: &[ProgramCall],
    ) -> Result<RunReport, ExecErr> {
        // Pull every argument vector before the trace window opens
        let mut calls = Vec::with_capacity(program.len());
        for entry in program {
            calls.push((entry.call, env.args_at(entry.args_offset)?));
        }

        // The trace is only writable while the program runs
        let started = Local::now();
        self.cover.unprotect()?;
        self.cover.reset()?;

        let mut results = Vec::with_capacity(calls.len());
        for (call, args) in calls.iter() {
            let result = execute_syscall(call, args);
            results.push(CallResult { name: call.name(), result });
        }

        let cover_size = self.cover.collect()?;
        self.cover.protect()?;
        let finished = Local::now();

        let view = TraceView::new(&self.cover)?;
        let (signals, comps) = match self.cover.mode() {
            Some(CoverMode::TraceCmp) => (Vec::new(), view.comparisons(self.classifier.as_ref())),
            _ => (view.signals(self.classifier.as_ref()), Vec::new()),
        };

        if self.verbose {
            for res in results.iter() {
                prompt!("unit {} {} = {}", self.unit_id, res.name, res.result);
            }
        }

        Ok(RunReport {
            results,
            cover_size,
            signals,
            comps,
            started,
            finished,
        })
    }

    /// Drop the page guard for good, the buffer is fully writable again
    pub fn release(&mut self) -> Result<(), ExecErr> {
        self.cover.unprotect()
    }
}
