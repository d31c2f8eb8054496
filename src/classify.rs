//! This file contains the address classification policy the reporting layer
//! consults after a collect. Every platform port brings its own answers, the
//! rest of the executor only talks to the trait
use std::ops::Range;

use crate::config::Config;

/// What we know about where a PC came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcKind {
    Kernel,
    User,
    Unknown,
}

pub trait AddressClassifier {
    /// Is `addr` inside the kernel's data segment, comparison operands that
    /// are kernel pointers aren't interesting input
    fn is_kernel_data(&self, addr: u64) -> bool;

    fn is_kernel_pc(&self, pc: u64) -> PcKind;

    /// Fold `pc` into an edge with the previous PC instead of reporting it
    /// bare
    fn use_cover_edges(&self, pc: u64) -> bool;
}

/// CheriBSD has no symbol or segment information to go on: nothing counts as
/// kernel data, PCs are unknown, everything becomes an edge
#[derive(Clone, Copy, Debug, Default)]
pub struct CheriBsdClassifier;

impl AddressClassifier for CheriBsdClassifier {
    fn is_kernel_data(&self, _addr: u64) -> bool {
        false
    }

    fn is_kernel_pc(&self, _pc: u64) -> PcKind {
        PcKind::Unknown
    }

    fn use_cover_edges(&self, _pc: u64) -> bool {
        true
    }
}

/// For ports that know where kernel text and data live
#[derive(Clone, Debug)]
pub struct RangeClassifier {
    text: Range<u64>,
    data: Option<Range<u64>>,
}

impl RangeClassifier {
    pub fn new(text: Range<u64>, data: Option<Range<u64>>) -> Self {
        RangeClassifier { text, data }
    }
}

impl AddressClassifier for RangeClassifier {
    fn is_kernel_data(&self, addr: u64) -> bool {
        self.data.as_ref().is_some_and(|data| data.contains(&addr))
    }

    fn is_kernel_pc(&self, pc: u64) -> PcKind {
        if self.text.contains(&pc) {
            PcKind::Kernel
        } else {
            PcKind::User
        }
    }

    // Only kernel code gets edges, anything else is noise from the target
    fn use_cover_edges(&self, pc: u64) -> bool {
        self.is_kernel_pc(pc) == PcKind::Kernel
    }
}

/// Pick the classifier the configuration asks for
pub fn from_config(config: &Config) -> Box<dyn AddressClassifier + Send + Sync> {
    match &config.kernel_text {
        Some(text) => Box::new(RangeClassifier::new(text.clone(), config.kernel_data.clone())),
        None => Box::new(CheriBsdClassifier),
    }
}
