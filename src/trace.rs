//! This file contains the logic for turning a harvested coverage buffer into
//! something the reporting layer can ship upstream: raw PCs, edge signals, or
//! comparison operands. Decoding only ever looks at the entries the last
//! collect reported and never past the end of the mapping, no matter what
//! count the kernel left in the header.
use std::collections::HashSet;

use crate::classify::AddressClassifier;
use crate::cover::{Cover, CoverDevice, EntryWidth};
use crate::err::ExecErr;

// Comparison records are four 64-bit words after a 64-bit count
const CMP_HEADER_SIZE: usize = std::mem::size_of::<u64>();
const CMP_RECORD_SIZE: usize = 4 * std::mem::size_of::<u64>();

// Comparison type bits
const CMP_CONST: u64 = 1;
const CMP_SIZE_SHIFT: u64 = 1;
const CMP_SIZE_MASK: u64 = 3;

/// One comparison the target performed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Comparison {
    pub size: usize,      // Operand size in bytes
    pub is_const: bool,   // One operand was a compile time constant
    pub arg1: u64,
    pub arg2: u64,
    pub pc: u64,
}

// Integer scrambler for the previous PC, keeps edges A->B and B->A apart
#[inline]
fn hash(pc: u64) -> u64 {
    let mut a = pc as u32;
    a = (a ^ 61) ^ (a >> 16);
    a = a.wrapping_add(a << 3);
    a ^= a >> 4;
    a = a.wrapping_mul(0x27d4_eb2d);
    a ^= a >> 15;
    a as u64
}

/// Borrowed view over a collected buffer
pub struct TraceView<'a> {
    data: &'a [u8],
    width: EntryWidth,
    data_offset: usize,
    pc_offset: u64,
    count: usize,
}

impl<'a> TraceView<'a> {
    /// View the entries of the last `collect` on `cover`
    pub fn new<D: CoverDevice>(cover: &'a Cover<D>) -> Result<Self, ExecErr> {
        let Some(data) = cover.data() else {
            return Err(ExecErr::from("trace decode invoked on an unmapped buffer"));
        };

        Ok(TraceView {
            data,
            width: cover.width(),
            data_offset: cover.data_offset(),
            pc_offset: cover.pc_offset(),
            count: cover.size(),
        })
    }

    /// Number of PC entries that actually fit in the mapping
    pub fn capacity(&self) -> usize {
        self.data.len().saturating_sub(self.data_offset) / self.width.bytes()
    }

    /// Entry count clamped to what the mapping can hold
    pub fn len(&self) -> usize {
        self.count.min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, idx: usize) -> u64 {
        let start = self.data_offset + idx * self.width.bytes();
        let bytes = &self.data[start..start + self.width.bytes()];

        match self.width {
            EntryWidth::U64 => {
                let mut word = [0u8; 8];
                word.copy_from_slice(bytes);
                u64::from_ne_bytes(word)
            }
            EntryWidth::U32 => {
                let mut word = [0u8; 4];
                word.copy_from_slice(bytes);
                u32::from_ne_bytes(word) as u64
            }
        }
    }

    /// Raw PCs in execution order
    pub fn pcs(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len()).map(move |idx| self.entry(idx).wrapping_add(self.pc_offset))
    }

    /// Unique signal values in order of first appearance. PCs the classifier
    /// wants as edges are mixed with the previous PC
    pub fn signals(&self, classifier: &dyn AddressClassifier) -> Vec<u64> {
        let mut seen = HashSet::new();
        let mut signals = Vec::new();
        let mut prev_pc = 0;

        for pc in self.pcs() {
            let mut sig = pc;
            if classifier.use_cover_edges(pc) {
                sig ^= hash(prev_pc);
            }
            prev_pc = pc;

            if seen.insert(sig) {
                signals.push(sig);
            }
        }

        signals
    }

    /// Decode the buffer as comparison records. Equal operands and pairs of
    /// kernel pointers say nothing about the input and are dropped
    pub fn comparisons(&self, classifier: &dyn AddressClassifier) -> Vec<Comparison> {
        let fit = self.data.len().saturating_sub(CMP_HEADER_SIZE) / CMP_RECORD_SIZE;
        let mut seen = HashSet::new();
        let mut comps = Vec::new();

        for idx in 0..self.count.min(fit) {
            let start = CMP_HEADER_SIZE + idx * CMP_RECORD_SIZE;
            let mut words = [0u64; 4];
            for (i, word) in words.iter_mut().enumerate() {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.data[start + i * 8..start + i * 8 + 8]);
                *word = u64::from_ne_bytes(raw);
            }

            let [kind, arg1, arg2, pc] = words;
            let size = 1usize << ((kind >> CMP_SIZE_SHIFT) & CMP_SIZE_MASK);
            let mask = if size == 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 };
            let (arg1, arg2) = (arg1 & mask, arg2 & mask);

            if arg1 == arg2 {
                continue;
            }

            if classifier.is_kernel_data(arg1) && classifier.is_kernel_data(arg2) {
                continue;
            }

            let comp = Comparison {
                size,
                is_const: kind & CMP_CONST != 0,
                arg1,
                arg2,
                pc: pc.wrapping_add(self.pc_offset),
            };

            if seen.insert(comp) {
                comps.push(comp);
            }
        }

        comps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{CheriBsdClassifier, RangeClassifier};
    use crate::cover::fake::{self, FakeDevice};

    const TEST_COVER_SIZE: usize = 1024;

    fn armed(width: EntryWidth, collect_comps: bool) -> Cover<FakeDevice> {
        let mut cover = Cover::open(
            FakeDevice::new(200, width), TEST_COVER_SIZE, width, false).unwrap();
        cover.map().unwrap();
        cover.enable(collect_comps, false).unwrap();
        cover.reset().unwrap();
        cover
    }

    #[test]
    fn pcs_come_back_in_order() {
        for width in [EntryWidth::U32, EntryWidth::U64] {
            let mut cover = armed(width, false);
            for pc in [0x1000, 0x2000, 0x1000] {
                fake::trace_pc(pc);
            }
            cover.collect().unwrap();

            let view = TraceView::new(&cover).unwrap();
            assert_eq!(view.pcs().collect::<Vec<_>>(), vec![0x1000, 0x2000, 0x1000]);
        }
    }

    #[test]
    fn edges_depend_on_direction() {
        let mut cover = armed(EntryWidth::U64, false);
        for pc in [0x1000, 0x2000, 0x1000, 0x2000] {
            fake::trace_pc(pc);
        }
        cover.collect().unwrap();

        let view = TraceView::new(&cover).unwrap();
        let signals = view.signals(&CheriBsdClassifier);

        // 0->A, A->B, B->A, then A->B again is a duplicate
        assert_eq!(signals.len(), 3);
        assert_eq!(signals[0], 0x1000 ^ hash(0));
        assert_eq!(signals[1], 0x2000 ^ hash(0x1000));
        assert_eq!(signals[2], 0x1000 ^ hash(0x2000));
    }

    #[test]
    fn bare_pcs_when_edges_are_off() {
        let mut cover = armed(EntryWidth::U64, false);
        for pc in [0x100, 0x200, 0x100] {
            fake::trace_pc(pc);
        }
        cover.collect().unwrap();

        // Nothing is in the kernel text range, so no edges
        let classifier = RangeClassifier::new(0xffff_0000..0xffff_ffff, None);
        let view = TraceView::new(&cover).unwrap();
        assert_eq!(view.signals(&classifier), vec![0x100, 0x200]);
    }

    #[test]
    fn signals_keep_the_full_kernel_address() {
        let mut cover = armed(EntryWidth::U64, false);
        for pc in [0xffff_8000_0000_1000, 0xffff_8000_0000_2000] {
            fake::trace_pc(pc);
        }
        cover.collect().unwrap();

        // Edges only mix the low word of the previous PC, the high half
        // of the current one survives untouched
        let view = TraceView::new(&cover).unwrap();
        let signals = view.signals(&CheriBsdClassifier);
        assert_eq!(signals[1], 0xffff_8000_0000_2000 ^ hash(0xffff_8000_0000_1000));
        assert_eq!(signals[1] >> 32, 0xffff_8000);
        assert_eq!(hash(0xffff_8000_0000_1000), hash(0x1000));
    }

    #[test]
    fn bogus_count_is_clamped_to_the_mapping() {
        let mut cover = armed(EntryWidth::U64, false);
        fake::trace_pc(0x1000);

        // Pretend the kernel scribbled a huge count into the header
        let header = cover.data().unwrap().as_ptr() as *mut u64;
        unsafe { header.write_volatile(u64::MAX >> 1) };
        cover.collect().unwrap();

        let view = TraceView::new(&cover).unwrap();
        assert_eq!(view.len(), view.capacity());
        assert_eq!(view.capacity(), TEST_COVER_SIZE - 1);
        assert_eq!(view.pcs().count(), view.capacity());
        assert!(view.comparisons(&CheriBsdClassifier).len() <= TEST_COVER_SIZE / 4);
    }

    #[test]
    fn comparisons_are_masked_and_filtered() {
        let mut cover = armed(EntryWidth::U64, true);

        // 2-byte constant comparison, upper bits must go
        fake::trace_cmp((1 << 1) | 1, 0xdead_0041, 0x42, 0x10);
        // Equal operands
        fake::trace_cmp(3 << 1, 7, 7, 0x20);
        // Two kernel pointers
        fake::trace_cmp(3 << 1, 0x9000_0010, 0x9000_0020, 0x30);
        // Duplicate of the first
        fake::trace_cmp((1 << 1) | 1, 0x41, 0x42, 0x10);
        assert_eq!(cover.collect().unwrap(), 4);

        let classifier = RangeClassifier::new(0x0..0x1000, Some(0x9000_0000..0xa000_0000));
        let view = TraceView::new(&cover).unwrap();
        let comps = view.comparisons(&classifier);

        assert_eq!(comps, vec![Comparison {
            size: 2,
            is_const: true,
            arg1: 0x41,
            arg2: 0x42,
            pc: 0x10,
        }]);

        // Without data ranges the kernel pointer pair survives
        assert_eq!(view.comparisons(&CheriBsdClassifier).len(), 2);
    }

    #[test]
    fn unmapped_buffers_cannot_be_viewed() {
        let cover = Cover::open(
            FakeDevice::new(200, EntryWidth::U64), TEST_COVER_SIZE, EntryWidth::U64, false)
            .unwrap();
        assert!(TraceView::new(&cover).is_err());
    }
}
