use std::collections::VecDeque;

use crate::core::Clocked;
use crate::instructions::{BranchOutcome, Fid, InflightOp, WordType};

pub(crate) struct RobEntry {
    pub(crate) op: InflightOp,
    pub(crate) ready: bool,
    pub(crate) value: Option<WordType>,
    pub(crate) branch: Option<BranchOutcome>,
}

/// The reorder buffer: a strict FIFO of in-flight instructions in fetch
/// order. Writebacks arrive out of order and mark entries ready; only the
/// head may retire, and only once ready. A second writeback for the same
/// fid is a protocol violation and fatal.
pub(crate) struct ReorderBuffer {
    capacity: u16,
    slots: VecDeque<RobEntry>,
    staged_push: Vec<InflightOp>,
    staged_writeback: Vec<(Fid, Option<WordType>, Option<BranchOutcome>)>,
}

impl ReorderBuffer {
    pub(crate) fn new(capacity: u16) -> ReorderBuffer {
        ReorderBuffer {
            capacity,
            slots: VecDeque::with_capacity(capacity as usize),
            staged_push: Vec::new(),
            staged_writeback: Vec::new(),
        }
    }

    pub(crate) fn size(&self) -> u16 {
        (self.slots.len() + self.staged_push.len()) as u16
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.staged_push.is_empty()
    }

    pub(crate) fn has_space(&self) -> bool {
        self.size() < self.capacity
    }

    /// Appends a freshly renamed instruction at the tail, not ready.
    pub(crate) fn touch(&mut self, op: InflightOp) {
        assert!(self.has_space(), "ROB: touch without space");
        self.staged_push.push(op);
    }

    /// Stages the out-of-order completion of `fid`.
    pub(crate) fn writeback(&mut self, fid: Fid, value: Option<WordType>, branch: Option<BranchOutcome>) {
        self.staged_writeback.push((fid, value, branch));
    }

    pub(crate) fn head_ready(&self) -> bool {
        self.slots.front().map(|e| e.ready).unwrap_or(false)
    }

    /// Pops the head entry. The caller must have checked `head_ready`;
    /// retiring a missing or non-ready head is fatal.
    pub(crate) fn commit_head(&mut self) -> RobEntry {
        let entry = self.slots.pop_front().expect("ROB: commit on empty buffer");
        assert!(entry.ready, "ROB: commit of non-ready head {}", entry.op);
        entry
    }

    /// The completed value of an entry still in the buffer; used for
    /// capture of sources whose producer sits in the ROB.
    pub(crate) fn value_of(&self, fid: Fid) -> WordType {
        let entry = self
            .slots
            .iter()
            .find(|e| e.op.fid == fid)
            .unwrap_or_else(|| panic!("ROB: no entry for fid {}", fid));
        entry
            .value
            .unwrap_or_else(|| panic!("ROB: fid {} has no value yet", fid))
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &RobEntry> {
        self.slots.iter()
    }

    pub(crate) fn flush(&mut self) {
        self.slots.clear();
        self.staged_push.clear();
        self.staged_writeback.clear();
    }

    pub(crate) fn dump(&self) {
        for e in &self.slots {
            println!("  rob {} ready={} value={:?}", e.op, e.ready, e.value);
        }
    }
}

impl Clocked for ReorderBuffer {
    fn commit(&mut self) {
        for op in self.staged_push.drain(..) {
            self.slots.push_back(RobEntry {
                op,
                ready: false,
                value: None,
                branch: None,
            });
        }

        for (fid, value, branch) in self.staged_writeback.drain(..) {
            let entry = self
                .slots
                .iter_mut()
                .find(|e| e.op.fid == fid)
                .unwrap_or_else(|| panic!("ROB: writeback for unknown fid {}", fid));
            assert!(
                !entry.ready,
                "ROB: duplicate writeback for fid {} ({})",
                fid, entry.op
            );
            entry.ready = true;
            entry.value = value;
            entry.branch = branch;
        }
    }
}
