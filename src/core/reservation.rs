use crate::core::Clocked;
use crate::instructions::{Fid, InflightOp, RegisterType, SrcOperand, WordType, MAX_SOURCE_COUNT};

/// A reservation entry: a renamed instruction plus its readiness flags.
/// Ready means both sources captured and the destination slot writable.
pub(crate) struct RqEntry {
    pub(crate) op: InflightOp,
    pub(crate) src_ready: [bool; MAX_SOURCE_COUNT as usize],
    pub(crate) dst_ready: bool,
}

impl RqEntry {
    pub(crate) fn ready(&self) -> bool {
        self.src_ready.iter().all(|&r| r) && self.dst_ready
    }
}

/// The age-ordered reservation queue. Instructions enter at the tail in
/// fetch order and leave when selected for issue; the oldest ready entry
/// is selected each cycle. Readiness flags, once set, are frozen until the
/// entry leaves the queue.
pub(crate) struct ReservationQueue {
    capacity: u16,
    entries: Vec<RqEntry>,
    staged_push: Vec<InflightOp>,
    // cached oldest-ready position; reset every cycle so that repeated
    // pop_ready calls within one cycle return the same entry
    next_ready: Option<usize>,
}

impl ReservationQueue {
    pub(crate) fn new(capacity: u16) -> ReservationQueue {
        ReservationQueue {
            capacity,
            entries: Vec::with_capacity(capacity as usize),
            staged_push: Vec::new(),
            next_ready: None,
        }
    }

    pub(crate) fn size(&self) -> u16 {
        (self.entries.len() + self.staged_push.len()) as u16
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.staged_push.is_empty()
    }

    pub(crate) fn has_space(&self) -> bool {
        self.size() < self.capacity
    }

    pub(crate) fn push(&mut self, op: InflightOp) -> bool {
        if !self.has_space() {
            return false;
        }
        self.staged_push.push(op);
        true
    }

    /// Returns the oldest entry with all readiness flags set, without
    /// removing it. Repeated calls within one cycle return the same entry
    /// until `remove_ready` is invoked, so at most one instruction is
    /// issued per selection and issue order is program order among ready
    /// instructions.
    pub(crate) fn pop_ready(&mut self) -> Option<&RqEntry> {
        if self.next_ready.is_none() {
            self.next_ready = self.entries.iter().position(|e| e.ready());
        }
        match self.next_ready {
            Some(index) => Some(&self.entries[index]),
            None => None,
        }
    }

    pub(crate) fn remove_ready(&mut self) -> InflightOp {
        let index = self
            .next_ready
            .take()
            .expect("reservation queue: remove_ready without a selected entry");
        self.entries.remove(index).op
    }

    /// Re-evaluates the flags of every not-yet-ready entry. `resolve`
    /// yields the value of a pending source once its producer allows
    /// capture, `arch_read` reads a source with no in-flight producer, and
    /// `dst_free` tells whether the destination slot is writable for the
    /// given fid. Flags only ever go from false to true.
    pub(crate) fn update_ready<F, A, G>(&mut self, mut resolve: F, mut arch_read: A, mut dst_free: G)
    where
        F: FnMut(RegisterType, RegisterType) -> Option<WordType>,
        A: FnMut(RegisterType) -> WordType,
        G: FnMut(RegisterType, Fid) -> bool,
    {
        for entry in &mut self.entries {
            for i in 0..MAX_SOURCE_COUNT as usize {
                if entry.src_ready[i] {
                    continue;
                }
                match entry.op.src[i] {
                    SrcOperand::Pending { slot, arch } => {
                        if let Some(value) = resolve(slot, arch) {
                            entry.op.src[i] = SrcOperand::Value(value);
                            entry.src_ready[i] = true;
                        }
                    }
                    SrcOperand::Arch { arch } => {
                        entry.op.src[i] = SrcOperand::Value(arch_read(arch));
                        entry.src_ready[i] = true;
                    }
                    SrcOperand::Value(_) | SrcOperand::Unused => {
                        entry.src_ready[i] = true;
                    }
                }
            }
            if !entry.dst_ready {
                entry.dst_ready = match entry.op.dst {
                    None => true,
                    Some(d) => dst_free(d.slot, entry.op.fid),
                };
            }
        }
    }

    pub(crate) fn flush(&mut self) {
        self.entries.clear();
        self.staged_push.clear();
        self.next_ready = None;
    }

    pub(crate) fn entries(&self) -> &[RqEntry] {
        &self.entries
    }

    pub(crate) fn dump(&self) {
        for e in &self.entries {
            println!(
                "  rq {} src_ready={:?} dst_ready={}",
                e.op, e.src_ready, e.dst_ready
            );
        }
    }
}

impl Clocked for ReservationQueue {
    fn commit(&mut self) {
        for op in self.staged_push.drain(..) {
            self.entries.push(RqEntry {
                op,
                src_ready: [false; MAX_SOURCE_COUNT as usize],
                dst_ready: false,
            });
        }
        self.next_ready = None;
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::instructions::{create_nop, DstSlot, Opcode, Operand};

    fn op(fid: Fid, src_slot: Option<RegisterType>, dst_slot: Option<RegisterType>) -> InflightOp {
        let mut instr = create_nop(1);
        let mut src = [SrcOperand::Unused, SrcOperand::Unused];
        if let Some(s) = src_slot {
            instr.opcode = Opcode::MOV;
            instr.source_cnt = 1;
            instr.source[0] = Operand::Register(s);
            src[0] = SrcOperand::Pending { slot: s, arch: s };
        }
        InflightOp {
            fid,
            pc: fid as usize,
            instr: Rc::new(instr),
            src,
            dst: dst_slot.map(|d| DstSlot { arch: d, slot: d }),
            fgr: None,
        }
    }

    #[test]
    fn test_push_is_staged_until_commit() {
        let mut rq = ReservationQueue::new(4);
        assert!(rq.push(op(0, None, None)));
        assert_eq!(rq.entries().len(), 0);
        assert_eq!(rq.size(), 1);
        rq.commit();
        assert_eq!(rq.entries().len(), 1);
    }

    #[test]
    fn test_capacity_back_pressure() {
        let mut rq = ReservationQueue::new(2);
        assert!(rq.push(op(0, None, None)));
        assert!(rq.push(op(1, None, None)));
        assert!(!rq.push(op(2, None, None)));
    }

    #[test]
    fn test_oldest_ready_wins_and_selection_is_sticky() {
        let mut rq = ReservationQueue::new(4);
        rq.push(op(0, Some(1), None));
        rq.push(op(1, None, None));
        rq.push(op(2, None, None));
        rq.commit();

        // fid 0 waits on slot 1; fids 1 and 2 are ready
        rq.update_ready(|slot, _| if slot == 1 { None } else { Some(0) }, |_| 0, |_, _| true);

        assert_eq!(rq.pop_ready().unwrap().op.fid, 1);
        assert_eq!(rq.pop_ready().unwrap().op.fid, 1);
        let removed = rq.remove_ready();
        assert_eq!(removed.fid, 1);
        assert_eq!(rq.pop_ready().unwrap().op.fid, 2);
    }

    #[test]
    fn test_captured_value_is_frozen() {
        let mut rq = ReservationQueue::new(4);
        rq.push(op(0, Some(1), None));
        rq.commit();

        rq.update_ready(|_, _| Some(42), |_| 0, |_, _| true);
        // a later re-evaluation must not overwrite the captured value
        rq.update_ready(|_, _| Some(99), |_| 0, |_, _| true);

        let entry = rq.pop_ready().unwrap();
        match entry.op.src[0] {
            SrcOperand::Value(v) => assert_eq!(v, 42),
            ref other => panic!("expected captured value, got {:?}", other),
        }
    }

    #[test]
    fn test_dst_slot_gates_readiness() {
        let mut rq = ReservationQueue::new(4);
        rq.push(op(0, None, Some(3)));
        rq.commit();

        rq.update_ready(|_, _| Some(0), |_| 0, |_, _| false);
        assert!(rq.pop_ready().is_none());

        rq.commit();
        rq.update_ready(|_, _| Some(0), |_| 0, |slot, _| slot == 3);
        assert_eq!(rq.pop_ready().unwrap().op.fid, 0);
    }
}
