use crate::core::Clocked;
use crate::instructions::{BranchOutcome, InflightOp, Opcode, SrcOperand, WordType};

/// One in-flight computation: a renamed instruction, its captured source
/// values, the remaining-latency counter and, once the latency has
/// elapsed, the result. Branches carry their resolved outcome behind a
/// separate branch-ready flag, decoupling ALU completion from branch
/// resolution.
pub(crate) struct EuEntry {
    pub(crate) op: InflightOp,
    pub(crate) cycles_remaining: u8,
    pub(crate) computed: bool,
    pub(crate) result: Option<WordType>,
    pub(crate) branch: Option<BranchOutcome>,
    pub(crate) branch_ready: bool,
}

impl EuEntry {
    pub(crate) fn ready(&self) -> bool {
        self.computed && (!self.op.instr.is_branch() || self.branch_ready)
    }
}

/// The table of execution units. Each occupied slot counts its latency
/// down; on the cycle after the count reaches zero the opcode is
/// evaluated and the entry becomes ready. Ready entries are consumed with
/// the same freeze-until-consumed discipline as the reservation queue.
pub(crate) struct ExecutionUnits {
    slots: Vec<Option<EuEntry>>,
    staged_push: Vec<EuEntry>,
    next_ready: Option<usize>,
}

impl ExecutionUnits {
    pub(crate) fn new(count: u8) -> ExecutionUnits {
        let mut slots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            slots.push(None);
        }

        ExecutionUnits {
            slots,
            staged_push: Vec::new(),
            next_ready: None,
        }
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count() - self.staged_push.len()
    }

    pub(crate) fn has_idle(&self) -> bool {
        self.idle_count() > 0
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.slots.iter().all(|s| s.is_none()) && self.staged_push.is_empty()
    }

    pub(crate) fn push(&mut self, op: InflightOp) -> bool {
        if !self.has_idle() {
            return false;
        }
        let cycles_remaining = op.instr.latency;
        self.staged_push.push(EuEntry {
            op,
            cycles_remaining,
            computed: false,
            result: None,
            branch: None,
            branch_ready: false,
        });
        true
    }

    /// Returns the ready entry in the lowest-numbered slot; repeated calls
    /// within one cycle return the same entry until `remove_ready`.
    pub(crate) fn pop_ready(&mut self) -> Option<&EuEntry> {
        if self.next_ready.is_none() {
            self.next_ready = self
                .slots
                .iter()
                .position(|s| s.as_ref().map(|e| e.ready()).unwrap_or(false));
        }
        match self.next_ready {
            Some(index) => self.slots[index].as_ref(),
            None => None,
        }
    }

    pub(crate) fn remove_ready(&mut self) -> EuEntry {
        let index = self
            .next_ready
            .take()
            .expect("execution units: remove_ready without a selected entry");
        self.slots[index].take().unwrap()
    }

    pub(crate) fn flush(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.staged_push.clear();
        self.next_ready = None;
    }

    pub(crate) fn dump(&self) {
        for (i, s) in self.slots.iter().enumerate() {
            if let Some(e) = s {
                println!(
                    "  eu[{}] {} remaining={} computed={}",
                    i, e.op, e.cycles_remaining, e.computed
                );
            }
        }
    }

    fn evaluate(entry: &mut EuEntry) {
        let instr = &entry.op.instr;
        let src = |i: usize| -> WordType {
            match entry.op.src[i] {
                SrcOperand::Value(v) => v,
                ref other => panic!("executing {} with unresolved source {:?}", entry.op, other),
            }
        };

        match instr.opcode {
            Opcode::NOP | Opcode::HALT => {}
            Opcode::MOV => entry.result = Some(src(0)),
            Opcode::ADD => entry.result = Some(src(0).wrapping_add(src(1))),
            Opcode::SUB => entry.result = Some(src(0).wrapping_sub(src(1))),
            Opcode::MUL => entry.result = Some(src(0).wrapping_mul(src(1))),
            Opcode::AND => entry.result = Some(src(0) & src(1)),
            Opcode::ORR => entry.result = Some(src(0) | src(1)),
            Opcode::EOR => entry.result = Some(src(0) ^ src(1)),
            Opcode::NEG => entry.result = Some(src(0).wrapping_neg()),
            Opcode::MVN => entry.result = Some(!src(0)),
            Opcode::BEQ | Opcode::BNE => {
                let taken = match instr.opcode {
                    Opcode::BEQ => src(0) == src(1),
                    _ => src(0) != src(1),
                };
                let target = instr
                    .target
                    .expect("branch without a target");
                entry.branch = Some(BranchOutcome {
                    taken,
                    next_pc: if taken { target } else { entry.op.pc + 1 },
                });
                entry.branch_ready = true;
            }
        }
        entry.computed = true;
    }
}

impl Clocked for ExecutionUnits {
    fn commit(&mut self) {
        // step the occupied slots first so a unit filled this cycle starts
        // counting next cycle
        for slot in &mut self.slots {
            if let Some(entry) = slot {
                if entry.cycles_remaining > 0 {
                    entry.cycles_remaining -= 1;
                } else if !entry.computed {
                    Self::evaluate(entry);
                }
            }
        }

        for entry in self.staged_push.drain(..) {
            let slot = self
                .slots
                .iter_mut()
                .find(|s| s.is_none())
                .expect("execution units: staged push with no idle slot");
            *slot = Some(entry);
        }

        self.next_ready = None;
    }
}
