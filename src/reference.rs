use std::rc::Rc;

use crate::core::execution_unit::ExecutionUnits;
use crate::core::reservation::ReservationQueue;
use crate::core::scoreboard::{GroupTag, RegStatus, Scoreboard};
use crate::core::Clocked;
use crate::instructions::{
    DstSlot, Fid, InflightOp, Opcode, Operand, Program, SrcOperand, MAX_SOURCE_COUNT,
};
use crate::sim::{ArchRegFile, PerfCounters, SimConfig, Trace};

/// The golden in-order pipeline: the same reservation queue, execution
/// units and scoreboard, driven directly over architectural registers with
/// no renaming and no speculation. Fetch stalls whenever the reservation
/// queue is non-empty or a branch is outstanding; writeback updates the
/// architectural file and the scoreboard and releases a branch stall once
/// the branch resolves.
pub(crate) struct ReferenceCore {
    program: Rc<Program>,
    scoreboard: Scoreboard,
    rq: ReservationQueue,
    eus: ExecutionUnits,
    arch_reg_file: ArchRegFile,

    pc: usize,
    next_fid: Fid,
    branch_outstanding: bool,
    halted: bool,
    halt_done: bool,
    cycle: u64,

    trace: Trace,
    perf: PerfCounters,
}

impl ReferenceCore {
    pub(crate) fn new(config: &SimConfig, program: &Rc<Program>) -> ReferenceCore {
        ReferenceCore {
            program: Rc::clone(program),
            scoreboard: Scoreboard::new(config.arch_reg_count),
            rq: ReservationQueue::new(config.rq_capacity),
            eus: ExecutionUnits::new(config.eu_count),
            arch_reg_file: ArchRegFile::new(config.arch_reg_count),
            pc: 0,
            next_fid: 0,
            branch_outstanding: false,
            halted: false,
            halt_done: false,
            cycle: 0,
            trace: config.trace.clone(),
            perf: PerfCounters::default(),
        }
    }

    pub(crate) fn run(&mut self, max_cycles: u64) -> u64 {
        while !self.finished() {
            assert!(
                self.cycle < max_cycles,
                "reference core: watchdog expired after {} cycles, pc={}",
                self.cycle,
                self.pc
            );
            self.evaluate();
        }
        self.cycle
    }

    pub(crate) fn finished(&self) -> bool {
        self.halt_done && self.rq.is_empty() && self.eus.is_idle()
    }

    pub(crate) fn evaluate(&mut self) {
        self.cycle += 1;
        self.perf.cycle_cnt += 1;

        self.stage_writeback();
        self.stage_issue();
        self.stage_fetch();
        self.apply();
    }

    fn stage_writeback(&mut self) {
        while self.eus.pop_ready().is_some() {
            let entry = self.eus.remove_ready();

            if self.trace.writeback {
                println!("Reference writeback [{}]", entry.op);
            }

            if let Some(d) = entry.op.dst {
                let value = entry.result.unwrap_or_else(|| {
                    panic!("reference: {} completed without a value", entry.op)
                });
                self.arch_reg_file.set_value(d.arch, value);
                self.scoreboard
                    .set_status(d.slot, RegStatus::IN_ARCH_FILE, entry.op.fid, GroupTag::Clear);
            }

            if entry.op.instr.is_branch() {
                let outcome = entry.branch.unwrap_or_else(|| {
                    panic!("reference: branch {} completed without an outcome", entry.op)
                });
                self.pc = outcome.next_pc;
                self.branch_outstanding = false;
            }

            if entry.op.instr.opcode == Opcode::HALT {
                self.halt_done = true;
            }

            self.perf.writeback_cnt += 1;
        }
    }

    fn stage_issue(&mut self) {
        if !self.eus.has_idle() {
            return;
        }
        if self.rq.pop_ready().is_some() {
            let op = self.rq.remove_ready();
            let pushed = self.eus.push(op);
            debug_assert!(pushed, "reference issue with no idle execution unit");
            self.perf.issue_cnt += 1;
        }
    }

    fn stage_fetch(&mut self) {
        if self.halted || self.branch_outstanding || !self.rq.is_empty() {
            return;
        }

        let instr = self.program.get_instr(self.pc);
        let fid = self.next_fid;

        // scoreboard interlock: hold fetch until every source producer has
        // written back and no older writer of the destination is in flight
        for i in 0..instr.source_cnt as usize {
            if let Operand::Register(arch) = instr.source[i] {
                if self.scoreboard.is_busy(arch) {
                    self.perf.stall_cnt += 1;
                    return;
                }
            }
        }
        if let Some(arch) = instr.dst {
            if self.scoreboard.is_busy(arch) {
                self.perf.stall_cnt += 1;
                return;
            }
        }

        let mut src = [SrcOperand::Unused; MAX_SOURCE_COUNT as usize];
        for i in 0..instr.source_cnt as usize {
            src[i] = match instr.source[i] {
                Operand::Register(arch) => SrcOperand::Pending { slot: arch, arch },
                Operand::Immediate(value) => SrcOperand::Value(value),
                Operand::Unused => SrcOperand::Unused,
            };
        }

        let dst = instr.dst.map(|arch| {
            self.scoreboard
                .set_status(arch, RegStatus::BUSY, fid, GroupTag::Clear);
            DstSlot { arch, slot: arch }
        });

        let op = InflightOp {
            fid,
            pc: self.pc,
            instr: Rc::clone(&instr),
            src,
            dst,
            fgr: None,
        };

        if self.trace.fetch {
            println!("Reference fetched [{}]", op);
        }

        let pushed = self.rq.push(op);
        debug_assert!(pushed, "reference fetch into a full reservation queue");
        self.perf.fetch_cnt += 1;
        self.next_fid += 1;

        if instr.is_branch() {
            self.branch_outstanding = true;
        } else if instr.opcode == Opcode::HALT {
            self.halted = true;
        } else {
            self.pc += 1;
        }
    }

    fn apply(&mut self) {
        self.scoreboard.commit();
        self.eus.commit();
        self.rq.commit();

        let scoreboard = &self.scoreboard;
        let arch = &self.arch_reg_file;
        self.rq.update_ready(
            |slot, arch_reg| {
                if scoreboard.is_busy(slot) {
                    None
                } else {
                    Some(arch.get_value(arch_reg))
                }
            },
            |arch_reg| arch.get_value(arch_reg),
            |slot, fid| {
                let e = scoreboard.get(slot);
                e.status != RegStatus::BUSY || e.fid == fid
            },
        );
    }

    pub(crate) fn arch_reg_file(&self) -> &ArchRegFile {
        &self.arch_reg_file
    }

    pub(crate) fn perf_counters(&self) -> &PerfCounters {
        &self.perf
    }
}
