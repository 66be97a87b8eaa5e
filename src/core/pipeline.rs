use std::rc::Rc;

use crate::core::execution_unit::ExecutionUnits;
use crate::core::freelist::FreelistBanks;
use crate::core::physical_register::PhysRegFile;
use crate::core::register_alias_table::Rat;
use crate::core::reorder_buffer::{ReorderBuffer, RobEntry};
use crate::core::reservation::ReservationQueue;
use crate::core::scoreboard::{GroupTag, RegStatus, Scoreboard};
use crate::core::Clocked;
use crate::instructions::{
    DstSlot, Fgr, Fid, InflightOp, Opcode, Operand, Program, SrcOperand, MAX_SOURCE_COUNT,
};
use crate::sim::{ArchRegFile, PerfCounters, SimConfig, Trace};

/// One unresolved speculative group: the branch that opened it, the
/// checkpoint holding the pre-speculation RAT validity bits, and the
/// not-taken prediction the fetch stream followed.
struct SpecGroup {
    fgr: Fgr,
    gc: usize,
    branch_fid: Fid,
    predicted_next: usize,
}

/// The out-of-order core: renaming, scheduling, execution and in-order
/// retirement over the two-phase component set. `evaluate` advances the
/// model by one clock cycle.
pub(crate) struct OooCore {
    program: Rc<Program>,
    prf: PhysRegFile,
    rat: Rat,
    freelist: FreelistBanks,
    scoreboard: Scoreboard,
    rq: ReservationQueue,
    eus: ExecutionUnits,
    rob: ReorderBuffer,
    arch_reg_file: ArchRegFile,

    pc: usize,
    next_fid: Fid,
    next_fgr: Fgr,
    groups: Vec<SpecGroup>,
    free_checkpoints: Vec<usize>,

    cycle: u64,
    halted: bool,
    halt_retired: bool,
    recovering: bool,
    retire_log: Vec<Fid>,

    trace: Trace,
    perf: PerfCounters,
}

impl OooCore {
    pub(crate) fn new(config: &SimConfig, program: &Rc<Program>) -> OooCore {
        let mut free_checkpoints: Vec<usize> = (0..config.checkpoint_count as usize).collect();
        free_checkpoints.reverse();

        OooCore {
            program: Rc::clone(program),
            prf: PhysRegFile::new(config.phys_reg_count),
            rat: Rat::new(config.phys_reg_count, config.checkpoint_count as usize),
            freelist: FreelistBanks::new(config.bank_count as usize, config.bank_depth as usize),
            scoreboard: Scoreboard::new(config.phys_reg_count),
            rq: ReservationQueue::new(config.rq_capacity),
            eus: ExecutionUnits::new(config.eu_count),
            rob: ReorderBuffer::new(config.rob_capacity),
            arch_reg_file: ArchRegFile::new(config.arch_reg_count),
            pc: 0,
            next_fid: 0,
            next_fgr: 0,
            groups: Vec::new(),
            free_checkpoints,
            cycle: 0,
            halted: false,
            halt_retired: false,
            recovering: false,
            retire_log: Vec::new(),
            trace: config.trace.clone(),
            perf: PerfCounters::default(),
        }
    }

    pub(crate) fn run(&mut self, max_cycles: u64) -> u64 {
        while !self.finished() {
            assert!(
                self.cycle < max_cycles,
                "ooo core: watchdog expired after {} cycles, pc={}",
                self.cycle,
                self.pc
            );
            self.evaluate();
        }
        self.cycle
    }

    pub(crate) fn finished(&self) -> bool {
        self.halt_retired && self.rob.is_empty() && self.freelist.all_invalid()
    }

    pub(crate) fn evaluate(&mut self) {
        self.cycle += 1;
        self.perf.cycle_cnt += 1;
        self.recovering = false;

        if self.trace.cycle {
            println!(
                "[cycle {}] pc={} rob={} rq={} groups={}",
                self.cycle,
                self.pc,
                self.rob.size(),
                self.rq.size(),
                self.groups.len()
            );
        }

        self.stage_retire();
        self.stage_backtrack();
        self.stage_writeback();
        self.stage_issue();
        self.stage_fetch();
        self.apply();

        debug_assert!(self.index_invariants_hold(), "cycle {}: physical index invariants violated", self.cycle);
    }

    // Retires the head of the ROB once ready: the single buffered PRF
    // write, the architectural write, the scoreboard promotion and the RAT
    // release all stage here. Branch resolution happens at this point, so
    // every in-flight instruction younger than a mispredicted branch is
    // squashed by a full flush.
    fn stage_retire(&mut self) {
        if !self.rob.head_ready() {
            return;
        }
        let entry = self.rob.commit_head();

        self.perf.retire_cnt += 1;
        self.retire_log.push(entry.op.fid);

        if self.trace.retire {
            println!("Retired [{}]", entry.op);
        }

        if let Some(d) = entry.op.dst {
            let value = entry.value.unwrap_or_else(|| {
                panic!("cycle {}: retiring {} without a value", self.cycle, entry.op)
            });
            self.prf.set(d.slot, value);
            self.arch_reg_file.set_value(d.arch, value);
            self.scoreboard
                .set_status(d.slot, RegStatus::IN_ARCH_FILE, entry.op.fid, GroupTag::Clear);

            // Release the mapping only while it is still the live one. A
            // younger in-flight rename may have displaced it; that
            // instruction's own retirement sweeps the stale entry, which is
            // what the multi-match release exists for.
            if self.rat.lookup(d.arch) == Some(d.slot) {
                self.rat.release(d.arch);
            }
        }

        if entry.op.instr.is_branch() {
            self.resolve_branch(&entry);
        }

        if entry.op.instr.opcode == Opcode::HALT {
            self.halt_retired = true;
        }
    }

    fn resolve_branch(&mut self, entry: &RobEntry) {
        let outcome = entry.branch.unwrap_or_else(|| {
            panic!("cycle {}: branch {} retired without an outcome", self.cycle, entry.op)
        });

        assert!(
            !self.groups.is_empty(),
            "cycle {}: branch {} retired with no open speculative group",
            self.cycle,
            entry.op
        );
        let group = self.groups.remove(0);
        assert_eq!(
            group.branch_fid, entry.op.fid,
            "cycle {}: branch {} resolved out of order",
            self.cycle, entry.op
        );

        if outcome.next_pc == group.predicted_next {
            // The acquisitions of the group are architecturally committed.
            // The export is the checked hand-off: every index the bank set
            // reports is promoted out of speculation here.
            let exported = self.freelist.commit_group(group.fgr);
            for prf in exported {
                self.rat.clear_fv(prf);
            }
            self.scoreboard.release_group(group.fgr);
            self.free_checkpoints.push(group.gc);
            self.perf.branch_good_cnt += 1;
        } else {
            self.recover(group, outcome.next_pc);
        }
    }

    fn recover(&mut self, group: SpecGroup, next_pc: usize) {
        self.perf.branch_mispredict_cnt += 1;
        self.perf.pipeline_flushes += 1;

        if self.trace.recovery {
            println!(
                "Recovery: fid {} mispredicted, re-steering to pc {}",
                group.branch_fid, next_pc
            );
        }

        // Everything left in flight is younger than the resolving branch.
        self.rat.rollback(group.gc);
        let _ = self.freelist.abandon(group.fgr);
        self.scoreboard.restore_group(group.fgr);
        self.free_checkpoints.push(group.gc);

        let nested: Vec<SpecGroup> = self.groups.drain(..).collect();
        for g in nested {
            let _ = self.freelist.abandon(g.fgr);
            self.scoreboard.restore_group(g.fgr);
            self.free_checkpoints.push(g.gc);
        }

        self.rob.flush();
        self.rq.flush();
        self.eus.flush();

        self.pc = next_pc;
        self.halted = false;
        self.recovering = true;
    }

    // Backtracks one abandoned acquisition per cycle: the popped physical
    // register becomes reallocatable again.
    fn stage_backtrack(&mut self) {
        if let Some(prf) = self.freelist.pop_abandoned() {
            self.rat.release_entry(prf);
        }
    }

    fn stage_writeback(&mut self) {
        if self.recovering {
            return;
        }
        while self.eus.pop_ready().is_some() {
            let entry = self.eus.remove_ready();

            if self.trace.writeback {
                println!("Writeback [{}]", entry.op);
            }

            self.rob.writeback(entry.op.fid, entry.result, entry.branch);
            if let Some(d) = entry.op.dst {
                self.scoreboard
                    .set_status(d.slot, RegStatus::IN_ROB, entry.op.fid, GroupTag::Keep);
            }
            self.perf.writeback_cnt += 1;
        }
    }

    // Releases the oldest operand-ready reservation entry to an execution
    // unit, one per cycle.
    fn stage_issue(&mut self) {
        if self.recovering || !self.eus.has_idle() {
            return;
        }
        if self.rq.pop_ready().is_some() {
            let op = self.rq.remove_ready();

            if self.trace.issue {
                println!("Issued [{}]", op);
            }

            let pushed = self.eus.push(op);
            debug_assert!(pushed, "issue with no idle execution unit");
            self.perf.issue_cnt += 1;
        }
    }

    // Fetches and renames one instruction. Every failure mode here is
    // back-pressure: the same fetch is retried next cycle.
    fn stage_fetch(&mut self) {
        if self.recovering || self.halted {
            return;
        }
        if !self.rob.has_space() || !self.rq.has_space() {
            self.perf.stall_cnt += 1;
            return;
        }

        let instr = self.program.get_instr(self.pc);

        if instr.is_branch() && self.free_checkpoints.is_empty() {
            self.perf.stall_cnt += 1;
            return;
        }

        let speculative = !self.groups.is_empty();
        let fgr = self.groups.last().map(|g| g.fgr);
        if instr.dst.is_some() && speculative && !self.freelist.can_push(fgr.unwrap()) {
            self.perf.stall_cnt += 1;
            return;
        }

        let fid = self.next_fid;

        let mut src = [SrcOperand::Unused; MAX_SOURCE_COUNT as usize];
        for i in 0..instr.source_cnt as usize {
            src[i] = match instr.source[i] {
                Operand::Register(arch) => match self.rat.lookup(arch) {
                    Some(slot) => SrcOperand::Pending { slot, arch },
                    None => SrcOperand::Arch { arch },
                },
                Operand::Immediate(value) => SrcOperand::Value(value),
                Operand::Unused => SrcOperand::Unused,
            };
        }

        let dst = match instr.dst {
            Some(arch) => {
                let slot = match self.rat.rename(fid, arch, speculative) {
                    Some(slot) => slot,
                    None => {
                        // every physical register is allocated
                        self.perf.stall_cnt += 1;
                        return;
                    }
                };
                let tag = match fgr {
                    Some(fgr) => GroupTag::Tag(fgr),
                    None => GroupTag::Clear,
                };
                self.scoreboard.set_status(slot, RegStatus::BUSY, fid, tag);
                if let Some(fgr) = fgr {
                    let pushed = self.freelist.push(fgr, slot);
                    debug_assert!(pushed, "freelist push failed after can_push");
                }
                Some(DstSlot { arch, slot })
            }
            None => None,
        };

        let op = InflightOp {
            fid,
            pc: self.pc,
            instr: Rc::clone(&instr),
            src,
            dst,
            fgr,
        };

        if self.trace.fetch {
            println!("Fetched [{}]", op);
        }

        self.rob.touch(op.clone());
        let pushed = self.rq.push(op);
        debug_assert!(pushed, "reservation push failed after has_space");

        self.perf.fetch_cnt += 1;
        self.next_fid += 1;

        if instr.is_branch() {
            // predict not-taken and open a speculative group for the
            // instructions that follow
            let gc = self.free_checkpoints.pop().unwrap();
            let fgr = self.next_fgr;
            self.next_fgr += 1;
            self.rat.snapshot(gc);
            self.groups.push(SpecGroup {
                fgr,
                gc,
                branch_fid: fid,
                predicted_next: self.pc + 1,
            });
            self.pc += 1;
        } else if instr.opcode == Opcode::HALT {
            self.halted = true;
        } else {
            self.pc += 1;
        }
    }

    fn apply(&mut self) {
        self.prf.commit();
        self.rat.commit();
        self.freelist.commit();
        self.scoreboard.commit();
        self.rob.commit();
        self.eus.commit();
        self.rq.commit();

        // Wake-up: re-evaluate reservation readiness against the state just
        // committed, capturing values through the scoreboard's back-pointer.
        let scoreboard = &self.scoreboard;
        let rob = &self.rob;
        let prf = &self.prf;
        let arch = &self.arch_reg_file;
        self.rq.update_ready(
            |slot, _arch| {
                let e = scoreboard.get(slot);
                match e.status {
                    RegStatus::BUSY => None,
                    RegStatus::IN_ROB => Some(rob.value_of(e.fid)),
                    RegStatus::IN_ARCH_FILE => Some(prf.get(slot)),
                }
            },
            |arch_reg| arch.get_value(arch_reg),
            |slot, fid| {
                let e = scoreboard.get(slot);
                e.status != RegStatus::BUSY || e.fid == fid
            },
        );
    }

    /// Checks that the physical index space is partitioned: an index held
    /// by a checkpoint bank is allocated and speculative, no index sits in
    /// two banks, and no architectural register has more than one live
    /// mapping.
    fn index_invariants_hold(&self) -> bool {
        let mut seen = vec![false; self.prf.count() as usize];
        for b in 0..self.freelist.bank_count() {
            for &prf in self.freelist.bank(b).contents() {
                if seen[prf as usize] {
                    return false;
                }
                seen[prf as usize] = true;
                let entry = self.rat.entry(prf);
                if !entry.nra || !entry.fv {
                    return false;
                }
            }
        }

        let mut mapped = vec![false; self.arch_reg_file.count() as usize];
        for prf in 0..self.rat.entry_count() {
            let entry = self.rat.entry(prf);
            if entry.valid {
                if mapped[entry.arf as usize] {
                    return false;
                }
                mapped[entry.arf as usize] = true;
            }
        }
        true
    }

    pub(crate) fn arch_reg_file(&self) -> &ArchRegFile {
        &self.arch_reg_file
    }

    pub(crate) fn perf_counters(&self) -> &PerfCounters {
        &self.perf
    }

    pub(crate) fn retire_log(&self) -> &[Fid] {
        &self.retire_log
    }

    pub(crate) fn rat(&self) -> &Rat {
        &self.rat
    }

    pub(crate) fn freelist(&self) -> &FreelistBanks {
        &self.freelist
    }

    pub(crate) fn scoreboard(&self) -> &Scoreboard {
        &self.scoreboard
    }

    pub(crate) fn cycle(&self) -> u64 {
        self.cycle
    }

    pub(crate) fn dump(&self) {
        println!("=== ooo core state, cycle {} ===", self.cycle);
        println!("pc={} halted={} groups={}", self.pc, self.halted, self.groups.len());
        self.rat.dump();
        self.freelist.dump();
        self.scoreboard.dump();
        self.rob.dump();
        self.rq.dump();
        self.eus.dump();
    }
}
