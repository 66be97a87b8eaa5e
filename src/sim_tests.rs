use std::rc::Rc;

use crate::core::pipeline::OooCore;
use crate::instructions::{Instr, Opcode, Operand, Program, RegisterType, WordType};
use crate::sim::{DiffOutcome, SimConfig, Simulator};
use crate::stimulus::{StimulusConfig, StimulusGenerator};

fn mov(dst: RegisterType, imm: WordType, latency: u8) -> Instr {
    Instr {
        opcode: Opcode::MOV,
        latency,
        source_cnt: 1,
        source: [Operand::Immediate(imm), Operand::Unused],
        dst: Some(dst),
        target: None,
    }
}

fn alu(opcode: Opcode, dst: RegisterType, a: RegisterType, b: RegisterType, latency: u8) -> Instr {
    Instr {
        opcode,
        latency,
        source_cnt: 2,
        source: [Operand::Register(a), Operand::Register(b)],
        dst: Some(dst),
        target: None,
    }
}

fn branch(opcode: Opcode, a: RegisterType, b: RegisterType, target: usize, latency: u8) -> Instr {
    Instr {
        opcode,
        latency,
        source_cnt: 2,
        source: [Operand::Register(a), Operand::Register(b)],
        dst: None,
        target: Some(target),
    }
}

fn nop(latency: u8) -> Instr {
    crate::instructions::create_nop(latency)
}

fn halt() -> Instr {
    crate::instructions::create_halt()
}

struct TestHarness {
    config: SimConfig,
}

impl TestHarness {
    fn default() -> TestHarness {
        TestHarness {
            config: SimConfig::default(),
        }
    }

    fn with_config(config: SimConfig) -> TestHarness {
        TestHarness { config }
    }

    fn run_ooo(&self, instrs: Vec<Instr>) -> OooCore {
        let program = Rc::new(Program {
            code: instrs.into_iter().map(Rc::new).collect(),
        });
        let mut core = OooCore::new(&self.config, &program);
        core.run(self.config.max_cycles);
        core
    }

    fn run_differential(&self, instrs: Vec<Instr>) -> DiffOutcome {
        let program = Rc::new(Program {
            code: instrs.into_iter().map(Rc::new).collect(),
        });
        Simulator::new(&self.config).run(&program)
    }

    fn run_differential_random(&self, seed: u64) -> DiffOutcome {
        let mut generator =
            StimulusGenerator::new(seed, self.config.arch_reg_count, &self.config.stimulus);
        let program = Rc::new(generator.generate());
        Simulator::new(&self.config).run(&program)
    }

    fn assert_reg_value(&self, core: &OooCore, reg: RegisterType, value: WordType) {
        assert_eq!(core.arch_reg_file().get_value(reg), value, "R{}", reg);
    }

    fn assert_idle_state(&self, core: &OooCore) {
        assert!(core.freelist().all_invalid(), "banks not drained");
        for prf in 0..core.rat().entry_count() {
            assert!(!core.rat().entry(prf).fv, "RAT[{}] still speculative", prf);
            assert!(!core.scoreboard().is_busy(prf), "scoreboard[{}] still busy", prf);
        }
    }
}

#[test]
fn test_alu_chain() {
    let harness = TestHarness::default();
    let core = harness.run_ooo(vec![
        mov(0, 100, 1),
        mov(1, 10, 1),
        alu(Opcode::ADD, 2, 0, 1, 1),
        alu(Opcode::SUB, 3, 0, 1, 2),
        alu(Opcode::MUL, 4, 2, 1, 3),
        halt(),
    ]);
    harness.assert_reg_value(&core, 0, 100);
    harness.assert_reg_value(&core, 1, 10);
    harness.assert_reg_value(&core, 2, 110);
    harness.assert_reg_value(&core, 3, 90);
    harness.assert_reg_value(&core, 4, 1100);
    harness.assert_idle_state(&core);
    assert!(core.cycle() >= 6, "six instructions cannot drain in fewer cycles");
}

#[test]
fn test_same_src_dst_reg() {
    let harness = TestHarness::default();
    let core = harness.run_ooo(vec![
        mov(0, 5, 1),
        alu(Opcode::ADD, 0, 0, 0, 1),
        alu(Opcode::ADD, 0, 0, 0, 1),
        halt(),
    ]);
    harness.assert_reg_value(&core, 0, 20);
}

#[test]
fn test_unary_ops() {
    let harness = TestHarness::default();
    let core = harness.run_ooo(vec![
        mov(0, 100, 1),
        Instr {
            opcode: Opcode::NEG,
            latency: 1,
            source_cnt: 1,
            source: [Operand::Register(0), Operand::Unused],
            dst: Some(1),
            target: None,
        },
        Instr {
            opcode: Opcode::MVN,
            latency: 1,
            source_cnt: 1,
            source: [Operand::Register(0), Operand::Unused],
            dst: Some(2),
            target: None,
        },
        halt(),
    ]);
    harness.assert_reg_value(&core, 1, -100);
    harness.assert_reg_value(&core, 2, !100i64);
}

#[test]
fn test_retirement_is_in_fetch_order_despite_latency() {
    let harness = TestHarness::default();
    // the first instruction is the slowest; the younger ones complete first
    let core = harness.run_ooo(vec![
        mov(0, 5, 8),
        mov(1, 3, 1),
        mov(2, 4, 1),
        halt(),
    ]);
    assert_eq!(core.retire_log().to_vec(), vec![0, 1, 2, 3]);
    harness.assert_reg_value(&core, 0, 5);
    harness.assert_reg_value(&core, 1, 3);
    harness.assert_reg_value(&core, 2, 4);
}

#[test]
fn test_not_taken_branch_commits_group() {
    let harness = TestHarness::default();
    let core = harness.run_ooo(vec![
        mov(0, 1, 1),
        mov(1, 2, 1),
        // r0 != r1, BEQ falls through: the not-taken prediction is right
        branch(Opcode::BEQ, 0, 1, 3, 1),
        mov(2, 7, 1),
        halt(),
    ]);
    assert_eq!(core.perf_counters().branch_good_cnt, 1);
    assert_eq!(core.perf_counters().branch_mispredict_cnt, 0);
    assert_eq!(core.perf_counters().pipeline_flushes, 0);
    harness.assert_reg_value(&core, 2, 7);
    harness.assert_idle_state(&core);
}

#[test]
fn test_taken_branch_squashes_wrong_path() {
    let harness = TestHarness::default();
    let core = harness.run_ooo(vec![
        mov(0, 1, 1),
        // r0 == r0, always taken: the not-taken prediction is wrong
        branch(Opcode::BEQ, 0, 0, 3, 1),
        mov(1, 99, 1),
        mov(2, 7, 1),
        halt(),
    ]);
    assert_eq!(core.perf_counters().branch_mispredict_cnt, 1);
    assert_eq!(core.perf_counters().pipeline_flushes, 1);
    harness.assert_reg_value(&core, 0, 1);
    // the wrong-path write never becomes architectural
    harness.assert_reg_value(&core, 1, 0);
    harness.assert_reg_value(&core, 2, 7);
    harness.assert_idle_state(&core);
}

#[test]
fn test_wrong_path_overwrite_is_rolled_back() {
    let harness = TestHarness::default();
    let core = harness.run_ooo(vec![
        mov(0, 1, 1),
        mov(1, 42, 4),
        branch(Opcode::BNE, 0, 0, 4, 1),
        // wrong path only: clobbers r1 speculatively
        mov(1, 13, 1),
        alu(Opcode::ADD, 2, 1, 0, 1),
        halt(),
    ]);
    // BNE r0,r0 never takes, so the fall-through prediction is correct and
    // pc 3 is the architectural path
    assert_eq!(core.perf_counters().branch_mispredict_cnt, 0);
    harness.assert_reg_value(&core, 1, 13);
    harness.assert_reg_value(&core, 2, 14);

    let harness = TestHarness::default();
    let core = harness.run_ooo(vec![
        mov(0, 1, 1),
        mov(1, 42, 4),
        branch(Opcode::BEQ, 0, 0, 4, 1),
        // wrong path: this clobber must be rolled back
        mov(1, 13, 1),
        alu(Opcode::ADD, 2, 1, 0, 1),
        halt(),
    ]);
    assert_eq!(core.perf_counters().branch_mispredict_cnt, 1);
    harness.assert_reg_value(&core, 1, 42);
    harness.assert_reg_value(&core, 2, 43);
    harness.assert_idle_state(&core);
}

#[test]
fn test_nested_branches_resolve_oldest_first() {
    let harness = TestHarness::default();
    let core = harness.run_ooo(vec![
        mov(0, 1, 1),
        mov(1, 2, 4),
        branch(Opcode::BEQ, 0, 1, 4, 2),
        branch(Opcode::BEQ, 0, 1, 5, 2),
        mov(2, 5, 1),
        mov(3, 6, 1),
        halt(),
    ]);
    // both fall through; both predictions are right
    assert_eq!(core.perf_counters().branch_good_cnt, 2);
    assert_eq!(core.perf_counters().branch_mispredict_cnt, 0);
    harness.assert_reg_value(&core, 2, 5);
    harness.assert_reg_value(&core, 3, 6);
    harness.assert_idle_state(&core);
}

#[test]
fn test_mispredict_inside_nested_speculation() {
    let harness = TestHarness::default();
    let core = harness.run_ooo(vec![
        mov(0, 1, 1),
        // taken: everything after it is squashed, including the nested branch
        branch(Opcode::BEQ, 0, 0, 5, 4),
        mov(1, 99, 1),
        branch(Opcode::BNE, 0, 0, 5, 1),
        mov(2, 99, 1),
        mov(3, 8, 1),
        halt(),
    ]);
    assert_eq!(core.perf_counters().branch_mispredict_cnt, 1);
    harness.assert_reg_value(&core, 1, 0);
    harness.assert_reg_value(&core, 2, 0);
    harness.assert_reg_value(&core, 3, 8);
    harness.assert_idle_state(&core);
}

#[test]
fn test_differential_fixed_alu_stream() {
    // NOP/AND/ADD with fixed delays, as a minimal cross-check of the two
    // pipelines before the random sweeps
    let harness = TestHarness::default();
    let outcome = harness.run_differential(vec![
        mov(0, 12, 2),
        mov(1, 10, 1),
        nop(3),
        alu(Opcode::AND, 2, 0, 1, 2),
        alu(Opcode::ADD, 3, 0, 1, 1),
        alu(Opcode::ADD, 4, 2, 3, 3),
        nop(1),
        alu(Opcode::ADD, 5, 4, 4, 1),
        halt(),
    ]);
    assert!(outcome.matched, "mismatches: {:?}", outcome.mismatches);
}

#[test]
fn test_differential_random_streams() {
    let harness = TestHarness::default();
    for seed in 1..=6 {
        let outcome = harness.run_differential_random(seed);
        assert!(
            outcome.matched,
            "seed {} mismatched: {:?}",
            seed, outcome.mismatches
        );
        assert!(outcome.retired > 0);
        // the reference executes exactly the architectural path
        assert_eq!(outcome.retired, outcome.ref_executed, "seed {}", seed);
    }
}

#[test]
fn test_differential_branch_heavy() {
    let mut config = SimConfig::default();
    config.stimulus = StimulusConfig {
        program_length: 200,
        max_latency: 6,
        branch_percent: 30,
        imm_max: 8,
    };
    let harness = TestHarness::with_config(config);
    for seed in 10..=14 {
        let outcome = harness.run_differential_random(seed);
        assert!(
            outcome.matched,
            "seed {} mismatched: {:?}",
            seed, outcome.mismatches
        );
    }
}

#[test]
fn test_differential_under_tight_capacities() {
    // small structures force stalls on every resource
    let mut config = SimConfig::default();
    config.phys_reg_count = 24;
    config.rob_capacity = 4;
    config.rq_capacity = 2;
    config.eu_count = 1;
    config.bank_count = 2;
    config.bank_depth = 4;
    config.checkpoint_count = 2;
    config.stimulus = StimulusConfig {
        program_length: 120,
        max_latency: 3,
        branch_percent: 15,
        imm_max: 16,
    };
    let harness = TestHarness::with_config(config);
    for seed in 20..=24 {
        let outcome = harness.run_differential_random(seed);
        assert!(
            outcome.matched,
            "seed {} mismatched: {:?}",
            seed, outcome.mismatches
        );
    }
}
