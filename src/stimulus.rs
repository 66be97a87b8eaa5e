use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::instructions::{
    create_halt, create_nop, Instr, Opcode, Operand, Program, RegisterType, WordType,
};

#[derive(Clone, Deserialize, Debug)]
pub(crate) struct StimulusConfig {
    // the number of instructions generated, HALT included
    pub(crate) program_length: usize,
    // per-instruction execution latency is drawn from 1..=max_latency
    pub(crate) max_latency: u8,
    // share of conditional branches, in percent
    pub(crate) branch_percent: u8,
    // immediates are drawn from 0..imm_max
    pub(crate) imm_max: WordType,
}

impl Default for StimulusConfig {
    fn default() -> StimulusConfig {
        StimulusConfig {
            program_length: 256,
            max_latency: 4,
            branch_percent: 10,
            imm_max: 64,
        }
    }
}

/// Seeded pseudo-random program generator. The core consumes the generated
/// stream and performs no randomness of its own; the same seed always
/// yields the same program, latencies included.
pub(crate) struct StimulusGenerator {
    rng: StdRng,
    arch_reg_count: u16,
    config: StimulusConfig,
}

impl StimulusGenerator {
    pub(crate) fn new(seed: u64, arch_reg_count: u16, config: &StimulusConfig) -> StimulusGenerator {
        StimulusGenerator {
            rng: StdRng::seed_from_u64(seed),
            arch_reg_count,
            config: config.clone(),
        }
    }

    pub(crate) fn generate(&mut self) -> Program {
        let len = self.config.program_length.max(2);
        let mut code: Vec<Rc<Instr>> = Vec::with_capacity(len);

        for pc in 0..len - 1 {
            let roll = self.rng.gen_range(0..100u8);
            let instr = if roll < self.config.branch_percent && pc + 2 < len {
                self.gen_branch(pc, len)
            } else if roll < self.config.branch_percent + 20 {
                self.gen_mov()
            } else if roll < self.config.branch_percent + 28 {
                create_nop(self.gen_latency())
            } else {
                self.gen_alu()
            };
            code.push(Rc::new(instr));
        }
        code.push(Rc::new(create_halt()));

        Program { code }
    }

    fn gen_latency(&mut self) -> u8 {
        self.rng.gen_range(1..=self.config.max_latency.max(1))
    }

    fn gen_reg(&mut self) -> RegisterType {
        self.rng.gen_range(0..self.arch_reg_count)
    }

    // forward-only targets keep every generated program terminating
    fn gen_branch(&mut self, pc: usize, len: usize) -> Instr {
        let opcode = if self.rng.gen_bool(0.5) { Opcode::BEQ } else { Opcode::BNE };
        let window_end = (pc + 9).min(len - 1);
        let target = self.rng.gen_range(pc + 2..=window_end);
        Instr {
            opcode,
            latency: self.gen_latency(),
            source_cnt: 2,
            source: [
                Operand::Register(self.gen_reg()),
                Operand::Register(self.gen_reg()),
            ],
            dst: None,
            target: Some(target),
        }
    }

    fn gen_mov(&mut self) -> Instr {
        Instr {
            opcode: Opcode::MOV,
            latency: self.gen_latency(),
            source_cnt: 1,
            source: [
                Operand::Immediate(self.rng.gen_range(0..self.config.imm_max.max(1))),
                Operand::Unused,
            ],
            dst: Some(self.gen_reg()),
            target: None,
        }
    }

    fn gen_alu(&mut self) -> Instr {
        let binary = [
            Opcode::ADD,
            Opcode::SUB,
            Opcode::MUL,
            Opcode::AND,
            Opcode::ORR,
            Opcode::EOR,
        ];
        let unary = [Opcode::NEG, Opcode::MVN];

        if self.rng.gen_bool(0.8) {
            let opcode = binary[self.rng.gen_range(0..binary.len())];
            Instr {
                opcode,
                latency: self.gen_latency(),
                source_cnt: 2,
                source: [
                    Operand::Register(self.gen_reg()),
                    Operand::Register(self.gen_reg()),
                ],
                dst: Some(self.gen_reg()),
                target: None,
            }
        } else {
            let opcode = unary[self.rng.gen_range(0..unary.len())];
            Instr {
                opcode,
                latency: self.gen_latency(),
                source_cnt: 1,
                source: [Operand::Register(self.gen_reg()), Operand::Unused],
                dst: Some(self.gen_reg()),
                target: None,
            }
        }
    }
}
