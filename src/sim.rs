use std::error::Error;
use std::fs::File;
use std::rc::Rc;

use log::{info, warn};
use serde::Deserialize;

use crate::core::pipeline::OooCore;
use crate::instructions::{Program, RegisterType, WordType};
use crate::reference::ReferenceCore;
use crate::stimulus::StimulusConfig;

#[derive(Clone, Deserialize, Debug)]
pub(crate) struct Trace {
    pub fetch: bool,
    pub issue: bool,
    pub writeback: bool,
    pub retire: bool,
    pub recovery: bool,
    pub cycle: bool,
}

impl Default for Trace {
    fn default() -> Trace {
        Trace {
            fetch: false,
            issue: false,
            writeback: false,
            retire: false,
            recovery: false,
            cycle: false,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub(crate) struct SimConfig {
    // the number of architectural registers
    pub(crate) arch_reg_count: u16,
    // the number of physical registers (and RAT entries)
    pub(crate) phys_reg_count: u16,
    // the capacity of the reorder buffer
    pub(crate) rob_capacity: u16,
    // the capacity of the reservation queue
    pub(crate) rq_capacity: u16,
    // the number of execution units
    pub(crate) eu_count: u8,
    // the number of freelist checkpoint banks
    pub(crate) bank_count: u8,
    // the LIFO depth of one checkpoint bank
    pub(crate) bank_depth: u16,
    // the number of global RAT checkpoints
    pub(crate) checkpoint_count: u8,
    // watchdog: abort a run that has not drained within this many cycles
    pub(crate) max_cycles: u64,
    pub(crate) stimulus: StimulusConfig,
    pub(crate) trace: Trace,
}

impl Default for SimConfig {
    fn default() -> SimConfig {
        SimConfig {
            arch_reg_count: 16,
            phys_reg_count: 48,
            rob_capacity: 16,
            rq_capacity: 8,
            eu_count: 4,
            bank_count: 4,
            bank_depth: 16,
            checkpoint_count: 4,
            max_cycles: 1_000_000,
            stimulus: StimulusConfig::default(),
            trace: Trace::default(),
        }
    }
}

pub(crate) fn load_sim_config(file_path: &str) -> Result<SimConfig, Box<dyn Error>> {
    let file = File::open(file_path)?;
    let config = serde_yaml::from_reader(file)?;
    Ok(config)
}

#[derive(Default)]
pub(crate) struct PerfCounters {
    pub fetch_cnt: u64,
    pub issue_cnt: u64,
    pub writeback_cnt: u64,
    pub retire_cnt: u64,
    pub stall_cnt: u64,
    pub branch_good_cnt: u64,
    pub branch_mispredict_cnt: u64,
    pub pipeline_flushes: u64,
    pub cycle_cnt: u64,
}

struct ArchRegEntry {
    value: WordType,
}

/// The architectural register file: the committed home of every register
/// value and the object of the differential comparison.
pub(crate) struct ArchRegFile {
    entries: Vec<ArchRegEntry>,
}

impl ArchRegFile {
    pub(crate) fn new(count: u16) -> ArchRegFile {
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(ArchRegEntry { value: 0 });
        }

        ArchRegFile { entries }
    }

    pub(crate) fn get_value(&self, reg: RegisterType) -> WordType {
        self.entries[reg as usize].value
    }

    pub(crate) fn set_value(&mut self, reg: RegisterType, value: WordType) {
        self.entries[reg as usize].value = value;
    }

    pub(crate) fn count(&self) -> u16 {
        self.entries.len() as u16
    }
}

pub(crate) struct DiffOutcome {
    pub matched: bool,
    pub mismatches: Vec<(RegisterType, WordType, WordType)>,
    pub ooo_cycles: u64,
    pub ref_cycles: u64,
    pub retired: u64,
    // instructions the reference executed; equals `retired` on a sound run
    pub ref_executed: u64,
    pub mispredicts: u64,
}

/// Runs one instruction stream through the out-of-order core and the
/// in-order reference and compares the final architectural state.
pub(crate) struct Simulator {
    config: SimConfig,
}

impl Simulator {
    pub(crate) fn new(config: &SimConfig) -> Simulator {
        Simulator {
            config: config.clone(),
        }
    }

    pub(crate) fn run(&self, program: &Rc<Program>) -> DiffOutcome {
        let mut ooo = OooCore::new(&self.config, program);
        let ooo_cycles = ooo.run(self.config.max_cycles);

        let mut reference = ReferenceCore::new(&self.config, program);
        let ref_cycles = reference.run(self.config.max_cycles);

        let mut mismatches = Vec::new();
        for reg in 0..self.config.arch_reg_count {
            let ooo_value = ooo.arch_reg_file().get_value(reg);
            let ref_value = reference.arch_reg_file().get_value(reg);
            if ooo_value != ref_value {
                mismatches.push((reg, ooo_value, ref_value));
            }
        }

        if mismatches.is_empty() {
            info!(
                "differential run matched: {} instructions retired, {} cycles ooo, {} cycles reference",
                ooo.perf_counters().retire_cnt,
                ooo_cycles,
                ref_cycles
            );
        } else {
            warn!("differential run mismatched on {} registers", mismatches.len());
            ooo.dump();
        }

        DiffOutcome {
            matched: mismatches.is_empty(),
            mispredicts: ooo.perf_counters().branch_mispredict_cnt,
            retired: ooo.perf_counters().retire_cnt,
            ref_executed: reference.perf_counters().writeback_cnt,
            ooo_cycles,
            ref_cycles,
            mismatches,
        }
    }
}
