use std::path::PathBuf;
use std::process::exit;
use std::rc::Rc;

use structopt::StructOpt;

use crate::sim::{load_sim_config, Simulator};
use crate::stimulus::StimulusGenerator;

mod core;
mod instructions;
mod reference;
mod sim;
#[cfg(test)]
mod sim_tests;
mod stimulus;

#[derive(StructOpt, Debug)]
#[structopt(name = "Out-of-order core model")]
struct Opt {
    /// Sets a custom config file
    #[structopt(short, long, parse(from_os_str), default_value = "sim.yaml")]
    config: PathBuf,

    /// Seed for the stimulus generator
    #[structopt(short, long, default_value = "1")]
    seed: u64,

    /// Number of differential runs; run i uses seed + i
    #[structopt(short, long, default_value = "1")]
    runs: u64,
}

fn main() {
    let opt = Opt::from_args();

    let config_path = opt.config.to_str().unwrap();
    let config = match load_sim_config(config_path) {
        Ok(config) => config,
        Err(error) => {
            println!("Failed to load {}. Cause: {}", config_path, error);
            exit(1);
        }
    };

    let simulator = Simulator::new(&config);
    let mut failures = 0;

    for i in 0..opt.runs {
        let seed = opt.seed + i;
        let mut generator = StimulusGenerator::new(seed, config.arch_reg_count, &config.stimulus);
        let program = Rc::new(generator.generate());

        let outcome = simulator.run(&program);
        if outcome.matched {
            println!(
                "seed {}: match ({} retired, {} mispredicts, ooo {} cycles, reference {} cycles)",
                seed, outcome.retired, outcome.mispredicts, outcome.ooo_cycles, outcome.ref_cycles
            );
        } else {
            println!("seed {}: MISMATCH on {} registers", seed, outcome.mismatches.len());
            for (reg, ooo_value, ref_value) in &outcome.mismatches {
                println!("  R{}: ooo={} reference={}", reg, ooo_value, ref_value);
            }
            failures += 1;
        }
    }

    if failures > 0 {
        exit(1);
    }
}
