//! Assembles a machine, prints the device table, and disassembles nothing:
//! just dumps the first words of each boot loader bank as octal.

use eleven34_core::{System, SystemConfig};
use log as _;
use proptest as _;
use thiserror as _;
use rstest as _;
use tempfile as _;

fn main() {
    let system = System::new(SystemConfig::default());

    println!("device table:");
    for info in system.bus().device_table() {
        println!(
            "  {:>8} at {:08o} size {:>3} {}",
            info.name,
            info.base,
            info.size,
            if info.standard { "(standard)" } else { "" }
        );
    }

    for (label, base) in [("disk", 0o773000_u32), ("tape", 0o773200)] {
        print!("{label} loader:");
        for index in 0..8 {
            let word = system
                .bus()
                .read(base + 2 * index)
                .expect("boot ROM must answer");
            print!(" {word:06o}");
        }
        println!();
    }
}
