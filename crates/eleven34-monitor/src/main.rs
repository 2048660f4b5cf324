//! The `eleven34` binary: a full machine under the octal monitor.

use std::io;

use log as _;

use eleven34_core::{System, SystemConfig, DEFAULT_CONSOLE_PORT};
use eleven34_monitor::Monitor;

fn main() -> io::Result<()> {
    env_logger::init();

    let mut system = System::new(SystemConfig::default());
    system.attach_console();
    system.attach_printer();

    println!(
        "eleven34: {} words of memory, terminal on port {}",
        system.config().memory_words,
        DEFAULT_CONSOLE_PORT
    );

    let stdin = io::stdin();
    Monitor::new(system, stdin.lock(), io::stdout()).run()
}
