use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use em86::{Machine, RuntimeOptions};

/// A 16/32-bit PC emulator.
#[derive(Parser)]
#[command(name = "mypc", version, about)]
struct Args {
    /// Machine configuration file.
    config: Option<PathBuf>,

    /// Run a flat binary in autotest mode (loaded at 1000:0000, opcode 0xF1
    /// terminates with exit code 0).
    #[arg(long)]
    autotest: Option<PathBuf>,

    /// Log one line per delivered exception.
    #[arg(long)]
    log_exceptions: bool,

    /// Dump state and abort on any exception.
    #[arg(long)]
    crash_on_exception: bool,

    /// Dump state and abort on page faults.
    #[arg(long)]
    crash_on_page_fault: bool,

    /// Dump state and abort on general protection faults.
    #[arg(long)]
    crash_on_gpf: bool,

    /// Trace every retired instruction.
    #[arg(long)]
    trace: bool,

    /// Log every memory access.
    #[arg(long)]
    memdebug: bool,

    /// Log every I/O port access.
    #[arg(long)]
    iopeek: bool,

    /// Log protected-mode segment register loads.
    #[arg(long)]
    pedebug: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let options = RuntimeOptions {
        log_exceptions: args.log_exceptions,
        crash_on_exception: args.crash_on_exception,
        crash_on_page_fault: args.crash_on_page_fault,
        crash_on_general_protection_fault: args.crash_on_gpf,
        trace: args.trace,
        memdebug: args.memdebug,
        iopeek: args.iopeek,
        pedebug: args.pedebug,
        log_page_translations: false,
    };

    let machine = if let Some(image) = &args.autotest {
        Machine::for_autotest(image, options)
    } else if let Some(config) = &args.config {
        Machine::from_file(config, options)
    } else {
        eprintln!("usage: mypc <config-file> | mypc --autotest <image>");
        return ExitCode::from(1);
    };

    let mut machine = match machine {
        Ok(machine) => machine,
        Err(error) => {
            eprintln!("mypc: {}", error);
            return ExitCode::from(1);
        }
    };

    ExitCode::from(machine.run() as u8)
}
