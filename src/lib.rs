use std::path::Path;

pub mod conversions;
pub mod descriptors;
pub mod devices;
pub mod exceptions;
pub mod fields;
pub mod memory;
pub mod parser;
pub mod paging;
pub mod processor;
pub mod settings;
pub mod tasking;

mod bcd;
mod bitwise;
mod flags;
mod instructions;
mod interrupts;
mod jump;
mod math;
mod mov;
mod pmode;
mod stack;
mod string;

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use memory::Rom;

pub use devices::{IoDevice, IrqLine, ListenMask};
pub use exceptions::{ExecResult, Fault, MemResult, Trap};
pub use fields::{
    InterruptSource, JumpType, LinearAddress, LogicalAddress, MemoryAccessType, PhysicalAddress,
    SegmentRegister,
};
pub use flags::Eflags;
pub use memory::MemoryProvider;
pub use processor::{Command, Cpu, CpuState};
pub use settings::{RuntimeOptions, Settings, SettingsError};

// Ports nobody interesting listens on; accesses to these should not spam the
// log.
const QUIET_PORTS: [u16; 29] = [
    0x220, 0x221, 0x222, 0x223, // SoundBlaster
    0x201, // gameport
    0x80,  // Linux outb_p() uses this for small delays
    0x330, 0x331, // MIDI
    0x334, // SCSI (BusLogic)
    0x237, 0x337, 0x322, 0x0c8f, 0x1c8f, 0x2c8f, 0x3c8f, 0x4c8f, 0x5c8f, 0x6c8f, 0x7c8f, 0x8c8f,
    0x9c8f, 0xac8f, 0xbc8f, 0xcc8f, 0xdc8f, 0xec8f, 0xfc8f, 0x3f6,
];

/// One PC: the CPU plus everything the configuration hangs off it. Devices
/// are registered onto the CPU's I/O bus and memory provider map before the
/// worker loop starts.
pub struct Machine {
    cpu: Cpu,
}

impl Machine {
    pub fn new(settings: &Settings, options: RuntimeOptions) -> Result<Machine, SettingsError> {
        let mut machine = Machine {
            cpu: Cpu::new(options, settings.for_autotest),
        };
        machine.apply_settings(settings)?;
        if !settings.for_autotest {
            for port in QUIET_PORTS {
                machine.cpu.io_bus().ignore_port(port);
            }
        }
        Ok(machine)
    }

    pub fn from_file(path: &Path, options: RuntimeOptions) -> Result<Machine, SettingsError> {
        let settings = Settings::from_file(path)?;
        Machine::new(&settings, options)
    }

    pub fn for_autotest(image: &Path, options: RuntimeOptions) -> Result<Machine, SettingsError> {
        let settings = Settings::for_autotest(image.to_path_buf());
        Machine::new(&settings, options)
    }

    fn apply_settings(&mut self, settings: &Settings) -> Result<(), SettingsError> {
        self.cpu.set_memory_size(settings.memory_size);
        self.cpu.set_extended_memory_size(settings.memory_size / 1024);
        self.cpu.set_reset_vector(settings.entry());
        self.cpu.reset();

        if let Some(ds) = settings.entry_ds {
            self.cpu.load_real_mode_segment(SegmentRegister::Ds, ds);
        }
        if let Some(ss) = settings.entry_ss {
            self.cpu.load_real_mode_segment(SegmentRegister::Ss, ss);
        }
        if let Some(sp) = settings.entry_sp {
            self.cpu.set_sp(sp);
        }

        for (address, path) in &settings.files {
            let contents = fs::read(path).map_err(|source| SettingsError::Io {
                path: path.clone(),
                source,
            })?;
            log::info!(
                target: "config",
                "loading {} at {:#010x}",
                path.display(),
                address.get()
            );
            for (index, &byte) in contents.iter().enumerate() {
                self.cpu.write_physical(address.offset(index as u32), byte);
            }
        }

        for (address, path) in &settings.rom_images {
            let rom = Rom::from_file(*address, path).map_err(|source| SettingsError::Io {
                path: path.clone(),
                source,
            })?;
            if !self
                .cpu
                .register_memory_provider(Rc::new(RefCell::new(rom)))
            {
                return Err(SettingsError::Parse {
                    path: path.clone(),
                    line: 0,
                    text: format!("rom-image outside the first megabyte: {:#010x}", address.get()),
                });
            }
        }

        Ok(())
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    /// The IRQ line handle a device keeps; raising it is thread-safe.
    pub fn irq_line(&self, line: u8) -> IrqLine {
        IrqLine::new(self.cpu.irq_status(), line)
    }

    pub fn queue_command(&self, command: Command) {
        self.cpu.queue_command(command);
    }

    pub fn reboot(&self) {
        self.cpu.queue_command(Command::HardReboot);
    }

    /// Drive the CPU until it dies; returns the process exit code.
    pub fn run(&mut self) -> i32 {
        self.cpu.main_loop();
        if self.cpu.was_killed_cleanly() {
            0
        } else {
            1
        }
    }
}
