// The I/O port fabric. Devices register read/write listeners per port; ports
// below 1024 sit in a fast table, the rest in a sparse map. Unhandled ports
// read as junk and get one log line unless they are on the ignore list.
// Devices also get an IRQ line backed by an atomic pending mask that other
// threads may raise; the CPU samples it between instructions.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::conversions::{weld16, weld32, ValueWidth};
use crate::exceptions::{ExecResult, MemResult};
use crate::fields::ValueSize;
use crate::parser::Instruction;
use crate::processor::Cpu;

pub const JUNK_VALUE: u8 = 0xff;

const FAST_PORT_COUNT: usize = 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListenMask: u8 {
        const READ = 1;
        const WRITE = 2;
        const READ_WRITE = 3;
    }
}

/// A virtual device on the port bus. The sized accessors default to the
/// little-endian weld of byte accesses.
pub trait IoDevice {
    fn name(&self) -> &'static str;
    fn reset(&mut self);

    fn in8(&mut self, port: u16) -> u8 {
        log::debug!(target: "io", "{}: unhandled 8-bit read from {:#05x}", self.name(), port);
        JUNK_VALUE
    }

    fn out8(&mut self, port: u16, data: u8) {
        log::debug!(
            target: "io",
            "{}: unhandled 8-bit write to {:#05x}, data {:#04x}",
            self.name(),
            port,
            data
        );
    }

    fn in16(&mut self, port: u16) -> u16 {
        weld16(self.in8(port.wrapping_add(1)), self.in8(port))
    }

    fn out16(&mut self, port: u16, data: u16) {
        self.out8(port, data as u8);
        self.out8(port.wrapping_add(1), (data >> 8) as u8);
    }

    fn in32(&mut self, port: u16) -> u32 {
        weld32(self.in16(port.wrapping_add(2)), self.in16(port))
    }

    fn out32(&mut self, port: u16, data: u32) {
        self.out16(port, data as u16);
        self.out16(port.wrapping_add(2), (data >> 16) as u16);
    }
}

pub type DeviceRef = Rc<RefCell<dyn IoDevice>>;

/// Pending IRQ lines as an atomic mask; device threads raise, the CPU thread
/// samples and clears between instructions.
pub struct IrqStatus {
    pending: AtomicU32,
}

impl IrqStatus {
    pub fn new() -> Arc<IrqStatus> {
        Arc::new(IrqStatus {
            pending: AtomicU32::new(0),
        })
    }

    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Claim the lowest pending line, if any.
    pub fn take_pending(&self) -> Option<u8> {
        loop {
            let mask = self.pending.load(Ordering::Acquire);
            if mask == 0 {
                return None;
            }
            let line = mask.trailing_zeros();
            let cleared = mask & !(1 << line);
            if self
                .pending
                .compare_exchange(mask, cleared, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(line as u8);
            }
        }
    }

    fn raise(&self, line: u8) {
        self.pending.fetch_or(1 << line, Ordering::AcqRel);
    }

    fn lower(&self, line: u8) {
        self.pending.fetch_and(!(1 << line), Ordering::AcqRel);
    }
}

/// A device's handle on its interrupt request line. Clone freely; raising is
/// thread-safe.
#[derive(Clone)]
pub struct IrqLine {
    status: Arc<IrqStatus>,
    line: u8,
}

impl IrqLine {
    pub fn new(status: Arc<IrqStatus>, line: u8) -> IrqLine {
        IrqLine { status, line }
    }

    pub fn raise_irq(&self) {
        self.status.raise(self.line);
    }

    pub fn lower_irq(&self) {
        self.status.lower(self.line);
    }

    pub fn line(&self) -> u8 {
        self.line
    }
}

/// The per-port dispatch tables plus the identity set used for reset
/// broadcasts.
pub struct IoBus {
    fast_input: Vec<Option<DeviceRef>>,
    fast_output: Vec<Option<DeviceRef>>,
    input_map: HashMap<u16, DeviceRef>,
    output_map: HashMap<u16, DeviceRef>,
    devices: Vec<DeviceRef>,
    ignored_ports: HashSet<u16>,
}

impl IoBus {
    pub fn new() -> IoBus {
        IoBus {
            fast_input: vec![None; FAST_PORT_COUNT],
            fast_output: vec![None; FAST_PORT_COUNT],
            input_map: HashMap::new(),
            output_map: HashMap::new(),
            devices: Vec::new(),
            ignored_ports: HashSet::new(),
        }
    }

    pub fn register_device(&mut self, device: DeviceRef) {
        if !self
            .devices
            .iter()
            .any(|existing| Rc::ptr_eq(existing, &device))
        {
            self.devices.push(device);
        }
    }

    pub fn listen(&mut self, port: u16, mask: ListenMask, device: DeviceRef) {
        self.register_device(Rc::clone(&device));
        if mask.contains(ListenMask::READ) {
            if (port as usize) < FAST_PORT_COUNT {
                self.fast_input[port as usize] = Some(Rc::clone(&device));
            }
            self.input_map.insert(port, Rc::clone(&device));
        }
        if mask.contains(ListenMask::WRITE) {
            if (port as usize) < FAST_PORT_COUNT {
                self.fast_output[port as usize] = Some(Rc::clone(&device));
            }
            self.output_map.insert(port, device);
        }
    }

    pub fn input_device_for_port(&self, port: u16) -> Option<DeviceRef> {
        if (port as usize) < FAST_PORT_COUNT {
            return self.fast_input[port as usize].clone();
        }
        self.input_map.get(&port).cloned()
    }

    pub fn output_device_for_port(&self, port: u16) -> Option<DeviceRef> {
        if (port as usize) < FAST_PORT_COUNT {
            return self.fast_output[port as usize].clone();
        }
        self.output_map.get(&port).cloned()
    }

    pub fn ignore_port(&mut self, port: u16) {
        self.ignored_ports.insert(port);
    }

    pub fn should_ignore_port(&self, port: u16) -> bool {
        self.ignored_ports.contains(&port)
    }

    pub fn reset_all(&mut self) {
        for device in &self.devices {
            device.borrow_mut().reset();
        }
    }
}

impl Default for IoBus {
    fn default() -> Self {
        IoBus::new()
    }
}

impl Cpu {
    pub fn io_bus(&mut self) -> &mut IoBus {
        &mut self.io
    }

    pub fn io_out<T: ValueWidth>(&mut self, port: u16, data: T) -> MemResult<()> {
        self.validate_io_access::<T>(port)?;

        if self.options.iopeek {
            log::trace!(
                target: "io",
                "out<{}>: {:#x} --> {:#05x}",
                T::BITS,
                data,
                port
            );
        }

        if let Some(device) = self.io.output_device_for_port(port) {
            let mut device = device.borrow_mut();
            match T::SIZE {
                ValueSize::Byte => device.out8(port, data.to_u32() as u8),
                ValueSize::Word => device.out16(port, data.to_u32() as u16),
                ValueSize::DWord => device.out32(port, data.to_u32()),
            }
            return Ok(());
        }

        if !self.io.should_ignore_port(port) {
            log::warn!(
                target: "io",
                "unhandled I/O write to port {:#05x}, data {:#x}",
                port,
                data
            );
        }
        Ok(())
    }

    pub fn io_in<T: ValueWidth>(&mut self, port: u16) -> MemResult<T> {
        self.validate_io_access::<T>(port)?;

        let data = if let Some(device) = self.io.input_device_for_port(port) {
            let mut device = device.borrow_mut();
            match T::SIZE {
                ValueSize::Byte => T::from_u32(device.in8(port) as u32),
                ValueSize::Word => T::from_u32(device.in16(port) as u32),
                ValueSize::DWord => T::from_u32(device.in32(port)),
            }
        } else {
            if !self.io.should_ignore_port(port) {
                log::warn!(target: "io", "unhandled I/O read from port {:#05x}", port);
            }
            T::from_u64(u64::MAX)
        };

        if self.options.iopeek {
            log::trace!(target: "io", "in<{}>: {:#05x} = {:#x}", T::BITS, port, data);
        }
        Ok(data)
    }

    pub fn in8(&mut self, port: u16) -> MemResult<u8> {
        self.io_in(port)
    }
    pub fn in16(&mut self, port: u16) -> MemResult<u16> {
        self.io_in(port)
    }
    pub fn in32(&mut self, port: u16) -> MemResult<u32> {
        self.io_in(port)
    }
    pub fn out8(&mut self, port: u16, data: u8) -> MemResult<()> {
        self.io_out(port, data)
    }
    pub fn out16(&mut self, port: u16, data: u16) -> MemResult<()> {
        self.io_out(port, data)
    }
    pub fn out32(&mut self, port: u16, data: u32) -> MemResult<()> {
        self.io_out(port, data)
    }

    // --- IN/OUT instruction forms ---

    pub(crate) fn out_imm8_al(&mut self, insn: &mut Instruction) -> ExecResult {
        let data = self.al();
        self.out8(insn.imm8() as u16, data)?;
        Ok(())
    }

    pub(crate) fn out_imm8_ax(&mut self, insn: &mut Instruction) -> ExecResult {
        let data = self.ax();
        self.out16(insn.imm8() as u16, data)?;
        Ok(())
    }

    pub(crate) fn out_imm8_eax(&mut self, insn: &mut Instruction) -> ExecResult {
        let data = self.eax();
        self.out32(insn.imm8() as u16, data)?;
        Ok(())
    }

    pub(crate) fn out_dx_al(&mut self, _insn: &mut Instruction) -> ExecResult {
        let port = self.dx();
        let data = self.al();
        self.out8(port, data)?;
        Ok(())
    }

    pub(crate) fn out_dx_ax(&mut self, _insn: &mut Instruction) -> ExecResult {
        let port = self.dx();
        let data = self.ax();
        self.out16(port, data)?;
        Ok(())
    }

    pub(crate) fn out_dx_eax(&mut self, _insn: &mut Instruction) -> ExecResult {
        let port = self.dx();
        let data = self.eax();
        self.out32(port, data)?;
        Ok(())
    }

    pub(crate) fn in_al_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let data = self.in8(insn.imm8() as u16)?;
        self.set_al(data);
        Ok(())
    }

    pub(crate) fn in_ax_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let data = self.in16(insn.imm8() as u16)?;
        self.set_ax(data);
        Ok(())
    }

    pub(crate) fn in_eax_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let data = self.in32(insn.imm8() as u16)?;
        self.set_eax(data);
        Ok(())
    }

    pub(crate) fn in_al_dx(&mut self, _insn: &mut Instruction) -> ExecResult {
        let port = self.dx();
        let data = self.in8(port)?;
        self.set_al(data);
        Ok(())
    }

    pub(crate) fn in_ax_dx(&mut self, _insn: &mut Instruction) -> ExecResult {
        let port = self.dx();
        let data = self.in16(port)?;
        self.set_ax(data);
        Ok(())
    }

    pub(crate) fn in_eax_dx(&mut self, _insn: &mut Instruction) -> ExecResult {
        let port = self.dx();
        let data = self.in32(port)?;
        self.set_eax(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RuntimeOptions;

    struct Latch {
        value: u8,
        resets: u32,
    }

    impl IoDevice for Latch {
        fn name(&self) -> &'static str {
            "latch"
        }
        fn reset(&mut self) {
            self.resets += 1;
            self.value = 0;
        }
        fn in8(&mut self, _port: u16) -> u8 {
            self.value
        }
        fn out8(&mut self, _port: u16, data: u8) {
            self.value = data;
        }
    }

    #[test]
    fn listen_routes_reads_and_writes() {
        let mut cpu = Cpu::new(RuntimeOptions::default(), true);
        let latch = Rc::new(RefCell::new(Latch { value: 0, resets: 0 }));
        cpu.io_bus()
            .listen(0x60, ListenMask::READ_WRITE, latch.clone());

        cpu.out8(0x60, 0xa5).unwrap();
        assert_eq!(cpu.in8(0x60).unwrap(), 0xa5);
        // 16-bit access welds the byte handlers.
        cpu.out16(0x60, 0x1234).unwrap();
        assert_eq!(latch.borrow().value, 0x12);
    }

    #[test]
    fn unhandled_ports_read_junk() {
        let mut cpu = Cpu::new(RuntimeOptions::default(), true);
        assert_eq!(cpu.in8(0x3f8).unwrap(), JUNK_VALUE);
        assert_eq!(cpu.in16(0x3f8).unwrap(), 0xffff);
    }

    #[test]
    fn reset_broadcast_reaches_every_device() {
        let mut bus = IoBus::new();
        let latch = Rc::new(RefCell::new(Latch { value: 7, resets: 0 }));
        bus.listen(0x10, ListenMask::READ, latch.clone());
        bus.listen(0x11, ListenMask::WRITE, latch.clone());
        bus.reset_all();
        assert_eq!(latch.borrow().resets, 1);
        assert_eq!(latch.borrow().value, 0);
    }

    #[test]
    fn irq_lines_latch_until_taken() {
        let status = IrqStatus::new();
        let line = IrqLine::new(status.clone(), 4);
        assert!(!status.has_pending());
        line.raise_irq();
        line.raise_irq();
        assert!(status.has_pending());
        assert_eq!(status.take_pending(), Some(4));
        assert!(!status.has_pending());

        line.raise_irq();
        line.lower_irq();
        assert_eq!(status.take_pending(), None);
    }
}
