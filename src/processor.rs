// This is the place for the basic processor implementation: the register
// file with its byte/word/dword aliasing, the segment descriptor caches, the
// fetch-decode-execute loop with its fault catch, the halt loop, and the
// externally injected command cell. Addressing and the memory pipeline live
// in the memory/paging modules; the protection machinery in pmode.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::descriptors::{DescriptorTableRegister, SegmentDescriptor};
use crate::devices::{IoBus, IrqStatus};
use crate::exceptions::{ExecResult, Fault, Trap};
use crate::fields::{
    InterruptSource, LinearAddress, LogicalAddress, SegmentRegister, ValueSize,
};
use crate::memory::PhysicalMemory;
use crate::parser::Instruction;
use crate::settings::RuntimeOptions;

pub mod cr0 {
    pub const PE: u32 = 1 << 0;
    pub const EM: u32 = 1 << 2;
    pub const TS: u32 = 1 << 3;
    pub const WP: u32 = 1 << 16;
    pub const PG: u32 = 1 << 31;
}

pub mod cr4 {
    pub const VME: u32 = 1 << 0;
    pub const PVI: u32 = 1 << 1;
    pub const TSD: u32 = 1 << 2;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CpuState {
    Dead,
    Alive,
    Halted,
}

/// The task register: selector plus the cached base/limit/width of the
/// current TSS.
#[derive(Debug, Copy, Clone)]
pub struct TaskRegister {
    pub selector: u16,
    pub base: LinearAddress,
    pub limit: u16,
    pub is_32bit: bool,
}

impl TaskRegister {
    fn cleared() -> TaskRegister {
        TaskRegister {
            selector: 0,
            base: LinearAddress(0),
            limit: 0xffff,
            is_32bit: false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    ExitDebugger,
    EnterDebugger,
    HardReboot,
}

const REQUEST_NONE: u8 = 0;
const REQUEST_ENTER_DEBUGGER: u8 = 1;
const REQUEST_EXIT_DEBUGGER: u8 = 2;

/// Commands posted from other threads land here and take effect at the next
/// instruction boundary.
pub struct CommandCell {
    debugger_request: AtomicU8,
    hard_reboot: AtomicBool,
    slow_stuff: AtomicBool,
}

impl CommandCell {
    pub fn new() -> Arc<CommandCell> {
        Arc::new(CommandCell {
            debugger_request: AtomicU8::new(REQUEST_NONE),
            hard_reboot: AtomicBool::new(false),
            slow_stuff: AtomicBool::new(false),
        })
    }

    pub fn queue(&self, command: Command) {
        match command {
            Command::EnterDebugger => self
                .debugger_request
                .store(REQUEST_ENTER_DEBUGGER, Ordering::SeqCst),
            Command::ExitDebugger => self
                .debugger_request
                .store(REQUEST_EXIT_DEBUGGER, Ordering::SeqCst),
            Command::HardReboot => self.hard_reboot.store(true, Ordering::SeqCst),
        }
        self.slow_stuff.store(true, Ordering::SeqCst);
    }
}

impl Default for CommandCell {
    fn default() -> Self {
        CommandCell {
            debugger_request: AtomicU8::new(REQUEST_NONE),
            hard_reboot: AtomicBool::new(false),
            slow_stuff: AtomicBool::new(false),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DebuggerEvent {
    Entered,
    Exited,
}

pub type DebuggerHook = Box<dyn FnMut(&mut Cpu, DebuggerEvent)>;

pub struct Cpu {
    pub(crate) gpr: [u32; 8],
    pub(crate) eip: u32,

    pub(crate) sreg: [u16; 6],
    pub(crate) descriptors: [SegmentDescriptor; 6],

    // Arithmetic flags; PF/ZF/SF may be stale while their dirty bit is set.
    pub(crate) cf: bool,
    pub(crate) pf: bool,
    pub(crate) af: bool,
    pub(crate) zf: bool,
    pub(crate) sf: bool,
    pub(crate) df: bool,
    pub(crate) if_flag: bool,
    pub(crate) tf: bool,
    pub(crate) of: bool,
    pub(crate) iopl: u8,
    pub(crate) nt: bool,
    pub(crate) rf: bool,
    pub(crate) vm: bool,
    pub(crate) ac: bool,
    pub(crate) vif: bool,
    pub(crate) vip: bool,
    pub(crate) id: bool,

    pub(crate) dirty_flags: u32,
    pub(crate) last_result: u64,
    pub(crate) last_op_size: ValueSize,

    pub(crate) gdtr: DescriptorTableRegister,
    pub(crate) idtr: DescriptorTableRegister,
    pub(crate) ldtr: DescriptorTableRegister,
    pub(crate) tr: TaskRegister,

    pub(crate) cr0: u32,
    pub(crate) cr2: u32,
    pub(crate) cr3: u32,
    pub(crate) cr4: u32,
    pub(crate) dr: [u32; 8],

    pub(crate) state: CpuState,

    // CS:EIP at the start of the currently executing instruction.
    pub(crate) base_cs: u16,
    pub(crate) base_eip: u32,

    pub(crate) segment_prefix: Option<SegmentRegister>,

    pub(crate) base_memory_size: u32,
    pub(crate) extended_memory_size: u32,

    pub(crate) a20_enabled: bool,
    pub(crate) next_instruction_uninterruptible: bool,

    pub(crate) address_size32: bool,
    pub(crate) operand_size32: bool,
    pub(crate) effective_address_size32: bool,
    pub(crate) effective_operand_size32: bool,
    pub(crate) stack_size32: bool,

    pub(crate) memory: PhysicalMemory,
    pub(crate) io: IoBus,
    pub(crate) irq: Arc<IrqStatus>,
    pub(crate) commands: Arc<CommandCell>,

    pub(crate) debugger_active: bool,
    pub(crate) debugger_hook: Option<DebuggerHook>,

    pub(crate) options: RuntimeOptions,
    pub(crate) is_for_autotest: bool,
    pub(crate) killed: bool,

    pub(crate) reset_vector: LogicalAddress,
    pub(crate) cycle: u64,
}

macro_rules! register_accessors {
    ($(($get:ident, $set:ident, $ty:ty, $index:expr)),* $(,)?) => {
        $(
            pub fn $get(&self) -> $ty {
                self.read_reg::<$ty>($index)
            }
            pub fn $set(&mut self, value: $ty) {
                self.write_reg::<$ty>($index, value)
            }
        )*
    };
}

impl Cpu {
    pub fn new(options: RuntimeOptions, is_for_autotest: bool) -> Cpu {
        let mut cpu = Cpu {
            gpr: [0; 8],
            eip: 0,
            sreg: [0; 6],
            descriptors: [SegmentDescriptor::null_descriptor(); 6],
            cf: false,
            pf: false,
            af: false,
            zf: false,
            sf: false,
            df: false,
            if_flag: false,
            tf: false,
            of: false,
            iopl: 0,
            nt: false,
            rf: false,
            vm: false,
            ac: false,
            vif: false,
            vip: false,
            id: false,
            dirty_flags: 0,
            last_result: 0,
            last_op_size: ValueSize::Byte,
            gdtr: DescriptorTableRegister::new("GDT"),
            idtr: DescriptorTableRegister::new("IDT"),
            ldtr: DescriptorTableRegister::new("LDT"),
            tr: TaskRegister::cleared(),
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr: [0; 8],
            state: CpuState::Dead,
            base_cs: 0,
            base_eip: 0,
            segment_prefix: None,
            base_memory_size: 640 * 1024,
            extended_memory_size: 0,
            a20_enabled: false,
            next_instruction_uninterruptible: false,
            address_size32: false,
            operand_size32: false,
            effective_address_size32: false,
            effective_operand_size32: false,
            stack_size32: false,
            memory: PhysicalMemory::new(8192 * 1024),
            io: IoBus::new(),
            irq: IrqStatus::new(),
            commands: CommandCell::new(),
            debugger_active: false,
            debugger_hook: None,
            options,
            is_for_autotest,
            killed: false,
            reset_vector: LogicalAddress::new(0xf000, 0x0000),
            cycle: 0,
        };
        crate::parser::build_opcode_tables_if_needed();
        cpu.reset();
        cpu
    }

    pub fn reset(&mut self) {
        self.a20_enabled = false;
        self.next_instruction_uninterruptible = false;

        self.gpr = [0; 8];
        self.cr0 = 0;
        self.cr2 = 0;
        self.cr3 = 0;
        self.cr4 = 0;
        self.dr = [0; 8];

        self.iopl = 0;
        self.vm = false;
        self.vip = false;
        self.vif = false;
        self.nt = false;
        self.rf = false;
        self.ac = false;
        self.id = false;

        self.gdtr.clear();
        self.idtr.clear();
        self.ldtr.clear();
        self.tr = TaskRegister::cleared();

        self.descriptors = [SegmentDescriptor::null_descriptor(); 6];
        self.segment_prefix = None;

        for index in 0..6 {
            let segment = SegmentRegister::from_index(index).expect("segment index");
            self.load_real_mode_segment(segment, 0);
        }

        let vector = self.reset_vector;
        self.load_real_mode_segment(SegmentRegister::Cs, vector.selector);
        self.set_eip(vector.offset);

        self.set_flags(0x0200);
        self.set_iopl(3);

        self.state = CpuState::Alive;

        self.address_size32 = false;
        self.operand_size32 = false;
        self.effective_address_size32 = false;
        self.effective_operand_size32 = false;
        self.stack_size32 = false;

        self.dirty_flags = 0;
        self.last_result = 0;
        self.last_op_size = ValueSize::Byte;

        self.cycle = 0;

        self.commands
            .slow_stuff
            .store(self.options.trace || self.debugger_active, Ordering::SeqCst);
    }

    pub fn set_reset_vector(&mut self, vector: LogicalAddress) {
        self.reset_vector = vector;
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn state(&self) -> CpuState {
        self.state
    }

    pub fn set_state(&mut self, state: CpuState) {
        self.state = state;
    }

    pub fn is_for_autotest(&self) -> bool {
        self.is_for_autotest
    }

    /// Cleanly stop the emulation (VKILL, machine shutdown).
    pub fn kill(&mut self) {
        self.killed = true;
        self.state = CpuState::Dead;
    }

    pub fn was_killed_cleanly(&self) -> bool {
        self.killed
    }

    pub fn set_debugger_hook(&mut self, hook: DebuggerHook) {
        self.debugger_hook = Some(hook);
    }

    fn fire_debugger_hook(&mut self, event: DebuggerEvent) {
        if let Some(mut hook) = self.debugger_hook.take() {
            hook(self, event);
            self.debugger_hook = Some(hook);
        }
    }

    pub fn command_cell(&self) -> Arc<CommandCell> {
        Arc::clone(&self.commands)
    }

    pub fn queue_command(&self, command: Command) {
        self.commands.queue(command);
    }

    pub fn irq_status(&self) -> Arc<IrqStatus> {
        Arc::clone(&self.irq)
    }

    // --- register file ---

    pub fn read_reg8(&self, index: usize) -> u8 {
        if index & 4 != 0 {
            (self.gpr[index & 3] >> 8) as u8
        } else {
            self.gpr[index & 3] as u8
        }
    }

    pub fn write_reg8(&mut self, index: usize, value: u8) {
        let slot = &mut self.gpr[index & 3];
        if index & 4 != 0 {
            *slot = (*slot & !0xff00) | (value as u32) << 8;
        } else {
            *slot = (*slot & !0xff) | value as u32;
        }
    }

    pub fn read_reg16(&self, index: usize) -> u16 {
        self.gpr[index] as u16
    }

    pub fn write_reg16(&mut self, index: usize, value: u16) {
        self.gpr[index] = (self.gpr[index] & 0xffff_0000) | value as u32;
    }

    pub fn read_reg32(&self, index: usize) -> u32 {
        self.gpr[index]
    }

    pub fn write_reg32(&mut self, index: usize, value: u32) {
        self.gpr[index] = value;
    }

    pub fn read_reg<T: crate::conversions::ValueWidth>(&self, index: usize) -> T {
        match T::SIZE {
            ValueSize::Byte => T::from_u32(self.read_reg8(index) as u32),
            ValueSize::Word => T::from_u32(self.read_reg16(index) as u32),
            ValueSize::DWord => T::from_u32(self.read_reg32(index)),
        }
    }

    pub fn write_reg<T: crate::conversions::ValueWidth>(&mut self, index: usize, value: T) {
        match T::SIZE {
            ValueSize::Byte => self.write_reg8(index, value.to_u32() as u8),
            ValueSize::Word => self.write_reg16(index, value.to_u32() as u16),
            ValueSize::DWord => self.write_reg32(index, value.to_u32()),
        }
    }

    register_accessors! {
        (al, set_al, u8, 0),
        (cl, set_cl, u8, 1),
        (dl, set_dl, u8, 2),
        (bl, set_bl, u8, 3),
        (ah, set_ah, u8, 4),
        (ch, set_ch, u8, 5),
        (dh, set_dh, u8, 6),
        (bh, set_bh, u8, 7),
        (ax, set_ax, u16, 0),
        (cx, set_cx, u16, 1),
        (dx, set_dx, u16, 2),
        (bx, set_bx, u16, 3),
        (sp, set_sp, u16, 4),
        (bp, set_bp, u16, 5),
        (si, set_si, u16, 6),
        (di, set_di, u16, 7),
        (eax, set_eax, u32, 0),
        (ecx, set_ecx, u32, 1),
        (edx, set_edx, u32, 2),
        (ebx, set_ebx, u32, 3),
        (esp, set_esp, u32, 4),
        (ebp, set_ebp, u32, 5),
        (esi, set_esi, u32, 6),
        (edi, set_edi, u32, 7),
    }

    /// Read a register at the current effective address size (the string and
    /// loop instructions index with CX or ECX this way).
    pub fn read_register_for_address_size(&self, index: usize) -> u32 {
        if self.a32() {
            self.gpr[index]
        } else {
            self.gpr[index] & 0xffff
        }
    }

    pub fn write_register_for_address_size(&mut self, index: usize, value: u32) {
        if self.a32() {
            self.gpr[index] = value;
        } else {
            self.write_reg16(index, value as u16);
        }
    }

    pub fn step_register_for_address_size(&mut self, index: usize, step: u32) {
        let step = if self.df() { step.wrapping_neg() } else { step };
        if self.a32() {
            self.gpr[index] = self.gpr[index].wrapping_add(step);
        } else {
            let value = self.read_reg16(index).wrapping_add(step as u16);
            self.write_reg16(index, value);
        }
    }

    pub fn decrement_cx_for_address_size(&mut self) -> bool {
        if self.a32() {
            let value = self.ecx().wrapping_sub(1);
            self.set_ecx(value);
            value == 0
        } else {
            let value = self.cx().wrapping_sub(1);
            self.set_cx(value);
            value == 0
        }
    }

    // --- segment registers ---

    pub fn read_segment_register(&self, segment: SegmentRegister) -> u16 {
        self.sreg[segment as usize]
    }

    pub fn cached_descriptor(&self, segment: SegmentRegister) -> &SegmentDescriptor {
        &self.descriptors[segment as usize]
    }

    pub fn cached_descriptor_mut(&mut self, segment: SegmentRegister) -> &mut SegmentDescriptor {
        &mut self.descriptors[segment as usize]
    }

    pub fn cs(&self) -> u16 {
        self.sreg[SegmentRegister::Cs as usize]
    }
    pub fn ds(&self) -> u16 {
        self.sreg[SegmentRegister::Ds as usize]
    }
    pub fn es(&self) -> u16 {
        self.sreg[SegmentRegister::Es as usize]
    }
    pub fn ss(&self) -> u16 {
        self.sreg[SegmentRegister::Ss as usize]
    }
    pub fn fs(&self) -> u16 {
        self.sreg[SegmentRegister::Fs as usize]
    }
    pub fn gs(&self) -> u16 {
        self.sreg[SegmentRegister::Gs as usize]
    }

    pub fn current_segment(&self) -> SegmentRegister {
        self.segment_prefix.unwrap_or(SegmentRegister::Ds)
    }

    pub fn has_segment_prefix(&self) -> bool {
        self.segment_prefix.is_some()
    }

    pub fn set_segment_prefix(&mut self, segment: Option<SegmentRegister>) {
        self.segment_prefix = segment;
    }

    pub fn clear_prefix(&mut self) {
        self.segment_prefix = None;
        self.effective_address_size32 = self.address_size32;
        self.effective_operand_size32 = self.operand_size32;
    }

    // --- privilege and mode queries ---

    pub fn cpl(&self) -> u8 {
        self.cached_descriptor(SegmentRegister::Cs).rpl
    }

    pub fn set_cpl(&mut self, cpl: u8) {
        if self.pe() && !self.vm() {
            self.sreg[SegmentRegister::Cs as usize] =
                (self.cs() & !3) | cpl as u16;
        }
        self.descriptors[SegmentRegister::Cs as usize].rpl = cpl;
    }

    pub fn pe(&self) -> bool {
        self.cr0 & cr0::PE != 0
    }
    pub fn pg(&self) -> bool {
        self.cr0 & cr0::PG != 0
    }
    pub fn vme(&self) -> bool {
        self.cr4 & cr4::VME != 0
    }
    pub fn pvi(&self) -> bool {
        self.cr4 & cr4::PVI != 0
    }
    pub fn tsd(&self) -> bool {
        self.cr4 & cr4::TSD != 0
    }

    pub fn cr0(&self) -> u32 {
        self.cr0
    }
    pub fn cr2(&self) -> u32 {
        self.cr2
    }
    pub fn cr3(&self) -> u32 {
        self.cr3
    }
    pub fn cr4(&self) -> u32 {
        self.cr4
    }

    pub fn control_register(&self, index: usize) -> Option<u32> {
        match index {
            0 => Some(self.cr0),
            2 => Some(self.cr2),
            3 => Some(self.cr3),
            4 => Some(self.cr4),
            _ => None,
        }
    }

    pub fn set_control_register(&mut self, index: usize, value: u32) {
        match index {
            0 => self.cr0 = value,
            2 => self.cr2 = value,
            3 => self.cr3 = value,
            4 => self.cr4 = value,
            _ => {}
        }
    }

    pub fn debug_register(&self, index: usize) -> u32 {
        self.dr[index]
    }

    pub fn set_debug_register(&mut self, index: usize, value: u32) {
        self.dr[index] = value;
    }

    // --- instruction and stack pointers ---

    pub fn ip(&self) -> u16 {
        self.eip as u16
    }
    pub fn eip(&self) -> u32 {
        self.eip
    }
    pub fn set_ip(&mut self, ip: u16) {
        self.eip = ip as u32;
    }
    pub fn set_eip(&mut self, eip: u32) {
        self.eip = eip;
    }

    pub fn base_cs(&self) -> u16 {
        self.base_cs
    }
    pub fn base_ip(&self) -> u16 {
        self.base_eip as u16
    }
    pub fn base_eip(&self) -> u32 {
        self.base_eip
    }

    pub(crate) fn save_base_address(&mut self) {
        self.base_cs = self.cs();
        self.base_eip = self.eip;
    }

    pub fn x32(&self) -> bool {
        self.cached_descriptor(SegmentRegister::Cs).d
    }
    pub fn x16(&self) -> bool {
        !self.x32()
    }
    pub fn a32(&self) -> bool {
        self.effective_address_size32
    }
    pub fn a16(&self) -> bool {
        !self.effective_address_size32
    }
    pub fn o32(&self) -> bool {
        self.effective_operand_size32
    }
    pub fn o16(&self) -> bool {
        !self.effective_operand_size32
    }
    pub fn s32(&self) -> bool {
        self.stack_size32
    }
    pub fn s16(&self) -> bool {
        !self.stack_size32
    }

    pub fn current_stack_pointer(&self) -> u32 {
        if self.s32() {
            self.esp()
        } else {
            self.sp() as u32
        }
    }

    pub fn set_current_stack_pointer(&mut self, value: u32) {
        if self.s32() {
            self.set_esp(value);
        } else {
            self.set_sp(value as u16);
        }
    }

    pub fn adjust_stack_pointer(&mut self, delta: i32) {
        self.set_current_stack_pointer(self.current_stack_pointer().wrapping_add(delta as u32));
    }

    pub fn current_base_pointer(&self) -> u32 {
        if self.s32() {
            self.ebp()
        } else {
            self.bp() as u32
        }
    }

    pub fn set_current_base_pointer(&mut self, value: u32) {
        if self.s32() {
            self.set_ebp(value);
        } else {
            self.set_bp(value as u16);
        }
    }

    pub fn current_instruction_pointer(&self) -> u32 {
        if self.x32() {
            self.eip
        } else {
            self.eip & 0xffff
        }
    }

    pub fn current_base_instruction_pointer(&self) -> u32 {
        if self.x32() {
            self.base_eip
        } else {
            self.base_eip & 0xffff
        }
    }

    pub fn adjust_instruction_pointer(&mut self, delta: u32) {
        self.eip = self.eip.wrapping_add(delta);
    }

    pub(crate) fn update_default_sizes(&mut self) {
        let d = self.cached_descriptor(SegmentRegister::Cs).d;
        self.address_size32 = d;
        self.operand_size32 = d;
    }

    pub(crate) fn update_stack_size(&mut self) {
        self.stack_size32 = self.cached_descriptor(SegmentRegister::Ss).d;
    }

    // --- A20 ---

    pub fn set_a20_enabled(&mut self, value: bool) {
        self.a20_enabled = value;
    }

    pub fn is_a20_enabled(&self) -> bool {
        self.a20_enabled
    }

    pub fn a20_mask(&self) -> u32 {
        if self.a20_enabled {
            0xffff_ffff
        } else {
            0xffef_ffff
        }
    }

    // --- memory sizing (reported by the out-of-scope CMOS device) ---

    pub fn base_memory_size(&self) -> u32 {
        self.base_memory_size
    }
    pub fn set_base_memory_size(&mut self, size: u32) {
        self.base_memory_size = size;
    }
    pub fn extended_memory_size(&self) -> u32 {
        self.extended_memory_size
    }
    pub fn set_extended_memory_size(&mut self, size: u32) {
        self.extended_memory_size = size;
    }

    pub fn set_memory_size(&mut self, size: u32) {
        self.memory.resize(size as usize);
    }

    pub fn make_next_instruction_uninterruptible(&mut self) {
        self.next_instruction_uninterruptible = true;
    }

    // --- the main loop ---

    pub fn main_loop(&mut self) {
        loop {
            if self.commands.slow_stuff.load(Ordering::Relaxed) {
                self.main_loop_slow_stuff();
            }

            self.execute_one_instruction();

            if self.state == CpuState::Dead {
                return;
            }

            if self.next_instruction_uninterruptible {
                self.next_instruction_uninterruptible = false;
                continue;
            }

            if self.tf {
                // The Trap Flag is set, so deliver the single-step trap as
                // soon as the instruction retires.
                self.deliver_interrupt_unfailingly(1, InterruptSource::Internal);
            }

            if self.irq.has_pending() && self.if_flag {
                self.service_irq();
            }
        }
    }

    fn main_loop_slow_stuff(&mut self) {
        if self.commands.hard_reboot.swap(false, Ordering::SeqCst) {
            self.hard_reboot();
        }

        match self.commands.debugger_request.swap(REQUEST_NONE, Ordering::SeqCst) {
            REQUEST_ENTER_DEBUGGER => {
                if !self.debugger_active {
                    self.debugger_active = true;
                    self.fire_debugger_hook(DebuggerEvent::Entered);
                }
            }
            REQUEST_EXIT_DEBUGGER => {
                if self.debugger_active {
                    self.debugger_active = false;
                    self.fire_debugger_hook(DebuggerEvent::Exited);
                }
            }
            _ => {}
        }

        self.commands.slow_stuff.store(
            self.options.trace || self.debugger_active,
            Ordering::SeqCst,
        );

        if self.options.trace {
            log::trace!(
                target: "cpu",
                "{:04x}:{:08x} eax={:08x} ebx={:08x} ecx={:08x} edx={:08x} esp={:08x} ebp={:08x} esi={:08x} edi={:08x}",
                self.cs(),
                self.eip,
                self.eax(),
                self.ebx(),
                self.ecx(),
                self.edx(),
                self.esp(),
                self.ebp(),
                self.esi(),
                self.edi()
            );
        }
    }

    pub fn execute_one_instruction(&mut self) {
        self.save_base_address();
        let result = self.decode_and_execute();
        self.clear_prefix();
        match result {
            Ok(()) => {}
            Err(Trap::Fault(fault)) => {
                if self.options.log_exceptions {
                    log::info!(
                        target: "cpu",
                        "{} at {:04x}:{:08x}",
                        fault,
                        self.base_cs,
                        self.base_eip
                    );
                }
                self.raise_fault(fault);
            }
            Err(Trap::HardwareInterruptDuringRep) => {
                self.eip = self.current_base_instruction_pointer();
            }
        }
    }

    fn decode_and_execute(&mut self) -> ExecResult {
        let o32 = self.operand_size32;
        let a32 = self.address_size32;
        let instruction = Instruction::from_stream(self, o32, a32)?;
        if !instruction.is_valid() {
            return Err(Trap::Fault(
                self.invalid_opcode("instruction not understood"),
            ));
        }
        self.execute(instruction)
    }

    pub fn execute(&mut self, mut instruction: Instruction) -> ExecResult {
        self.segment_prefix = instruction.segment_prefix();
        self.effective_operand_size32 = instruction.o32();
        self.effective_address_size32 = instruction.a32();
        if instruction.has_rm() {
            instruction.modrm.resolve(self);
        }
        let handler = instruction.handler().expect("valid instruction");
        handler(self, &mut instruction)?;
        self.cycle += 1;
        Ok(())
    }

    /// Convert a caught fault into interrupt delivery at the faulting
    /// instruction's address. A fault raised while delivering re-enters the
    /// same path; past double-fault territory we leave the guest wedged for
    /// the reset command, per the cascaded-fault contract.
    pub(crate) fn raise_fault(&mut self, fault: Fault) {
        if self.options.crash_on_exception {
            log::error!(target: "cpu", "crash on exception requested: {}", fault);
            std::process::abort();
        }

        let mut fault = fault;
        for _ in 0..2 {
            self.eip = self.current_base_instruction_pointer();
            match self.interrupt(fault.vector(), InterruptSource::External, fault.code()) {
                Ok(()) => return,
                Err(next) => {
                    log::warn!(target: "cpu", "fault while delivering {}: {}", fault, next);
                    fault = next;
                }
            }
        }
        log::error!(
            target: "cpu",
            "repeated faults during exception delivery; guest needs a reset"
        );
    }

    fn deliver_interrupt_unfailingly(&mut self, vector: u8, source: InterruptSource) {
        if let Err(fault) = self.interrupt(vector, source, None) {
            self.raise_fault(fault);
        }
    }

    fn service_irq(&mut self) {
        if let Some(line) = self.irq.take_pending() {
            let vector = if line < 8 { 0x08 + line } else { 0x70 + line - 8 };
            if self.state == CpuState::Halted {
                self.state = CpuState::Alive;
            }
            self.deliver_interrupt_unfailingly(vector, InterruptSource::External);
        }
    }

    /// The CPU main loop while halted (HLT): do nothing until an IRQ or an
    /// external command arrives.
    pub(crate) fn halted_loop(&mut self) {
        while self.state == CpuState::Halted {
            std::thread::sleep(std::time::Duration::from_micros(100));
            if self.commands.hard_reboot.swap(false, Ordering::SeqCst) {
                self.hard_reboot();
                return;
            }
            if self.irq.has_pending() && self.if_flag {
                self.service_irq();
            }
        }
    }

    pub fn hard_reboot(&mut self) {
        self.io.reset_all();
        self.reset();
    }

    /// Real-mode segment load used by reset, before any descriptor tables
    /// exist. Cannot fault.
    pub(crate) fn load_real_mode_segment(&mut self, segment: SegmentRegister, selector: u16) {
        debug_assert!(!self.pe() || self.vm() || self.state == CpuState::Dead);
        self.sreg[segment as usize] = selector;
        let mut descriptor = self.real_mode_or_vm86_descriptor(selector, Some(segment));
        if segment == SegmentRegister::Ss {
            descriptor.loaded_in_ss = true;
        }
        self.descriptors[segment as usize] = descriptor;
        match segment {
            SegmentRegister::Cs => self.update_default_sizes(),
            SegmentRegister::Ss => self.update_stack_size(),
            _ => {}
        }
    }

    // --- descriptor table registers; the machine and the test harness load
    //     them directly when no guest code has run yet ---

    pub fn gdtr(&self) -> &DescriptorTableRegister {
        &self.gdtr
    }

    pub fn idtr(&self) -> &DescriptorTableRegister {
        &self.idtr
    }

    pub fn ldtr(&self) -> &DescriptorTableRegister {
        &self.ldtr
    }

    pub fn set_gdtr(&mut self, base: LinearAddress, limit: u16) {
        self.gdtr.base = base;
        self.gdtr.limit = limit;
    }

    pub fn set_idtr(&mut self, base: LinearAddress, limit: u16) {
        self.idtr.base = base;
        self.idtr.limit = limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RuntimeOptions;

    #[test]
    fn byte_registers_alias_their_words() {
        let mut cpu = Cpu::new(RuntimeOptions::default(), true);
        cpu.set_eax(0x1122_3344);
        assert_eq!(cpu.ax(), 0x3344);
        assert_eq!(cpu.al(), 0x44);
        assert_eq!(cpu.ah(), 0x33);
        cpu.set_ah(0xaa);
        assert_eq!(cpu.eax(), 0x1122_aa44);
        cpu.set_al(0xbb);
        assert_eq!(cpu.eax(), 0x1122_aabb);
        cpu.set_ax(0xccdd);
        assert_eq!(cpu.eax(), 0x1122_ccdd);
    }

    #[test]
    fn reset_state_matches_the_reset_vector() {
        let mut cpu = Cpu::new(RuntimeOptions::default(), false);
        cpu.set_reset_vector(LogicalAddress::new(0xf000, 0xfff0));
        cpu.reset();
        assert_eq!(cpu.cs(), 0xf000);
        assert_eq!(cpu.eip(), 0xfff0);
        assert_eq!(cpu.get_flags() & 0x0200, 0x0200);
        assert_eq!(cpu.iopl(), 3);
        assert_eq!(cpu.cr0(), 0);
        assert!(!cpu.pe());
        assert_eq!(cpu.cached_descriptor(SegmentRegister::Cs).base, 0xf0000);
        assert_eq!(
            cpu.cached_descriptor(SegmentRegister::Ds).effective_limit,
            0xffff
        );
    }

    #[test]
    fn a20_masks_bit_twenty() {
        let mut cpu = Cpu::new(RuntimeOptions::default(), true);
        assert_eq!(cpu.a20_mask(), 0xffef_ffff);
        cpu.set_a20_enabled(true);
        assert_eq!(cpu.a20_mask(), 0xffff_ffff);
    }
}
