// Task state segments and hardware task switching. A TSS is just a window
// onto guest memory; the accessors dispatch on the 16/32-bit layout cached
// when the task register was loaded. Task switches save the outgoing
// register file, flip busy bits in the GDT through the raw descriptor
// halves, load the incoming file and only then validate the new selectors.

use crate::conversions::ValueWidth;
use crate::descriptors::Descriptor;
use crate::exceptions::{ExecResult, MemResult};
use crate::fields::{JumpType, LinearAddress, SegmentRegister};
use crate::flags::Eflags;
use crate::parser::Instruction;
use crate::processor::{cr0, Cpu};

mod tss32 {
    pub const BACKLINK: u32 = 0;
    pub const ESP0: u32 = 4;
    pub const SS0: u32 = 8;
    pub const ESP1: u32 = 12;
    pub const SS1: u32 = 16;
    pub const ESP2: u32 = 20;
    pub const SS2: u32 = 24;
    pub const CR3: u32 = 28;
    pub const EIP: u32 = 32;
    pub const EFLAGS: u32 = 36;
    pub const EAX: u32 = 40;
    pub const ECX: u32 = 44;
    pub const EDX: u32 = 48;
    pub const EBX: u32 = 52;
    pub const ESP: u32 = 56;
    pub const EBP: u32 = 60;
    pub const ESI: u32 = 64;
    pub const EDI: u32 = 68;
    pub const ES: u32 = 72;
    pub const CS: u32 = 76;
    pub const SS: u32 = 80;
    pub const DS: u32 = 84;
    pub const FS: u32 = 88;
    pub const GS: u32 = 92;
    pub const LDT: u32 = 96;
    pub const IOMAP_BASE: u32 = 102;
}

mod tss16 {
    pub const BACKLINK: u32 = 0;
    pub const SP0: u32 = 2;
    pub const SS0: u32 = 4;
    pub const SP1: u32 = 6;
    pub const SS1: u32 = 8;
    pub const SP2: u32 = 10;
    pub const SS2: u32 = 12;
    pub const IP: u32 = 14;
    pub const FLAGS: u32 = 16;
    pub const AX: u32 = 18;
    pub const CX: u32 = 20;
    pub const DX: u32 = 22;
    pub const BX: u32 = 24;
    pub const SP: u32 = 26;
    pub const BP: u32 = 28;
    pub const SI: u32 = 30;
    pub const DI: u32 = 32;
    pub const ES: u32 = 34;
    pub const CS: u32 = 36;
    pub const SS: u32 = 38;
    pub const DS: u32 = 40;
    pub const FS: u32 = 42;
    pub const GS: u32 = 44;
    pub const LDT: u32 = 46;
}

/// A view of a task state segment in guest memory.
#[derive(Debug, Clone, Copy)]
pub struct Tss {
    base: LinearAddress,
    is_32bit: bool,
}

macro_rules! tss_field_16or32 {
    ($get:ident, $set:ident, $off32:expr, $off16:expr) => {
        pub fn $get(&self, cpu: &mut Cpu) -> MemResult<u32> {
            if self.is_32bit {
                cpu.read_metal32(self.base.offset($off32))
            } else {
                Ok(cpu.read_metal16(self.base.offset($off16))? as u32)
            }
        }
        pub fn $set(&self, cpu: &mut Cpu, value: u32) -> MemResult<()> {
            if self.is_32bit {
                cpu.write_metal32(self.base.offset($off32), value)
            } else {
                cpu.write_metal16(self.base.offset($off16), value as u16)
            }
        }
    };
}

macro_rules! tss_field_16 {
    ($get:ident, $set:ident, $off32:expr, $off16:expr) => {
        pub fn $get(&self, cpu: &mut Cpu) -> MemResult<u16> {
            if self.is_32bit {
                cpu.read_metal16(self.base.offset($off32))
            } else {
                cpu.read_metal16(self.base.offset($off16))
            }
        }
        pub fn $set(&self, cpu: &mut Cpu, value: u16) -> MemResult<()> {
            if self.is_32bit {
                cpu.write_metal16(self.base.offset($off32), value)
            } else {
                cpu.write_metal16(self.base.offset($off16), value)
            }
        }
    };
}

impl Tss {
    pub fn new(base: LinearAddress, is_32bit: bool) -> Tss {
        Tss { base, is_32bit }
    }

    pub fn is_32bit(&self) -> bool {
        self.is_32bit
    }

    tss_field_16or32!(eax, set_eax, tss32::EAX, tss16::AX);
    tss_field_16or32!(ebx, set_ebx, tss32::EBX, tss16::BX);
    tss_field_16or32!(ecx, set_ecx, tss32::ECX, tss16::CX);
    tss_field_16or32!(edx, set_edx, tss32::EDX, tss16::DX);
    tss_field_16or32!(esi, set_esi, tss32::ESI, tss16::SI);
    tss_field_16or32!(edi, set_edi, tss32::EDI, tss16::DI);
    tss_field_16or32!(ebp, set_ebp, tss32::EBP, tss16::BP);
    tss_field_16or32!(esp, set_esp, tss32::ESP, tss16::SP);
    tss_field_16or32!(eip, set_eip, tss32::EIP, tss16::IP);
    tss_field_16or32!(eflags, set_eflags, tss32::EFLAGS, tss16::FLAGS);
    tss_field_16or32!(esp0_raw, set_esp0, tss32::ESP0, tss16::SP0);
    tss_field_16or32!(esp1_raw, set_esp1, tss32::ESP1, tss16::SP1);
    tss_field_16or32!(esp2_raw, set_esp2, tss32::ESP2, tss16::SP2);

    tss_field_16!(backlink, set_backlink, tss32::BACKLINK, tss16::BACKLINK);
    tss_field_16!(ldt, set_ldt, tss32::LDT, tss16::LDT);
    tss_field_16!(cs, set_cs, tss32::CS, tss16::CS);
    tss_field_16!(ds, set_ds, tss32::DS, tss16::DS);
    tss_field_16!(es, set_es, tss32::ES, tss16::ES);
    tss_field_16!(ss, set_ss, tss32::SS, tss16::SS);
    tss_field_16!(fs, set_fs, tss32::FS, tss16::FS);
    tss_field_16!(gs, set_gs, tss32::GS, tss16::GS);
    tss_field_16!(ss0_raw, set_ss0, tss32::SS0, tss16::SS0);
    tss_field_16!(ss1_raw, set_ss1, tss32::SS1, tss16::SS1);
    tss_field_16!(ss2_raw, set_ss2, tss32::SS2, tss16::SS2);

    pub fn ss0(&self, cpu: &mut Cpu) -> MemResult<u16> {
        self.ss0_raw(cpu)
    }

    pub fn esp0(&self, cpu: &mut Cpu) -> MemResult<u32> {
        self.esp0_raw(cpu)
    }

    pub fn cr3(&self, cpu: &mut Cpu) -> MemResult<u32> {
        debug_assert!(self.is_32bit);
        cpu.read_metal32(self.base.offset(tss32::CR3))
    }

    pub fn set_cr3(&self, cpu: &mut Cpu, value: u32) -> MemResult<()> {
        debug_assert!(self.is_32bit);
        cpu.write_metal32(self.base.offset(tss32::CR3), value)
    }

    pub fn io_map_base(&self, cpu: &mut Cpu) -> MemResult<u16> {
        debug_assert!(self.is_32bit);
        cpu.read_metal16(self.base.offset(tss32::IOMAP_BASE))
    }

    pub fn ring_ss(&self, cpu: &mut Cpu, ring: u8) -> MemResult<u16> {
        match ring {
            0 => self.ss0_raw(cpu),
            1 => self.ss1_raw(cpu),
            _ => self.ss2_raw(cpu),
        }
    }

    pub fn ring_esp(&self, cpu: &mut Cpu, ring: u8) -> MemResult<u32> {
        match ring {
            0 => self.esp0_raw(cpu),
            1 => self.esp1_raw(cpu),
            _ => self.esp2_raw(cpu),
        }
    }
}

impl Cpu {
    pub fn current_tss(&self) -> Tss {
        Tss::new(self.tr.base, self.tr.is_32bit)
    }

    pub fn task_register(&self) -> &crate::processor::TaskRegister {
        &self.tr
    }

    pub(crate) fn task_switch_to_selector(
        &mut self,
        selector: u16,
        jump_type: JumpType,
    ) -> MemResult<()> {
        let descriptor = self.get_descriptor(selector)?;
        if !descriptor.is_tss() {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                "task switch target is not a TSS",
            ));
        }
        self.task_switch(selector, descriptor, jump_type)
    }

    pub(crate) fn task_switch(
        &mut self,
        task_selector: u16,
        mut incoming_descriptor: Descriptor,
        source: JumpType,
    ) -> MemResult<()> {
        if incoming_descriptor.is_null() {
            return Err(self.general_protection_fault(0, "incoming TSS descriptor is null"));
        }
        if !incoming_descriptor.global {
            if source == JumpType::Iret {
                return Err(self.invalid_tss(
                    task_selector & 0xfffc,
                    "incoming TSS descriptor is not from the GDT",
                ));
            }
            return Err(self.general_protection_fault(
                task_selector & 0xfffc,
                "incoming TSS descriptor is not from the GDT",
            ));
        }
        if !incoming_descriptor.present {
            return Err(self.not_present(
                task_selector & 0xfffc,
                "incoming TSS descriptor is not present",
            ));
        }

        let incoming_tss_descriptor = incoming_descriptor.as_tss();
        if !incoming_tss_descriptor.is_32bit() {
            return Err(self.invalid_tss(
                task_selector & 0xfffc,
                "incoming TSS descriptor is not a 32-bit TSS",
            ));
        }
        if incoming_tss_descriptor.limit < 108 {
            return Err(self.invalid_tss(
                task_selector & 0xfffc,
                "incoming TSS descriptor limit too small",
            ));
        }

        if source == JumpType::Iret {
            if !incoming_tss_descriptor.is_busy() {
                return Err(self.invalid_tss(
                    task_selector & 0xfffc,
                    "incoming TSS descriptor is not busy",
                ));
            }
        } else if incoming_tss_descriptor.is_busy() {
            return Err(self.general_protection_fault(
                task_selector & 0xfffc,
                "incoming TSS descriptor is busy",
            ));
        }

        let outgoing_selector = self.tr.selector;
        let mut outgoing_descriptor = self.get_descriptor(outgoing_selector)?;
        if !outgoing_descriptor.is_tss() {
            // What have we got ourselves into now?
            log::warn!(
                target: "cpu",
                "switching tasks and the outgoing TR({:04x}) is not a TSS",
                outgoing_selector
            );
        }

        if outgoing_descriptor.is_tss()
            && outgoing_descriptor.as_tss().base == incoming_tss_descriptor.base
        {
            log::debug!(
                target: "cpu",
                "switching to the same TSS ({:#010x})",
                incoming_tss_descriptor.base.get()
            );
        }

        let outgoing_tss = Tss::new(self.tr.base, self.tr.is_32bit);

        let value = self.eax();
        outgoing_tss.set_eax(self, value)?;
        let value = self.ebx();
        outgoing_tss.set_ebx(self, value)?;
        let value = self.ecx();
        outgoing_tss.set_ecx(self, value)?;
        let value = self.edx();
        outgoing_tss.set_edx(self, value)?;
        let value = self.ebp();
        outgoing_tss.set_ebp(self, value)?;
        let value = self.esp();
        outgoing_tss.set_esp(self, value)?;
        let value = self.esi();
        outgoing_tss.set_esi(self, value)?;
        let value = self.edi();
        outgoing_tss.set_edi(self, value)?;

        if (source == JumpType::Jmp || source == JumpType::Iret) && outgoing_descriptor.is_tss() {
            outgoing_descriptor.set_tss_available();
            self.write_to_gdt(&outgoing_descriptor)?;
        }

        let mut outgoing_eflags = self.get_eflags();
        if source == JumpType::Iret {
            outgoing_eflags &= !Eflags::NT.bits();
        }
        outgoing_tss.set_eflags(self, outgoing_eflags)?;

        let value = self.cs();
        outgoing_tss.set_cs(self, value)?;
        let value = self.ds();
        outgoing_tss.set_ds(self, value)?;
        let value = self.es();
        outgoing_tss.set_es(self, value)?;
        let value = self.fs();
        outgoing_tss.set_fs(self, value)?;
        let value = self.gs();
        outgoing_tss.set_gs(self, value)?;
        let value = self.ss();
        outgoing_tss.set_ss(self, value)?;
        let value = self.ldtr.selector;
        outgoing_tss.set_ldt(self, value)?;
        let value = self.eip();
        outgoing_tss.set_eip(self, value)?;
        if self.pg() {
            let value = self.cr3();
            outgoing_tss.set_cr3(self, value)?;
        }

        let incoming_tss = Tss::new(incoming_tss_descriptor.base, true);

        // First load everything from the incoming TSS without validating it.
        self.cr3 = incoming_tss.cr3(self)?;

        let incoming_ldt = incoming_tss.ldt(self)?;
        self.ldtr.selector = incoming_ldt;
        self.ldtr.base = LinearAddress(0);
        self.ldtr.limit = 0;

        let incoming_cs = incoming_tss.cs(self)?;
        let incoming_ds = incoming_tss.ds(self)?;
        let incoming_es = incoming_tss.es(self)?;
        let incoming_fs = incoming_tss.fs(self)?;
        let incoming_gs = incoming_tss.gs(self)?;
        let incoming_ss = incoming_tss.ss(self)?;
        self.sreg[SegmentRegister::Cs as usize] = incoming_cs;
        self.sreg[SegmentRegister::Ds as usize] = incoming_ds;
        self.sreg[SegmentRegister::Es as usize] = incoming_es;
        self.sreg[SegmentRegister::Fs as usize] = incoming_fs;
        self.sreg[SegmentRegister::Gs as usize] = incoming_gs;
        self.sreg[SegmentRegister::Ss as usize] = incoming_ss;

        let mut incoming_eflags = incoming_tss.eflags(self)?;
        if incoming_eflags & Eflags::VM.bits() != 0 {
            return Err(self.invalid_tss(
                task_selector & 0xfffc,
                "incoming task is in VM86 mode",
            ));
        }
        if source == JumpType::Call || source == JumpType::Int {
            incoming_eflags |= Eflags::NT.bits();
        }
        self.set_eflags(incoming_eflags);

        let value = incoming_tss.eax(self)?;
        self.set_eax(value);
        let value = incoming_tss.ebx(self)?;
        self.set_ebx(value);
        let value = incoming_tss.ecx(self)?;
        self.set_ecx(value);
        let value = incoming_tss.edx(self)?;
        self.set_edx(value);
        let value = incoming_tss.ebp(self)?;
        self.set_ebp(value);
        let value = incoming_tss.esp(self)?;
        self.set_esp(value);
        let value = incoming_tss.esi(self)?;
        self.set_esi(value);
        let value = incoming_tss.edi(self)?;
        self.set_edi(value);
        let incoming_eip = incoming_tss.eip(self)?;

        if source == JumpType::Call || source == JumpType::Int {
            incoming_tss.set_backlink(self, outgoing_selector)?;
        }

        self.tr.selector = task_selector;
        self.tr.base = incoming_tss_descriptor.base;
        self.tr.limit = incoming_tss_descriptor.limit as u16;
        self.tr.is_32bit = incoming_tss_descriptor.is_32bit();

        if source != JumpType::Iret {
            incoming_descriptor.set_tss_busy();
            self.write_to_gdt(&incoming_descriptor)?;
        }

        self.cr0 |= cr0::TS;

        // Now let's validate.
        let ldt_descriptor = self.get_descriptor(incoming_ldt)?;
        if !ldt_descriptor.is_null() {
            if !ldt_descriptor.global {
                return Err(
                    self.invalid_tss(incoming_ldt & 0xfffc, "incoming LDT is not in the GDT")
                );
            }
            if !ldt_descriptor.is_ldt() {
                return Err(self.invalid_tss(incoming_ldt & 0xfffc, "incoming LDT is not an LDT"));
            }
            if !ldt_descriptor.present {
                return Err(self.invalid_tss(incoming_ldt & 0xfffc, "incoming LDT is not present"));
            }
        }

        let incoming_cpl = (incoming_cs & 3) as u8;

        let cs_descriptor = self.get_descriptor(incoming_cs)?;
        if cs_descriptor.is_code() {
            if cs_descriptor.is_nonconforming_code() {
                if cs_descriptor.dpl != incoming_cpl {
                    return Err(self.invalid_tss(
                        incoming_cs & 0xfffc,
                        &format!(
                            "CS is non-conforming with DPL({}) != RPL({})",
                            cs_descriptor.dpl, incoming_cpl
                        ),
                    ));
                }
            } else if cs_descriptor.dpl > incoming_cpl {
                return Err(self.invalid_tss(
                    incoming_cs & 0xfffc,
                    "CS is conforming with DPL > RPL",
                ));
            }
        }

        let ss_descriptor = self.get_descriptor(incoming_ss)?;
        if !ss_descriptor.is_null() {
            if ss_descriptor.is_outside_table_limits() {
                return Err(self.invalid_tss(incoming_ss & 0xfffc, "SS outside table limits"));
            }
            if !ss_descriptor.is_data() {
                return Err(self.invalid_tss(incoming_ss & 0xfffc, "SS is not a data segment"));
            }
            if !ss_descriptor.as_segment().writable() {
                return Err(self.invalid_tss(incoming_ss & 0xfffc, "SS is not writable"));
            }
            if !ss_descriptor.present {
                return Err(self.stack_fault(incoming_ss & 0xfffc, "SS is not present"));
            }
            if ss_descriptor.dpl != incoming_cpl {
                return Err(self.invalid_tss(
                    incoming_ss & 0xfffc,
                    &format!(
                        "SS DPL({}) != CPL({})",
                        ss_descriptor.dpl, incoming_cpl
                    ),
                ));
            }
            if ss_descriptor.dpl != (incoming_ss & 3) as u8 {
                return Err(self.invalid_tss(incoming_ss & 0xfffc, "SS DPL != RPL"));
            }
        }

        if !cs_descriptor.is_code() {
            return Err(self.invalid_tss(incoming_cs & 0xfffc, "CS is not a code segment"));
        }
        if !cs_descriptor.present {
            return Err(self.invalid_tss(incoming_cs & 0xfffc, "CS is not present"));
        }

        for selector in [incoming_ds, incoming_es, incoming_fs, incoming_gs] {
            let descriptor = self.get_descriptor(selector)?;
            if descriptor.is_null() {
                continue;
            }
            if descriptor.is_outside_table_limits() {
                return Err(
                    self.invalid_tss(selector & 0xfffc, "DS/ES/FS/GS outside table limits")
                );
            }
            if !descriptor.is_segment() {
                return Err(self.invalid_tss(selector & 0xfffc, "DS/ES/FS/GS is a system segment"));
            }
            if !descriptor.present {
                return Err(self.not_present(selector & 0xfffc, "DS/ES/FS/GS is not present"));
            }
            if !descriptor.is_conforming_code() && descriptor.dpl < incoming_cpl {
                return Err(self.invalid_tss(
                    selector & 0xfffc,
                    "DS/ES/FS/GS has DPL < CPL and is not a conforming code segment",
                ));
            }
        }

        self.set_ldt(incoming_ldt)?;
        self.write_segment_register(SegmentRegister::Cs, incoming_cs)?;
        self.write_segment_register(SegmentRegister::Es, incoming_es)?;
        self.write_segment_register(SegmentRegister::Ds, incoming_ds)?;
        self.write_segment_register(SegmentRegister::Fs, incoming_fs)?;
        self.write_segment_register(SegmentRegister::Gs, incoming_gs)?;
        self.write_segment_register(SegmentRegister::Ss, incoming_ss)?;
        self.set_eip(incoming_eip);

        if self.eip() > self.cached_descriptor(SegmentRegister::Cs).effective_limit {
            return Err(
                self.general_protection_fault(0, "task switch to EIP outside CS limit")
            );
        }

        if self.tf() {
            log::debug!(target: "cpu", "leaving task switch with TF=1");
        }
        Ok(())
    }

    // --- LTR / STR ---

    pub(crate) fn ltr_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.vm() {
            return Err(self
                .invalid_opcode("LTR not recognized in real/VM86 mode")
                .into());
        }
        if self.cpl() != 0 {
            return Err(self.general_protection_fault(0, "LTR with CPL != 0").into());
        }

        let selector = insn.modrm.read16(self)?;
        let mut descriptor = self.get_descriptor(selector)?;

        if descriptor.is_null() {
            return Err(self.general_protection_fault(0, "LTR with null selector").into());
        }
        if !descriptor.global {
            return Err(self
                .general_protection_fault(selector & 0xfffc, "LTR selector must reference the GDT")
                .into());
        }
        if !descriptor.is_tss() {
            return Err(self
                .general_protection_fault(selector & 0xfffc, "LTR with non-TSS descriptor")
                .into());
        }
        let tss_descriptor = descriptor.as_tss();
        if tss_descriptor.is_busy() {
            return Err(self
                .general_protection_fault(selector & 0xfffc, "LTR with busy TSS")
                .into());
        }
        if !descriptor.present {
            return Err(self
                .not_present(selector & 0xfffc, "LTR with non-present TSS")
                .into());
        }

        descriptor.set_tss_busy();
        self.write_to_gdt(&descriptor)?;

        self.tr.selector = selector;
        self.tr.base = tss_descriptor.base;
        self.tr.limit = tss_descriptor.limit as u16;
        self.tr.is_32bit = tss_descriptor.is_32bit();
        Ok(())
    }

    pub(crate) fn str_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.vm() {
            return Err(self
                .invalid_opcode("STR not recognized in real/VM86 mode")
                .into());
        }
        let selector = self.tr.selector;
        let o32 = self.o32();
        insn.modrm.write_special(self, selector as u32, o32)?;
        Ok(())
    }

    /// The TSS I/O permission bitmap check that runs before port access when
    /// (PE && (VM || CPL > IOPL)).
    pub(crate) fn validate_io_access<T: ValueWidth>(&mut self, port: u16) -> MemResult<()> {
        if !self.pe() {
            return Ok(());
        }
        if !self.vm() && self.cpl() <= self.iopl() {
            return Ok(());
        }
        let tss = self.current_tss();
        if !tss.is_32bit() {
            return Err(
                self.general_protection_fault(0, "I/O permission check with a 16-bit TSS")
            );
        }
        if self.tr.limit < 103 {
            return Err(self.general_protection_fault(0, "TSS too small, I/O map missing"));
        }

        let iomap_base = tss.io_map_base(self)?;
        let high_port = port as u32 + T::BITS / 8 - 1;

        if (self.tr.limit as u32) < iomap_base as u32 + high_port / 8 {
            return Err(self.general_protection_fault(0, "TSS I/O map too small"));
        }

        let mask = (((1u32 << (T::BITS / 8)) - 1) << (port & 7)) as u16;
        let address = self.tr.base.offset(iomap_base as u32 + port as u32 / 8);
        let permissions = if mask & 0xff00 != 0 {
            self.read_metal16(address)?
        } else {
            let byte: u8 =
                self.read_linear(address, crate::fields::MemoryAccessType::Read, Some(0))?;
            byte as u16
        };
        if permissions & mask != 0 {
            return Err(self.general_protection_fault(0, "I/O map disallowed access"));
        }
        Ok(())
    }
}
