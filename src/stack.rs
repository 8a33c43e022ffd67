// Stack machinery: the push/pop primitives at the current stack size, the
// PUSH/POP instruction families, PUSHA/POPA, the flag image pushes with the
// privilege-respecting restore rule, and ENTER/LEAVE with the nesting-level
// walk.

use crate::conversions::{sign_extended, ValueWidth};
use crate::exceptions::{ExecResult, MemResult};
use crate::fields::{reg16, MemoryAccessType, SegmentRegister, ValueSize};
use crate::flags::Eflags;
use crate::parser::Instruction;
use crate::processor::Cpu;

impl Cpu {
    pub fn push32(&mut self, value: u32) -> MemResult<()> {
        let mut new_esp = self.current_stack_pointer().wrapping_sub(4);
        if self.s16() {
            new_esp &= 0xffff;
        }
        self.write_memory32(SegmentRegister::Ss, new_esp, value)?;
        self.adjust_stack_pointer(-4);
        Ok(())
    }

    pub fn push16(&mut self, value: u16) -> MemResult<()> {
        let mut new_esp = self.current_stack_pointer().wrapping_sub(2);
        if self.s16() {
            new_esp &= 0xffff;
        }
        self.write_memory16(SegmentRegister::Ss, new_esp, value)?;
        self.adjust_stack_pointer(-2);
        Ok(())
    }

    pub fn pop32(&mut self) -> MemResult<u32> {
        let value = self.read_memory32(SegmentRegister::Ss, self.current_stack_pointer())?;
        self.adjust_stack_pointer(4);
        Ok(value)
    }

    pub fn pop16(&mut self) -> MemResult<u16> {
        let value = self.read_memory16(SegmentRegister::Ss, self.current_stack_pointer())?;
        self.adjust_stack_pointer(2);
        Ok(value)
    }

    pub fn push_sized<T: ValueWidth>(&mut self, value: T) -> MemResult<()> {
        if T::BITS == 32 {
            self.push32(value.to_u32())
        } else {
            self.push16(value.to_u32() as u16)
        }
    }

    pub fn pop_sized<T: ValueWidth>(&mut self) -> MemResult<T> {
        if T::BITS == 32 {
            Ok(T::from_u32(self.pop32()?))
        } else {
            Ok(T::from_u32(self.pop16()? as u32))
        }
    }

    pub fn push_value_with_size(&mut self, value: u32, size: ValueSize) -> MemResult<()> {
        if size == ValueSize::Word {
            self.push16(value as u16)
        } else {
            self.push32(value)
        }
    }

    pub fn push_operand_sized_value(&mut self, value: u32) -> MemResult<()> {
        if self.o16() {
            self.push16(value as u16)
        } else {
            self.push32(value)
        }
    }

    pub fn pop_operand_sized_value(&mut self) -> MemResult<u32> {
        if self.o16() {
            Ok(self.pop16()? as u32)
        } else {
            self.pop32()
        }
    }

    /// Segment register pushes write 16 bits but move the stack pointer by
    /// the operand size.
    pub fn push_segment_register_value(&mut self, value: u16) -> MemResult<()> {
        if self.o16() {
            return self.push16(value);
        }
        let mut new_esp = self.current_stack_pointer().wrapping_sub(4);
        if self.s16() {
            new_esp &= 0xffff;
        }
        self.write_memory16(SegmentRegister::Ss, new_esp, value)?;
        self.adjust_stack_pointer(-4);
        Ok(())
    }

    // --- PUSH/POP instruction forms ---

    pub(crate) fn push_reg16(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: u16 = insn.reg(self);
        self.push16(value)?;
        Ok(())
    }

    pub(crate) fn push_reg32(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: u32 = insn.reg(self);
        self.push32(value)?;
        Ok(())
    }

    pub(crate) fn pop_reg16(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = self.pop16()?;
        insn.set_reg(self, value);
        Ok(())
    }

    pub(crate) fn pop_reg32(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = self.pop32()?;
        insn.set_reg(self, value);
        Ok(())
    }

    pub(crate) fn push_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read16(self)?;
        self.push16(value)?;
        Ok(())
    }

    pub(crate) fn push_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read32(self)?;
        self.push32(value)?;
        Ok(())
    }

    // If ESP is a base register for the destination, POP uses the
    // incremented value; re-resolve after the pop.

    pub(crate) fn pop_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = self.pop16()?;
        insn.modrm.resolve(self);
        insn.modrm.write16(self, value)?;
        Ok(())
    }

    pub(crate) fn pop_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = self.pop32()?;
        insn.modrm.resolve(self);
        insn.modrm.write32(self, value)?;
        Ok(())
    }

    pub(crate) fn push_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        if self.o32() {
            self.push32(sign_extended::<u8, u32>(insn.imm8()))?;
        } else {
            self.push16(sign_extended::<u8, u16>(insn.imm8()))?;
        }
        Ok(())
    }

    pub(crate) fn push_imm16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.push16(insn.imm16())?;
        Ok(())
    }

    pub(crate) fn push_imm32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.push32(insn.imm32())?;
        Ok(())
    }

    pub(crate) fn push_cs(&mut self, _insn: &mut Instruction) -> ExecResult {
        let value = self.cs();
        self.push_segment_register_value(value)?;
        Ok(())
    }

    pub(crate) fn push_ds(&mut self, _insn: &mut Instruction) -> ExecResult {
        let value = self.ds();
        self.push_segment_register_value(value)?;
        Ok(())
    }

    pub(crate) fn push_es(&mut self, _insn: &mut Instruction) -> ExecResult {
        let value = self.es();
        self.push_segment_register_value(value)?;
        Ok(())
    }

    pub(crate) fn push_ss(&mut self, _insn: &mut Instruction) -> ExecResult {
        let value = self.ss();
        self.push_segment_register_value(value)?;
        Ok(())
    }

    pub(crate) fn push_fs(&mut self, _insn: &mut Instruction) -> ExecResult {
        let value = self.fs();
        self.push_segment_register_value(value)?;
        Ok(())
    }

    pub(crate) fn push_gs(&mut self, _insn: &mut Instruction) -> ExecResult {
        let value = self.gs();
        self.push_segment_register_value(value)?;
        Ok(())
    }

    pub(crate) fn pop_ds(&mut self, _insn: &mut Instruction) -> ExecResult {
        let value = self.pop_operand_sized_value()? as u16;
        self.write_segment_register(SegmentRegister::Ds, value)?;
        Ok(())
    }

    pub(crate) fn pop_es(&mut self, _insn: &mut Instruction) -> ExecResult {
        let value = self.pop_operand_sized_value()? as u16;
        self.write_segment_register(SegmentRegister::Es, value)?;
        Ok(())
    }

    pub(crate) fn pop_ss(&mut self, _insn: &mut Instruction) -> ExecResult {
        let value = self.pop_operand_sized_value()? as u16;
        self.write_segment_register(SegmentRegister::Ss, value)?;
        self.make_next_instruction_uninterruptible();
        Ok(())
    }

    pub(crate) fn pop_fs(&mut self, _insn: &mut Instruction) -> ExecResult {
        let value = self.pop_operand_sized_value()? as u16;
        self.write_segment_register(SegmentRegister::Fs, value)?;
        Ok(())
    }

    pub(crate) fn pop_gs(&mut self, _insn: &mut Instruction) -> ExecResult {
        let value = self.pop_operand_sized_value()? as u16;
        self.write_segment_register(SegmentRegister::Gs, value)?;
        Ok(())
    }

    // --- flag images ---

    pub(crate) fn pushf(&mut self, _insn: &mut Instruction) -> ExecResult {
        if self.pe() && self.vm() && self.iopl() < 3 {
            return Err(self
                .general_protection_fault(0, "PUSHF in VM86 mode with IOPL < 3")
                .into());
        }
        let flags = self.get_flags();
        self.push16(flags)?;
        Ok(())
    }

    pub(crate) fn pushfd(&mut self, _insn: &mut Instruction) -> ExecResult {
        if self.pe() && self.vm() && self.iopl() < 3 {
            return Err(self
                .general_protection_fault(0, "PUSHFD in VM86 mode with IOPL < 3")
                .into());
        }
        let eflags = self.get_eflags() & 0x00fc_ffff;
        self.push32(eflags)?;
        Ok(())
    }

    pub(crate) fn popf(&mut self, _insn: &mut Instruction) -> ExecResult {
        if self.pe() && self.vm() && self.iopl() < 3 {
            return Err(self
                .general_protection_fault(0, "POPF in VM86 mode with IOPL < 3")
                .into());
        }
        let flags = self.pop16()? as u32;
        self.set_eflags_respectfully(flags, self.cpl());
        Ok(())
    }

    pub(crate) fn popfd(&mut self, _insn: &mut Instruction) -> ExecResult {
        if self.pe() && self.vm() && self.iopl() < 3 {
            return Err(self
                .general_protection_fault(0, "POPFD in VM86 mode with IOPL < 3")
                .into());
        }
        let flags = self.pop32()?;
        self.set_eflags_respectfully(flags, self.cpl());
        Ok(())
    }

    /// Load a new EFLAGS image while preserving what the current privilege
    /// is not allowed to change: VIP/VIF/RF always, IOPL unless ring 0,
    /// IF unless CPL <= IOPL. RF is cleared after the load.
    pub fn set_eflags_respectfully(&mut self, new_flags: u32, effective_cpl: u8) {
        let old_flags = self.get_eflags();
        let mut flags_to_keep = Eflags::VIP.bits() | Eflags::VIF.bits() | Eflags::RF.bits();
        if self.o16() {
            flags_to_keep |= 0xffff_0000;
        }
        if self.vm() {
            flags_to_keep |= Eflags::IOPL.bits();
        }
        if self.pe() && effective_cpl != 0 {
            flags_to_keep |= Eflags::IOPL.bits();
            if effective_cpl > self.iopl() {
                flags_to_keep |= Eflags::IF.bits();
            }
        }
        let mut flags = new_flags & !flags_to_keep;
        flags |= old_flags & flags_to_keep;
        flags &= !Eflags::RF.bits();
        self.set_eflags(flags);
    }

    // --- PUSHA / POPA ---

    fn do_pusha<T: ValueWidth>(&mut self) -> MemResult<()> {
        let mut new_esp = self
            .current_stack_pointer()
            .wrapping_sub(T::BITS / 8 * 8);
        if self.s16() {
            new_esp &= 0xffff;
        }
        self.snoop_segment(
            SegmentRegister::Ss,
            self.current_stack_pointer(),
            MemoryAccessType::Write,
        )?;
        self.snoop_segment(SegmentRegister::Ss, new_esp, MemoryAccessType::Write)?;

        let old_stack_pointer: T = self.read_reg(reg16::SP);
        self.push_sized::<T>(self.read_reg(reg16::AX))?;
        self.push_sized::<T>(self.read_reg(reg16::CX))?;
        self.push_sized::<T>(self.read_reg(reg16::DX))?;
        self.push_sized::<T>(self.read_reg(reg16::BX))?;
        self.push_sized::<T>(old_stack_pointer)?;
        self.push_sized::<T>(self.read_reg(reg16::BP))?;
        self.push_sized::<T>(self.read_reg(reg16::SI))?;
        self.push_sized::<T>(self.read_reg(reg16::DI))?;
        Ok(())
    }

    fn do_popa<T: ValueWidth>(&mut self) -> MemResult<()> {
        let mut new_esp = self
            .current_stack_pointer()
            .wrapping_add(T::BITS / 8 * 8);
        if self.s16() {
            new_esp &= 0xffff;
        }
        self.snoop_segment(
            SegmentRegister::Ss,
            self.current_stack_pointer(),
            MemoryAccessType::Read,
        )?;
        self.snoop_segment(SegmentRegister::Ss, new_esp, MemoryAccessType::Read)?;

        let value: T = self.pop_sized()?;
        self.write_reg(reg16::DI, value);
        let value: T = self.pop_sized()?;
        self.write_reg(reg16::SI, value);
        let value: T = self.pop_sized()?;
        self.write_reg(reg16::BP, value);
        let _discarded: T = self.pop_sized()?;
        let value: T = self.pop_sized()?;
        self.write_reg(reg16::BX, value);
        let value: T = self.pop_sized()?;
        self.write_reg(reg16::DX, value);
        let value: T = self.pop_sized()?;
        self.write_reg(reg16::CX, value);
        let value: T = self.pop_sized()?;
        self.write_reg(reg16::AX, value);
        Ok(())
    }

    pub(crate) fn pusha(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.do_pusha::<u16>()?;
        Ok(())
    }

    pub(crate) fn pushad(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.do_pusha::<u32>()?;
        Ok(())
    }

    pub(crate) fn popa(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.do_popa::<u16>()?;
        Ok(())
    }

    pub(crate) fn popad(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.do_popa::<u32>()?;
        Ok(())
    }

    // --- ENTER / LEAVE ---

    fn do_enter<T: ValueWidth>(&mut self, insn: &mut Instruction) -> MemResult<()> {
        let size = insn.imm16_2();
        let nesting_level = insn.imm8_1() & 31;
        self.push_sized::<T>(self.read_reg(reg16::BP))?;
        let frame_temp: T = self.read_reg(reg16::SP);

        if nesting_level > 0 {
            let mut temp_base_pointer = self.current_base_pointer();
            for _ in 1..nesting_level {
                temp_base_pointer = temp_base_pointer.wrapping_sub(T::BITS / 8);
                let link: T = self.read_memory(
                    SegmentRegister::Ss,
                    temp_base_pointer,
                    MemoryAccessType::Read,
                )?;
                self.push_sized(link)?;
            }
            self.push_sized(frame_temp)?;
        }
        self.write_reg(reg16::BP, frame_temp);
        self.adjust_stack_pointer(-(size as i32));
        self.snoop_segment(
            SegmentRegister::Ss,
            self.current_stack_pointer(),
            MemoryAccessType::Write,
        )?;
        Ok(())
    }

    fn do_leave<T: ValueWidth>(&mut self) -> MemResult<()> {
        let new_base_pointer: T = self.read_memory(
            SegmentRegister::Ss,
            self.current_base_pointer(),
            MemoryAccessType::Read,
        )?;
        self.set_current_stack_pointer(self.current_base_pointer().wrapping_add(T::BITS / 8));
        self.write_reg(reg16::BP, new_base_pointer);
        Ok(())
    }

    pub(crate) fn enter16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_enter::<u16>(insn)?;
        Ok(())
    }

    pub(crate) fn enter32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_enter::<u32>(insn)?;
        Ok(())
    }

    pub(crate) fn leave16(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.do_leave::<u16>()?;
        Ok(())
    }

    pub(crate) fn leave32(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.do_leave::<u32>()?;
        Ok(())
    }
}

/// Stages pops against a scratch stack pointer so a faulting far return can
/// leave the real one untouched; `commit` applies the accumulated offset.
pub struct TransactionalPopper {
    offset: i32,
}

impl TransactionalPopper {
    pub fn new() -> TransactionalPopper {
        TransactionalPopper { offset: 0 }
    }

    pub fn commit(self, cpu: &mut Cpu) {
        cpu.adjust_stack_pointer(self.offset);
    }

    pub fn pop32(&mut self, cpu: &mut Cpu) -> MemResult<u32> {
        let mut new_esp = cpu.current_stack_pointer().wrapping_add(self.offset as u32);
        if cpu.s16() {
            new_esp &= 0xffff;
        }
        let data = cpu.read_memory32(SegmentRegister::Ss, new_esp)?;
        self.offset += 4;
        Ok(data)
    }

    pub fn pop16(&mut self, cpu: &mut Cpu) -> MemResult<u16> {
        let mut new_esp = cpu.current_stack_pointer().wrapping_add(self.offset as u32);
        if cpu.s16() {
            new_esp &= 0xffff;
        }
        let data = cpu.read_memory16(SegmentRegister::Ss, new_esp)?;
        self.offset += 2;
        Ok(data)
    }

    pub fn pop_operand_sized_value(&mut self, cpu: &mut Cpu) -> MemResult<u32> {
        if cpu.o16() {
            Ok(self.pop16(cpu)? as u32)
        } else {
            self.pop32(cpu)
        }
    }

    pub fn adjust_stack_pointer(&mut self, adjustment: i32) {
        self.offset += adjustment;
    }

    pub fn adjusted_stack_pointer(&self, cpu: &Cpu) -> u32 {
        cpu.current_stack_pointer().wrapping_add(self.offset as u32)
    }
}

impl Default for TransactionalPopper {
    fn default() -> Self {
        TransactionalPopper::new()
    }
}
