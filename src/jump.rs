// Near control flow and the instruction-level entry points into the far
// transfer and interrupt machinery: Jcc/SETcc/CMOVcc, JCXZ, the LOOP family,
// CALL/RET in all their forms, JMP, INT n/INT3/INTO and IRET.

use crate::conversions::ValueWidth;
use crate::exceptions::ExecResult;
use crate::fields::{reg16, InterruptSource, JumpType};
use crate::parser::Instruction;
use crate::processor::Cpu;

impl Cpu {
    pub fn jump_relative8(&mut self, displacement: i8) {
        self.eip = self.eip.wrapping_add(displacement as i32 as u32);
    }

    pub fn jump_relative16(&mut self, displacement: i16) {
        self.eip = self.eip.wrapping_add(displacement as i32 as u32);
    }

    pub fn jump_relative32(&mut self, displacement: i32) {
        self.eip = self.eip.wrapping_add(displacement as u32);
    }

    pub fn jump_absolute16(&mut self, offset: u16) {
        self.eip = offset as u32;
    }

    pub fn jump_absolute32(&mut self, offset: u32) {
        self.eip = offset;
    }

    pub(crate) fn jmp_short_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        self.jump_relative8(insn.imm8() as i8);
        Ok(())
    }

    pub(crate) fn jmp_imm16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.jump_relative16(insn.imm16() as i16);
        Ok(())
    }

    pub(crate) fn jmp_imm32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.jump_relative32(insn.imm32() as i32);
        Ok(())
    }

    pub(crate) fn jmp_imm16_imm16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.far_jump(insn.imm_address16_16(), JumpType::Jmp, None)?;
        Ok(())
    }

    pub(crate) fn jmp_imm16_imm32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.far_jump(insn.imm_address16_32(), JumpType::Jmp, None)?;
        Ok(())
    }

    pub(crate) fn jmp_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let offset = insn.modrm.read16(self)?;
        self.jump_absolute16(offset);
        Ok(())
    }

    pub(crate) fn jmp_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let offset = insn.modrm.read32(self)?;
        self.jump_absolute32(offset);
        Ok(())
    }

    fn do_far_jump<T: ValueWidth>(
        &mut self,
        insn: &mut Instruction,
        jump_type: JumpType,
    ) -> ExecResult {
        if insn.modrm.is_register() {
            return Err(self
                .invalid_opcode("far JMP/CALL with register operand")
                .into());
        }
        let address = self.read_logical_address::<T>(insn.modrm.segment(), insn.modrm.offset())?;
        self.far_jump(address, jump_type, None)?;
        Ok(())
    }

    pub(crate) fn jmp_far_mem16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_far_jump::<u16>(insn, JumpType::Jmp)
    }

    pub(crate) fn jmp_far_mem32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_far_jump::<u32>(insn, JumpType::Jmp)
    }

    pub(crate) fn call_far_mem16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_far_jump::<u16>(insn, JumpType::Call)
    }

    pub(crate) fn call_far_mem32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_far_jump::<u32>(insn, JumpType::Call)
    }

    pub(crate) fn jcc_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        if self.evaluate(insn.cc()) {
            self.jump_relative8(insn.imm8() as i8);
        }
        Ok(())
    }

    pub(crate) fn jcc_near_imm(&mut self, insn: &mut Instruction) -> ExecResult {
        if !self.evaluate(insn.cc()) {
            return Ok(());
        }
        if insn.a32() {
            self.jump_relative32(insn.imm_address() as i32);
        } else {
            self.jump_relative16(insn.imm_address() as u16 as i16);
        }
        Ok(())
    }

    pub(crate) fn setcc_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = self.evaluate(insn.cc()) as u8;
        insn.modrm.write8(self, value)?;
        Ok(())
    }

    pub(crate) fn cmovcc_reg16_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read16(self)?;
        if self.evaluate(insn.cc()) {
            insn.set_reg(self, value);
        }
        Ok(())
    }

    pub(crate) fn cmovcc_reg32_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read32(self)?;
        if self.evaluate(insn.cc()) {
            insn.set_reg(self, value);
        }
        Ok(())
    }

    pub(crate) fn jcxz_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        if self.read_register_for_address_size(reg16::CX) == 0 {
            self.jump_relative8(insn.imm8() as i8);
        }
        Ok(())
    }

    fn do_loop(&mut self, insn: &mut Instruction, condition: bool) {
        if !self.decrement_cx_for_address_size() && condition {
            self.jump_relative8(insn.imm8() as i8);
        }
    }

    pub(crate) fn loop_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_loop(insn, true);
        Ok(())
    }

    pub(crate) fn loopz_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let zf = self.get_zf();
        self.do_loop(insn, zf);
        Ok(())
    }

    pub(crate) fn loopnz_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let zf = self.get_zf();
        self.do_loop(insn, !zf);
        Ok(())
    }

    pub(crate) fn call_imm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let return_ip = self.ip();
        self.push16(return_ip)?;
        self.jump_relative16(insn.imm16() as i16);
        Ok(())
    }

    pub(crate) fn call_imm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let return_eip = self.eip();
        self.push32(return_eip)?;
        self.jump_relative32(insn.imm32() as i32);
        Ok(())
    }

    pub(crate) fn call_imm16_imm16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.far_jump(insn.imm_address16_16(), JumpType::Call, None)?;
        Ok(())
    }

    pub(crate) fn call_imm16_imm32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.far_jump(insn.imm_address16_32(), JumpType::Call, None)?;
        Ok(())
    }

    pub(crate) fn call_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let offset = insn.modrm.read16(self)?;
        let return_ip = self.ip();
        self.push16(return_ip)?;
        self.jump_absolute16(offset);
        Ok(())
    }

    pub(crate) fn call_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let offset = insn.modrm.read32(self)?;
        let return_eip = self.eip();
        self.push32(return_eip)?;
        self.jump_absolute32(offset);
        Ok(())
    }

    pub(crate) fn ret(&mut self, _insn: &mut Instruction) -> ExecResult {
        let offset = self.pop_operand_sized_value()?;
        self.jump_absolute32(offset);
        Ok(())
    }

    pub(crate) fn ret_imm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let offset = self.pop_operand_sized_value()?;
        self.jump_absolute32(offset);
        self.adjust_stack_pointer(insn.imm16() as i32);
        Ok(())
    }

    pub(crate) fn retf(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.far_return(0)?;
        Ok(())
    }

    pub(crate) fn retf_imm16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.far_return(insn.imm16())?;
        Ok(())
    }

    pub(crate) fn int_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        self.interrupt(insn.imm8(), InterruptSource::Internal, None)?;
        Ok(())
    }

    pub(crate) fn int3(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.interrupt(3, InterruptSource::Internal, None)?;
        Ok(())
    }

    pub(crate) fn into_overflow(&mut self, _insn: &mut Instruction) -> ExecResult {
        if self.of() {
            self.interrupt(4, InterruptSource::Internal, None)?;
        }
        Ok(())
    }

    pub(crate) fn iret(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.do_iret()?;
        Ok(())
    }
}
