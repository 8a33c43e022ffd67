// The MOV family: register/memory/immediate moves, segment register moves
// (with the interrupt shadow after MOV SS), moff accumulator forms, zero- and
// sign-extending moves, control/debug register moves, and CMPXCHG.

use crate::conversions::{sign_extended, ValueWidth};
use crate::exceptions::ExecResult;
use crate::fields::{reg8, MemoryAccessType, SegmentRegister};
use crate::parser::Instruction;
use crate::processor::Cpu;

impl Cpu {
    pub(crate) fn mov_rm8_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        insn.modrm.write8(self, insn.imm8())?;
        Ok(())
    }

    pub(crate) fn mov_rm16_imm16(&mut self, insn: &mut Instruction) -> ExecResult {
        insn.modrm.write16(self, insn.imm16())?;
        Ok(())
    }

    pub(crate) fn mov_rm32_imm32(&mut self, insn: &mut Instruction) -> ExecResult {
        insn.modrm.write32(self, insn.imm32())?;
        Ok(())
    }

    pub(crate) fn mov_rm16_seg(&mut self, insn: &mut Instruction) -> ExecResult {
        let segment = match insn.segment_register_index() {
            Some(segment) => segment,
            None => {
                return Err(self
                    .invalid_opcode("MOV r/m16, seg with invalid segment register index")
                    .into())
            }
        };
        let value = self.read_segment_register(segment);
        let o32 = self.o32();
        insn.modrm.write_special(self, value as u32, o32)?;
        Ok(())
    }

    fn do_mov_seg(&mut self, insn: &mut Instruction, selector: u16) -> ExecResult {
        let segment = match insn.segment_register_index() {
            Some(SegmentRegister::Cs) | None => {
                return Err(self.invalid_opcode("MOV CS").into())
            }
            Some(segment) => segment,
        };
        self.write_segment_register(segment, selector)?;
        if segment == SegmentRegister::Ss {
            self.make_next_instruction_uninterruptible();
        }
        Ok(())
    }

    pub(crate) fn mov_seg_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let selector = insn.modrm.read16(self)?;
        self.do_mov_seg(insn, selector)
    }

    pub(crate) fn mov_seg_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let selector = insn.modrm.read32(self)? as u16;
        self.do_mov_seg(insn, selector)
    }

    pub(crate) fn mov_rm8_reg8(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: u8 = insn.reg(self);
        insn.modrm.write8(self, value)?;
        Ok(())
    }

    pub(crate) fn mov_reg8_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read8(self)?;
        insn.set_reg(self, value);
        Ok(())
    }

    pub(crate) fn mov_rm16_reg16(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: u16 = insn.reg(self);
        insn.modrm.write16(self, value)?;
        Ok(())
    }

    pub(crate) fn mov_rm32_reg32(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: u32 = insn.reg(self);
        insn.modrm.write32(self, value)?;
        Ok(())
    }

    pub(crate) fn mov_reg16_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read16(self)?;
        insn.set_reg(self, value);
        Ok(())
    }

    pub(crate) fn mov_reg32_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read32(self)?;
        insn.set_reg(self, value);
        Ok(())
    }

    pub(crate) fn mov_reg8_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        self.write_reg8(insn.register_index(), insn.imm8());
        Ok(())
    }

    pub(crate) fn mov_reg16_imm16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.write_reg16(insn.register_index(), insn.imm16());
        Ok(())
    }

    pub(crate) fn mov_reg32_imm32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.write_reg32(insn.register_index(), insn.imm32());
        Ok(())
    }

    // --- moff accumulator forms; the displacement follows the address size ---

    fn do_mov_areg_moff<T: ValueWidth>(&mut self, insn: &mut Instruction) -> ExecResult {
        let segment = self.current_segment();
        let value: T =
            self.read_memory(segment, insn.imm_address(), MemoryAccessType::Read)?;
        self.write_reg(reg8::AL, value);
        Ok(())
    }

    fn do_mov_moff_areg<T: ValueWidth>(&mut self, insn: &mut Instruction) -> ExecResult {
        let segment = self.current_segment();
        let value: T = self.read_reg(reg8::AL);
        self.write_memory(segment, insn.imm_address(), value)?;
        Ok(())
    }

    pub(crate) fn mov_al_moff8(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_mov_areg_moff::<u8>(insn)
    }
    pub(crate) fn mov_ax_moff16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_mov_areg_moff::<u16>(insn)
    }
    pub(crate) fn mov_eax_moff32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_mov_areg_moff::<u32>(insn)
    }
    pub(crate) fn mov_moff8_al(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_mov_moff_areg::<u8>(insn)
    }
    pub(crate) fn mov_moff16_ax(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_mov_moff_areg::<u16>(insn)
    }
    pub(crate) fn mov_moff32_eax(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_mov_moff_areg::<u32>(insn)
    }

    // --- MOVZX / MOVSX ---

    pub(crate) fn movzx_reg16_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read8(self)?;
        insn.set_reg(self, value as u16);
        Ok(())
    }

    pub(crate) fn movzx_reg32_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read8(self)?;
        insn.set_reg(self, value as u32);
        Ok(())
    }

    pub(crate) fn movzx_reg32_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read16(self)?;
        insn.set_reg(self, value as u32);
        Ok(())
    }

    pub(crate) fn movsx_reg16_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read8(self)?;
        insn.set_reg(self, sign_extended::<u8, u16>(value));
        Ok(())
    }

    pub(crate) fn movsx_reg32_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read8(self)?;
        insn.set_reg(self, sign_extended::<u8, u32>(value));
        Ok(())
    }

    pub(crate) fn movsx_reg32_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let value = insn.modrm.read16(self)?;
        insn.set_reg(self, sign_extended::<u16, u32>(value));
        Ok(())
    }

    // --- control / debug register moves; ring 0 only ---

    fn validate_cr_access(&mut self, index: usize, direction: &str) -> ExecResult {
        if !matches!(index, 0 | 2 | 3 | 4) {
            return Err(self
                .invalid_opcode(&format!("MOV {} with invalid control register", direction))
                .into());
        }
        if self.vm() {
            return Err(self
                .general_protection_fault(0, &format!("MOV {} with VM=1", direction))
                .into());
        }
        if self.pe() && self.cpl() != 0 {
            return Err(self
                .general_protection_fault(0, &format!("MOV {} with CPL != 0", direction))
                .into());
        }
        Ok(())
    }

    pub(crate) fn mov_reg32_cr(&mut self, insn: &mut Instruction) -> ExecResult {
        let index = insn.register_index();
        self.validate_cr_access(index, "reg32, CRx")?;
        let value = self.control_register(index).unwrap_or(0);
        self.write_reg32((insn.rm() & 7) as usize, value);
        Ok(())
    }

    pub(crate) fn mov_cr_reg32(&mut self, insn: &mut Instruction) -> ExecResult {
        let index = insn.register_index();
        self.validate_cr_access(index, "CRx, reg32")?;
        let value = self.read_reg32((insn.rm() & 7) as usize);
        if index == 4 && value != 0 {
            log::debug!(target: "cpu", "CR4 written ({:#010x}); only VME/PVI/TSD are honored", value);
        }
        self.set_control_register(index, value);
        Ok(())
    }

    fn validate_dr_access(&mut self, direction: &str) -> ExecResult {
        if self.vm() {
            return Err(self
                .general_protection_fault(0, &format!("MOV {} with VM=1", direction))
                .into());
        }
        if self.pe() && self.cpl() != 0 {
            return Err(self
                .general_protection_fault(0, &format!("MOV {} with CPL != 0", direction))
                .into());
        }
        Ok(())
    }

    pub(crate) fn mov_reg32_dr(&mut self, insn: &mut Instruction) -> ExecResult {
        self.validate_dr_access("reg32, DRx")?;
        let value = self.debug_register(insn.register_index());
        self.write_reg32((insn.rm() & 7) as usize, value);
        Ok(())
    }

    pub(crate) fn mov_dr_reg32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.validate_dr_access("DRx, reg32")?;
        let value = self.read_reg32((insn.rm() & 7) as usize);
        self.set_debug_register(insn.register_index(), value);
        Ok(())
    }

    // --- CMPXCHG: compare with the accumulator, set ZF, swap on match ---

    fn do_cmpxchg<T: ValueWidth>(&mut self, insn: &mut Instruction) -> ExecResult {
        let current: T = insn.modrm.read(self)?;
        let accumulator: T = self.read_reg(reg8::AL);
        if current == accumulator {
            self.set_zf(true);
            let replacement: T = insn.reg(self);
            insn.modrm.write(self, replacement)?;
        } else {
            self.set_zf(false);
            self.write_reg(reg8::AL, current);
        }
        Ok(())
    }

    pub(crate) fn cmpxchg_rm8_reg8(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_cmpxchg::<u8>(insn)
    }
    pub(crate) fn cmpxchg_rm16_reg16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_cmpxchg::<u16>(insn)
    }
    pub(crate) fn cmpxchg_rm32_reg32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_cmpxchg::<u32>(insn)
    }
}
