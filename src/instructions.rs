// Miscellaneous execution bodies that do not belong to a bigger family:
// NOP/HLT/XLAT, the XCHG forms, INC/DEC, BOUND, LEA and the far-pointer
// loads, BSWAP, the explicit invalid opcodes, WBINVD/INVLPG, CPUID, RDTSC
// and the autotest shutdown opcode.

use crate::conversions::ValueWidth;
use crate::exceptions::{ExecResult, Fault};
use crate::fields::{reg16, MemoryAccessType, SegmentRegister};
use crate::parser::Instruction;
use crate::processor::{CpuState, Cpu};

impl Cpu {
    pub(crate) fn invalid_opcode(&mut self, reason: &str) -> Fault {
        if self.options.log_exceptions {
            log::info!(target: "cpu", "#UD :: {}", reason);
        }
        Fault::InvalidOpcode(reason.into())
    }

    pub(crate) fn bound_range_exceeded(&mut self, reason: &str) -> Fault {
        if self.options.log_exceptions {
            log::info!(target: "cpu", "#BR :: {}", reason);
        }
        Fault::BoundRangeExceeded(reason.into())
    }

    pub(crate) fn nop(&mut self, _insn: &mut Instruction) -> ExecResult {
        Ok(())
    }

    /// Multi-byte NOP; consumes its ModR/M operand without touching it.
    pub(crate) fn nop_rm(&mut self, _insn: &mut Instruction) -> ExecResult {
        Ok(())
    }

    /// x87 escape. There is no FPU; the operand has been consumed, nothing
    /// else happens.
    pub(crate) fn escape(&mut self, _insn: &mut Instruction) -> ExecResult {
        Ok(())
    }

    pub(crate) fn wait(&mut self, _insn: &mut Instruction) -> ExecResult {
        Ok(())
    }

    pub(crate) fn hlt(&mut self, _insn: &mut Instruction) -> ExecResult {
        if self.pe() && self.cpl() != 0 {
            return Err(self
                .general_protection_fault(0, &format!("HLT with CPL != 0 ({})", self.cpl()))
                .into());
        }
        self.set_state(CpuState::Halted);
        if !self.get_if() {
            log::warn!(target: "cpu", "halted with IF=0");
        }
        self.halted_loop();
        Ok(())
    }

    pub(crate) fn xlat(&mut self, _insn: &mut Instruction) -> ExecResult {
        let segment = self.current_segment();
        let table = self.read_register_for_address_size(reg16::BX);
        let offset = table.wrapping_add(self.al() as u32);
        let value = self.read_memory8(segment, offset)?;
        self.set_al(value);
        Ok(())
    }

    // --- XCHG ---

    pub(crate) fn xchg_ax_reg16(&mut self, insn: &mut Instruction) -> ExecResult {
        let tmp: u16 = insn.reg(self);
        let ax = self.ax();
        insn.set_reg(self, ax);
        self.set_ax(tmp);
        Ok(())
    }

    pub(crate) fn xchg_eax_reg32(&mut self, insn: &mut Instruction) -> ExecResult {
        let tmp: u32 = insn.reg(self);
        let eax = self.eax();
        insn.set_reg(self, eax);
        self.set_eax(tmp);
        Ok(())
    }

    fn do_xchg<T: ValueWidth>(&mut self, insn: &mut Instruction) -> ExecResult {
        let tmp: T = insn.modrm.read(self)?;
        let reg: T = insn.reg(self);
        insn.modrm.write(self, reg)?;
        insn.set_reg(self, tmp);
        Ok(())
    }

    pub(crate) fn xchg_reg8_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_xchg::<u8>(insn)
    }
    pub(crate) fn xchg_reg16_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_xchg::<u16>(insn)
    }
    pub(crate) fn xchg_reg32_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_xchg::<u32>(insn)
    }

    // --- INC/DEC touch every arithmetic flag except CF ---

    fn do_inc<T: ValueWidth>(&mut self, value: T) -> T {
        self.set_of(value.to_u64() == T::MASK >> 1);
        let result = T::from_u64(value.to_u64().wrapping_add(1));
        self.adjust_flag(result.to_u64(), value, T::from_u64(1));
        self.update_flags(result);
        result
    }

    fn do_dec<T: ValueWidth>(&mut self, value: T) -> T {
        self.set_of(value.to_u64() == 1 << (T::BITS - 1));
        let result = T::from_u64(value.to_u64().wrapping_sub(1));
        self.adjust_flag(result.to_u64(), value, T::from_u64(1));
        self.update_flags(result);
        result
    }

    pub(crate) fn inc_reg16(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: u16 = insn.reg(self);
        let result = self.do_inc(value);
        insn.set_reg(self, result);
        Ok(())
    }

    pub(crate) fn inc_reg32(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: u32 = insn.reg(self);
        let result = self.do_inc(value);
        insn.set_reg(self, result);
        Ok(())
    }

    pub(crate) fn dec_reg16(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: u16 = insn.reg(self);
        let result = self.do_dec(value);
        insn.set_reg(self, result);
        Ok(())
    }

    pub(crate) fn dec_reg32(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: u32 = insn.reg(self);
        let result = self.do_dec(value);
        insn.set_reg(self, result);
        Ok(())
    }

    fn do_inc_rm<T: ValueWidth>(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: T = insn.modrm.read(self)?;
        let result = self.do_inc(value);
        insn.modrm.write(self, result)?;
        Ok(())
    }

    fn do_dec_rm<T: ValueWidth>(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: T = insn.modrm.read(self)?;
        let result = self.do_dec(value);
        insn.modrm.write(self, result)?;
        Ok(())
    }

    pub(crate) fn inc_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_inc_rm::<u8>(insn)
    }
    pub(crate) fn inc_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_inc_rm::<u16>(insn)
    }
    pub(crate) fn inc_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_inc_rm::<u32>(insn)
    }
    pub(crate) fn dec_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_dec_rm::<u8>(insn)
    }
    pub(crate) fn dec_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_dec_rm::<u16>(insn)
    }
    pub(crate) fn dec_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_dec_rm::<u32>(insn)
    }

    // --- BOUND ---

    fn do_bound<T: ValueWidth>(&mut self, insn: &mut Instruction) -> ExecResult {
        if insn.modrm.is_register() {
            return Err(self.invalid_opcode("BOUND with register operand").into());
        }
        let index: T = insn.reg(self);
        let segment = insn.modrm.segment();
        let offset = insn.modrm.offset();
        let lower: T = self.read_memory(segment, offset, MemoryAccessType::Read)?;
        let upper: T =
            self.read_memory(segment, offset.wrapping_add(T::BITS / 8), MemoryAccessType::Read)?;
        let index = index.to_i64();
        if index < lower.to_i64() || index > upper.to_i64() {
            return Err(self
                .bound_range_exceeded(&format!(
                    "{} not within [{}, {}]",
                    index,
                    lower.to_i64(),
                    upper.to_i64()
                ))
                .into());
        }
        Ok(())
    }

    pub(crate) fn bound(&mut self, insn: &mut Instruction) -> ExecResult {
        if self.o16() {
            self.do_bound::<u16>(insn)
        } else {
            self.do_bound::<u32>(insn)
        }
    }

    // --- LEA ---

    pub(crate) fn lea_reg16_mem16(&mut self, insn: &mut Instruction) -> ExecResult {
        if insn.modrm.is_register() {
            return Err(self.invalid_opcode("LEA with register source").into());
        }
        insn.set_reg(self, insn.modrm.offset() as u16);
        Ok(())
    }

    pub(crate) fn lea_reg32_mem32(&mut self, insn: &mut Instruction) -> ExecResult {
        if insn.modrm.is_register() {
            return Err(self.invalid_opcode("LEA with register source").into());
        }
        insn.set_reg(self, insn.modrm.offset());
        Ok(())
    }

    // --- far pointer loads ---

    fn do_lxs<T: ValueWidth>(
        &mut self,
        insn: &mut Instruction,
        segment: SegmentRegister,
    ) -> ExecResult {
        if insn.modrm.is_register() {
            return Err(self.invalid_opcode("LxS with register operand").into());
        }
        let address =
            self.read_logical_address::<T>(insn.modrm.segment(), insn.modrm.offset())?;
        self.write_segment_register(segment, address.selector)?;
        insn.set_reg(self, T::from_u32(address.offset));
        Ok(())
    }

    pub(crate) fn lds_reg16_mem16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_lxs::<u16>(insn, SegmentRegister::Ds)
    }
    pub(crate) fn lds_reg32_mem32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_lxs::<u32>(insn, SegmentRegister::Ds)
    }
    pub(crate) fn les_reg16_mem16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_lxs::<u16>(insn, SegmentRegister::Es)
    }
    pub(crate) fn les_reg32_mem32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_lxs::<u32>(insn, SegmentRegister::Es)
    }
    pub(crate) fn lfs_reg16_mem16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_lxs::<u16>(insn, SegmentRegister::Fs)
    }
    pub(crate) fn lfs_reg32_mem32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_lxs::<u32>(insn, SegmentRegister::Fs)
    }
    pub(crate) fn lgs_reg16_mem16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_lxs::<u16>(insn, SegmentRegister::Gs)
    }
    pub(crate) fn lgs_reg32_mem32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_lxs::<u32>(insn, SegmentRegister::Gs)
    }
    pub(crate) fn lss_reg16_mem16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_lxs::<u16>(insn, SegmentRegister::Ss)
    }
    pub(crate) fn lss_reg32_mem32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_lxs::<u32>(insn, SegmentRegister::Ss)
    }

    pub(crate) fn bswap_reg32(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: u32 = insn.reg(self);
        insn.set_reg(self, value.swap_bytes());
        Ok(())
    }

    // --- explicit invalid opcodes ---

    pub(crate) fn ud0(&mut self, _insn: &mut Instruction) -> ExecResult {
        Err(self.invalid_opcode("UD0").into())
    }
    pub(crate) fn ud1(&mut self, _insn: &mut Instruction) -> ExecResult {
        Err(self.invalid_opcode("UD1").into())
    }
    pub(crate) fn ud2(&mut self, _insn: &mut Instruction) -> ExecResult {
        Err(self.invalid_opcode("UD2").into())
    }

    pub(crate) fn wbinvd(&mut self, _insn: &mut Instruction) -> ExecResult {
        if self.pe() && self.cpl() != 0 {
            return Err(self.general_protection_fault(0, "WBINVD").into());
        }
        Ok(())
    }

    pub(crate) fn invlpg(&mut self, _insn: &mut Instruction) -> ExecResult {
        if self.pe() && self.cpl() != 0 {
            return Err(self.general_protection_fault(0, "INVLPG").into());
        }
        Ok(())
    }

    /// Opcode 0xF1: cleanly stops the whole emulator, but only in autotest
    /// mode.
    pub(crate) fn vkill(&mut self, _insn: &mut Instruction) -> ExecResult {
        if !self.is_for_autotest() {
            return Err(self
                .invalid_opcode("0xF1 is an invalid opcode outside of auto-test mode")
                .into());
        }
        log::info!(target: "cpu", "0xF1: shutdown command received");
        self.kill();
        Ok(())
    }

    pub(crate) fn cpuid(&mut self, _insn: &mut Instruction) -> ExecResult {
        match self.eax() {
            0 => {
                self.set_eax(1);
                self.set_ebx(0x706d_6f43);
                self.set_edx(0x6f72_7475);
                self.set_ecx(0x3638_586e);
            }
            1 => {
                let stepping = 0;
                let model = 1;
                let family = 3;
                let kind = 0;
                self.set_eax(stepping | model << 4 | family << 8 | kind << 12);
                self.set_ebx(0);
                self.set_edx(1 << 4 | 1 << 15); // RDTSC + CMOV
                self.set_ecx(0);
            }
            0x8000_0000 => self.set_eax(0x8000_0004),
            0x8000_0002 => {
                self.set_eax(0x6163_2049);
                self.set_ebx(0x2074_276e);
                self.set_ecx(0x696c_6562);
                self.set_edx(0x2065_7665);
            }
            0x8000_0003 => {
                self.set_eax(0x7327_7469);
                self.set_ebx(0x746f_6e20);
                self.set_ecx(0x746e_4920);
                self.set_edx(0x0021_6c65);
            }
            _ => {
                self.set_eax(0);
                self.set_ebx(0);
                self.set_ecx(0);
                self.set_edx(0);
            }
        }
        Ok(())
    }

    /// RDTSC returns the opcode-retirement counter; CR4.TSD makes it a
    /// privileged instruction.
    pub(crate) fn rdtsc(&mut self, _insn: &mut Instruction) -> ExecResult {
        if self.tsd() && self.pe() && self.cpl() != 0 {
            return Err(self.general_protection_fault(0, "RDTSC").into());
        }
        self.set_edx((self.cycle() >> 32) as u32);
        self.set_eax(self.cycle() as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RuntimeOptions;

    fn cpu() -> Cpu {
        Cpu::new(RuntimeOptions::default(), true)
    }

    #[test]
    fn inc_preserves_carry() {
        let mut cpu = cpu();
        cpu.set_cf(true);
        let result = cpu.do_inc(0xffu8);
        assert_eq!(result, 0);
        assert!(cpu.cf());
        assert!(cpu.get_zf());
        assert!(cpu.af());
        assert!(!cpu.of());
    }

    #[test]
    fn inc_signed_overflow() {
        let mut cpu = cpu();
        cpu.do_inc(0x7fu8);
        assert!(cpu.of());
        let mut cpu = Cpu::new(RuntimeOptions::default(), true);
        cpu.do_dec(0x80u8);
        assert!(cpu.of());
    }

    #[test]
    fn cpuid_identifies_the_vendor() {
        let mut cpu = cpu();
        cpu.set_eax(0);
        cpu.cpuid(&mut dummy_instruction()).unwrap();
        assert_eq!(cpu.eax(), 1);
        assert_eq!(cpu.ebx(), 0x706d_6f43);
        cpu.set_eax(1);
        cpu.cpuid(&mut dummy_instruction()).unwrap();
        assert_eq!(cpu.edx(), 1 << 4 | 1 << 15);
    }

    fn dummy_instruction() -> Instruction {
        crate::parser::build_opcode_tables_if_needed();
        let mut stream = crate::parser::SimpleInstructionStream::new(&[0x90]);
        Instruction::from_stream(&mut stream, false, false).unwrap()
    }
}
