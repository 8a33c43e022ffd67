// The flag engine. PF/ZF/SF are lazy: arithmetic stashes its result and
// width, a dirty mask records which of the three need recomputing, and any
// read refreshes the bit first. Explicit writes clear the dirty bit in
// lock-step.

use bitflags::bitflags;

use crate::conversions::ValueWidth;
use crate::exceptions::ExecResult;
use crate::parser::Instruction;
use crate::processor::Cpu;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Eflags: u32 {
        const CF = 0x0001;
        const PF = 0x0004;
        const AF = 0x0010;
        const ZF = 0x0040;
        const SF = 0x0080;
        const TF = 0x0100;
        const IF = 0x0200;
        const DF = 0x0400;
        const OF = 0x0800;
        const IOPL = 0x3000; // two-bit field
        const NT = 0x4000;
        const RF = 0x1_0000;
        const VM = 0x2_0000;
        const AC = 0x4_0000;
        const VIF = 0x8_0000;
        const VIP = 0x10_0000;
        const ID = 0x20_0000;
    }
}

impl Cpu {
    // --- lazy getters ---

    pub fn get_pf(&mut self) -> bool {
        if self.dirty_flags & Eflags::PF.bits() != 0 {
            let r = self.last_result as u32;
            self.pf = (0x9669u32 << 2) >> ((r ^ (r >> 4)) & 0xf) & Eflags::PF.bits() != 0;
            self.dirty_flags &= !Eflags::PF.bits();
        }
        self.pf
    }

    pub fn get_zf(&mut self) -> bool {
        if self.dirty_flags & Eflags::ZF.bits() != 0 {
            let r = self.last_result;
            self.zf = (!r & r.wrapping_sub(1)) >> (self.last_op_size.bits() - 1) & 1 != 0;
            self.dirty_flags &= !Eflags::ZF.bits();
        }
        self.zf
    }

    pub fn get_sf(&mut self) -> bool {
        if self.dirty_flags & Eflags::SF.bits() != 0 {
            self.sf = self.last_result >> (self.last_op_size.bits() - 1) & 1 != 0;
            self.dirty_flags &= !Eflags::SF.bits();
        }
        self.sf
    }

    pub fn cf(&self) -> bool {
        self.cf
    }
    pub fn af(&self) -> bool {
        self.af
    }
    pub fn of(&self) -> bool {
        self.of
    }
    pub fn df(&self) -> bool {
        self.df
    }
    pub fn get_if(&self) -> bool {
        self.if_flag
    }
    pub fn tf(&self) -> bool {
        self.tf
    }
    pub fn nt(&self) -> bool {
        self.nt
    }
    pub fn rf(&self) -> bool {
        self.rf
    }
    pub fn vm(&self) -> bool {
        self.vm
    }
    pub fn vif(&self) -> bool {
        self.vif
    }
    pub fn vip(&self) -> bool {
        self.vip
    }
    pub fn iopl(&self) -> u8 {
        self.iopl
    }

    // --- setters; the lazy three clear their dirty bit ---

    pub fn set_cf(&mut self, value: bool) {
        self.cf = value;
    }
    pub fn set_af(&mut self, value: bool) {
        self.af = value;
    }
    pub fn set_of(&mut self, value: bool) {
        self.of = value;
    }
    pub fn set_df(&mut self, value: bool) {
        self.df = value;
    }
    pub fn set_if(&mut self, value: bool) {
        self.if_flag = value;
    }
    pub fn set_tf(&mut self, value: bool) {
        self.tf = value;
    }
    pub fn set_nt(&mut self, value: bool) {
        self.nt = value;
    }
    pub fn set_rf(&mut self, value: bool) {
        self.rf = value;
    }
    pub fn set_vm(&mut self, value: bool) {
        self.vm = value;
    }
    pub fn set_vif(&mut self, value: bool) {
        self.vif = value;
    }
    pub fn set_vip(&mut self, value: bool) {
        self.vip = value;
    }
    pub fn set_iopl(&mut self, value: u8) {
        self.iopl = value & 3;
    }

    pub fn set_pf(&mut self, value: bool) {
        self.dirty_flags &= !Eflags::PF.bits();
        self.pf = value;
    }

    pub fn set_zf(&mut self, value: bool) {
        self.dirty_flags &= !Eflags::ZF.bits();
        self.zf = value;
    }

    pub fn set_sf(&mut self, value: bool) {
        self.dirty_flags &= !Eflags::SF.bits();
        self.sf = value;
    }

    // --- lazy bookkeeping ---

    pub fn update_flags<T: ValueWidth>(&mut self, value: T) {
        self.dirty_flags |= (Eflags::PF | Eflags::ZF | Eflags::SF).bits();
        self.last_result = value.to_u64();
        self.last_op_size = T::SIZE;
    }

    /// Carry, adjust and the lazy three for an arithmetic result computed in
    /// doubled width.
    pub fn math_flags<T: ValueWidth>(&mut self, result: u64, dest: T, src: T) {
        self.dirty_flags |= (Eflags::PF | Eflags::ZF | Eflags::SF).bits();
        self.last_result = result;
        self.last_op_size = T::SIZE;
        self.set_cf(result & (T::MASK << T::BITS) != 0);
        self.adjust_flag(result, dest, src);
    }

    /// math_flags plus the signed-overflow OF rule for subtraction.
    pub fn cmp_flags<T: ValueWidth>(&mut self, result: u64, dest: T, src: T) {
        self.math_flags(result, dest, src);
        self.set_of(
            ((result ^ dest.to_u64()) & (src.to_u64() ^ dest.to_u64())) >> (T::BITS - 1) & 1 != 0,
        );
    }

    pub fn adjust_flag<T: ValueWidth>(&mut self, result: u64, dest: T, src: T) {
        self.af = (result ^ (dest.to_u64() ^ src.to_u64())) & 0x10 != 0;
    }

    // --- FLAGS/EFLAGS images ---

    pub fn get_flags(&mut self) -> u16 {
        0x0002
            | (self.cf as u16) * Eflags::CF.bits() as u16
            | (self.get_pf() as u16) * Eflags::PF.bits() as u16
            | (self.af as u16) * Eflags::AF.bits() as u16
            | (self.get_zf() as u16) * Eflags::ZF.bits() as u16
            | (self.get_sf() as u16) * Eflags::SF.bits() as u16
            | (self.tf as u16) * Eflags::TF.bits() as u16
            | (self.if_flag as u16) * Eflags::IF.bits() as u16
            | (self.df as u16) * Eflags::DF.bits() as u16
            | (self.of as u16) * Eflags::OF.bits() as u16
            | (self.iopl as u16) << 12
            | (self.nt as u16) * Eflags::NT.bits() as u16
    }

    pub fn set_flags(&mut self, flags: u16) {
        let flags = flags as u32;
        self.set_cf(flags & Eflags::CF.bits() != 0);
        self.set_pf(flags & Eflags::PF.bits() != 0);
        self.set_af(flags & Eflags::AF.bits() != 0);
        self.set_zf(flags & Eflags::ZF.bits() != 0);
        self.set_sf(flags & Eflags::SF.bits() != 0);
        self.set_tf(flags & Eflags::TF.bits() != 0);
        self.set_if(flags & Eflags::IF.bits() != 0);
        self.set_df(flags & Eflags::DF.bits() != 0);
        self.set_of(flags & Eflags::OF.bits() != 0);
        self.set_iopl(((flags & Eflags::IOPL.bits()) >> 12) as u8);
        self.set_nt(flags & Eflags::NT.bits() != 0);
    }

    pub fn get_eflags(&mut self) -> u32 {
        self.get_flags() as u32
            | (self.rf as u32) * Eflags::RF.bits()
            | (self.vm as u32) * Eflags::VM.bits()
    }

    pub fn set_eflags(&mut self, eflags: u32) {
        self.set_flags(eflags as u16);
        self.set_rf(eflags & Eflags::RF.bits() != 0);
        self.set_vm(eflags & Eflags::VM.bits() != 0);
    }

    /// Evaluate one of the sixteen condition codes.
    pub fn evaluate(&mut self, condition_code: u8) -> bool {
        debug_assert!(condition_code <= 0xf);
        match condition_code {
            0 => self.of,                                    // O
            1 => !self.of,                                   // NO
            2 => self.cf,                                    // B, C, NAE
            3 => !self.cf,                                   // NB, NC, AE
            4 => self.get_zf(),                              // E, Z
            5 => !self.get_zf(),                             // NE, NZ
            6 => self.cf | self.get_zf(),                    // BE, NA
            7 => !(self.cf | self.get_zf()),                 // NBE, A
            8 => self.get_sf(),                              // S
            9 => !self.get_sf(),                             // NS
            10 => self.get_pf(),                             // P, PE
            11 => !self.get_pf(),                            // NP, PO
            12 => self.get_sf() ^ self.of,                   // L, NGE
            13 => !(self.get_sf() ^ self.of),                // NL, GE
            14 => (self.get_sf() ^ self.of) | self.get_zf(), // LE, NG
            _ => !((self.get_sf() ^ self.of) | self.get_zf()), // NLE, G
        }
    }

    // --- flag instructions ---

    pub(crate) fn op_stc(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.set_cf(true);
        Ok(())
    }

    pub(crate) fn op_clc(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.set_cf(false);
        Ok(())
    }

    pub(crate) fn op_cmc(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.set_cf(!self.cf);
        Ok(())
    }

    pub(crate) fn op_std(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.set_df(true);
        Ok(())
    }

    pub(crate) fn op_cld(&mut self, _insn: &mut Instruction) -> ExecResult {
        self.set_df(false);
        Ok(())
    }

    pub(crate) fn op_sti(&mut self, _insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.iopl() >= self.cpl() {
            // STI opens a one-instruction shadow before interrupts are
            // sampled again.
            self.make_next_instruction_uninterruptible();
            self.set_if(true);
            return Ok(());
        }

        if !self.vme() && !self.pvi() {
            return Err(self
                .general_protection_fault(0, "STI with VME=0 && PVI=0")
                .into());
        }
        if self.vip() {
            return Err(self.general_protection_fault(0, "STI with VIP=1").into());
        }
        self.set_vif(true);
        Ok(())
    }

    pub(crate) fn op_cli(&mut self, _insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.iopl() >= self.cpl() {
            self.set_if(false);
            return Ok(());
        }
        if !self.vme() && !self.pvi() {
            return Err(self
                .general_protection_fault(0, "CLI with VME=0 && PVI=0")
                .into());
        }
        self.set_vif(false);
        Ok(())
    }

    pub(crate) fn op_lahf(&mut self, _insn: &mut Instruction) -> ExecResult {
        let value = self.cf as u8
            | (self.get_pf() as u8) * Eflags::PF.bits() as u8
            | (self.af as u8) * Eflags::AF.bits() as u8
            | (self.get_zf() as u8) * Eflags::ZF.bits() as u8
            | (self.get_sf() as u8) * Eflags::SF.bits() as u8
            | 2;
        self.set_ah(value);
        Ok(())
    }

    pub(crate) fn op_sahf(&mut self, _insn: &mut Instruction) -> ExecResult {
        let ah = self.ah() as u32;
        self.set_cf(ah & Eflags::CF.bits() != 0);
        self.set_pf(ah & Eflags::PF.bits() != 0);
        self.set_af(ah & Eflags::AF.bits() != 0);
        self.set_zf(ah & Eflags::ZF.bits() != 0);
        self.set_sf(ah & Eflags::SF.bits() != 0);
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
    fn lazy_flags_match_eager_computation() {
        let mut cpu = cpu();
        cpu.update_flags::<u8>(0x00);
        assert!(cpu.get_zf());
        assert!(!cpu.get_sf());
        assert!(cpu.get_pf());

        cpu.update_flags::<u8>(0x81);
        assert!(!cpu.get_zf());
        assert!(cpu.get_sf());
        assert!(cpu.get_pf()); // two bits set -> even parity

        cpu.update_flags::<u16>(0x0100);
        assert!(!cpu.get_zf());
        assert!(!cpu.get_sf());
        assert!(cpu.get_pf()); // parity looks at the low byte only
    }

    #[test]
    fn explicit_writes_clear_the_dirty_bits() {
        let mut cpu = cpu();
        cpu.update_flags::<u8>(0xff);
        cpu.set_zf(true);
        assert!(cpu.get_zf());
        cpu.set_pf(false);
        assert!(!cpu.get_pf());
    }

    #[test]
    fn flags_image_round_trips() {
        let mut cpu = cpu();
        cpu.set_flags(0x0ed7 | 0x3000);
        let flags = cpu.get_flags();
        assert_eq!(flags & 0x0ed7, 0x0ed7);
        assert_eq!(flags & 0x3000, 0x3000);
        assert_eq!(flags & 0x0002, 0x0002); // reserved bit 1 always set
    }

    #[test]
    fn condition_codes() {
        let mut cpu = cpu();
        cpu.set_zf(true);
        cpu.set_cf(false);
        assert!(cpu.evaluate(4)); // Z
        assert!(!cpu.evaluate(5)); // NZ
        assert!(cpu.evaluate(6)); // BE
        cpu.set_sf(true);
        cpu.set_of(false);
        assert!(cpu.evaluate(12)); // L
        assert!(cpu.evaluate(14)); // LE
        assert!(!cpu.evaluate(15)); // G
    }
}
