// ASCII and decimal adjust instructions. These operate on AL/AX with their
// own AF/CF side effects; AAM and AAD take an immediate radix and AAM can
// divide by zero.

use crate::exceptions::ExecResult;
use crate::parser::Instruction;
use crate::processor::Cpu;

impl Cpu {
    pub(crate) fn aaa(&mut self, _insn: &mut Instruction) -> ExecResult {
        if self.al() & 0x0f > 9 || self.af() {
            self.set_ax(self.ax().wrapping_add(0x0106));
            self.set_af(true);
            self.set_cf(true);
        } else {
            self.set_af(false);
            self.set_cf(false);
        }
        self.set_al(self.al() & 0x0f);
        Ok(())
    }

    pub(crate) fn aam(&mut self, insn: &mut Instruction) -> ExecResult {
        if insn.imm8() == 0 {
            return Err(self.divide_error("AAM with 0 immediate").into());
        }
        let al = self.al();
        self.set_ah(al / insn.imm8());
        self.set_al(al % insn.imm8());
        let al = self.al();
        self.update_flags(al);
        self.set_af(false);
        Ok(())
    }

    pub(crate) fn aad(&mut self, insn: &mut Instruction) -> ExecResult {
        let al = self.al();
        let ah = self.ah();
        self.set_al(al.wrapping_add(ah.wrapping_mul(insn.imm8())));
        self.set_ah(0);
        let al = self.al();
        self.update_flags(al);
        self.set_af(false);
        Ok(())
    }

    pub(crate) fn aas(&mut self, _insn: &mut Instruction) -> ExecResult {
        if self.al() & 0x0f > 9 || self.af() {
            self.set_ax(self.ax().wrapping_sub(6));
            self.set_ah(self.ah().wrapping_sub(1));
            self.set_af(true);
            self.set_cf(true);
        } else {
            self.set_af(false);
            self.set_cf(false);
        }
        self.set_al(self.al() & 0x0f);
        Ok(())
    }

    pub(crate) fn daa(&mut self, _insn: &mut Instruction) -> ExecResult {
        let old_cf = self.cf();
        let old_al = self.al();

        self.set_cf(false);
        if self.al() & 0x0f > 0x09 || self.af() {
            let wide = self.al() as u16 + 6;
            self.set_al(wide as u8);
            self.set_cf(old_cf || wide > 0xff);
            self.set_af(true);
        } else {
            self.set_af(false);
        }

        if old_al > 0x99 || old_cf {
            self.set_al(self.al().wrapping_add(0x60));
            self.set_cf(true);
        } else {
            self.set_cf(false);
        }

        let al = self.al();
        self.update_flags(al);
        Ok(())
    }

    pub(crate) fn das(&mut self, _insn: &mut Instruction) -> ExecResult {
        let old_cf = self.cf();
        let old_al = self.al();

        self.set_cf(false);
        if self.al() & 0x0f > 0x09 || self.af() {
            let wide = self.al() as i16 - 6;
            self.set_al(wide as u8);
            self.set_cf(old_cf || wide < 0);
            self.set_af(true);
        } else {
            self.set_af(false);
        }

        if old_al > 0x99 || old_cf {
            self.set_al(self.al().wrapping_sub(0x60));
            self.set_cf(true);
        }

        let al = self.al();
        self.update_flags(al);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RuntimeOptions;
    use crate::parser::build_opcode_tables_if_needed;
    use crate::parser::SimpleInstructionStream;

    fn cpu() -> Cpu {
        Cpu::new(RuntimeOptions::default(), true)
    }

    fn run(cpu: &mut Cpu, bytes: &[u8]) {
        build_opcode_tables_if_needed();
        let mut stream = SimpleInstructionStream::new(bytes);
        let insn = Instruction::from_stream(&mut stream, false, false).unwrap();
        cpu.execute(insn).unwrap();
    }

    #[test]
    fn aaa_adjusts_past_nine() {
        let mut cpu = cpu();
        cpu.set_ax(0x000b);
        run(&mut cpu, &[0x37]);
        assert_eq!(cpu.ax(), 0x0101);
        assert!(cpu.cf());
        assert!(cpu.af());
    }

    #[test]
    fn aam_splits_al_by_the_radix() {
        let mut cpu = cpu();
        cpu.set_al(123);
        run(&mut cpu, &[0xd4, 0x0a]);
        assert_eq!(cpu.ah(), 12);
        assert_eq!(cpu.al(), 3);
        assert!(!cpu.get_zf());
    }

    #[test]
    fn aad_recombines_ax() {
        let mut cpu = cpu();
        cpu.set_ah(12);
        cpu.set_al(3);
        run(&mut cpu, &[0xd5, 0x0a]);
        assert_eq!(cpu.ax(), 123);
    }

    #[test]
    fn daa_carries_into_the_high_nibble() {
        let mut cpu = cpu();
        cpu.set_al(0x79);
        cpu.set_cf(false);
        cpu.set_af(false);
        // 0x79 + 0x35 = 0xae -> DAA -> 0x14, CF set (BCD 79+35=114)
        let result = cpu.do_add(0x79u8, 0x35u8);
        cpu.set_al(result);
        run(&mut cpu, &[0x27]);
        assert_eq!(cpu.al(), 0x14);
        assert!(cpu.cf());
    }
}
