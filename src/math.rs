// Arithmetic kernels and the ADD/ADC/SUB/SBB/CMP instruction families, plus
// multiply, divide, NEG and XADD. The kernels compute in u64 so the carry
// falls out of bit `width`; OF comes from the sign-difference formula and AF
// from the low-nibble three-way XOR (see flags.rs).

use crate::conversions::{sign_extended, ValueWidth};
use crate::exceptions::{ExecResult, Fault, MemResult};
use crate::parser::Instruction;
use crate::processor::Cpu;

impl Cpu {
    pub fn do_add<T: ValueWidth>(&mut self, dest: T, src: T) -> T {
        let result = dest.to_u64().wrapping_add(src.to_u64());
        self.math_flags(result, dest, src);
        self.set_of(
            ((result ^ dest.to_u64()) & (result ^ src.to_u64())) >> (T::BITS - 1) & 1 != 0,
        );
        T::from_u64(result)
    }

    pub fn do_adc<T: ValueWidth>(&mut self, dest: T, src: T) -> T {
        let result = dest
            .to_u64()
            .wrapping_add(src.to_u64())
            .wrapping_add(self.cf() as u64);
        self.math_flags(result, dest, src);
        self.set_of(
            ((result ^ dest.to_u64()) & (result ^ src.to_u64())) >> (T::BITS - 1) & 1 != 0,
        );
        T::from_u64(result)
    }

    pub fn do_sub<T: ValueWidth>(&mut self, dest: T, src: T) -> T {
        let result = dest.to_u64().wrapping_sub(src.to_u64());
        self.cmp_flags(result, dest, src);
        T::from_u64(result)
    }

    pub fn do_sbb<T: ValueWidth>(&mut self, dest: T, src: T) -> T {
        let result = dest
            .to_u64()
            .wrapping_sub(src.to_u64())
            .wrapping_sub(self.cf() as u64);
        self.cmp_flags(result, dest, src);
        T::from_u64(result)
    }
}

/// The fourteen encodings every two-operand arithmetic instruction comes in.
macro_rules! arith_instruction_handlers {
    ($kernel:ident, $writeback:tt,
     $rm8_reg8:ident, $rm16_reg16:ident, $rm32_reg32:ident,
     $reg8_rm8:ident, $reg16_rm16:ident, $reg32_rm32:ident,
     $al_imm8:ident, $ax_imm16:ident, $eax_imm32:ident,
     $rm8_imm8:ident, $rm16_imm16:ident, $rm32_imm32:ident,
     $rm16_imm8:ident, $rm32_imm8:ident) => {
        impl Cpu {
            pub(crate) fn $rm8_reg8(&mut self, insn: &mut Instruction) -> ExecResult {
                let dest = insn.modrm.read8(self)?;
                let src: u8 = insn.reg(self);
                let result = self.$kernel(dest, src);
                arith_writeback!($writeback, self, insn, modrm8, result);
                Ok(())
            }
            pub(crate) fn $rm16_reg16(&mut self, insn: &mut Instruction) -> ExecResult {
                let dest = insn.modrm.read16(self)?;
                let src: u16 = insn.reg(self);
                let result = self.$kernel(dest, src);
                arith_writeback!($writeback, self, insn, modrm16, result);
                Ok(())
            }
            pub(crate) fn $rm32_reg32(&mut self, insn: &mut Instruction) -> ExecResult {
                let dest = insn.modrm.read32(self)?;
                let src: u32 = insn.reg(self);
                let result = self.$kernel(dest, src);
                arith_writeback!($writeback, self, insn, modrm32, result);
                Ok(())
            }
            pub(crate) fn $reg8_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
                let dest: u8 = insn.reg(self);
                let src = insn.modrm.read8(self)?;
                let result = self.$kernel(dest, src);
                arith_writeback!($writeback, self, insn, reg, result);
                Ok(())
            }
            pub(crate) fn $reg16_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
                let dest: u16 = insn.reg(self);
                let src = insn.modrm.read16(self)?;
                let result = self.$kernel(dest, src);
                arith_writeback!($writeback, self, insn, reg, result);
                Ok(())
            }
            pub(crate) fn $reg32_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
                let dest: u32 = insn.reg(self);
                let src = insn.modrm.read32(self)?;
                let result = self.$kernel(dest, src);
                arith_writeback!($writeback, self, insn, reg, result);
                Ok(())
            }
            pub(crate) fn $al_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
                let result = self.$kernel(self.al(), insn.imm8());
                arith_writeback!($writeback, self, insn, al, result);
                Ok(())
            }
            pub(crate) fn $ax_imm16(&mut self, insn: &mut Instruction) -> ExecResult {
                let result = self.$kernel(self.ax(), insn.imm16());
                arith_writeback!($writeback, self, insn, ax, result);
                Ok(())
            }
            pub(crate) fn $eax_imm32(&mut self, insn: &mut Instruction) -> ExecResult {
                let result = self.$kernel(self.eax(), insn.imm32());
                arith_writeback!($writeback, self, insn, eax, result);
                Ok(())
            }
            pub(crate) fn $rm8_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
                let dest = insn.modrm.read8(self)?;
                let result = self.$kernel(dest, insn.imm8());
                arith_writeback!($writeback, self, insn, modrm8, result);
                Ok(())
            }
            pub(crate) fn $rm16_imm16(&mut self, insn: &mut Instruction) -> ExecResult {
                let dest = insn.modrm.read16(self)?;
                let result = self.$kernel(dest, insn.imm16());
                arith_writeback!($writeback, self, insn, modrm16, result);
                Ok(())
            }
            pub(crate) fn $rm32_imm32(&mut self, insn: &mut Instruction) -> ExecResult {
                let dest = insn.modrm.read32(self)?;
                let result = self.$kernel(dest, insn.imm32());
                arith_writeback!($writeback, self, insn, modrm32, result);
                Ok(())
            }
            pub(crate) fn $rm16_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
                let dest = insn.modrm.read16(self)?;
                let src = sign_extended::<u8, u16>(insn.imm8());
                let result = self.$kernel(dest, src);
                arith_writeback!($writeback, self, insn, modrm16, result);
                Ok(())
            }
            pub(crate) fn $rm32_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
                let dest = insn.modrm.read32(self)?;
                let src = sign_extended::<u8, u32>(insn.imm8());
                let result = self.$kernel(dest, src);
                arith_writeback!($writeback, self, insn, modrm32, result);
                Ok(())
            }
        }
    };
}

macro_rules! arith_writeback {
    (write, $cpu:expr, $insn:expr, modrm8, $result:expr) => {
        $insn.modrm.write8($cpu, $result)?
    };
    (write, $cpu:expr, $insn:expr, modrm16, $result:expr) => {
        $insn.modrm.write16($cpu, $result)?
    };
    (write, $cpu:expr, $insn:expr, modrm32, $result:expr) => {
        $insn.modrm.write32($cpu, $result)?
    };
    (write, $cpu:expr, $insn:expr, reg, $result:expr) => {
        $insn.set_reg($cpu, $result)
    };
    (write, $cpu:expr, $insn:expr, al, $result:expr) => {
        $cpu.set_al($result)
    };
    (write, $cpu:expr, $insn:expr, ax, $result:expr) => {
        $cpu.set_ax($result)
    };
    (write, $cpu:expr, $insn:expr, eax, $result:expr) => {
        $cpu.set_eax($result)
    };
    (discard, $cpu:expr, $insn:expr, $place:ident, $result:expr) => {
        let _ = $result;
    };
}

arith_instruction_handlers!(
    do_add, write, add_rm8_reg8, add_rm16_reg16, add_rm32_reg32, add_reg8_rm8, add_reg16_rm16,
    add_reg32_rm32, add_al_imm8, add_ax_imm16, add_eax_imm32, add_rm8_imm8, add_rm16_imm16,
    add_rm32_imm32, add_rm16_imm8, add_rm32_imm8
);
arith_instruction_handlers!(
    do_adc, write, adc_rm8_reg8, adc_rm16_reg16, adc_rm32_reg32, adc_reg8_rm8, adc_reg16_rm16,
    adc_reg32_rm32, adc_al_imm8, adc_ax_imm16, adc_eax_imm32, adc_rm8_imm8, adc_rm16_imm16,
    adc_rm32_imm32, adc_rm16_imm8, adc_rm32_imm8
);
arith_instruction_handlers!(
    do_sub, write, sub_rm8_reg8, sub_rm16_reg16, sub_rm32_reg32, sub_reg8_rm8, sub_reg16_rm16,
    sub_reg32_rm32, sub_al_imm8, sub_ax_imm16, sub_eax_imm32, sub_rm8_imm8, sub_rm16_imm16,
    sub_rm32_imm32, sub_rm16_imm8, sub_rm32_imm8
);
arith_instruction_handlers!(
    do_sbb, write, sbb_rm8_reg8, sbb_rm16_reg16, sbb_rm32_reg32, sbb_reg8_rm8, sbb_reg16_rm16,
    sbb_reg32_rm32, sbb_al_imm8, sbb_ax_imm16, sbb_eax_imm32, sbb_rm8_imm8, sbb_rm16_imm16,
    sbb_rm32_imm32, sbb_rm16_imm8, sbb_rm32_imm8
);
arith_instruction_handlers!(
    do_sub, discard, cmp_rm8_reg8, cmp_rm16_reg16, cmp_rm32_reg32, cmp_reg8_rm8, cmp_reg16_rm16,
    cmp_reg32_rm32, cmp_al_imm8, cmp_ax_imm16, cmp_eax_imm32, cmp_rm8_imm8, cmp_rm16_imm16,
    cmp_rm32_imm32, cmp_rm16_imm8, cmp_rm32_imm8
);

impl Cpu {
    // --- unsigned multiply ---

    fn do_mul<T: ValueWidth>(&mut self, f1: T, f2: T) -> (T, T) {
        let result = f1.to_u64().wrapping_mul(f2.to_u64());
        let low = T::from_u64(result);
        let high = T::from_u64(result >> T::BITS);
        let overflow = high.to_u64() != 0;
        self.set_cf(overflow);
        self.set_of(overflow);
        (high, low)
    }

    pub(crate) fn mul_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let src = insn.modrm.read8(self)?;
        let (high, low) = self.do_mul(self.al(), src);
        self.set_ah(high);
        self.set_al(low);
        Ok(())
    }

    pub(crate) fn mul_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let src = insn.modrm.read16(self)?;
        let (high, low) = self.do_mul(self.ax(), src);
        self.set_dx(high);
        self.set_ax(low);
        Ok(())
    }

    pub(crate) fn mul_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let src = insn.modrm.read32(self)?;
        let (high, low) = self.do_mul(self.eax(), src);
        self.set_edx(high);
        self.set_eax(low);
        Ok(())
    }

    // --- signed multiply; overflow when the doubled result leaves the
    //     destination width ---

    fn do_imul<T: ValueWidth>(&mut self, f1: T, f2: T) -> (T, T) {
        let result = f1.to_i64().wrapping_mul(f2.to_i64());
        let low = T::from_u64(result as u64);
        let high = T::from_u64((result as u64) >> T::BITS);
        let overflow = result != low.to_i64();
        self.set_cf(overflow);
        self.set_of(overflow);
        (high, low)
    }

    pub(crate) fn imul_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let src = insn.modrm.read8(self)?;
        let (high, low) = self.do_imul(src, self.al());
        self.set_ah(high);
        self.set_al(low);
        Ok(())
    }

    pub(crate) fn imul_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let src = insn.modrm.read16(self)?;
        let (high, low) = self.do_imul(src, self.ax());
        self.set_dx(high);
        self.set_ax(low);
        Ok(())
    }

    pub(crate) fn imul_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let src = insn.modrm.read32(self)?;
        let (high, low) = self.do_imul(src, self.eax());
        self.set_edx(high);
        self.set_eax(low);
        Ok(())
    }

    pub(crate) fn imul_reg16_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let src = insn.modrm.read16(self)?;
        let dest: u16 = insn.reg(self);
        let (_, low) = self.do_imul(dest, src);
        insn.set_reg(self, low);
        Ok(())
    }

    pub(crate) fn imul_reg32_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let src = insn.modrm.read32(self)?;
        let dest: u32 = insn.reg(self);
        let (_, low) = self.do_imul(dest, src);
        insn.set_reg(self, low);
        Ok(())
    }

    pub(crate) fn imul_reg16_rm16_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let src = insn.modrm.read16(self)?;
        let imm = sign_extended::<u8, u16>(insn.imm8());
        let (_, low) = self.do_imul(src, imm);
        insn.set_reg(self, low);
        Ok(())
    }

    pub(crate) fn imul_reg32_rm32_imm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let src = insn.modrm.read32(self)?;
        let imm = sign_extended::<u8, u32>(insn.imm8());
        let (_, low) = self.do_imul(src, imm);
        insn.set_reg(self, low);
        Ok(())
    }

    pub(crate) fn imul_reg16_rm16_imm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let src = insn.modrm.read16(self)?;
        let (_, low) = self.do_imul(src, insn.imm16());
        insn.set_reg(self, low);
        Ok(())
    }

    pub(crate) fn imul_reg32_rm32_imm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let src = insn.modrm.read32(self)?;
        let (_, low) = self.do_imul(src, insn.imm32());
        insn.set_reg(self, low);
        Ok(())
    }

    // --- divide; #DE on zero divisors and quotient overflow ---

    fn do_div<T: ValueWidth>(
        &mut self,
        dividend_high: T,
        dividend_low: T,
        divisor: T,
    ) -> MemResult<(T, T)> {
        if divisor.to_u64() == 0 {
            return Err(self.divide_error("divide by zero"));
        }
        let dividend = dividend_high.to_u64() << T::BITS | dividend_low.to_u64();
        let quotient = dividend / divisor.to_u64();
        if quotient > T::MASK {
            return Err(self.divide_error(&format!(
                "divide overflow ({} / {})",
                dividend,
                divisor.to_u64()
            )));
        }
        let remainder = dividend % divisor.to_u64();
        Ok((T::from_u64(quotient), T::from_u64(remainder)))
    }

    fn do_idiv<T: ValueWidth>(
        &mut self,
        dividend_high: T,
        dividend_low: T,
        divisor: T,
    ) -> MemResult<(T, T)> {
        if divisor.to_u64() == 0 {
            return Err(self.divide_error("divide by zero"));
        }
        let dividend = ((dividend_high.to_u64() << T::BITS | dividend_low.to_u64())
            << (64 - 2 * T::BITS)) as i64
            >> (64 - 2 * T::BITS);
        let divisor = divisor.to_i64();
        if dividend == i64::MIN && divisor == -1 {
            return Err(self.divide_error("divide overflow"));
        }
        let quotient = dividend / divisor;
        let limit = 1i64 << (T::BITS - 1);
        if quotient >= limit || quotient < -limit {
            return Err(self.divide_error(&format!(
                "divide overflow ({} / {})",
                dividend, divisor
            )));
        }
        let remainder = dividend % divisor;
        Ok((T::from_u64(quotient as u64), T::from_u64(remainder as u64)))
    }

    pub(crate) fn div_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let divisor = insn.modrm.read8(self)?;
        let (quotient, remainder) = self.do_div(self.ah(), self.al(), divisor)?;
        self.set_al(quotient);
        self.set_ah(remainder);
        Ok(())
    }

    pub(crate) fn div_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let divisor = insn.modrm.read16(self)?;
        let (quotient, remainder) = self.do_div(self.dx(), self.ax(), divisor)?;
        self.set_ax(quotient);
        self.set_dx(remainder);
        Ok(())
    }

    pub(crate) fn div_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let divisor = insn.modrm.read32(self)?;
        let (quotient, remainder) = self.do_div(self.edx(), self.eax(), divisor)?;
        self.set_eax(quotient);
        self.set_edx(remainder);
        Ok(())
    }

    pub(crate) fn idiv_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        let divisor = insn.modrm.read8(self)?;
        let (quotient, remainder) = self.do_idiv(self.ah(), self.al(), divisor)?;
        self.set_al(quotient);
        self.set_ah(remainder);
        Ok(())
    }

    pub(crate) fn idiv_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let divisor = insn.modrm.read16(self)?;
        let (quotient, remainder) = self.do_idiv(self.dx(), self.ax(), divisor)?;
        self.set_ax(quotient);
        self.set_dx(remainder);
        Ok(())
    }

    pub(crate) fn idiv_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        let divisor = insn.modrm.read32(self)?;
        let (quotient, remainder) = self.do_idiv(self.edx(), self.eax(), divisor)?;
        self.set_eax(quotient);
        self.set_edx(remainder);
        Ok(())
    }

    // --- NEG ---

    fn do_neg<T: ValueWidth>(&mut self, insn: &mut Instruction) -> ExecResult {
        let value: T = insn.modrm.read(self)?;
        let result = self.do_sub(T::from_u64(0), value);
        insn.modrm.write(self, result)?;
        Ok(())
    }

    pub(crate) fn neg_rm8(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_neg::<u8>(insn)
    }
    pub(crate) fn neg_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_neg::<u16>(insn)
    }
    pub(crate) fn neg_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_neg::<u32>(insn)
    }

    // --- XADD: exchange, then add ---

    fn do_xadd<T: ValueWidth>(&mut self, insn: &mut Instruction) -> ExecResult {
        let dest: T = insn.modrm.read(self)?;
        let src: T = insn.reg(self);
        let result = self.do_add(dest, src);
        insn.set_reg(self, dest);
        insn.modrm.write(self, result)?;
        Ok(())
    }

    pub(crate) fn xadd_rm8_reg8(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_xadd::<u8>(insn)
    }
    pub(crate) fn xadd_rm16_reg16(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_xadd::<u16>(insn)
    }
    pub(crate) fn xadd_rm32_reg32(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_xadd::<u32>(insn)
    }

    pub(crate) fn divide_error(&mut self, reason: &str) -> Fault {
        if self.options.log_exceptions {
            log::info!(target: "cpu", "#DE :: {}", reason);
        }
        Fault::DivideError(reason.into())
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
    fn add_sets_carry_from_the_doubled_width() {
        let mut cpu = cpu();
        let result = cpu.do_add(0xffu8, 0x01u8);
        assert_eq!(result, 0x00);
        assert!(cpu.cf());
        assert!(cpu.get_zf());
        assert!(!cpu.of());
        assert!(cpu.af());
    }

    #[test]
    fn add_signed_overflow() {
        let mut cpu = cpu();
        let result = cpu.do_add(0x7fu8, 0x01u8);
        assert_eq!(result, 0x80);
        assert!(cpu.of());
        assert!(!cpu.cf());
        assert!(cpu.get_sf());
    }

    #[test]
    fn sub_borrow_and_sign() {
        let mut cpu = cpu();
        let result = cpu.do_sub(0x00u8, 0x01u8);
        assert_eq!(result, 0xff);
        assert!(cpu.cf());
        assert!(cpu.get_sf());
        assert!(!cpu.of());
    }

    #[test]
    fn adc_chains_the_carry() {
        let mut cpu = cpu();
        cpu.set_cf(true);
        let result = cpu.do_adc(0x10u16, 0x20u16);
        assert_eq!(result, 0x31);
        assert!(!cpu.cf());
    }

    #[test]
    fn mul_flags_track_the_high_half() {
        let mut cpu = cpu();
        let (high, low) = cpu.do_mul(0x10u8, 0x10u8);
        assert_eq!((high, low), (0x01, 0x00));
        assert!(cpu.cf());
        assert!(cpu.of());

        let (high, low) = cpu.do_mul(0x02u8, 0x03u8);
        assert_eq!((high, low), (0x00, 0x06));
        assert!(!cpu.cf());
    }

    #[test]
    fn imul_overflow_is_signed() {
        let mut cpu = cpu();
        let (_, low) = cpu.do_imul(0xffu8, 0xffu8); // -1 * -1
        assert_eq!(low, 1);
        assert!(!cpu.cf());

        cpu.do_imul(0x7fu8, 0x02u8); // 127 * 2 overflows i8
        assert!(cpu.cf());
        assert!(cpu.of());
    }

    #[test]
    fn div_by_zero_is_a_fault() {
        let mut cpu = cpu();
        assert!(matches!(
            cpu.do_div(0u8, 10u8, 0u8),
            Err(Fault::DivideError(_))
        ));
    }

    #[test]
    fn div_quotient_overflow_is_a_fault() {
        let mut cpu = cpu();
        // 0x200 / 1 does not fit in 8 bits.
        assert!(matches!(
            cpu.do_div(0x02u8, 0x00u8, 0x01u8),
            Err(Fault::DivideError(_))
        ));
        let (quotient, remainder) = cpu.do_div(0x00u8, 0x65u8, 0x10u8).unwrap();
        assert_eq!((quotient, remainder), (0x06, 0x05));
    }

    #[test]
    fn idiv_rounds_toward_zero() {
        let mut cpu = cpu();
        // -7 / 2 = -3 rem -1
        let (quotient, remainder) = cpu.do_idiv(0xffu8, 0xf9u8, 0x02u8).unwrap();
        assert_eq!(quotient as i8, -3);
        assert_eq!(remainder as i8, -1);
    }
}
