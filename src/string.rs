// String primitives and their REP forms. The count lives in CX or ECX per
// the address size, DF picks the stride direction, and the index registers
// only advance after an iteration's accesses have all succeeded, so a fault
// mid-loop leaves a restartable machine state. Between iterations a pending
// external IRQ aborts the loop; the driver rewinds EIP to the prefixed
// instruction and the REP resumes after the ISR.

use crate::conversions::ValueWidth;
use crate::exceptions::{ExecResult, MemResult, Trap};
use crate::fields::{reg16, reg8, MemoryAccessType, SegmentRegister};
use crate::parser::{prefix, Instruction};
use crate::processor::Cpu;

impl Cpu {
    fn do_once_or_repeatedly<F>(
        &mut self,
        insn: &mut Instruction,
        care_about_zf: bool,
        mut body: F,
    ) -> ExecResult
    where
        F: FnMut(&mut Cpu) -> MemResult<()>,
    {
        if !insn.has_rep_prefix() {
            body(self)?;
            return Ok(());
        }
        loop {
            if self.read_register_for_address_size(reg16::CX) == 0 {
                return Ok(());
            }
            body(self)?;
            let exhausted = self.decrement_cx_for_address_size();
            if care_about_zf {
                let zf = self.get_zf();
                if insn.rep_prefix() == prefix::REPZ && !zf {
                    return Ok(());
                }
                if insn.rep_prefix() == prefix::REPNZ && zf {
                    return Ok(());
                }
            }
            if exhausted {
                return Ok(());
            }
            if self.irq.has_pending() && self.get_if() {
                return Err(Trap::HardwareInterruptDuringRep);
            }
        }
    }

    fn do_movs<T: ValueWidth>(&mut self) -> MemResult<()> {
        let source_segment = self.current_segment();
        let si = self.read_register_for_address_size(reg16::SI);
        let di = self.read_register_for_address_size(reg16::DI);
        let value: T = self.read_memory(source_segment, si, MemoryAccessType::Read)?;
        self.write_memory(SegmentRegister::Es, di, value)?;
        self.step_register_for_address_size(reg16::SI, T::BITS / 8);
        self.step_register_for_address_size(reg16::DI, T::BITS / 8);
        Ok(())
    }

    fn do_cmps<T: ValueWidth>(&mut self) -> MemResult<()> {
        let source_segment = self.current_segment();
        let si = self.read_register_for_address_size(reg16::SI);
        let di = self.read_register_for_address_size(reg16::DI);
        let dest: T = self.read_memory(source_segment, si, MemoryAccessType::Read)?;
        let src: T = self.read_memory(SegmentRegister::Es, di, MemoryAccessType::Read)?;
        self.do_sub(dest, src);
        self.step_register_for_address_size(reg16::SI, T::BITS / 8);
        self.step_register_for_address_size(reg16::DI, T::BITS / 8);
        Ok(())
    }

    fn do_stos<T: ValueWidth>(&mut self) -> MemResult<()> {
        let di = self.read_register_for_address_size(reg16::DI);
        let value: T = self.read_reg(reg8::AL);
        self.write_memory(SegmentRegister::Es, di, value)?;
        self.step_register_for_address_size(reg16::DI, T::BITS / 8);
        Ok(())
    }

    fn do_lods<T: ValueWidth>(&mut self) -> MemResult<()> {
        let source_segment = self.current_segment();
        let si = self.read_register_for_address_size(reg16::SI);
        let value: T = self.read_memory(source_segment, si, MemoryAccessType::Read)?;
        self.write_reg(reg8::AL, value);
        self.step_register_for_address_size(reg16::SI, T::BITS / 8);
        Ok(())
    }

    fn do_scas<T: ValueWidth>(&mut self) -> MemResult<()> {
        let di = self.read_register_for_address_size(reg16::DI);
        let accumulator: T = self.read_reg(reg8::AL);
        let value: T = self.read_memory(SegmentRegister::Es, di, MemoryAccessType::Read)?;
        self.do_sub(accumulator, value);
        self.step_register_for_address_size(reg16::DI, T::BITS / 8);
        Ok(())
    }

    // Per IA-32, INS may complete the port read even if the memory write
    // faults; the read happens first here for exactly that reason.
    fn do_ins<T: ValueWidth>(&mut self) -> MemResult<()> {
        let port = self.dx();
        let value: T = self.io_in(port)?;
        let di = self.read_register_for_address_size(reg16::DI);
        self.write_memory(SegmentRegister::Es, di, value)?;
        self.step_register_for_address_size(reg16::DI, T::BITS / 8);
        Ok(())
    }

    fn do_outs<T: ValueWidth>(&mut self) -> MemResult<()> {
        let source_segment = self.current_segment();
        let si = self.read_register_for_address_size(reg16::SI);
        let value: T = self.read_memory(source_segment, si, MemoryAccessType::Read)?;
        let port = self.dx();
        self.io_out(port, value)?;
        self.step_register_for_address_size(reg16::SI, T::BITS / 8);
        Ok(())
    }

    pub(crate) fn movsb(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_movs::<u8>())
    }
    pub(crate) fn movsw(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_movs::<u16>())
    }
    pub(crate) fn movsd(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_movs::<u32>())
    }

    pub(crate) fn cmpsb(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, true, |cpu| cpu.do_cmps::<u8>())
    }
    pub(crate) fn cmpsw(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, true, |cpu| cpu.do_cmps::<u16>())
    }
    pub(crate) fn cmpsd(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, true, |cpu| cpu.do_cmps::<u32>())
    }

    pub(crate) fn stosb(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_stos::<u8>())
    }
    pub(crate) fn stosw(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_stos::<u16>())
    }
    pub(crate) fn stosd(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_stos::<u32>())
    }

    pub(crate) fn lodsb(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_lods::<u8>())
    }
    pub(crate) fn lodsw(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_lods::<u16>())
    }
    pub(crate) fn lodsd(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_lods::<u32>())
    }

    pub(crate) fn scasb(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, true, |cpu| cpu.do_scas::<u8>())
    }
    pub(crate) fn scasw(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, true, |cpu| cpu.do_scas::<u16>())
    }
    pub(crate) fn scasd(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, true, |cpu| cpu.do_scas::<u32>())
    }

    pub(crate) fn insb(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_ins::<u8>())
    }
    pub(crate) fn insw(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_ins::<u16>())
    }
    pub(crate) fn insd(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_ins::<u32>())
    }

    pub(crate) fn outsb(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_outs::<u8>())
    }
    pub(crate) fn outsw(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_outs::<u16>())
    }
    pub(crate) fn outsd(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_once_or_repeatedly(insn, false, |cpu| cpu.do_outs::<u32>())
    }
}
