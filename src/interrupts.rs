// Interrupt and exception delivery: real-mode IVT dispatch, protected-mode
// gate dispatch with the inter-ring stack switch, the VM86 entry and exit
// variants, and IRET in all its shapes. Everything after the new stack is
// validated runs in a push sequence that must not fault halfway.

use crate::descriptors::Gate;
use crate::exceptions::MemResult;
use crate::fields::{InterruptSource, JumpType, LogicalAddress, SegmentRegister};
use crate::flags::Eflags;
use crate::processor::Cpu;
use crate::stack::TransactionalPopper;

fn make_error_code(number: u16, idt: bool, source: InterruptSource) -> u16 {
    if idt {
        return number << 3 | 2 | source as u16;
    }
    (number & 0xfffc) | source as u16
}

impl Cpu {
    /// Deliver interrupt `vector`, optionally pushing an error code. This is
    /// the single entry point for software INTs, external IRQs and caught
    /// CPU faults.
    pub fn interrupt(
        &mut self,
        vector: u8,
        source: InterruptSource,
        error_code: Option<u16>,
    ) -> MemResult<()> {
        if self.pe() {
            self.protected_mode_interrupt(vector, source, error_code)
        } else {
            self.real_mode_interrupt(vector, source)
        }
    }

    fn real_mode_interrupt(&mut self, vector: u8, source: InterruptSource) -> MemResult<()> {
        debug_assert!(!self.pe());
        let original_cs = self.cs();
        let original_ip = self.ip();
        let flags = self.get_flags();
        let entry = self.fetch_real_mode_interrupt_vector(vector);

        log::trace!(
            target: "cpu",
            "PE=0 interrupt {:02x},{:04x}{} -> {}",
            vector,
            self.ax(),
            if source == InterruptSource::External { " (external)" } else { "" },
            entry
        );

        self.write_segment_register(SegmentRegister::Cs, entry.selector)?;
        self.set_eip(entry.offset);

        self.push16(flags)?;
        self.push16(original_cs)?;
        self.push16(original_ip)?;

        self.set_if(false);
        self.set_tf(false);
        Ok(())
    }

    fn protected_mode_interrupt(
        &mut self,
        vector: u8,
        source: InterruptSource,
        error_code: Option<u16>,
    ) -> MemResult<()> {
        debug_assert!(self.pe());

        if source == InterruptSource::Internal && self.vm() && self.iopl() != 3 {
            return Err(
                self.general_protection_fault(0, "software INT in VM86 mode with IOPL != 3")
            );
        }

        let idt_entry = self.get_interrupt_descriptor(vector)?;
        if !idt_entry.is_task_gate() && !idt_entry.is_trap_gate() && !idt_entry.is_interrupt_gate()
        {
            return Err(self.general_protection_fault(
                make_error_code(vector as u16, true, source),
                "interrupt to invalid gate type",
            ));
        }
        let gate = idt_entry.as_gate();

        if source == InterruptSource::Internal && idt_entry.dpl < self.cpl() {
            return Err(self.general_protection_fault(
                make_error_code(vector as u16, true, source),
                &format!(
                    "software interrupt trying to escalate privilege (CPL={}, DPL={}, VM={})",
                    self.cpl(),
                    idt_entry.dpl,
                    self.vm()
                ),
            ));
        }

        if !idt_entry.present {
            return Err(self.not_present(
                make_error_code(vector as u16, true, source),
                "interrupt gate not present",
            ));
        }

        if gate.is_task_gate() {
            return self.interrupt_to_task_gate(vector, source, error_code, &gate);
        }

        let descriptor = self.get_descriptor(gate.selector)?;

        if descriptor.is_null() {
            return Err(self.general_protection_fault(
                source as u16,
                "interrupt gate to null descriptor",
            ));
        }
        if descriptor.is_outside_table_limits() {
            return Err(self.general_protection_fault(
                make_error_code(gate.selector, false, source),
                "interrupt gate to descriptor outside table limit",
            ));
        }
        if !descriptor.is_code() {
            return Err(self.general_protection_fault(
                make_error_code(gate.selector, false, source),
                "interrupt gate to non-code segment",
            ));
        }

        let code_descriptor = descriptor.as_segment();
        if code_descriptor.dpl > self.cpl() {
            return Err(self.general_protection_fault(
                make_error_code(gate.selector, false, source),
                &format!(
                    "interrupt gate to segment with DPL({}) > CPL({})",
                    code_descriptor.dpl,
                    self.cpl()
                ),
            ));
        }
        if !code_descriptor.present {
            return Err(self.not_present(
                make_error_code(gate.selector, false, source),
                "interrupt to non-present segment",
            ));
        }

        let mut offset = gate.offset;
        let flags = self.get_eflags();

        let original_cpl = self.cpl();
        let original_cs = self.cs();
        let original_eip = self.eip();

        if !gate.is_32bit() || !code_descriptor.is_32bit() {
            if offset & 0xffff_0000 != 0 {
                log::debug!(
                    target: "cpu",
                    "truncating interrupt entry offset from {:04x}:{:08x} to {:04x}:{:08x}",
                    gate.selector,
                    offset,
                    gate.selector,
                    offset & 0xffff
                );
            }
            offset &= 0xffff;
        }

        if offset > code_descriptor.effective_limit {
            return Err(self.general_protection_fault(0, "offset outside segment limit"));
        }

        if self.vm() {
            return self.interrupt_from_vm86_mode(&gate, offset, &code_descriptor, source, error_code);
        }

        if !code_descriptor.conforming() && code_descriptor.dpl < original_cpl {
            // Escalating to an inner ring: the target stack comes from the
            // current TSS and is fully validated before the switch.
            let tss = self.current_tss();
            let new_ss = tss.ring_ss(self, code_descriptor.dpl)?;
            let new_esp = tss.ring_esp(self, code_descriptor.dpl)?;
            let new_ss_descriptor = self.get_descriptor(new_ss)?;

            if new_ss_descriptor.is_null() {
                return Err(self.invalid_tss(source as u16, "new ss is null"));
            }
            if new_ss_descriptor.is_outside_table_limits() {
                return Err(self.invalid_tss(
                    make_error_code(new_ss, false, source),
                    "new ss outside table limits",
                ));
            }
            if new_ss_descriptor.dpl != code_descriptor.dpl {
                return Err(self.invalid_tss(
                    make_error_code(new_ss, false, source),
                    &format!(
                        "new ss DPL({}) != code segment DPL({})",
                        new_ss_descriptor.dpl, code_descriptor.dpl
                    ),
                ));
            }
            if !new_ss_descriptor.is_data() || !new_ss_descriptor.as_segment().writable() {
                return Err(self.invalid_tss(
                    make_error_code(new_ss, false, source),
                    "new ss not a writable data segment",
                ));
            }
            if !new_ss_descriptor.present {
                return Err(self.stack_fault(
                    make_error_code(new_ss, false, source),
                    "new ss not present",
                ));
            }

            let original_ss = self.ss();
            let original_esp = self.esp();
            self.set_cpl(code_descriptor.dpl);
            self.write_segment_register(SegmentRegister::Ss, new_ss)?;
            self.set_esp(new_esp);
            self.push_value_with_size(original_ss as u32, gate.size())?;
            self.push_value_with_size(original_esp, gate.size())?;
        } else if code_descriptor.conforming() || code_descriptor.dpl == original_cpl {
            self.set_cpl(original_cpl);
        } else {
            return Err(self.general_protection_fault(
                make_error_code(gate.selector, false, source),
                "interrupt to non-conforming code segment with DPL > CPL",
            ));
        }

        self.push_value_with_size(flags, gate.size())?;
        self.push_value_with_size(original_cs as u32, gate.size())?;
        self.push_value_with_size(original_eip, gate.size())?;
        if let Some(code) = error_code {
            self.push_value_with_size(code as u32, gate.size())?;
        }

        if gate.is_interrupt_gate() {
            self.set_if(false);
        }
        self.set_tf(false);
        self.set_rf(false);
        self.set_nt(false);
        self.set_vm(false);
        self.write_segment_register(SegmentRegister::Cs, gate.selector)?;
        self.set_eip(offset);
        Ok(())
    }

    fn interrupt_to_task_gate(
        &mut self,
        _vector: u8,
        source: InterruptSource,
        error_code: Option<u16>,
        gate: &Gate,
    ) -> MemResult<()> {
        let descriptor = self.get_descriptor(gate.selector)?;
        if !descriptor.global {
            return Err(self.general_protection_fault(
                make_error_code(gate.selector, false, source),
                "interrupt to task gate referencing local descriptor",
            ));
        }
        if !descriptor.is_tss() {
            return Err(self.general_protection_fault(
                make_error_code(gate.selector, false, source),
                "interrupt to task gate referencing non-TSS descriptor",
            ));
        }
        let tss_descriptor = descriptor.as_tss();
        if tss_descriptor.is_busy() {
            return Err(self.general_protection_fault(
                make_error_code(gate.selector, false, source),
                "interrupt to task gate referencing busy TSS descriptor",
            ));
        }
        if !descriptor.present {
            return Err(self.general_protection_fault(
                make_error_code(gate.selector, false, source),
                "interrupt to task gate referencing non-present TSS descriptor",
            ));
        }
        self.task_switch(gate.selector, descriptor, JumpType::Int)?;
        if let Some(code) = error_code {
            if tss_descriptor.is_32bit() {
                self.push32(code as u32)?;
            } else {
                self.push16(code)?;
            }
        }
        Ok(())
    }

    fn interrupt_from_vm86_mode(
        &mut self,
        gate: &Gate,
        offset: u32,
        code_descriptor: &crate::descriptors::SegmentDescriptor,
        source: InterruptSource,
        error_code: Option<u16>,
    ) -> MemResult<()> {
        let original_flags = self.get_eflags();
        let original_ss = self.ss();
        let original_esp = self.esp();
        let original_cs = self.cs();
        let original_eip = self.eip();

        if code_descriptor.dpl != 0 {
            return Err(self.general_protection_fault(
                make_error_code(gate.selector, false, source),
                "interrupt from VM86 mode to descriptor with DPL != 0",
            ));
        }

        let tss = self.current_tss();
        let new_ss = tss.ss0(self)?;
        let new_esp = tss.esp0(self)?;
        let new_ss_descriptor = self.get_descriptor(new_ss)?;

        if new_ss_descriptor.is_null() {
            return Err(self.invalid_tss(source as u16, "new ss is null"));
        }
        if new_ss_descriptor.is_outside_table_limits() {
            return Err(self.invalid_tss(
                make_error_code(new_ss, false, source),
                "new ss outside table limits",
            ));
        }
        if new_ss & 3 != 0 {
            return Err(self.invalid_tss(
                make_error_code(new_ss, false, source),
                &format!("new ss RPL({}) != 0", new_ss & 3),
            ));
        }
        if new_ss_descriptor.dpl != 0 {
            return Err(self.invalid_tss(
                make_error_code(new_ss, false, source),
                &format!("new ss DPL({}) != 0", new_ss_descriptor.dpl),
            ));
        }
        if !new_ss_descriptor.is_data() || !new_ss_descriptor.as_segment().writable() {
            return Err(self.invalid_tss(
                make_error_code(new_ss, false, source),
                "new ss not a writable data segment",
            ));
        }
        if !new_ss_descriptor.present {
            return Err(self.stack_fault(
                make_error_code(new_ss, false, source),
                "new ss not present",
            ));
        }

        self.set_cpl(0);
        self.set_vm(false);
        self.set_tf(false);
        self.set_rf(false);
        self.set_nt(false);
        if gate.is_interrupt_gate() {
            self.set_if(false);
        }
        self.write_segment_register(SegmentRegister::Ss, new_ss)?;
        self.set_esp(new_esp);

        let gs = self.gs();
        let fs = self.fs();
        let ds = self.ds();
        let es = self.es();
        self.push_value_with_size(gs as u32, gate.size())?;
        self.push_value_with_size(fs as u32, gate.size())?;
        self.push_value_with_size(ds as u32, gate.size())?;
        self.push_value_with_size(es as u32, gate.size())?;
        self.push_value_with_size(original_ss as u32, gate.size())?;
        self.push_value_with_size(original_esp, gate.size())?;
        self.push_value_with_size(original_flags, gate.size())?;
        self.push_value_with_size(original_cs as u32, gate.size())?;
        self.push_value_with_size(original_eip, gate.size())?;
        if let Some(code) = error_code {
            self.push_value_with_size(code as u32, gate.size())?;
        }
        self.write_segment_register(SegmentRegister::Gs, 0)?;
        self.write_segment_register(SegmentRegister::Fs, 0)?;
        self.write_segment_register(SegmentRegister::Ds, 0)?;
        self.write_segment_register(SegmentRegister::Es, 0)?;
        self.write_segment_register(SegmentRegister::Cs, gate.selector)?;
        self.set_cpl(0);
        self.set_eip(offset);
        Ok(())
    }

    // --- IRET ---

    pub(crate) fn do_iret(&mut self) -> MemResult<()> {
        if !self.pe() {
            return self.iret_from_real_mode();
        }
        if self.vm() {
            return self.iret_from_vm86_mode();
        }

        let original_cpl = self.cpl();

        if self.nt() {
            // Nested task: return through the TSS backlink.
            let tss = self.current_tss();
            let backlink = tss.backlink(self)?;
            return self.task_switch_to_selector(backlink, JumpType::Iret);
        }

        let mut popper = TransactionalPopper::new();
        let offset = popper.pop_operand_sized_value(self)?;
        let selector = popper.pop_operand_sized_value(self)? as u16;
        let flags = popper.pop_operand_sized_value(self)?;

        if flags & Eflags::VM.bits() != 0 {
            if self.cpl() == 0 {
                return self.iret_to_vm86_mode(popper, LogicalAddress::new(selector, offset), flags);
            }
            return Err(self.general_protection_fault(0, "IRET to VM86 with CPL != 0"));
        }
        self.protected_iret(popper, LogicalAddress::new(selector, offset))?;
        self.set_eflags_respectfully(flags, original_cpl);
        Ok(())
    }

    fn iret_from_real_mode(&mut self) -> MemResult<()> {
        let offset = self.pop_operand_sized_value()?;
        let selector = self.pop_operand_sized_value()? as u16;
        let flags = self.pop_operand_sized_value()?;

        self.write_segment_register(SegmentRegister::Cs, selector)?;
        self.set_eip(offset);
        self.set_eflags_respectfully(flags, 0);
        Ok(())
    }

    fn iret_from_vm86_mode(&mut self) -> MemResult<()> {
        if self.iopl() != 3 {
            return Err(self.general_protection_fault(0, "IRET in VM86 mode with IOPL != 3"));
        }
        let original_cpl = self.cpl();

        let mut popper = TransactionalPopper::new();
        let offset = popper.pop_operand_sized_value(self)?;
        let selector = popper.pop_operand_sized_value(self)? as u16;
        let flags = popper.pop_operand_sized_value(self)?;

        if offset & 0xffff_0000 != 0 {
            return Err(self.general_protection_fault(0, "IRET in VM86 mode to EIP > 0xffff"));
        }
        self.write_segment_register(SegmentRegister::Cs, selector)?;
        self.set_eip(offset);
        self.set_eflags_respectfully(flags, original_cpl);
        popper.commit(self);
        Ok(())
    }

    fn protected_iret(
        &mut self,
        mut popper: TransactionalPopper,
        address: LogicalAddress,
    ) -> MemResult<()> {
        debug_assert!(self.pe());
        let selector = address.selector;
        let mut offset = address.offset;
        let original_cpl = self.cpl();
        let selector_rpl = (selector & 3) as u8;

        let descriptor = self.get_descriptor(selector)?;

        if descriptor.is_null() {
            return Err(self.general_protection_fault(0, "IRET to null selector"));
        }
        if descriptor.is_outside_table_limits() {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                "IRET to selector outside table limit",
            ));
        }
        if !descriptor.is_code() {
            return Err(self.general_protection_fault(selector & 0xfffc, "not a code segment"));
        }
        if selector_rpl < self.cpl() {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                &format!("IRET with RPL({}) < CPL({})", selector_rpl, self.cpl()),
            ));
        }

        let code_segment = descriptor.as_segment();

        if code_segment.conforming() && code_segment.dpl > selector_rpl {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                "IRET to conforming code segment with DPL > RPL",
            ));
        }
        if !code_segment.conforming() && code_segment.dpl != selector_rpl {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                "IRET to non-conforming code segment with DPL != RPL",
            ));
        }
        if !code_segment.present {
            return Err(self.not_present(selector & 0xfffc, "code segment not present"));
        }

        if !code_segment.is_32bit() {
            offset &= 0xffff;
        }
        if offset > code_segment.effective_limit {
            log::debug!(
                target: "cpu",
                "IRET to eip({:08x}) outside limit({:08x})",
                offset,
                code_segment.effective_limit
            );
            return Err(self.general_protection_fault(0, "offset outside segment limit"));
        }

        if selector_rpl > original_cpl {
            let new_esp = popper.pop_operand_sized_value(self)?;
            let new_ss = popper.pop_operand_sized_value(self)? as u16;

            self.write_segment_register(SegmentRegister::Cs, selector)?;
            self.set_eip(offset);
            self.write_segment_register(SegmentRegister::Ss, new_ss)?;
            self.set_esp(new_esp);

            self.clear_segment_register_after_return_if_needed(
                SegmentRegister::Es,
                JumpType::Iret,
            )?;
            self.clear_segment_register_after_return_if_needed(
                SegmentRegister::Fs,
                JumpType::Iret,
            )?;
            self.clear_segment_register_after_return_if_needed(
                SegmentRegister::Gs,
                JumpType::Iret,
            )?;
            self.clear_segment_register_after_return_if_needed(
                SegmentRegister::Ds,
                JumpType::Iret,
            )?;
        } else {
            self.write_segment_register(SegmentRegister::Cs, selector)?;
            self.set_eip(offset);
            popper.commit(self);
        }
        Ok(())
    }

    fn iret_to_vm86_mode(
        &mut self,
        mut popper: TransactionalPopper,
        entry: LogicalAddress,
        flags: u32,
    ) -> MemResult<()> {
        if !self.o32() {
            return Err(self.general_protection_fault(0, "16-bit IRET to VM86 mode"));
        }
        if entry.offset & 0xffff_0000 != 0 {
            return Err(self.general_protection_fault(0, "IRET to VM86 with offset > 0xffff"));
        }

        let new_esp = popper.pop32(self)?;
        let new_ss = popper.pop32(self)? as u16;
        let new_es = popper.pop32(self)? as u16;
        let new_ds = popper.pop32(self)? as u16;
        let new_fs = popper.pop32(self)? as u16;
        let new_gs = popper.pop32(self)? as u16;

        self.set_eflags(flags);
        self.write_segment_register(SegmentRegister::Cs, entry.selector)?;
        self.set_eip(entry.offset);
        self.write_segment_register(SegmentRegister::Es, new_es)?;
        self.write_segment_register(SegmentRegister::Ds, new_ds)?;
        self.write_segment_register(SegmentRegister::Fs, new_fs)?;
        self.write_segment_register(SegmentRegister::Gs, new_gs)?;
        self.set_cpl(3);
        self.set_esp(new_esp);
        self.write_segment_register(SegmentRegister::Ss, new_ss)?;
        Ok(())
    }
}
