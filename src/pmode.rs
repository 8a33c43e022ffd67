// The segmentation and protection engine: fault constructors, segment
// register writes with full validation, far jumps/calls/returns through code
// segments, call gates and TSS descriptors (with the inner-ring stack
// switch), and the descriptor-table instruction family.

use crate::descriptors::{Descriptor, Gate, SegmentDescriptor};
use crate::exceptions::{ExecResult, Fault, MemResult};
use crate::fields::{JumpType, LinearAddress, LogicalAddress, MemoryAccessType, SegmentRegister};
use crate::parser::Instruction;
use crate::processor::Cpu;
use crate::stack::TransactionalPopper;

impl Cpu {
    // --- fault constructors; they only build the value, raising is the
    //     driver's business ---

    pub(crate) fn general_protection_fault(&mut self, code: u16, reason: &str) -> Fault {
        if self.options.log_exceptions {
            log::info!(
                target: "cpu",
                "#GP({:04x}) selector={:04x}, TI={}, I={}, EX={} :: {}",
                code,
                code & 0xfff8,
                (code >> 2) & 1,
                (code >> 1) & 1,
                code & 1,
                reason
            );
        }
        if self.options.crash_on_general_protection_fault {
            log::error!(target: "cpu", "crash on #GP requested");
            std::process::abort();
        }
        Fault::GeneralProtectionFault {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn stack_fault(&mut self, selector: u16, reason: &str) -> Fault {
        if self.options.log_exceptions {
            log::info!(target: "cpu", "#SS({:04x}) :: {}", selector, reason);
        }
        Fault::StackFault {
            selector,
            reason: reason.into(),
        }
    }

    pub(crate) fn not_present(&mut self, selector: u16, reason: &str) -> Fault {
        if self.options.log_exceptions {
            log::info!(target: "cpu", "#NP({:04x}) :: {}", selector, reason);
        }
        Fault::NotPresent {
            selector,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_tss(&mut self, selector: u16, reason: &str) -> Fault {
        if self.options.log_exceptions {
            log::info!(target: "cpu", "#TS({:04x}) :: {}", selector, reason);
        }
        Fault::InvalidTss {
            selector,
            reason: reason.into(),
        }
    }

    // --- segment register writes ---

    fn validate_segment_load(
        &mut self,
        segment: SegmentRegister,
        selector: u16,
        descriptor: &Descriptor,
    ) -> MemResult<()> {
        if !self.pe() || self.vm() {
            return Ok(());
        }

        let selector_rpl = (selector & 3) as u8;

        if descriptor.is_outside_table_limits() {
            return Err(
                self.general_protection_fault(selector & 0xfffc, "selector outside table limits")
            );
        }

        if segment == SegmentRegister::Ss {
            if descriptor.is_null() {
                return Err(self.general_protection_fault(0, "ss loaded with null descriptor"));
            }
            if selector_rpl != self.cpl() {
                return Err(self.general_protection_fault(
                    selector & 0xfffc,
                    &format!("ss selector RPL({}) != CPL({})", selector_rpl, self.cpl()),
                ));
            }
            if !descriptor.is_data() || !descriptor.as_segment().writable() {
                return Err(self.general_protection_fault(
                    selector & 0xfffc,
                    "ss loaded with something other than a writable data segment",
                ));
            }
            if descriptor.dpl != self.cpl() {
                return Err(self.general_protection_fault(
                    selector & 0xfffc,
                    &format!(
                        "ss selector leads to descriptor with DPL({}) != CPL({})",
                        descriptor.dpl,
                        self.cpl()
                    ),
                ));
            }
            if !descriptor.present {
                return Err(self.stack_fault(selector & 0xfffc, "ss loaded with non-present segment"));
            }
            return Ok(());
        }

        if descriptor.is_null() {
            return Ok(());
        }

        if matches!(
            segment,
            SegmentRegister::Ds | SegmentRegister::Es | SegmentRegister::Fs | SegmentRegister::Gs
        ) {
            if !descriptor.is_data()
                && (descriptor.is_code() && !descriptor.as_segment().readable())
            {
                return Err(self.general_protection_fault(
                    selector & 0xfffc,
                    &format!("{} loaded with non-data or non-readable code segment", segment),
                ));
            }
            if descriptor.is_data() || descriptor.is_nonconforming_code() {
                if selector_rpl > descriptor.dpl {
                    return Err(self.general_protection_fault(
                        selector & 0xfffc,
                        &format!(
                            "{} loaded with data or non-conforming code segment and RPL > DPL",
                            segment
                        ),
                    ));
                }
                if self.cpl() > descriptor.dpl {
                    return Err(self.general_protection_fault(
                        selector & 0xfffc,
                        &format!(
                            "{} loaded with data or non-conforming code segment and CPL > DPL",
                            segment
                        ),
                    ));
                }
            }
            if !descriptor.present {
                return Err(self.not_present(
                    selector & 0xfffc,
                    &format!("{} loaded with non-present segment", segment),
                ));
            }
        }

        if !descriptor.is_segment() {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                &format!("{} loaded with system segment", segment),
            ));
        }
        Ok(())
    }

    /// Validate, load and update the caches for a segment register write.
    /// Loading CS refreshes CPL and the default sizes; loading SS marks the
    /// cache for stack-fault selection and refreshes the stack size.
    pub fn write_segment_register(
        &mut self,
        segment: SegmentRegister,
        selector: u16,
    ) -> MemResult<()> {
        let cached;
        if !self.pe() || self.vm() {
            cached = self.real_mode_or_vm86_descriptor(selector, Some(segment));
        } else {
            let descriptor = self.get_descriptor(selector)?;
            self.validate_segment_load(segment, selector, &descriptor)?;
            cached = if descriptor.is_null() {
                SegmentDescriptor::null_descriptor()
            } else {
                descriptor.as_segment()
            };
        }

        self.sreg[segment as usize] = selector;
        self.descriptors[segment as usize] = cached;

        if self.options.pedebug && self.pe() {
            log::debug!(
                target: "cpu",
                "{} loaded with {:04x} {{ type:{:02x}, base:{:08x}, limit:{:08x} }}",
                segment,
                selector,
                cached.type_code,
                cached.base,
                cached.limit
            );
        }

        match segment {
            SegmentRegister::Cs => {
                if self.pe() {
                    if self.vm() {
                        self.set_cpl(3);
                    } else {
                        let dpl = cached.dpl;
                        self.set_cpl(dpl);
                    }
                }
                self.update_default_sizes();
            }
            SegmentRegister::Ss => {
                self.descriptors[SegmentRegister::Ss as usize].loaded_in_ss = true;
                self.update_stack_size();
            }
            _ => {}
        }
        Ok(())
    }

    // --- far control transfers ---

    pub fn far_jump(
        &mut self,
        address: LogicalAddress,
        jump_type: JumpType,
        gate: Option<&Gate>,
    ) -> MemResult<()> {
        if !self.pe() || self.vm() {
            self.real_mode_far_jump(address, jump_type)
        } else {
            self.protected_mode_far_jump(address, jump_type, gate)
        }
    }

    fn real_mode_far_jump(
        &mut self,
        address: LogicalAddress,
        jump_type: JumpType,
    ) -> MemResult<()> {
        debug_assert!(!self.pe() || self.vm());
        let original_cs = self.cs();
        let original_eip = self.eip();

        self.write_segment_register(SegmentRegister::Cs, address.selector)?;
        self.set_eip(address.offset);

        if jump_type == JumpType::Call {
            self.push_operand_sized_value(original_cs as u32)?;
            self.push_operand_sized_value(original_eip)?;
        }
        Ok(())
    }

    fn protected_mode_far_jump(
        &mut self,
        address: LogicalAddress,
        jump_type: JumpType,
        gate: Option<&Gate>,
    ) -> MemResult<()> {
        debug_assert!(self.pe());
        let selector = address.selector;
        let mut offset = address.offset;
        let push_size = match gate {
            // Coming through a gate; respect the bit size of the gate
            // descriptor.
            Some(gate) => gate.size(),
            None => {
                if self.o32() {
                    crate::fields::ValueSize::DWord
                } else {
                    crate::fields::ValueSize::Word
                }
            }
        };

        let original_cpl = self.cpl();
        let original_cs = self.cs();
        let original_eip = self.eip();
        let selector_rpl = (selector & 3) as u8;

        let descriptor = self.get_descriptor(selector)?;

        if descriptor.is_null() {
            return Err(
                self.general_protection_fault(0, &format!("{} to null selector", jump_type))
            );
        }
        if descriptor.is_outside_table_limits() {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                &format!("{} to selector outside table limit", jump_type),
            ));
        }
        if !descriptor.is_code()
            && !descriptor.is_call_gate()
            && !descriptor.is_task_gate()
            && !descriptor.is_tss()
        {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                &format!("{} to invalid descriptor type", jump_type),
            ));
        }

        if descriptor.is_gate() && gate.is_some() {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                "gate-to-gate jumps are not allowed",
            ));
        }

        if descriptor.is_task_gate() {
            // A task gate outside interrupt delivery would nest through the
            // TSS path; the referenced TSS selector goes through a full task
            // switch.
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                &format!("{} through task gate not supported", jump_type),
            ));
        }

        if descriptor.is_call_gate() {
            let inner_gate = descriptor.as_gate();
            if inner_gate.parameter_count != 0 {
                return Err(self.general_protection_fault(
                    selector & 0xfffc,
                    "call gate with parameter count != 0",
                ));
            }
            if descriptor.dpl < self.cpl() {
                return Err(self.general_protection_fault(
                    selector & 0xfffc,
                    &format!(
                        "{} to gate with DPL({}) < CPL({})",
                        jump_type,
                        descriptor.dpl,
                        self.cpl()
                    ),
                ));
            }
            if selector_rpl > descriptor.dpl {
                return Err(self.general_protection_fault(
                    selector & 0xfffc,
                    &format!(
                        "{} to gate with RPL({}) > DPL({})",
                        jump_type, selector_rpl, descriptor.dpl
                    ),
                ));
            }
            if !descriptor.present {
                return Err(self.not_present(selector & 0xfffc, "gate not present"));
            }
            // Jump to the gate's entry point, with the gate now in hand.
            return self.far_jump(inner_gate.entry(), jump_type, Some(&inner_gate));
        }

        if descriptor.is_tss() {
            if descriptor.dpl < self.cpl() {
                return Err(self.general_protection_fault(
                    selector & 0xfffc,
                    &format!("{} to TSS descriptor with DPL < CPL", jump_type),
                ));
            }
            if descriptor.dpl < selector_rpl {
                return Err(self.general_protection_fault(
                    selector & 0xfffc,
                    &format!("{} to TSS descriptor with DPL < RPL", jump_type),
                ));
            }
            if !descriptor.present {
                return Err(self.not_present(selector & 0xfffc, "TSS not present"));
            }
            return self.task_switch(selector, descriptor, jump_type);
        }

        // So it's a code segment then.
        let code_segment = descriptor.as_segment();

        if (jump_type == JumpType::Call || jump_type == JumpType::Jmp) && gate.is_none() {
            if code_segment.conforming() {
                if code_segment.dpl > self.cpl() {
                    return Err(self.general_protection_fault(
                        selector & 0xfffc,
                        &format!(
                            "{} -> conforming code segment DPL({}) > CPL({})",
                            jump_type,
                            code_segment.dpl,
                            self.cpl()
                        ),
                    ));
                }
            } else {
                if selector_rpl > code_segment.dpl {
                    return Err(self.general_protection_fault(
                        selector & 0xfffc,
                        &format!(
                            "{} -> code segment RPL({}) > DPL({})",
                            jump_type, selector_rpl, code_segment.dpl
                        ),
                    ));
                }
                if code_segment.dpl != self.cpl() {
                    return Err(self.general_protection_fault(
                        selector & 0xfffc,
                        &format!(
                            "{} -> code segment DPL({}) != CPL({})",
                            jump_type,
                            code_segment.dpl,
                            self.cpl()
                        ),
                    ));
                }
            }
        }

        if let Some(gate) = gate {
            if !gate.is_32bit() {
                offset &= 0xffff;
            }
        }
        // A 32-bit jump into a 16-bit segment might have irrelevant higher
        // bits set; mask them off so the limit check is meaningful.
        if !code_segment.is_32bit() {
            offset &= 0xffff;
        }

        if !code_segment.present {
            return Err(self.not_present(selector & 0xfffc, "code segment not present"));
        }

        if offset > code_segment.effective_limit {
            log::debug!(
                target: "cpu",
                "{} to eip({:08x}) outside limit({:08x})",
                jump_type,
                offset,
                code_segment.effective_limit
            );
            return Err(self.general_protection_fault(0, "offset outside segment limit"));
        }

        self.write_segment_register(SegmentRegister::Cs, selector)?;
        self.set_eip(offset);

        if jump_type == JumpType::Call && gate.is_some() {
            if descriptor.dpl < original_cpl {
                // Escalating to an inner ring: fetch the ring stack from the
                // TSS and validate it before anything is pushed.
                let tss = self.current_tss();
                let new_ss = tss.ring_ss(self, descriptor.dpl)?;
                let new_esp = tss.ring_esp(self, descriptor.dpl)?;
                let new_ss_descriptor = self.get_descriptor(new_ss)?;

                if new_ss_descriptor.is_null() {
                    return Err(self.invalid_tss(new_ss & 0xfffc, "new ss is null"));
                }
                if new_ss_descriptor.is_outside_table_limits() {
                    return Err(self.invalid_tss(new_ss & 0xfffc, "new ss outside table limits"));
                }
                if new_ss_descriptor.dpl != descriptor.dpl {
                    return Err(self.invalid_tss(
                        new_ss & 0xfffc,
                        &format!(
                            "new ss DPL({}) != code segment DPL({})",
                            new_ss_descriptor.dpl, descriptor.dpl
                        ),
                    ));
                }
                if !new_ss_descriptor.is_data() || !new_ss_descriptor.as_segment().writable() {
                    return Err(
                        self.invalid_tss(new_ss & 0xfffc, "new ss not a writable data segment")
                    );
                }
                if !new_ss_descriptor.present {
                    return Err(self.stack_fault(new_ss & 0xfffc, "new ss not present"));
                }

                // Everything is validated; the switch plus pushes must not
                // fault halfway.
                let original_ss = self.ss();
                let original_esp = self.esp();
                self.set_cpl(descriptor.dpl);
                self.write_segment_register(SegmentRegister::Ss, new_ss)?;
                self.set_esp(new_esp);
                self.push_value_with_size(original_ss as u32, push_size)?;
                self.push_value_with_size(original_esp, push_size)?;
            } else {
                self.set_cpl(original_cpl);
            }
        }

        if jump_type == JumpType::Call {
            self.push_value_with_size(original_cs as u32, push_size)?;
            self.push_value_with_size(original_eip, push_size)?;
        }

        if gate.is_none() {
            self.set_cpl(original_cpl);
        }
        Ok(())
    }

    /// After a privilege de-escalating return, data segment registers whose
    /// cached descriptor the new ring could not load get reset to null.
    pub(crate) fn clear_segment_register_after_return_if_needed(
        &mut self,
        segment: SegmentRegister,
        jump_type: JumpType,
    ) -> MemResult<()> {
        if self.read_segment_register(segment) == 0 {
            return Ok(());
        }
        let cached = *self.cached_descriptor(segment);
        if cached.null
            || (cached.dpl < self.cpl() && (cached.is_data() || !cached.conforming()))
        {
            log::debug!(
                target: "cpu",
                "{} clearing {}({:04x}) with DPL={} (CPL now {})",
                jump_type,
                segment,
                self.read_segment_register(segment),
                cached.dpl,
                self.cpl()
            );
            self.write_segment_register(segment, 0)?;
        }
        Ok(())
    }

    pub fn far_return(&mut self, stack_adjustment: u16) -> MemResult<()> {
        if !self.pe() || self.vm() {
            self.real_mode_far_return(stack_adjustment)
        } else {
            self.protected_far_return(stack_adjustment)
        }
    }

    fn real_mode_far_return(&mut self, stack_adjustment: u16) -> MemResult<()> {
        let offset = self.pop_operand_sized_value()?;
        let selector = self.pop_operand_sized_value()? as u16;
        self.write_segment_register(SegmentRegister::Cs, selector)?;
        self.set_eip(offset);
        self.adjust_stack_pointer(stack_adjustment as i32);
        Ok(())
    }

    fn protected_far_return(&mut self, stack_adjustment: u16) -> MemResult<()> {
        debug_assert!(self.pe());
        let mut popper = TransactionalPopper::new();
        let mut offset = popper.pop_operand_sized_value(self)?;
        let selector = popper.pop_operand_sized_value(self)? as u16;
        let original_cpl = self.cpl();
        let selector_rpl = (selector & 3) as u8;

        popper.adjust_stack_pointer(stack_adjustment as i32);

        let descriptor = self.get_descriptor(selector)?;

        if descriptor.is_null() {
            return Err(self.general_protection_fault(0, "RETF to null selector"));
        }
        if descriptor.is_outside_table_limits() {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                "RETF to selector outside table limit",
            ));
        }
        if !descriptor.is_code() {
            return Err(self.general_protection_fault(selector & 0xfffc, "not a code segment"));
        }
        if selector_rpl < self.cpl() {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                &format!("RETF with RPL({}) < CPL({})", selector_rpl, self.cpl()),
            ));
        }

        let code_segment = descriptor.as_segment();

        if code_segment.conforming() && code_segment.dpl > selector_rpl {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                "RETF to conforming code segment with DPL > RPL",
            ));
        }
        if !code_segment.conforming() && code_segment.dpl != selector_rpl {
            return Err(self.general_protection_fault(
                selector & 0xfffc,
                "RETF to non-conforming code segment with DPL != RPL",
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
                "RETF to eip({:08x}) outside limit({:08x})",
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
                JumpType::Retf,
            )?;
            self.clear_segment_register_after_return_if_needed(
                SegmentRegister::Fs,
                JumpType::Retf,
            )?;
            self.clear_segment_register_after_return_if_needed(
                SegmentRegister::Gs,
                JumpType::Retf,
            )?;
            self.clear_segment_register_after_return_if_needed(
                SegmentRegister::Ds,
                JumpType::Retf,
            )?;
            self.adjust_stack_pointer(stack_adjustment as i32);
        } else {
            self.write_segment_register(SegmentRegister::Cs, selector)?;
            self.set_eip(offset);
            popper.commit(self);
        }
        Ok(())
    }

    // --- descriptor table instructions ---

    fn do_sgdt_or_sidt(&mut self, insn: &mut Instruction, is_gdt: bool) -> ExecResult {
        if insn.modrm.is_register() {
            return Err(self
                .invalid_opcode("SGDT/SIDT with register destination")
                .into());
        }
        let table = if is_gdt { self.gdtr } else { self.idtr };
        let segment = insn.modrm.segment();
        let offset = insn.modrm.offset();
        self.snoop_segment(segment, offset, MemoryAccessType::Write)?;
        self.snoop_segment(segment, offset.wrapping_add(5), MemoryAccessType::Write)?;
        // 16-bit stores mask the base to 24 bits, 286/386 style.
        let masked_base = if self.o16() {
            table.base.get() & 0x00ff_ffff
        } else {
            table.base.get()
        };
        self.write_memory16(segment, offset, table.limit)?;
        self.write_memory32(segment, offset.wrapping_add(2), masked_base)?;
        Ok(())
    }

    pub(crate) fn sgdt(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_sgdt_or_sidt(insn, true)
    }

    pub(crate) fn sidt(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_sgdt_or_sidt(insn, false)
    }

    fn do_lgdt_or_lidt(&mut self, insn: &mut Instruction, is_gdt: bool) -> ExecResult {
        if insn.modrm.is_register() {
            return Err(self.invalid_opcode("LGDT/LIDT with register source").into());
        }
        if self.pe() && self.cpl() != 0 {
            return Err(self
                .general_protection_fault(0, "LGDT/LIDT with CPL != 0")
                .into());
        }
        let segment = insn.modrm.segment();
        let offset = insn.modrm.offset();
        let base = self.read_memory32(segment, offset.wrapping_add(2))?;
        let limit = self.read_memory16(segment, offset)?;
        let base_mask = if self.o32() { 0xffff_ffff } else { 0x00ff_ffff };
        let table = if is_gdt { &mut self.gdtr } else { &mut self.idtr };
        table.base = LinearAddress(base & base_mask);
        table.limit = limit;
        Ok(())
    }

    pub(crate) fn lgdt(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_lgdt_or_lidt(insn, true)
    }

    pub(crate) fn lidt(&mut self, insn: &mut Instruction) -> ExecResult {
        self.do_lgdt_or_lidt(insn, false)
    }

    pub(crate) fn set_ldt(&mut self, selector: u16) -> MemResult<()> {
        let descriptor = self.get_descriptor(selector)?;
        let mut base = LinearAddress(0);
        let mut limit = 0;
        if !descriptor.is_null() {
            if descriptor.is_ldt() {
                if !descriptor.present {
                    return Err(self.not_present(selector & 0xfffc, "LDT segment not present"));
                }
                let ldt = descriptor.as_ldt();
                base = ldt.base;
                limit = ldt.limit as u16;
            } else {
                return Err(
                    self.general_protection_fault(selector & 0xfffc, "not an LDT descriptor")
                );
            }
        }
        self.ldtr.selector = selector;
        self.ldtr.base = base;
        self.ldtr.limit = limit;
        Ok(())
    }

    pub(crate) fn lldt_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.vm() {
            return Err(self
                .invalid_opcode("LLDT not recognized in real/VM86 mode")
                .into());
        }
        if self.cpl() != 0 {
            return Err(self.general_protection_fault(0, "LLDT with CPL != 0").into());
        }
        let selector = insn.modrm.read16(self)?;
        self.set_ldt(selector)?;
        Ok(())
    }

    pub(crate) fn sldt_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.vm() {
            return Err(self
                .invalid_opcode("SLDT not recognized in real/VM86 mode")
                .into());
        }
        let selector = self.ldtr.selector;
        let o32 = self.o32();
        insn.modrm.write_special(self, selector as u32, o32)?;
        Ok(())
    }

    // --- machine status word ---

    pub(crate) fn clts(&mut self, _insn: &mut Instruction) -> ExecResult {
        if self.pe() && self.cpl() != 0 {
            return Err(self
                .general_protection_fault(0, &format!("CLTS with CPL != 0 ({})", self.cpl()))
                .into());
        }
        self.cr0 &= !crate::processor::cr0::TS;
        Ok(())
    }

    pub(crate) fn lmsw_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        if self.pe() && self.cpl() != 0 {
            return Err(self
                .general_protection_fault(0, &format!("LMSW with CPL != 0 ({})", self.cpl()))
                .into());
        }
        let mut msw = insn.modrm.read16(self)?;
        if self.pe() {
            // LMSW cannot leave protected mode.
            msw |= crate::processor::cr0::PE as u16;
        }
        self.cr0 = (self.cr0 & 0xffff_fff0) | (msw as u32 & 0x0f);
        Ok(())
    }

    pub(crate) fn smsw_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        let cr0 = self.cr0();
        let o32 = self.o32();
        insn.modrm.write_special(self, cr0, o32)?;
        Ok(())
    }

    // --- access-rights and limit probes ---

    fn lar_descriptor_fails(&mut self, selector: u16) -> MemResult<Option<u32>> {
        let selector_rpl = (selector & 3) as u8;
        let descriptor = self.get_descriptor(selector)?;
        if descriptor.is_null()
            || descriptor.is_outside_table_limits()
            || descriptor.dpl < self.cpl()
            || descriptor.dpl < selector_rpl
        {
            return Ok(None);
        }
        Ok(Some(descriptor.raw_high))
    }

    pub(crate) fn lar_reg16_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.vm() {
            return Err(self
                .invalid_opcode("LAR not recognized in real/VM86 mode")
                .into());
        }
        let selector = insn.modrm.read16(self)?;
        match self.lar_descriptor_fails(selector)? {
            None => self.set_zf(false),
            Some(raw_high) => {
                insn.set_reg(self, (raw_high & 0xff00) as u16);
                self.set_zf(true);
            }
        }
        Ok(())
    }

    pub(crate) fn lar_reg32_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.vm() {
            return Err(self
                .invalid_opcode("LAR not recognized in real/VM86 mode")
                .into());
        }
        let selector = insn.modrm.read32(self)? as u16;
        match self.lar_descriptor_fails(selector)? {
            None => self.set_zf(false),
            Some(raw_high) => {
                insn.set_reg(self, raw_high & 0x00ff_ff00);
                self.set_zf(true);
            }
        }
        Ok(())
    }

    fn is_valid_descriptor_for_lsl(descriptor: &Descriptor) -> bool {
        use crate::descriptors::system_type;
        if descriptor.is_null() || descriptor.is_outside_table_limits() {
            return true;
        }
        if descriptor.is_segment() {
            return true;
        }
        matches!(
            descriptor.type_code,
            system_type::AVAILABLE_TSS_16BIT
                | system_type::LDT
                | system_type::BUSY_TSS_16BIT
                | system_type::AVAILABLE_TSS_32BIT
                | system_type::BUSY_TSS_32BIT
        )
    }

    pub(crate) fn lsl_reg16_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.vm() {
            return Err(self
                .invalid_opcode("LSL not recognized in real/VM86 mode")
                .into());
        }
        let selector = insn.modrm.read16(self)?;
        let descriptor = self.get_descriptor(selector)?;
        if !Cpu::is_valid_descriptor_for_lsl(&descriptor) {
            self.set_zf(false);
            return Ok(());
        }
        insn.set_reg(self, descriptor.effective_limit() as u16);
        self.set_zf(true);
        Ok(())
    }

    pub(crate) fn lsl_reg32_rm32(&mut self, insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.vm() {
            return Err(self
                .invalid_opcode("LSL not recognized in real/VM86 mode")
                .into());
        }
        let selector = insn.modrm.read16(self)?;
        let descriptor = self.get_descriptor(selector)?;
        if descriptor.is_outside_table_limits() {
            self.set_zf(false);
            return Ok(());
        }
        insn.set_reg(self, descriptor.effective_limit());
        self.set_zf(true);
        Ok(())
    }

    pub(crate) fn verr_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.vm() {
            return Err(self
                .invalid_opcode("VERR not recognized in real/VM86 mode")
                .into());
        }
        let selector = insn.modrm.read16(self)?;
        let rpl = (selector & 3) as u8;
        let descriptor = self.get_descriptor(selector)?;

        let readable = !descriptor.is_null()
            && !descriptor.is_outside_table_limits()
            && descriptor.is_segment()
            && descriptor.as_segment().readable()
            && (descriptor.is_conforming_code()
                || (descriptor.dpl >= self.cpl() && descriptor.dpl >= rpl));
        self.set_zf(readable);
        Ok(())
    }

    pub(crate) fn verw_rm16(&mut self, insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.vm() {
            return Err(self
                .invalid_opcode("VERW not recognized in real/VM86 mode")
                .into());
        }
        let selector = insn.modrm.read16(self)?;
        let rpl = (selector & 3) as u8;
        let descriptor = self.get_descriptor(selector)?;

        let writable = !descriptor.is_null()
            && !descriptor.is_outside_table_limits()
            && descriptor.is_segment()
            && descriptor.dpl >= self.cpl()
            && descriptor.dpl >= rpl
            && descriptor.as_segment().writable();
        self.set_zf(writable);
        Ok(())
    }

    pub(crate) fn arpl(&mut self, insn: &mut Instruction) -> ExecResult {
        if !self.pe() || self.vm() {
            return Err(self
                .invalid_opcode("ARPL not recognized in real/VM86 mode")
                .into());
        }
        let dest = insn.modrm.read16(self)?;
        let src: u16 = insn.reg(self);

        if dest & 3 < src & 3 {
            self.set_zf(true);
            insn.modrm.write16(self, (dest & !3) | (src & 3))?;
        } else {
            self.set_zf(false);
        }
        Ok(())
    }
}
