// Linear to physical translation. With CR0.PG clear the mapping is the
// identity; otherwise a two-level walk through the page directory and page
// table, with user/supervisor and write checks, Accessed/Dirty maintenance
// and #PF error-code synthesis. CR2 latches the faulting linear address
// before the fault value is returned.

use bitflags::bitflags;

use crate::exceptions::{Fault, MemResult};
use crate::fields::{LinearAddress, MemoryAccessType, PhysicalAddress, SegmentRegister};
use crate::processor::Cpu;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableEntryFlags: u32 {
        const PRESENT = 0x01;
        const READ_WRITE = 0x02;
        const USER_SUPERVISOR = 0x04;
        const ACCESSED = 0x20;
        const DIRTY = 0x40;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultFlags: u16 {
        const PROTECTION_VIOLATION = 0x01;
        const WRITE = 0x02;
        const USER_MODE = 0x04;
        const INSTRUCTION_FETCH = 0x08;
    }
}

fn make_page_fault_code(
    flags: PageFaultFlags,
    access_type: MemoryAccessType,
    user_mode: bool,
) -> u16 {
    let mut code = flags;
    if access_type == MemoryAccessType::Write {
        code |= PageFaultFlags::WRITE;
    }
    if user_mode {
        code |= PageFaultFlags::USER_MODE;
    }
    if access_type == MemoryAccessType::Execute {
        code |= PageFaultFlags::INSTRUCTION_FETCH;
    }
    code.bits()
}

impl Cpu {
    pub fn translate_address(
        &mut self,
        linear_address: LinearAddress,
        access_type: MemoryAccessType,
        effective_cpl: Option<u8>,
    ) -> MemResult<PhysicalAddress> {
        if !self.pe() || !self.pg() {
            return Ok(PhysicalAddress(linear_address.get()));
        }
        self.translate_address_slow_case(linear_address, access_type, effective_cpl)
    }

    fn page_fault(
        &mut self,
        linear_address: LinearAddress,
        flags: PageFaultFlags,
        access_type: MemoryAccessType,
        user_mode: bool,
        fault_table: &str,
        pde: u32,
        pte: u32,
    ) -> Fault {
        let code = make_page_fault_code(flags, access_type, user_mode);
        if self.options.log_exceptions {
            log::info!(
                target: "cpu",
                "#PF({:04x}) {} in {} for {} {:?} @{:#010x}, PDBR={:#010x}, PDE={:#010x}, PTE={:#010x}",
                code,
                if flags.contains(PageFaultFlags::PROTECTION_VIOLATION) { "PV" } else { "NP" },
                fault_table,
                if user_mode { "user" } else { "supervisor" },
                access_type,
                linear_address.get(),
                self.cr3,
                pde,
                pte
            );
        }
        self.cr2 = linear_address.get();
        if self.options.crash_on_page_fault {
            log::error!(target: "cpu", "crash on #PF requested");
            std::process::abort();
        }
        Fault::PageFault {
            code,
            address: linear_address.get(),
        }
    }

    fn translate_address_slow_case(
        &mut self,
        linear_address: LinearAddress,
        access_type: MemoryAccessType,
        effective_cpl: Option<u8>,
    ) -> MemResult<PhysicalAddress> {
        let dir = linear_address.get() >> 22 & 0x3ff;
        let page = linear_address.get() >> 12 & 0x3ff;
        let offset = linear_address.get() & 0xfff;

        let pde_address = PhysicalAddress((self.cr3 & 0xffff_f000).wrapping_add(dir * 4));
        let mut pde = self.read_physical::<u32>(pde_address);
        let pte_address = PhysicalAddress((pde & 0xffff_f000).wrapping_add(page * 4));
        let mut pte = self.read_physical::<u32>(pte_address);

        let user_mode = match effective_cpl {
            Some(cpl) => cpl == 3,
            None => self.cpl() == 3,
        };

        if pde & PageTableEntryFlags::PRESENT.bits() == 0 {
            return Err(self.page_fault(
                linear_address,
                PageFaultFlags::empty(),
                access_type,
                user_mode,
                "PDE",
                pde,
                0,
            ));
        }
        if pte & PageTableEntryFlags::PRESENT.bits() == 0 {
            return Err(self.page_fault(
                linear_address,
                PageFaultFlags::empty(),
                access_type,
                user_mode,
                "PTE",
                pde,
                pte,
            ));
        }

        if user_mode {
            if pde & PageTableEntryFlags::USER_SUPERVISOR.bits() == 0 {
                return Err(self.page_fault(
                    linear_address,
                    PageFaultFlags::PROTECTION_VIOLATION,
                    access_type,
                    user_mode,
                    "PDE",
                    pde,
                    0,
                ));
            }
            if pte & PageTableEntryFlags::USER_SUPERVISOR.bits() == 0 {
                return Err(self.page_fault(
                    linear_address,
                    PageFaultFlags::PROTECTION_VIOLATION,
                    access_type,
                    user_mode,
                    "PTE",
                    pde,
                    pte,
                ));
            }
        }

        if (user_mode || self.cr0 & crate::processor::cr0::WP != 0)
            && access_type == MemoryAccessType::Write
        {
            if pde & PageTableEntryFlags::READ_WRITE.bits() == 0 {
                return Err(self.page_fault(
                    linear_address,
                    PageFaultFlags::PROTECTION_VIOLATION,
                    access_type,
                    user_mode,
                    "PDE",
                    pde,
                    0,
                ));
            }
            if pte & PageTableEntryFlags::READ_WRITE.bits() == 0 {
                return Err(self.page_fault(
                    linear_address,
                    PageFaultFlags::PROTECTION_VIOLATION,
                    access_type,
                    user_mode,
                    "PTE",
                    pde,
                    pte,
                ));
            }
        }

        if access_type == MemoryAccessType::Write {
            pte |= PageTableEntryFlags::DIRTY.bits();
        }
        pde |= PageTableEntryFlags::ACCESSED.bits();
        pte |= PageTableEntryFlags::ACCESSED.bits();
        self.write_physical(pde_address, pde);
        self.write_physical(pte_address, pte);

        let physical_address = PhysicalAddress((pte & 0xffff_f000) | offset);
        if self.options.log_page_translations {
            log::trace!(
                target: "cpu",
                "PG=1 translating {:#010x} {{dir={:03x}, page={:03x}, offset={:03x}}} => {:#010x}",
                linear_address.get(),
                dir,
                page,
                offset,
                physical_address.get()
            );
        }
        Ok(physical_address)
    }

    /// Touch a linear address so translation faults fire now instead of in
    /// the middle of a multi-part access.
    pub fn snoop(
        &mut self,
        linear_address: LinearAddress,
        access_type: MemoryAccessType,
    ) -> MemResult<()> {
        self.translate_address(linear_address, access_type, None)?;
        Ok(())
    }

    pub fn snoop_segment(
        &mut self,
        segment: SegmentRegister,
        offset: u32,
        access_type: MemoryAccessType,
    ) -> MemResult<()> {
        let descriptor = *self.cached_descriptor(segment);
        if self.pe() && !self.vm() {
            self.validate_address::<u8>(&descriptor, offset, access_type)?;
        }
        self.snoop(descriptor.linear_address(offset), access_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_follow_the_architectural_bit_layout() {
        assert_eq!(
            make_page_fault_code(PageFaultFlags::empty(), MemoryAccessType::Read, false),
            0b0000
        );
        assert_eq!(
            make_page_fault_code(
                PageFaultFlags::PROTECTION_VIOLATION,
                MemoryAccessType::Write,
                true
            ),
            0b0111
        );
        assert_eq!(
            make_page_fault_code(PageFaultFlags::empty(), MemoryAccessType::Execute, true),
            0b1100
        );
    }
}
