// The memory fabric. A flat byte array backs all of physical memory; the
// first megabyte is carved into fixed-size blocks, each of which may be
// claimed by a MemoryProvider (ROM, video aperture, ...). On top of that sits
// the segmented access pipeline the CPU uses: permission and limit checks
// against the cached descriptor, then paging, then the physical bus with A20
// folding. Accesses that straddle a page boundary are split into bytes so
// each part re-translates and may fault on its own.

use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::Path;
use std::rc::Rc;

use crate::conversions::{weld16, weld32, ValueWidth};
use crate::descriptors::SegmentDescriptor;
use crate::exceptions::MemResult;
use crate::fields::{
    LinearAddress, LogicalAddress, MemoryAccessType, PhysicalAddress, SegmentRegister, ValueSize,
};
use crate::parser::InstructionStream;
use crate::processor::Cpu;

pub const MEMORY_PROVIDER_BLOCK_SIZE: u32 = 16384;
const PROVIDER_SLOTS: usize = (1048576 / MEMORY_PROVIDER_BLOCK_SIZE) as usize;

pub type ProviderRef = Rc<RefCell<dyn MemoryProvider>>;

/// Something that claims a range of physical address space in the first
/// megabyte. The sized accessors default to the little-endian weld of byte
/// accesses; providers with wider registers override them.
pub trait MemoryProvider {
    fn base_address(&self) -> PhysicalAddress;
    fn size(&self) -> u32;

    fn read8(&mut self, address: u32) -> u8;
    fn write8(&mut self, address: u32, value: u8);

    fn read16(&mut self, address: u32) -> u16 {
        weld16(self.read8(address + 1), self.read8(address))
    }
    fn read32(&mut self, address: u32) -> u32 {
        weld32(self.read16(address + 2), self.read16(address))
    }
    fn write16(&mut self, address: u32, value: u16) {
        self.write8(address, value as u8);
        self.write8(address + 1, (value >> 8) as u8);
    }
    fn write32(&mut self, address: u32, value: u32) {
        self.write16(address, value as u16);
        self.write16(address + 2, (value >> 16) as u16);
    }

    /// A contiguous read-only view of the provider's backing buffer, when it
    /// has one, indexed from the provider's base address.
    fn direct_read_slice(&self) -> Option<&[u8]> {
        None
    }
}

/// A read-only image mapped at a fixed physical base.
pub struct Rom {
    base: PhysicalAddress,
    data: Vec<u8>,
}

impl Rom {
    pub fn from_file(base: PhysicalAddress, path: &Path) -> io::Result<Rom> {
        let data = fs::read(path)?;
        log::info!(target: "config", "ROM {} ({} bytes) at {:#010x}", path.display(), data.len(), base.get());
        Ok(Rom { base, data })
    }

    pub fn from_bytes(base: PhysicalAddress, data: Vec<u8>) -> Rom {
        Rom { base, data }
    }
}

impl MemoryProvider for Rom {
    fn base_address(&self) -> PhysicalAddress {
        self.base
    }
    fn size(&self) -> u32 {
        self.data.len() as u32
    }
    fn read8(&mut self, address: u32) -> u8 {
        self.data[(address - self.base.get()) as usize]
    }
    fn write8(&mut self, address: u32, value: u8) {
        log::debug!(target: "memory", "ROM write ignored: {:#010x} <- {:#04x}", address, value);
    }
    fn direct_read_slice(&self) -> Option<&[u8]> {
        Some(&self.data)
    }
}

/// Flat physical memory plus the provider block map for the first megabyte.
pub struct PhysicalMemory {
    data: Vec<u8>,
    providers: Vec<Option<ProviderRef>>,
}

impl PhysicalMemory {
    pub fn new(size: usize) -> PhysicalMemory {
        PhysicalMemory {
            data: vec![0; size],
            providers: vec![None; PROVIDER_SLOTS],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn resize(&mut self, size: usize) {
        if self.data.len() != size {
            self.data = vec![0; size];
        }
    }

    pub fn clear(&mut self) {
        for byte in self.data.iter_mut() {
            *byte = 0;
        }
    }

    /// Claim every block the provider's range covers. Ranges must stay inside
    /// the first megabyte.
    pub fn register_provider(&mut self, provider: ProviderRef) -> bool {
        let (base, size) = {
            let p = provider.borrow();
            (p.base_address().get(), p.size())
        };
        if base + size > 1048576 {
            log::error!(
                target: "config",
                "can't register memory provider with length {} at {:#010x}",
                size,
                base
            );
            return false;
        }
        for i in base / MEMORY_PROVIDER_BLOCK_SIZE..(base + size) / MEMORY_PROVIDER_BLOCK_SIZE {
            log::debug!(target: "config", "memory provider claims block {}", i);
            self.providers[i as usize] = Some(Rc::clone(&provider));
        }
        true
    }

    fn provider_for(&self, address: PhysicalAddress) -> Option<&ProviderRef> {
        if address.get() >= 1048576 {
            return None;
        }
        self.providers[(address.get() / MEMORY_PROVIDER_BLOCK_SIZE) as usize].as_ref()
    }

    pub fn read8(&mut self, address: PhysicalAddress) -> u8 {
        if address.get() as usize >= self.data.len() {
            log::debug!(target: "memory", "read outside physical memory: {:#010x}", address.get());
            return 0;
        }
        if let Some(provider) = self.provider_for(address).map(Rc::clone) {
            let mut provider = provider.borrow_mut();
            if let Some(slice) = provider.direct_read_slice() {
                let offset = (address.get() - provider.base_address().get()) as usize;
                if let Some(&byte) = slice.get(offset) {
                    return byte;
                }
            }
            return provider.read8(address.get());
        }
        self.data[address.get() as usize]
    }

    pub fn write8(&mut self, address: PhysicalAddress, value: u8) {
        if address.get() as usize >= self.data.len() {
            log::debug!(target: "memory", "write outside physical memory: {:#010x}", address.get());
            return;
        }
        if let Some(provider) = self.provider_for(address) {
            let provider = Rc::clone(provider);
            provider.borrow_mut().write8(address.get(), value);
            return;
        }
        self.data[address.get() as usize] = value;
    }

    pub fn read16(&mut self, address: PhysicalAddress) -> u16 {
        if self.provider_for(address).is_none() && (address.get() as usize + 1) < self.data.len() {
            let at = address.get() as usize;
            return u16::from_le_bytes([self.data[at], self.data[at + 1]]);
        }
        weld16(self.read8(address.offset(1)), self.read8(address))
    }

    pub fn read32(&mut self, address: PhysicalAddress) -> u32 {
        if self.provider_for(address).is_none() && (address.get() as usize + 3) < self.data.len() {
            let at = address.get() as usize;
            return u32::from_le_bytes([
                self.data[at],
                self.data[at + 1],
                self.data[at + 2],
                self.data[at + 3],
            ]);
        }
        weld32(self.read16(address.offset(2)), self.read16(address))
    }

    pub fn write16(&mut self, address: PhysicalAddress, value: u16) {
        self.write8(address, value as u8);
        self.write8(address.offset(1), (value >> 8) as u8);
    }

    pub fn write32(&mut self, address: PhysicalAddress, value: u32) {
        self.write16(address, value as u16);
        self.write16(address.offset(2), (value >> 16) as u16);
    }
}

impl Cpu {
    pub fn register_memory_provider(&mut self, provider: ProviderRef) -> bool {
        self.memory.register_provider(provider)
    }

    pub fn read_physical<T: ValueWidth>(&mut self, address: PhysicalAddress) -> T {
        match T::SIZE {
            ValueSize::Byte => T::from_u32(self.memory.read8(address) as u32),
            ValueSize::Word => T::from_u32(self.memory.read16(address) as u32),
            ValueSize::DWord => T::from_u32(self.memory.read32(address)),
        }
    }

    pub fn write_physical<T: ValueWidth>(&mut self, address: PhysicalAddress, value: T) {
        match T::SIZE {
            ValueSize::Byte => self.memory.write8(address, value.to_u32() as u8),
            ValueSize::Word => self.memory.write16(address, value.to_u32() as u16),
            ValueSize::DWord => self.memory.write32(address, value.to_u32()),
        }
    }

    /// Segmentation checks against a cached descriptor: null selectors,
    /// read/write permission, and the effective limit. Stack-relative
    /// violations raise #SS instead of #GP.
    pub fn validate_address<T: ValueWidth>(
        &mut self,
        descriptor: &SegmentDescriptor,
        offset: u32,
        access_type: MemoryAccessType,
    ) -> MemResult<()> {
        if !self.vm() {
            if access_type != MemoryAccessType::Execute && descriptor.null {
                log::debug!(
                    target: "cpu",
                    "{:?} offset {:#010x} through null selector",
                    access_type,
                    offset
                );
                if descriptor.loaded_in_ss {
                    return Err(self.stack_fault(0, "access through null selector"));
                }
                return Err(self.general_protection_fault(0, "access through null selector"));
            }

            match access_type {
                MemoryAccessType::Read => {
                    if descriptor.is_code() && !descriptor.readable() {
                        return Err(self
                            .general_protection_fault(0, "read from non-readable code segment"));
                    }
                }
                MemoryAccessType::Write => {
                    if !descriptor.is_data() {
                        if descriptor.loaded_in_ss {
                            return Err(self.stack_fault(0, "write to non-data segment"));
                        }
                        return Err(
                            self.general_protection_fault(0, "write to non-data segment")
                        );
                    }
                    if !descriptor.writable() {
                        if descriptor.loaded_in_ss {
                            return Err(self.stack_fault(0, "write to non-writable data segment"));
                        }
                        return Err(self
                            .general_protection_fault(0, "write to non-writable data segment"));
                    }
                }
                MemoryAccessType::Execute | MemoryAccessType::InternalPointer => {}
            }
        }

        if offset.wrapping_add(T::BITS / 8 - 1) > descriptor.effective_limit {
            log::debug!(
                target: "cpu",
                "{}-bit {:?} offset {:#010x} outside limit (selector index {:#06x}, effective limit {:#010x})",
                T::BITS,
                access_type,
                offset,
                descriptor.index,
                descriptor.effective_limit
            );
            if descriptor.loaded_in_ss {
                return Err(self.stack_fault(0, "access outside segment limit"));
            }
            return Err(self.general_protection_fault(0, "access outside segment limit"));
        }
        Ok(())
    }

    pub fn read_linear<T: ValueWidth>(
        &mut self,
        linear_address: LinearAddress,
        access_type: MemoryAccessType,
        effective_cpl: Option<u8>,
    ) -> MemResult<T> {
        if T::BITS > 8 && self.pg() {
            let first_page = linear_address.get() & 0xffff_f000;
            let last_page = linear_address.get().wrapping_add(T::BITS / 8 - 1) & 0xffff_f000;
            if first_page != last_page {
                let mut value = 0u64;
                for i in 0..T::BITS / 8 {
                    let byte: u8 =
                        self.read_linear(linear_address.offset(i), access_type, effective_cpl)?;
                    value |= (byte as u64) << (8 * i);
                }
                return Ok(T::from_u64(value));
            }
        }

        let physical_address = self
            .translate_address(linear_address, access_type, effective_cpl)?
            .mask(self.a20_mask());
        let value = self.read_physical::<T>(physical_address);
        if self.options.memdebug {
            log::trace!(
                target: "memory",
                "{}-bit read [A20={}] {:#010x}, value: {:#x}",
                T::BITS,
                if self.is_a20_enabled() { "on" } else { "off" },
                physical_address.get(),
                value
            );
        }
        Ok(value)
    }

    pub fn write_linear<T: ValueWidth>(
        &mut self,
        linear_address: LinearAddress,
        value: T,
        effective_cpl: Option<u8>,
    ) -> MemResult<()> {
        if T::BITS > 8 && self.pg() {
            let first_page = linear_address.get() & 0xffff_f000;
            let last_page = linear_address.get().wrapping_add(T::BITS / 8 - 1) & 0xffff_f000;
            if first_page != last_page {
                for i in 0..T::BITS / 8 {
                    let byte = (value.to_u64() >> (8 * i)) as u8;
                    self.write_linear(linear_address.offset(i), byte, effective_cpl)?;
                }
                return Ok(());
            }
        }

        let physical_address = self
            .translate_address(linear_address, MemoryAccessType::Write, effective_cpl)?
            .mask(self.a20_mask());
        if self.options.memdebug {
            log::trace!(
                target: "memory",
                "{}-bit write [A20={}] {:#010x}, value: {:#x}",
                T::BITS,
                if self.is_a20_enabled() { "on" } else { "off" },
                physical_address.get(),
                value
            );
        }
        self.write_physical(physical_address, value);
        Ok(())
    }

    pub fn read_memory_via<T: ValueWidth>(
        &mut self,
        descriptor: &SegmentDescriptor,
        offset: u32,
        access_type: MemoryAccessType,
    ) -> MemResult<T> {
        if self.pe() && !self.vm() {
            self.validate_address::<T>(descriptor, offset, access_type)?;
        }
        self.read_linear(descriptor.linear_address(offset), access_type, None)
    }

    pub fn write_memory_via<T: ValueWidth>(
        &mut self,
        descriptor: &SegmentDescriptor,
        offset: u32,
        value: T,
    ) -> MemResult<()> {
        if self.pe() && !self.vm() {
            self.validate_address::<T>(descriptor, offset, MemoryAccessType::Write)?;
        }
        self.write_linear(descriptor.linear_address(offset), value, None)
    }

    pub fn read_memory<T: ValueWidth>(
        &mut self,
        segment: SegmentRegister,
        offset: u32,
        access_type: MemoryAccessType,
    ) -> MemResult<T> {
        let descriptor = *self.cached_descriptor(segment);
        self.read_memory_via(&descriptor, offset, access_type)
    }

    pub fn write_memory<T: ValueWidth>(
        &mut self,
        segment: SegmentRegister,
        offset: u32,
        value: T,
    ) -> MemResult<()> {
        let descriptor = *self.cached_descriptor(segment);
        self.write_memory_via(&descriptor, offset, value)
    }

    pub fn read_memory8(&mut self, segment: SegmentRegister, offset: u32) -> MemResult<u8> {
        self.read_memory(segment, offset, MemoryAccessType::Read)
    }
    pub fn read_memory16(&mut self, segment: SegmentRegister, offset: u32) -> MemResult<u16> {
        self.read_memory(segment, offset, MemoryAccessType::Read)
    }
    pub fn read_memory32(&mut self, segment: SegmentRegister, offset: u32) -> MemResult<u32> {
        self.read_memory(segment, offset, MemoryAccessType::Read)
    }
    pub fn write_memory8(
        &mut self,
        segment: SegmentRegister,
        offset: u32,
        value: u8,
    ) -> MemResult<()> {
        self.write_memory(segment, offset, value)
    }
    pub fn write_memory16(
        &mut self,
        segment: SegmentRegister,
        offset: u32,
        value: u16,
    ) -> MemResult<()> {
        self.write_memory(segment, offset, value)
    }
    pub fn write_memory32(
        &mut self,
        segment: SegmentRegister,
        offset: u32,
        value: u32,
    ) -> MemResult<()> {
        self.write_memory(segment, offset, value)
    }

    pub fn read_linear8(&mut self, address: LinearAddress) -> MemResult<u8> {
        self.read_linear(address, MemoryAccessType::Read, None)
    }
    pub fn read_linear16(&mut self, address: LinearAddress) -> MemResult<u16> {
        self.read_linear(address, MemoryAccessType::Read, None)
    }
    pub fn read_linear32(&mut self, address: LinearAddress) -> MemResult<u32> {
        self.read_linear(address, MemoryAccessType::Read, None)
    }
    pub fn write_linear8(&mut self, address: LinearAddress, value: u8) -> MemResult<()> {
        self.write_linear(address, value, None)
    }

    /// Supervisor ("metal") accessors for descriptor tables and TSS images:
    /// the walk runs with an effective CPL of 0 so system structures stay
    /// reachable from ring 3.
    pub fn read_metal16(&mut self, address: LinearAddress) -> MemResult<u16> {
        self.read_linear(address, MemoryAccessType::Read, Some(0))
    }
    pub fn read_metal32(&mut self, address: LinearAddress) -> MemResult<u32> {
        self.read_linear(address, MemoryAccessType::Read, Some(0))
    }
    pub fn write_metal16(&mut self, address: LinearAddress, value: u16) -> MemResult<()> {
        self.write_linear(address, value, Some(0))
    }
    pub fn write_metal32(&mut self, address: LinearAddress, value: u32) -> MemResult<()> {
        self.write_linear(address, value, Some(0))
    }

    /// Read an offset:selector pair as used by LDS/LES/far JMP/CALL memory
    /// operands.
    pub fn read_logical_address<T: ValueWidth>(
        &mut self,
        segment: SegmentRegister,
        offset: u32,
    ) -> MemResult<LogicalAddress> {
        let target_offset: T = self.read_memory(segment, offset, MemoryAccessType::Read)?;
        let selector = self.read_memory16(segment, offset.wrapping_add(T::BITS / 8))?;
        Ok(LogicalAddress::new(selector, target_offset.to_u32()))
    }

    fn read_instruction_stream<T: ValueWidth>(&mut self) -> MemResult<T> {
        let offset = self.current_instruction_pointer();
        let data: T = self.read_memory(SegmentRegister::Cs, offset, MemoryAccessType::Execute)?;
        self.adjust_instruction_pointer(T::BITS / 8);
        Ok(data)
    }
}

impl InstructionStream for Cpu {
    fn read_instruction8(&mut self) -> MemResult<u8> {
        self.read_instruction_stream()
    }
    fn read_instruction16(&mut self) -> MemResult<u16> {
        self.read_instruction_stream()
    }
    fn read_instruction32(&mut self) -> MemResult<u32> {
        self.read_instruction_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_memory_is_little_endian() {
        let mut memory = PhysicalMemory::new(0x1000);
        memory.write32(PhysicalAddress(0x10), 0x1234_5678);
        assert_eq!(memory.read8(PhysicalAddress(0x10)), 0x78);
        assert_eq!(memory.read8(PhysicalAddress(0x13)), 0x12);
        assert_eq!(memory.read16(PhysicalAddress(0x12)), 0x1234);
        assert_eq!(memory.read32(PhysicalAddress(0x10)), 0x1234_5678);
    }

    #[test]
    fn out_of_range_reads_are_harmless() {
        let mut memory = PhysicalMemory::new(0x100);
        assert_eq!(memory.read8(PhysicalAddress(0x200)), 0);
        memory.write8(PhysicalAddress(0x200), 0xaa);
    }

    #[test]
    fn rom_claims_its_blocks_and_rejects_writes() {
        let mut memory = PhysicalMemory::new(1048576);
        let data = vec![0xcd; MEMORY_PROVIDER_BLOCK_SIZE as usize];
        let rom = Rc::new(RefCell::new(Rom::from_bytes(
            PhysicalAddress(0xc0000),
            data,
        )));
        assert!(memory.register_provider(rom));
        assert_eq!(memory.read8(PhysicalAddress(0xc0001)), 0xcd);
        memory.write8(PhysicalAddress(0xc0001), 0x00);
        assert_eq!(memory.read8(PhysicalAddress(0xc0001)), 0xcd);
        // Unclaimed space still hits the flat store.
        memory.write8(PhysicalAddress(0x1234), 0x55);
        assert_eq!(memory.read8(PhysicalAddress(0x1234)), 0x55);
    }

    #[test]
    fn providers_outside_first_megabyte_are_rejected() {
        let mut memory = PhysicalMemory::new(2 * 1048576);
        let rom = Rc::new(RefCell::new(Rom::from_bytes(
            PhysicalAddress(0xff000),
            vec![0; 0x2000],
        )));
        assert!(!memory.register_provider(rom));
    }
}
