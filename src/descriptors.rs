// The descriptor model: what the 8-byte GDT/LDT/IDT entries decode into, the
// cached per-segment-register form, and the table walker. The raw 32-bit
// halves ride along so a TSS busy-bit flip can be written straight back into
// the GDT.

use crate::exceptions::MemResult;
use crate::fields::{LinearAddress, LogicalAddress, SegmentRegister, ValueSize};
use crate::processor::Cpu;

pub mod system_type {
    pub const AVAILABLE_TSS_16BIT: u8 = 0x1;
    pub const LDT: u8 = 0x2;
    pub const BUSY_TSS_16BIT: u8 = 0x3;
    pub const CALL_GATE_16BIT: u8 = 0x4;
    pub const TASK_GATE: u8 = 0x5;
    pub const INTERRUPT_GATE_16BIT: u8 = 0x6;
    pub const TRAP_GATE_16BIT: u8 = 0x7;
    pub const AVAILABLE_TSS_32BIT: u8 = 0x9;
    pub const BUSY_TSS_32BIT: u8 = 0xb;
    pub const CALL_GATE_32BIT: u8 = 0xc;
    pub const INTERRUPT_GATE_32BIT: u8 = 0xe;
    pub const TRAP_GATE_32BIT: u8 = 0xf;
}

/// One of GDTR, IDTR or LDTR. The limit is stored exactly as loaded; LDTR
/// additionally remembers the selector it was loaded from.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorTableRegister {
    pub name: &'static str,
    pub base: LinearAddress,
    pub limit: u16,
    pub selector: u16,
}

impl DescriptorTableRegister {
    pub fn new(name: &'static str) -> DescriptorTableRegister {
        DescriptorTableRegister {
            name,
            base: LinearAddress(0),
            limit: 0xffff,
            selector: 0,
        }
    }

    pub fn clear(&mut self) {
        self.base = LinearAddress(0);
        self.limit = 0xffff;
        self.selector = 0;
    }
}

/// The cached form living behind each segment register, also used for the
/// synthetic real-mode / VM86 shadows. `rpl` doubles as the CPL mirror when
/// this cache entry belongs to CS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentDescriptor {
    pub base: u32,
    pub limit: u32,
    pub effective_limit: u32,
    pub index: u16,
    pub type_code: u8,
    pub dpl: u8,
    pub rpl: u8,
    pub present: bool,
    pub d: bool,
    pub granularity: bool,
    pub avl: bool,
    pub null: bool,
    pub loaded_in_ss: bool,
}

impl SegmentDescriptor {
    pub fn null_descriptor() -> SegmentDescriptor {
        SegmentDescriptor {
            null: true,
            ..SegmentDescriptor::default()
        }
    }

    pub fn is_code(&self) -> bool {
        !self.null && self.type_code & 0x8 != 0
    }
    pub fn is_data(&self) -> bool {
        !self.null && self.type_code & 0x8 == 0
    }
    pub fn accessed(&self) -> bool {
        self.type_code & 0x1 != 0
    }
    pub fn conforming(&self) -> bool {
        self.is_code() && self.type_code & 0x4 != 0
    }
    pub fn expand_down(&self) -> bool {
        self.is_data() && self.type_code & 0x4 != 0
    }
    pub fn readable(&self) -> bool {
        if self.is_code() {
            self.type_code & 0x2 != 0
        } else {
            true
        }
    }
    pub fn writable(&self) -> bool {
        if self.is_data() {
            self.type_code & 0x2 != 0
        } else {
            false
        }
    }
    pub fn is_32bit(&self) -> bool {
        self.d
    }
    pub fn linear_address(&self, offset: u32) -> LinearAddress {
        LinearAddress(self.base.wrapping_add(offset))
    }
}

/// A call, task, interrupt or trap gate.
#[derive(Debug, Clone, Copy)]
pub struct Gate {
    pub type_code: u8,
    pub selector: u16,
    pub offset: u32,
    pub parameter_count: u8,
}

impl Gate {
    pub fn entry(&self) -> LogicalAddress {
        LogicalAddress::new(self.selector, self.offset)
    }
    pub fn is_call_gate(&self) -> bool {
        matches!(
            self.type_code,
            system_type::CALL_GATE_16BIT | system_type::CALL_GATE_32BIT
        )
    }
    pub fn is_task_gate(&self) -> bool {
        self.type_code == system_type::TASK_GATE
    }
    pub fn is_interrupt_gate(&self) -> bool {
        matches!(
            self.type_code,
            system_type::INTERRUPT_GATE_16BIT | system_type::INTERRUPT_GATE_32BIT
        )
    }
    pub fn is_trap_gate(&self) -> bool {
        matches!(
            self.type_code,
            system_type::TRAP_GATE_16BIT | system_type::TRAP_GATE_32BIT
        )
    }
    pub fn is_32bit(&self) -> bool {
        matches!(
            self.type_code,
            system_type::CALL_GATE_32BIT
                | system_type::INTERRUPT_GATE_32BIT
                | system_type::TRAP_GATE_32BIT
        )
    }
    pub fn size(&self) -> ValueSize {
        if self.is_32bit() {
            ValueSize::DWord
        } else {
            ValueSize::Word
        }
    }
}

/// A TSS descriptor. Uses segment base+limit despite being a system
/// descriptor.
#[derive(Debug, Clone, Copy)]
pub struct TssDescriptor {
    pub type_code: u8,
    pub base: LinearAddress,
    pub limit: u32,
    pub effective_limit: u32,
}

impl TssDescriptor {
    pub fn is_available(&self) -> bool {
        matches!(
            self.type_code,
            system_type::AVAILABLE_TSS_16BIT | system_type::AVAILABLE_TSS_32BIT
        )
    }
    pub fn is_busy(&self) -> bool {
        matches!(
            self.type_code,
            system_type::BUSY_TSS_16BIT | system_type::BUSY_TSS_32BIT
        )
    }
    pub fn is_32bit(&self) -> bool {
        matches!(
            self.type_code,
            system_type::AVAILABLE_TSS_32BIT | system_type::BUSY_TSS_32BIT
        )
    }
}

/// An LDT descriptor. Also carries segment base+limit.
#[derive(Debug, Clone, Copy)]
pub struct SystemSegment {
    pub base: LinearAddress,
    pub limit: u32,
    pub effective_limit: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum DescriptorKind {
    Null,
    OutsideTableLimits,
    Segment(SegmentDescriptor),
    Gate(Gate),
    Tss(TssDescriptor),
    Ldt(SystemSegment),
    Reserved,
}

/// What a descriptor-table lookup produced: the decoded view plus the raw
/// halves and the lookup metadata (selector, table, RPL).
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub kind: DescriptorKind,
    pub raw_high: u32,
    pub raw_low: u32,
    pub dpl: u8,
    pub present: bool,
    pub type_code: u8,
    pub d: bool,
    pub avl: bool,
    pub granularity: bool,
    /// Selector (or vector) that found this descriptor.
    pub index: u16,
    /// Byte offset of the entry within its table.
    pub table_offset: u32,
    pub global: bool,
    pub rpl: u8,
}

impl Descriptor {
    fn error(kind: DescriptorKind, index: u16) -> Descriptor {
        Descriptor {
            kind,
            raw_high: 0,
            raw_low: 0,
            dpl: 0,
            present: false,
            type_code: 0,
            d: false,
            avl: false,
            granularity: false,
            index,
            table_offset: 0,
            global: false,
            rpl: 0,
        }
    }

    pub fn null_descriptor(index: u16) -> Descriptor {
        Descriptor::error(DescriptorKind::Null, index)
    }

    pub fn outside_table_limits(index: u16) -> Descriptor {
        Descriptor::error(DescriptorKind::OutsideTableLimits, index)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, DescriptorKind::Null)
    }
    pub fn is_outside_table_limits(&self) -> bool {
        matches!(self.kind, DescriptorKind::OutsideTableLimits)
    }
    pub fn is_segment(&self) -> bool {
        matches!(self.kind, DescriptorKind::Segment(_))
    }
    pub fn is_system(&self) -> bool {
        !self.is_segment() && !self.is_null() && !self.is_outside_table_limits()
    }
    pub fn is_code(&self) -> bool {
        matches!(self.kind, DescriptorKind::Segment(ref s) if s.is_code())
    }
    pub fn is_data(&self) -> bool {
        matches!(self.kind, DescriptorKind::Segment(ref s) if s.is_data())
    }
    pub fn is_conforming_code(&self) -> bool {
        matches!(self.kind, DescriptorKind::Segment(ref s) if s.conforming())
    }
    pub fn is_nonconforming_code(&self) -> bool {
        self.is_code() && !self.is_conforming_code()
    }
    pub fn is_gate(&self) -> bool {
        matches!(self.kind, DescriptorKind::Gate(_))
    }
    pub fn is_call_gate(&self) -> bool {
        matches!(self.kind, DescriptorKind::Gate(ref g) if g.is_call_gate())
    }
    pub fn is_task_gate(&self) -> bool {
        matches!(self.kind, DescriptorKind::Gate(ref g) if g.is_task_gate())
    }
    pub fn is_interrupt_gate(&self) -> bool {
        matches!(self.kind, DescriptorKind::Gate(ref g) if g.is_interrupt_gate())
    }
    pub fn is_trap_gate(&self) -> bool {
        matches!(self.kind, DescriptorKind::Gate(ref g) if g.is_trap_gate())
    }
    pub fn is_tss(&self) -> bool {
        matches!(self.kind, DescriptorKind::Tss(_))
    }
    pub fn is_ldt(&self) -> bool {
        matches!(self.kind, DescriptorKind::Ldt(_))
    }

    pub fn as_segment(&self) -> SegmentDescriptor {
        match self.kind {
            DescriptorKind::Segment(segment) => segment,
            DescriptorKind::Null => SegmentDescriptor::null_descriptor(),
            _ => panic!("as_segment on non-segment descriptor"),
        }
    }
    pub fn as_gate(&self) -> Gate {
        match self.kind {
            DescriptorKind::Gate(gate) => gate,
            _ => panic!("as_gate on non-gate descriptor"),
        }
    }
    pub fn as_tss(&self) -> TssDescriptor {
        match self.kind {
            DescriptorKind::Tss(tss) => tss,
            _ => panic!("as_tss on non-TSS descriptor"),
        }
    }
    pub fn as_ldt(&self) -> SystemSegment {
        match self.kind {
            DescriptorKind::Ldt(ldt) => ldt,
            _ => panic!("as_ldt on non-LDT descriptor"),
        }
    }

    /// Flip an available TSS descriptor to busy, in the view and in the raw
    /// form that gets written back to the GDT.
    pub fn set_tss_busy(&mut self) {
        self.type_code |= 2;
        self.raw_high |= 0x200;
        if let DescriptorKind::Tss(ref mut tss) = self.kind {
            tss.type_code |= 2;
        }
    }

    pub fn set_tss_available(&mut self) {
        self.type_code &= !2;
        self.raw_high &= !0x200;
        if let DescriptorKind::Tss(ref mut tss) = self.kind {
            tss.type_code &= !2;
        }
    }

    /// The effective limit of whatever the descriptor describes, for LSL.
    pub fn effective_limit(&self) -> u32 {
        match self.kind {
            DescriptorKind::Segment(ref s) => s.effective_limit,
            DescriptorKind::Tss(ref t) => t.effective_limit,
            DescriptorKind::Ldt(ref l) => l.effective_limit,
            _ => 0,
        }
    }
}

/// Decode the raw 8 bytes of a table entry.
fn decode_descriptor(descriptor: &mut Descriptor, hi: u32, lo: u32) {
    descriptor.granularity = hi >> 23 & 1 != 0;
    descriptor.d = hi >> 22 & 1 != 0;
    descriptor.avl = hi >> 20 & 1 != 0;
    descriptor.present = hi >> 15 & 1 != 0;
    descriptor.dpl = (hi >> 13 & 3) as u8;
    let is_segment = hi >> 12 & 1 != 0;
    descriptor.type_code = (hi >> 8 & 0xf) as u8;
    descriptor.raw_high = hi;
    descriptor.raw_low = lo;

    let segment_base = (hi & 0xff00_0000) | ((hi & 0xff) << 16) | (lo >> 16 & 0xffff);
    let segment_limit = (hi & 0xf_0000) | (lo & 0xffff);
    let effective_limit = if descriptor.granularity {
        segment_limit << 12 | 0xfff
    } else {
        segment_limit
    };

    if is_segment {
        descriptor.kind = DescriptorKind::Segment(SegmentDescriptor {
            base: segment_base,
            limit: segment_limit,
            effective_limit,
            index: descriptor.index,
            type_code: descriptor.type_code,
            dpl: descriptor.dpl,
            rpl: descriptor.rpl,
            present: descriptor.present,
            d: descriptor.d,
            granularity: descriptor.granularity,
            avl: descriptor.avl,
            null: false,
            loaded_in_ss: false,
        });
        return;
    }

    descriptor.kind = match descriptor.type_code {
        system_type::AVAILABLE_TSS_16BIT
        | system_type::BUSY_TSS_16BIT
        | system_type::AVAILABLE_TSS_32BIT
        | system_type::BUSY_TSS_32BIT => DescriptorKind::Tss(TssDescriptor {
            type_code: descriptor.type_code,
            base: LinearAddress(segment_base),
            limit: segment_limit,
            effective_limit,
        }),
        system_type::LDT => DescriptorKind::Ldt(SystemSegment {
            base: LinearAddress(segment_base),
            limit: segment_limit,
            effective_limit,
        }),
        system_type::CALL_GATE_16BIT
        | system_type::TASK_GATE
        | system_type::INTERRUPT_GATE_16BIT
        | system_type::TRAP_GATE_16BIT
        | system_type::CALL_GATE_32BIT
        | system_type::INTERRUPT_GATE_32BIT
        | system_type::TRAP_GATE_32BIT => {
            let gate = Gate {
                type_code: descriptor.type_code,
                selector: (lo >> 16) as u16,
                offset: (hi & 0xffff_0000) | (lo & 0xffff),
                parameter_count: (hi & 0x1f) as u8,
            };
            descriptor.d = gate.is_32bit();
            DescriptorKind::Gate(gate)
        }
        _ => DescriptorKind::Reserved,
    };
}

impl Cpu {
    /// Synthesize the descriptor real mode and VM86 use for every segment
    /// register: base = selector<<4, 64K limit, writable data (readable code
    /// for CS).
    pub fn real_mode_or_vm86_descriptor(
        &self,
        selector: u16,
        segment_register: Option<SegmentRegister>,
    ) -> SegmentDescriptor {
        let type_code = if segment_register == Some(SegmentRegister::Cs) {
            0x8 | 0x2
        } else {
            0x2
        };
        SegmentDescriptor {
            base: (selector as u32) << 4,
            limit: 0xffff,
            effective_limit: 0xffff,
            index: selector,
            type_code,
            dpl: 0,
            rpl: 0,
            present: true,
            d: false,
            granularity: false,
            avl: false,
            null: false,
            loaded_in_ss: false,
        }
    }

    /// Look a selector up in the GDT or LDT.
    pub fn get_descriptor(&mut self, selector: u16) -> MemResult<Descriptor> {
        if selector & 0xfffc == 0 {
            return Ok(Descriptor::null_descriptor(selector));
        }
        let table = if selector & 0x04 == 0 {
            self.gdtr
        } else {
            self.ldtr
        };
        self.descriptor_from_table(&table, selector, true)
    }

    /// Look an interrupt vector up in the IDT.
    pub fn get_interrupt_descriptor(&mut self, vector: u8) -> MemResult<Descriptor> {
        debug_assert!(self.pe());
        let table = self.idtr;
        self.descriptor_from_table(&table, vector as u16, false)
    }

    /// Segment-descriptor lookup that falls back to the real-mode shadow.
    pub fn get_segment_descriptor(&mut self, selector: u16) -> MemResult<SegmentDescriptor> {
        if !self.pe() || self.vm() {
            return Ok(self.real_mode_or_vm86_descriptor(selector, None));
        }
        let descriptor = self.get_descriptor(selector)?;
        if descriptor.is_null() {
            return Ok(SegmentDescriptor::null_descriptor());
        }
        Ok(descriptor.as_segment())
    }

    pub fn descriptor_from_table(
        &mut self,
        table: &DescriptorTableRegister,
        index: u16,
        index_is_selector: bool,
    ) -> MemResult<Descriptor> {
        if index_is_selector && index & 0xfffc == 0 {
            return Ok(Descriptor::null_descriptor(index));
        }

        let mut descriptor = Descriptor::null_descriptor(index);
        let table_offset;
        if index_is_selector {
            descriptor.global = index & 0x04 == 0;
            descriptor.rpl = (index & 3) as u8;
            table_offset = (index & 0xfff8) as u32;
        } else {
            table_offset = index as u32 * 8;
        }
        descriptor.table_offset = table_offset;

        if table_offset >= table.limit as u32 {
            log::debug!(
                target: "cpu",
                "selector {:#06x} >= {}.limit ({:#06x})",
                index,
                table.name,
                table.limit
            );
            let mut out = Descriptor::outside_table_limits(index);
            out.global = descriptor.global;
            out.rpl = descriptor.rpl;
            return Ok(out);
        }

        let hi = self.read_metal32(table.base.offset(table_offset + 4))?;
        let lo = self.read_metal32(table.base.offset(table_offset))?;
        decode_descriptor(&mut descriptor, hi, lo);
        Ok(descriptor)
    }

    /// Write the raw halves back into the GDT, used for TSS busy-bit flips.
    pub fn write_to_gdt(&mut self, descriptor: &Descriptor) -> MemResult<()> {
        debug_assert!(descriptor.global);
        let base = self.gdtr.base;
        self.write_metal32(base.offset(descriptor.table_offset + 4), descriptor.raw_high)?;
        self.write_metal32(base.offset(descriptor.table_offset), descriptor.raw_low)?;
        Ok(())
    }

    pub fn fetch_real_mode_interrupt_vector(&mut self, vector: u8) -> LogicalAddress {
        let selector = self.read_physical::<u16>(crate::fields::PhysicalAddress(
            vector as u32 * 4 + 2,
        ));
        let offset = self.read_physical::<u16>(crate::fields::PhysicalAddress(vector as u32 * 4));
        LogicalAddress::new(selector, offset as u32)
    }
}

/// Build the raw 8 bytes of a segment descriptor; test and boot-image helper.
pub fn raw_segment_descriptor(
    base: u32,
    limit: u32,
    type_code: u8,
    is_segment: bool,
    dpl: u8,
    present: bool,
    d: bool,
    granularity: bool,
) -> (u32, u32) {
    let lo = (limit & 0xffff) | (base & 0xffff) << 16;
    let hi = (base >> 16 & 0xff)
        | (type_code as u32 & 0xf) << 8
        | (is_segment as u32) << 12
        | (dpl as u32 & 3) << 13
        | (present as u32) << 15
        | (limit & 0xf_0000)
        | (d as u32) << 22
        | (granularity as u32) << 23
        | (base & 0xff00_0000);
    (hi, lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_descriptor_round_trips() {
        let (hi, lo) = raw_segment_descriptor(0x0012_3456, 0xabcd, 0xb, true, 3, true, true, false);
        let mut descriptor = Descriptor::null_descriptor(0x08);
        decode_descriptor(&mut descriptor, hi, lo);
        let segment = descriptor.as_segment();
        assert_eq!(segment.base, 0x0012_3456);
        assert_eq!(segment.limit, 0xabcd);
        assert_eq!(segment.effective_limit, 0xabcd);
        assert_eq!(segment.dpl, 3);
        assert!(segment.present);
        assert!(segment.is_code());
        assert!(segment.is_32bit());
    }

    #[test]
    fn granularity_expands_the_limit() {
        let (hi, lo) = raw_segment_descriptor(0, 0xf_ffff, 0x3, true, 0, true, true, true);
        let mut descriptor = Descriptor::null_descriptor(0x10);
        decode_descriptor(&mut descriptor, hi, lo);
        assert_eq!(descriptor.as_segment().effective_limit, 0xffff_ffff);
    }

    #[test]
    fn gates_split_their_offset() {
        let mut descriptor = Descriptor::null_descriptor(0);
        // Interrupt gate, selector 0x0008, offset 0x1234_5678, present, DPL 3.
        let lo = 0x0008_5678;
        let hi = 0x1234_0000 | 1 << 15 | 3 << 13 | (system_type::INTERRUPT_GATE_32BIT as u32) << 8;
        decode_descriptor(&mut descriptor, hi, lo);
        let gate = descriptor.as_gate();
        assert!(gate.is_interrupt_gate());
        assert!(gate.is_32bit());
        assert_eq!(gate.selector, 0x0008);
        assert_eq!(gate.offset, 0x1234_5678);
        assert_eq!(descriptor.dpl, 3);
    }

    #[test]
    fn tss_busy_flip_touches_the_raw_half() {
        let (hi, lo) = raw_segment_descriptor(
            0x1000,
            0x67,
            system_type::AVAILABLE_TSS_32BIT,
            false,
            0,
            true,
            false,
            false,
        );
        let mut descriptor = Descriptor::null_descriptor(0x18);
        decode_descriptor(&mut descriptor, hi, lo);
        assert!(descriptor.as_tss().is_available());
        descriptor.set_tss_busy();
        assert!(descriptor.as_tss().is_busy());
        assert_eq!(descriptor.raw_high & 0x200, 0x200);
        descriptor.set_tss_available();
        assert!(descriptor.as_tss().is_available());
    }
}
