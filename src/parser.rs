// This is where the dirty grunt work of making sense of our binary input
// happens: prefix bytes, the one- and two-byte opcode tables (one pair per
// default operand size), slash groups indexed by the ModR/M /reg field, and
// ModR/M + SIB + displacement + immediate consumption. Decoding pulls bytes
// through the CPU's own instruction stream, so a fetch can page-fault like
// any other memory access.

use std::sync::OnceLock;

use crate::conversions::{sign_extended, ValueWidth};
use crate::exceptions::{ExecResult, MemResult};
use crate::fields::{LogicalAddress, SegmentRegister};
use crate::processor::Cpu;

pub type Handler = fn(&mut Cpu, &mut Instruction) -> ExecResult;

pub mod prefix {
    pub const OPERAND_SIZE_OVERRIDE: u8 = 0x66;
    pub const ADDRESS_SIZE_OVERRIDE: u8 = 0x67;
    pub const REP: u8 = 0xf3;
    pub const REPZ: u8 = 0xf3;
    pub const REPNZ: u8 = 0xf2;
    pub const LOCK: u8 = 0xf0;
}

/// The decoder's byte source. The CPU implements this by fetching through
/// CS:EIP with Execute access; tests use [`SimpleInstructionStream`].
pub trait InstructionStream {
    fn read_instruction8(&mut self) -> MemResult<u8>;
    fn read_instruction16(&mut self) -> MemResult<u16>;
    fn read_instruction32(&mut self) -> MemResult<u32>;

    fn read_bytes(&mut self, count: u32) -> MemResult<u32> {
        match count {
            1 => Ok(self.read_instruction8()? as u32),
            2 => Ok(self.read_instruction16()? as u32),
            _ => self.read_instruction32(),
        }
    }
}

/// A flat byte-slice stream for decoder tests and tooling.
pub struct SimpleInstructionStream<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> SimpleInstructionStream<'a> {
    pub fn new(data: &'a [u8]) -> SimpleInstructionStream<'a> {
        SimpleInstructionStream { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn next(&mut self) -> MemResult<u8> {
        let byte = self.data.get(self.position).copied().ok_or_else(|| {
            crate::exceptions::Fault::InvalidOpcode("instruction stream exhausted".into())
        })?;
        self.position += 1;
        Ok(byte)
    }
}

impl<'a> InstructionStream for SimpleInstructionStream<'a> {
    fn read_instruction8(&mut self) -> MemResult<u8> {
        self.next()
    }
    fn read_instruction16(&mut self) -> MemResult<u16> {
        let lo = self.next()?;
        let hi = self.next()?;
        Ok(crate::conversions::weld16(hi, lo))
    }
    fn read_instruction32(&mut self) -> MemResult<u32> {
        let lo = self.read_instruction16()?;
        let hi = self.read_instruction16()?;
        Ok(crate::conversions::weld32(hi, lo))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImmWidth {
    None,
    One,
    Two,
    Four,
    /// `moff`-style immediates follow the effective address size.
    AddressSized,
}

impl ImmWidth {
    fn bytes(self, a32: bool) -> u32 {
        match self {
            ImmWidth::None => 0,
            ImmWidth::One => 1,
            ImmWidth::Two => 2,
            ImmWidth::Four => 4,
            ImmWidth::AddressSized => {
                if a32 {
                    4
                } else {
                    2
                }
            }
        }
    }
}

/// Operand formats, mirroring the instruction reference's shorthand. The
/// format decides whether a ModR/M byte follows and how wide the immediates
/// are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
enum Format {
    Invalid,
    MultibyteWithSlash,

    RM16Reg16,
    Reg8RM8,
    Reg16RM16,
    RM16Seg,
    RM8Imm8,
    RM16Imm16,
    RM16Imm8,
    RM32Imm8,
    RM8,
    RM16,
    RM32,
    RM8Reg8,
    RM32Reg32,
    Reg32RM32,
    RM32Imm32,
    Reg16RM16Imm8,
    Reg32RM32Imm8,
    Reg16RM16Imm16,
    Reg32RM32Imm32,
    Reg16Mem16,
    Reg32Mem32,
    SegRM16,
    SegRM32,
    RM8One,
    RM16One,
    RM32One,
    FarMem16,
    FarMem32,
    RM8CL,
    RM16CL,
    RM32CL,
    Reg32CR,
    CRReg32,
    Reg32DR,
    DRReg32,
    Reg16RM8,
    Reg32RM8,
    Reg32RM16,
    RM16Reg16Imm8,
    RM32Reg32Imm8,
    RM16Reg16CL,
    RM32Reg32CL,

    Reg32Imm32,
    ALImm8,
    AXImm16,
    EAXImm32,
    SegES,
    SegCS,
    SegSS,
    SegDS,
    SegFS,
    SegGS,
    Op,
    Reg16,
    Imm16,
    RelImm16,
    RelImm32,
    Imm8,
    Imm16Imm16,
    Imm16Imm32,
    AXReg16,
    EAXReg32,
    ALMoff8,
    AXMoff16,
    EAXMoff32,
    Moff8AL,
    Moff16AX,
    Moff32EAX,
    Reg8Imm8,
    Reg16Imm16,
    Three,
    AXImm8,
    EAXImm8,
    ShortImm8,
    ALDX,
    AXDX,
    EAXDX,
    DXAL,
    DXAX,
    DXEAX,
    Imm8AL,
    Imm8AX,
    Imm8EAX,
    Reg32,
    Imm32,
    Imm8Imm16,
    NearImm,
}

fn format_has_rm(format: Format) -> bool {
    use Format::*;
    matches!(
        format,
        MultibyteWithSlash
            | RM16Reg16
            | Reg8RM8
            | Reg16RM16
            | RM16Seg
            | RM8Imm8
            | RM16Imm16
            | RM16Imm8
            | RM32Imm8
            | RM8
            | RM16
            | RM32
            | RM8Reg8
            | RM32Reg32
            | Reg32RM32
            | RM32Imm32
            | Reg16RM16Imm8
            | Reg32RM32Imm8
            | Reg16RM16Imm16
            | Reg32RM32Imm32
            | Reg16Mem16
            | Reg32Mem32
            | SegRM16
            | SegRM32
            | RM8One
            | RM16One
            | RM32One
            | FarMem16
            | FarMem32
            | RM8CL
            | RM16CL
            | RM32CL
            | Reg32CR
            | CRReg32
            | Reg32DR
            | DRReg32
            | Reg16RM8
            | Reg32RM8
            | Reg32RM16
            | RM16Reg16Imm8
            | RM32Reg32Imm8
            | RM16Reg16CL
            | RM32Reg32CL
    )
}

fn format_immediates(format: Format) -> (ImmWidth, ImmWidth) {
    use Format::*;
    match format {
        RM8Imm8 | RM16Imm8 | RM32Imm8 | Reg16RM16Imm8 | Reg32RM32Imm8 | ALImm8 | Imm8
        | Reg8Imm8 | AXImm8 | EAXImm8 | ShortImm8 | Imm8AL | Imm8AX | Imm8EAX | RM16Reg16Imm8
        | RM32Reg32Imm8 => (ImmWidth::One, ImmWidth::None),
        Reg16RM16Imm16 | AXImm16 | Imm16 | RelImm16 | Reg16Imm16 | RM16Imm16 => {
            (ImmWidth::Two, ImmWidth::None)
        }
        RM32Imm32 | Reg32RM32Imm32 | Reg32Imm32 | EAXImm32 | Imm32 | RelImm32 => {
            (ImmWidth::Four, ImmWidth::None)
        }
        Imm8Imm16 => (ImmWidth::One, ImmWidth::Two),
        Imm16Imm16 => (ImmWidth::Two, ImmWidth::Two),
        Imm16Imm32 => (ImmWidth::Two, ImmWidth::Four),
        Moff8AL | Moff16AX | Moff32EAX | ALMoff8 | AXMoff16 | EAXMoff32 | NearImm => {
            (ImmWidth::AddressSized, ImmWidth::None)
        }
        _ => (ImmWidth::None, ImmWidth::None),
    }
}

fn opcode_has_register_index(op: u8) -> bool {
    (0x40..=0x5f).contains(&op) || (0x90..=0x97).contains(&op) || (0xb0..=0xbf).contains(&op)
}

struct Entry {
    handler: Option<Handler>,
    mnemonic: &'static str,
    format: Format,
    has_rm: bool,
    imm1: ImmWidth,
    imm2: ImmWidth,
    lock_allowed: bool,
    register_index_in_opcode: bool,
    slashes: Option<Box<[Entry; 8]>>,
}

impl Entry {
    fn invalid() -> Entry {
        Entry {
            handler: None,
            mnemonic: "",
            format: Format::Invalid,
            has_rm: false,
            imm1: ImmWidth::None,
            imm2: ImmWidth::None,
            lock_allowed: false,
            register_index_in_opcode: false,
            slashes: None,
        }
    }
}

struct OpcodeTables {
    table16: [Entry; 256],
    table32: [Entry; 256],
    table_0f16: [Entry; 256],
    table_0f32: [Entry; 256],
}

fn new_table() -> [Entry; 256] {
    std::array::from_fn(|_| Entry::invalid())
}

fn set_entry(
    table: &mut [Entry; 256],
    op: u8,
    mnemonic: &'static str,
    format: Format,
    handler: Handler,
    lock_allowed: bool,
) {
    let entry = &mut table[op as usize];
    debug_assert!(entry.handler.is_none(), "duplicate opcode {:#04x}", op);
    let (imm1, imm2) = format_immediates(format);
    entry.handler = Some(handler);
    entry.mnemonic = mnemonic;
    entry.format = format;
    entry.has_rm = format_has_rm(format);
    entry.imm1 = imm1;
    entry.imm2 = imm2;
    entry.lock_allowed = lock_allowed;
    if !entry.has_rm {
        entry.register_index_in_opcode = opcode_has_register_index(op);
    }
}

fn set_slash_entry(
    table: &mut [Entry; 256],
    op: u8,
    slash: u8,
    mnemonic: &'static str,
    format: Format,
    handler: Handler,
    lock_allowed: bool,
) {
    let entry = &mut table[op as usize];
    entry.format = Format::MultibyteWithSlash;
    entry.has_rm = true;
    let slashes = entry
        .slashes
        .get_or_insert_with(|| Box::new(new_table_8()));
    let sub = &mut slashes[slash as usize];
    debug_assert!(sub.handler.is_none(), "duplicate {:#04x} /{}", op, slash);
    let (imm1, imm2) = format_immediates(format);
    sub.handler = Some(handler);
    sub.mnemonic = mnemonic;
    sub.format = format;
    sub.has_rm = true;
    sub.imm1 = imm1;
    sub.imm2 = imm2;
    sub.lock_allowed = lock_allowed;
}

fn new_table_8() -> [Entry; 8] {
    std::array::from_fn(|_| Entry::invalid())
}

struct Builder {
    table16: [Entry; 256],
    table32: [Entry; 256],
    table_0f16: [Entry; 256],
    table_0f32: [Entry; 256],
}

impl Builder {
    fn new() -> Builder {
        Builder {
            table16: new_table(),
            table32: new_table(),
            table_0f16: new_table(),
            table_0f32: new_table(),
        }
    }

    fn build(&mut self, op: u8, mnemonic: &'static str, format: Format, handler: Handler) {
        set_entry(&mut self.table16, op, mnemonic, format, handler, false);
        set_entry(&mut self.table32, op, mnemonic, format, handler, false);
    }

    fn build_lock(&mut self, op: u8, mnemonic: &'static str, format: Format, handler: Handler) {
        set_entry(&mut self.table16, op, mnemonic, format, handler, true);
        set_entry(&mut self.table32, op, mnemonic, format, handler, true);
    }

    fn build_sz(
        &mut self,
        op: u8,
        mnemonic: &'static str,
        format16: Format,
        handler16: Handler,
        format32: Format,
        handler32: Handler,
    ) {
        set_entry(&mut self.table16, op, mnemonic, format16, handler16, false);
        set_entry(&mut self.table32, op, mnemonic, format32, handler32, false);
    }

    fn build_sz_lock(
        &mut self,
        op: u8,
        mnemonic: &'static str,
        format16: Format,
        handler16: Handler,
        format32: Format,
        handler32: Handler,
    ) {
        set_entry(&mut self.table16, op, mnemonic, format16, handler16, true);
        set_entry(&mut self.table32, op, mnemonic, format32, handler32, true);
    }

    fn build_named_sz(
        &mut self,
        op: u8,
        mnemonic16: &'static str,
        format16: Format,
        handler16: Handler,
        mnemonic32: &'static str,
        format32: Format,
        handler32: Handler,
    ) {
        set_entry(&mut self.table16, op, mnemonic16, format16, handler16, false);
        set_entry(&mut self.table32, op, mnemonic32, format32, handler32, false);
    }

    fn build_0f(&mut self, op: u8, mnemonic: &'static str, format: Format, handler: Handler) {
        set_entry(&mut self.table_0f16, op, mnemonic, format, handler, false);
        set_entry(&mut self.table_0f32, op, mnemonic, format, handler, false);
    }

    fn build_0f_sz(
        &mut self,
        op: u8,
        mnemonic: &'static str,
        format16: Format,
        handler16: Handler,
        format32: Format,
        handler32: Handler,
    ) {
        set_entry(&mut self.table_0f16, op, mnemonic, format16, handler16, false);
        set_entry(&mut self.table_0f32, op, mnemonic, format32, handler32, false);
    }

    fn build_slash(
        &mut self,
        op: u8,
        slash: u8,
        mnemonic: &'static str,
        format: Format,
        handler: Handler,
    ) {
        set_slash_entry(&mut self.table16, op, slash, mnemonic, format, handler, false);
        set_slash_entry(&mut self.table32, op, slash, mnemonic, format, handler, false);
    }

    fn build_slash_lock(
        &mut self,
        op: u8,
        slash: u8,
        mnemonic: &'static str,
        format: Format,
        handler: Handler,
    ) {
        set_slash_entry(&mut self.table16, op, slash, mnemonic, format, handler, true);
        set_slash_entry(&mut self.table32, op, slash, mnemonic, format, handler, true);
    }

    fn build_slash_sz(
        &mut self,
        op: u8,
        slash: u8,
        mnemonic: &'static str,
        format16: Format,
        handler16: Handler,
        format32: Format,
        handler32: Handler,
    ) {
        set_slash_entry(&mut self.table16, op, slash, mnemonic, format16, handler16, false);
        set_slash_entry(&mut self.table32, op, slash, mnemonic, format32, handler32, false);
    }

    fn build_slash_sz_lock(
        &mut self,
        op: u8,
        slash: u8,
        mnemonic: &'static str,
        format16: Format,
        handler16: Handler,
        format32: Format,
        handler32: Handler,
    ) {
        set_slash_entry(&mut self.table16, op, slash, mnemonic, format16, handler16, true);
        set_slash_entry(&mut self.table32, op, slash, mnemonic, format32, handler32, true);
    }

    fn build_0f_slash(
        &mut self,
        op: u8,
        slash: u8,
        mnemonic: &'static str,
        format: Format,
        handler: Handler,
    ) {
        set_slash_entry(&mut self.table_0f16, op, slash, mnemonic, format, handler, false);
        set_slash_entry(&mut self.table_0f32, op, slash, mnemonic, format, handler, false);
    }

    fn build_0f_slash_sz_lock(
        &mut self,
        op: u8,
        slash: u8,
        mnemonic: &'static str,
        format16: Format,
        handler16: Handler,
        format32: Format,
        handler32: Handler,
    ) {
        set_slash_entry(&mut self.table_0f16, op, slash, mnemonic, format16, handler16, true);
        set_slash_entry(&mut self.table_0f32, op, slash, mnemonic, format32, handler32, true);
    }
}

static TABLES: OnceLock<OpcodeTables> = OnceLock::new();

pub fn build_opcode_tables_if_needed() {
    TABLES.get_or_init(build_opcode_tables);
}

fn tables() -> &'static OpcodeTables {
    TABLES.get_or_init(build_opcode_tables)
}

fn build_opcode_tables() -> OpcodeTables {
    use Format::*;
    let mut b = Builder::new();

    b.build_lock(0x00, "ADD", RM8Reg8, Cpu::add_rm8_reg8);
    b.build_sz_lock(0x01, "ADD", RM16Reg16, Cpu::add_rm16_reg16, RM32Reg32, Cpu::add_rm32_reg32);
    b.build_lock(0x02, "ADD", Reg8RM8, Cpu::add_reg8_rm8);
    b.build_sz_lock(0x03, "ADD", Reg16RM16, Cpu::add_reg16_rm16, Reg32RM32, Cpu::add_reg32_rm32);
    b.build(0x04, "ADD", ALImm8, Cpu::add_al_imm8);
    b.build_sz(0x05, "ADD", AXImm16, Cpu::add_ax_imm16, EAXImm32, Cpu::add_eax_imm32);
    b.build(0x06, "PUSH", SegES, Cpu::push_es);
    b.build(0x07, "POP", SegES, Cpu::pop_es);
    b.build_lock(0x08, "OR", RM8Reg8, Cpu::or_rm8_reg8);
    b.build_sz_lock(0x09, "OR", RM16Reg16, Cpu::or_rm16_reg16, RM32Reg32, Cpu::or_rm32_reg32);
    b.build_lock(0x0a, "OR", Reg8RM8, Cpu::or_reg8_rm8);
    b.build_sz_lock(0x0b, "OR", Reg16RM16, Cpu::or_reg16_rm16, Reg32RM32, Cpu::or_reg32_rm32);
    b.build(0x0c, "OR", ALImm8, Cpu::or_al_imm8);
    b.build_sz(0x0d, "OR", AXImm16, Cpu::or_ax_imm16, EAXImm32, Cpu::or_eax_imm32);
    b.build(0x0e, "PUSH", SegCS, Cpu::push_cs);

    b.build_lock(0x10, "ADC", RM8Reg8, Cpu::adc_rm8_reg8);
    b.build_sz_lock(0x11, "ADC", RM16Reg16, Cpu::adc_rm16_reg16, RM32Reg32, Cpu::adc_rm32_reg32);
    b.build_lock(0x12, "ADC", Reg8RM8, Cpu::adc_reg8_rm8);
    b.build_sz_lock(0x13, "ADC", Reg16RM16, Cpu::adc_reg16_rm16, Reg32RM32, Cpu::adc_reg32_rm32);
    b.build(0x14, "ADC", ALImm8, Cpu::adc_al_imm8);
    b.build_sz(0x15, "ADC", AXImm16, Cpu::adc_ax_imm16, EAXImm32, Cpu::adc_eax_imm32);
    b.build(0x16, "PUSH", SegSS, Cpu::push_ss);
    b.build(0x17, "POP", SegSS, Cpu::pop_ss);
    b.build_lock(0x18, "SBB", RM8Reg8, Cpu::sbb_rm8_reg8);
    b.build_sz_lock(0x19, "SBB", RM16Reg16, Cpu::sbb_rm16_reg16, RM32Reg32, Cpu::sbb_rm32_reg32);
    b.build_lock(0x1a, "SBB", Reg8RM8, Cpu::sbb_reg8_rm8);
    b.build_sz_lock(0x1b, "SBB", Reg16RM16, Cpu::sbb_reg16_rm16, Reg32RM32, Cpu::sbb_reg32_rm32);
    b.build(0x1c, "SBB", ALImm8, Cpu::sbb_al_imm8);
    b.build_sz(0x1d, "SBB", AXImm16, Cpu::sbb_ax_imm16, EAXImm32, Cpu::sbb_eax_imm32);
    b.build(0x1e, "PUSH", SegDS, Cpu::push_ds);
    b.build(0x1f, "POP", SegDS, Cpu::pop_ds);

    b.build_lock(0x20, "AND", RM8Reg8, Cpu::and_rm8_reg8);
    b.build_sz_lock(0x21, "AND", RM16Reg16, Cpu::and_rm16_reg16, RM32Reg32, Cpu::and_rm32_reg32);
    b.build_lock(0x22, "AND", Reg8RM8, Cpu::and_reg8_rm8);
    b.build_sz_lock(0x23, "AND", Reg16RM16, Cpu::and_reg16_rm16, Reg32RM32, Cpu::and_reg32_rm32);
    b.build(0x24, "AND", ALImm8, Cpu::and_al_imm8);
    b.build_sz(0x25, "AND", AXImm16, Cpu::and_ax_imm16, EAXImm32, Cpu::and_eax_imm32);
    b.build(0x27, "DAA", Op, Cpu::daa);
    b.build_lock(0x28, "SUB", RM8Reg8, Cpu::sub_rm8_reg8);
    b.build_sz_lock(0x29, "SUB", RM16Reg16, Cpu::sub_rm16_reg16, RM32Reg32, Cpu::sub_rm32_reg32);
    b.build_lock(0x2a, "SUB", Reg8RM8, Cpu::sub_reg8_rm8);
    b.build_sz_lock(0x2b, "SUB", Reg16RM16, Cpu::sub_reg16_rm16, Reg32RM32, Cpu::sub_reg32_rm32);
    b.build(0x2c, "SUB", ALImm8, Cpu::sub_al_imm8);
    b.build_sz(0x2d, "SUB", AXImm16, Cpu::sub_ax_imm16, EAXImm32, Cpu::sub_eax_imm32);
    b.build(0x2f, "DAS", Op, Cpu::das);

    b.build_lock(0x30, "XOR", RM8Reg8, Cpu::xor_rm8_reg8);
    b.build_sz_lock(0x31, "XOR", RM16Reg16, Cpu::xor_rm16_reg16, RM32Reg32, Cpu::xor_rm32_reg32);
    b.build_lock(0x32, "XOR", Reg8RM8, Cpu::xor_reg8_rm8);
    b.build_sz_lock(0x33, "XOR", Reg16RM16, Cpu::xor_reg16_rm16, Reg32RM32, Cpu::xor_reg32_rm32);
    b.build(0x34, "XOR", ALImm8, Cpu::xor_al_imm8);
    b.build_sz(0x35, "XOR", AXImm16, Cpu::xor_ax_imm16, EAXImm32, Cpu::xor_eax_imm32);
    b.build(0x37, "AAA", Op, Cpu::aaa);
    b.build_lock(0x38, "CMP", RM8Reg8, Cpu::cmp_rm8_reg8);
    b.build_sz_lock(0x39, "CMP", RM16Reg16, Cpu::cmp_rm16_reg16, RM32Reg32, Cpu::cmp_rm32_reg32);
    b.build_lock(0x3a, "CMP", Reg8RM8, Cpu::cmp_reg8_rm8);
    b.build_sz_lock(0x3b, "CMP", Reg16RM16, Cpu::cmp_reg16_rm16, Reg32RM32, Cpu::cmp_reg32_rm32);
    b.build(0x3c, "CMP", ALImm8, Cpu::cmp_al_imm8);
    b.build_sz(0x3d, "CMP", AXImm16, Cpu::cmp_ax_imm16, EAXImm32, Cpu::cmp_eax_imm32);
    b.build(0x3f, "AAS", Op, Cpu::aas);

    for i in 0..=7 {
        b.build_sz(0x40 + i, "INC", Reg16, Cpu::inc_reg16, Reg32, Cpu::inc_reg32);
    }
    for i in 0..=7 {
        b.build_sz(0x48 + i, "DEC", Reg16, Cpu::dec_reg16, Reg32, Cpu::dec_reg32);
    }
    for i in 0..=7 {
        b.build_sz(0x50 + i, "PUSH", Reg16, Cpu::push_reg16, Reg32, Cpu::push_reg32);
    }
    for i in 0..=7 {
        b.build_sz(0x58 + i, "POP", Reg16, Cpu::pop_reg16, Reg32, Cpu::pop_reg32);
    }

    b.build_named_sz(0x60, "PUSHAW", Op, Cpu::pusha, "PUSHAD", Op, Cpu::pushad);
    b.build_named_sz(0x61, "POPAW", Op, Cpu::popa, "POPAD", Op, Cpu::popad);
    b.build_sz(0x62, "BOUND", Reg16RM16, Cpu::bound, Reg32RM32, Cpu::bound);
    b.build(0x63, "ARPL", RM16Reg16, Cpu::arpl);

    b.build_sz(0x68, "PUSH", Imm16, Cpu::push_imm16, Imm32, Cpu::push_imm32);
    b.build_sz(
        0x69,
        "IMUL",
        Reg16RM16Imm16,
        Cpu::imul_reg16_rm16_imm16,
        Reg32RM32Imm32,
        Cpu::imul_reg32_rm32_imm32,
    );
    b.build(0x6a, "PUSH", Imm8, Cpu::push_imm8);
    b.build_sz(
        0x6b,
        "IMUL",
        Reg16RM16Imm8,
        Cpu::imul_reg16_rm16_imm8,
        Reg32RM32Imm8,
        Cpu::imul_reg32_rm32_imm8,
    );
    b.build(0x6c, "INSB", Op, Cpu::insb);
    b.build_named_sz(0x6d, "INSW", Op, Cpu::insw, "INSD", Op, Cpu::insd);
    b.build(0x6e, "OUTSB", Op, Cpu::outsb);
    b.build_named_sz(0x6f, "OUTSW", Op, Cpu::outsw, "OUTSD", Op, Cpu::outsd);

    const JCC_NAMES: [&str; 16] = [
        "JO", "JNO", "JC", "JNC", "JZ", "JNZ", "JNA", "JA", "JS", "JNS", "JP", "JNP", "JL", "JNL",
        "JNG", "JG",
    ];
    for (i, name) in JCC_NAMES.iter().enumerate() {
        b.build(0x70 + i as u8, name, ShortImm8, Cpu::jcc_imm8);
    }

    b.build(0x84, "TEST", RM8Reg8, Cpu::test_rm8_reg8);
    b.build_sz(0x85, "TEST", RM16Reg16, Cpu::test_rm16_reg16, RM32Reg32, Cpu::test_rm32_reg32);
    b.build_lock(0x86, "XCHG", Reg8RM8, Cpu::xchg_reg8_rm8);
    b.build_sz_lock(
        0x87,
        "XCHG",
        Reg16RM16,
        Cpu::xchg_reg16_rm16,
        Reg32RM32,
        Cpu::xchg_reg32_rm32,
    );
    b.build(0x88, "MOV", RM8Reg8, Cpu::mov_rm8_reg8);
    b.build_sz(0x89, "MOV", RM16Reg16, Cpu::mov_rm16_reg16, RM32Reg32, Cpu::mov_rm32_reg32);
    b.build(0x8a, "MOV", Reg8RM8, Cpu::mov_reg8_rm8);
    b.build_sz(0x8b, "MOV", Reg16RM16, Cpu::mov_reg16_rm16, Reg32RM32, Cpu::mov_reg32_rm32);
    b.build(0x8c, "MOV", RM16Seg, Cpu::mov_rm16_seg);
    b.build_sz(0x8d, "LEA", Reg16Mem16, Cpu::lea_reg16_mem16, Reg32Mem32, Cpu::lea_reg32_mem32);
    b.build_sz(0x8e, "MOV", SegRM16, Cpu::mov_seg_rm16, SegRM32, Cpu::mov_seg_rm32);

    b.build(0x90, "NOP", Op, Cpu::nop);
    for i in 0..=6 {
        b.build_sz(0x91 + i, "XCHG", AXReg16, Cpu::xchg_ax_reg16, EAXReg32, Cpu::xchg_eax_reg32);
    }

    b.build_named_sz(0x98, "CBW", Op, Cpu::cbw, "CWDE", Op, Cpu::cwde);
    b.build_named_sz(0x99, "CWD", Op, Cpu::cwd, "CDQ", Op, Cpu::cdq);
    b.build_sz(
        0x9a,
        "CALL",
        Imm16Imm16,
        Cpu::call_imm16_imm16,
        Imm16Imm32,
        Cpu::call_imm16_imm32,
    );
    b.build(0x9b, "WAIT", Op, Cpu::wait);
    b.build_named_sz(0x9c, "PUSHFW", Op, Cpu::pushf, "PUSHFD", Op, Cpu::pushfd);
    b.build_named_sz(0x9d, "POPFW", Op, Cpu::popf, "POPFD", Op, Cpu::popfd);
    b.build(0x9e, "SAHF", Op, Cpu::op_sahf);
    b.build(0x9f, "LAHF", Op, Cpu::op_lahf);

    b.build(0xa0, "MOV", ALMoff8, Cpu::mov_al_moff8);
    b.build_sz(0xa1, "MOV", AXMoff16, Cpu::mov_ax_moff16, EAXMoff32, Cpu::mov_eax_moff32);
    b.build(0xa2, "MOV", Moff8AL, Cpu::mov_moff8_al);
    b.build_sz(0xa3, "MOV", Moff16AX, Cpu::mov_moff16_ax, Moff32EAX, Cpu::mov_moff32_eax);
    b.build(0xa4, "MOVSB", Op, Cpu::movsb);
    b.build_named_sz(0xa5, "MOVSW", Op, Cpu::movsw, "MOVSD", Op, Cpu::movsd);
    b.build(0xa6, "CMPSB", Op, Cpu::cmpsb);
    b.build_named_sz(0xa7, "CMPSW", Op, Cpu::cmpsw, "CMPSD", Op, Cpu::cmpsd);
    b.build(0xa8, "TEST", ALImm8, Cpu::test_al_imm8);
    b.build_sz(0xa9, "TEST", AXImm16, Cpu::test_ax_imm16, EAXImm32, Cpu::test_eax_imm32);
    b.build(0xaa, "STOSB", Op, Cpu::stosb);
    b.build_named_sz(0xab, "STOSW", Op, Cpu::stosw, "STOSD", Op, Cpu::stosd);
    b.build(0xac, "LODSB", Op, Cpu::lodsb);
    b.build_named_sz(0xad, "LODSW", Op, Cpu::lodsw, "LODSD", Op, Cpu::lodsd);
    b.build(0xae, "SCASB", Op, Cpu::scasb);
    b.build_named_sz(0xaf, "SCASW", Op, Cpu::scasw, "SCASD", Op, Cpu::scasd);

    for i in 0xb0..=0xb7 {
        b.build(i, "MOV", Reg8Imm8, Cpu::mov_reg8_imm8);
    }
    for i in 0xb8..=0xbf {
        b.build_sz(i, "MOV", Reg16Imm16, Cpu::mov_reg16_imm16, Reg32Imm32, Cpu::mov_reg32_imm32);
    }

    b.build(0xc2, "RET", Imm16, Cpu::ret_imm16);
    b.build(0xc3, "RET", Op, Cpu::ret);
    b.build_sz(0xc4, "LES", Reg16Mem16, Cpu::les_reg16_mem16, Reg32Mem32, Cpu::les_reg32_mem32);
    b.build_sz(0xc5, "LDS", Reg16Mem16, Cpu::lds_reg16_mem16, Reg32Mem32, Cpu::lds_reg32_mem32);
    b.build(0xc6, "MOV", RM8Imm8, Cpu::mov_rm8_imm8);
    b.build_sz(0xc7, "MOV", RM16Imm16, Cpu::mov_rm16_imm16, RM32Imm32, Cpu::mov_rm32_imm32);
    b.build_sz(0xc8, "ENTER", Imm8Imm16, Cpu::enter16, Imm8Imm16, Cpu::enter32);
    b.build_sz(0xc9, "LEAVE", Op, Cpu::leave16, Op, Cpu::leave32);
    b.build(0xca, "RETF", Imm16, Cpu::retf_imm16);
    b.build(0xcb, "RETF", Op, Cpu::retf);
    b.build(0xcc, "INT3", Three, Cpu::int3);
    b.build(0xcd, "INT", Imm8, Cpu::int_imm8);
    b.build(0xce, "INTO", Op, Cpu::into_overflow);
    b.build(0xcf, "IRET", Op, Cpu::iret);

    b.build(0xd4, "AAM", Imm8, Cpu::aam);
    b.build(0xd5, "AAD", Imm8, Cpu::aad);
    b.build(0xd6, "SALC", Op, Cpu::salc);
    b.build(0xd7, "XLAT", Op, Cpu::xlat);

    // D8-DF are the x87 escape range; consume the ModR/M and do nothing.
    for i in 0..=7 {
        b.build(0xd8 + i, "FPU?", RM8, Cpu::escape);
    }

    b.build(0xe0, "LOOPNZ", Imm8, Cpu::loopnz_imm8);
    b.build(0xe1, "LOOPZ", Imm8, Cpu::loopz_imm8);
    b.build(0xe2, "LOOP", Imm8, Cpu::loop_imm8);
    b.build(0xe3, "JCXZ", Imm8, Cpu::jcxz_imm8);
    b.build(0xe4, "IN", ALImm8, Cpu::in_al_imm8);
    b.build_sz(0xe5, "IN", AXImm8, Cpu::in_ax_imm8, EAXImm8, Cpu::in_eax_imm8);
    b.build(0xe6, "OUT", Imm8AL, Cpu::out_imm8_al);
    b.build_sz(0xe7, "OUT", Imm8AX, Cpu::out_imm8_ax, Imm8EAX, Cpu::out_imm8_eax);
    b.build_sz(0xe8, "CALL", RelImm16, Cpu::call_imm16, RelImm32, Cpu::call_imm32);
    b.build_sz(0xe9, "JMP", RelImm16, Cpu::jmp_imm16, RelImm32, Cpu::jmp_imm32);
    b.build_sz(
        0xea,
        "JMP",
        Imm16Imm16,
        Cpu::jmp_imm16_imm16,
        Imm16Imm32,
        Cpu::jmp_imm16_imm32,
    );
    b.build(0xeb, "JMP", ShortImm8, Cpu::jmp_short_imm8);
    b.build(0xec, "IN", ALDX, Cpu::in_al_dx);
    b.build_sz(0xed, "IN", AXDX, Cpu::in_ax_dx, EAXDX, Cpu::in_eax_dx);
    b.build(0xee, "OUT", DXAL, Cpu::out_dx_al);
    b.build_sz(0xef, "OUT", DXAX, Cpu::out_dx_ax, DXEAX, Cpu::out_dx_eax);

    b.build(0xf1, "VKILL", Op, Cpu::vkill);

    b.build(0xf4, "HLT", Op, Cpu::hlt);
    b.build(0xf5, "CMC", Op, Cpu::op_cmc);

    b.build(0xf8, "CLC", Op, Cpu::op_clc);
    b.build(0xf9, "STC", Op, Cpu::op_stc);
    b.build(0xfa, "CLI", Op, Cpu::op_cli);
    b.build(0xfb, "STI", Op, Cpu::op_sti);
    b.build(0xfc, "CLD", Op, Cpu::op_cld);
    b.build(0xfd, "STD", Op, Cpu::op_std);

    b.build_slash_lock(0x80, 0, "ADD", RM8Imm8, Cpu::add_rm8_imm8);
    b.build_slash_lock(0x80, 1, "OR", RM8Imm8, Cpu::or_rm8_imm8);
    b.build_slash_lock(0x80, 2, "ADC", RM8Imm8, Cpu::adc_rm8_imm8);
    b.build_slash_lock(0x80, 3, "SBB", RM8Imm8, Cpu::sbb_rm8_imm8);
    b.build_slash_lock(0x80, 4, "AND", RM8Imm8, Cpu::and_rm8_imm8);
    b.build_slash_lock(0x80, 5, "SUB", RM8Imm8, Cpu::sub_rm8_imm8);
    b.build_slash_lock(0x80, 6, "XOR", RM8Imm8, Cpu::xor_rm8_imm8);
    b.build_slash(0x80, 7, "CMP", RM8Imm8, Cpu::cmp_rm8_imm8);

    b.build_slash_sz_lock(0x81, 0, "ADD", RM16Imm16, Cpu::add_rm16_imm16, RM32Imm32, Cpu::add_rm32_imm32);
    b.build_slash_sz_lock(0x81, 1, "OR", RM16Imm16, Cpu::or_rm16_imm16, RM32Imm32, Cpu::or_rm32_imm32);
    b.build_slash_sz_lock(0x81, 2, "ADC", RM16Imm16, Cpu::adc_rm16_imm16, RM32Imm32, Cpu::adc_rm32_imm32);
    b.build_slash_sz_lock(0x81, 3, "SBB", RM16Imm16, Cpu::sbb_rm16_imm16, RM32Imm32, Cpu::sbb_rm32_imm32);
    b.build_slash_sz_lock(0x81, 4, "AND", RM16Imm16, Cpu::and_rm16_imm16, RM32Imm32, Cpu::and_rm32_imm32);
    b.build_slash_sz_lock(0x81, 5, "SUB", RM16Imm16, Cpu::sub_rm16_imm16, RM32Imm32, Cpu::sub_rm32_imm32);
    b.build_slash_sz_lock(0x81, 6, "XOR", RM16Imm16, Cpu::xor_rm16_imm16, RM32Imm32, Cpu::xor_rm32_imm32);
    b.build_slash_sz(0x81, 7, "CMP", RM16Imm16, Cpu::cmp_rm16_imm16, RM32Imm32, Cpu::cmp_rm32_imm32);

    b.build_slash_sz_lock(0x83, 0, "ADD", RM16Imm8, Cpu::add_rm16_imm8, RM32Imm8, Cpu::add_rm32_imm8);
    b.build_slash_sz_lock(0x83, 1, "OR", RM16Imm8, Cpu::or_rm16_imm8, RM32Imm8, Cpu::or_rm32_imm8);
    b.build_slash_sz_lock(0x83, 2, "ADC", RM16Imm8, Cpu::adc_rm16_imm8, RM32Imm8, Cpu::adc_rm32_imm8);
    b.build_slash_sz_lock(0x83, 3, "SBB", RM16Imm8, Cpu::sbb_rm16_imm8, RM32Imm8, Cpu::sbb_rm32_imm8);
    b.build_slash_sz_lock(0x83, 4, "AND", RM16Imm8, Cpu::and_rm16_imm8, RM32Imm8, Cpu::and_rm32_imm8);
    b.build_slash_sz_lock(0x83, 5, "SUB", RM16Imm8, Cpu::sub_rm16_imm8, RM32Imm8, Cpu::sub_rm32_imm8);
    b.build_slash_sz_lock(0x83, 6, "XOR", RM16Imm8, Cpu::xor_rm16_imm8, RM32Imm8, Cpu::xor_rm32_imm8);
    b.build_slash_sz(0x83, 7, "CMP", RM16Imm8, Cpu::cmp_rm16_imm8, RM32Imm8, Cpu::cmp_rm32_imm8);

    b.build_slash_sz(0x8f, 0, "POP", RM16, Cpu::pop_rm16, RM32, Cpu::pop_rm32);

    b.build_slash(0xc0, 0, "ROL", RM8Imm8, Cpu::rol_rm8_imm8);
    b.build_slash(0xc0, 1, "ROR", RM8Imm8, Cpu::ror_rm8_imm8);
    b.build_slash(0xc0, 2, "RCL", RM8Imm8, Cpu::rcl_rm8_imm8);
    b.build_slash(0xc0, 3, "RCR", RM8Imm8, Cpu::rcr_rm8_imm8);
    b.build_slash(0xc0, 4, "SHL", RM8Imm8, Cpu::shl_rm8_imm8);
    b.build_slash(0xc0, 5, "SHR", RM8Imm8, Cpu::shr_rm8_imm8);
    b.build_slash(0xc0, 6, "SHL", RM8Imm8, Cpu::shl_rm8_imm8);
    b.build_slash(0xc0, 7, "SAR", RM8Imm8, Cpu::sar_rm8_imm8);

    b.build_slash_sz(0xc1, 0, "ROL", RM16Imm8, Cpu::rol_rm16_imm8, RM32Imm8, Cpu::rol_rm32_imm8);
    b.build_slash_sz(0xc1, 1, "ROR", RM16Imm8, Cpu::ror_rm16_imm8, RM32Imm8, Cpu::ror_rm32_imm8);
    b.build_slash_sz(0xc1, 2, "RCL", RM16Imm8, Cpu::rcl_rm16_imm8, RM32Imm8, Cpu::rcl_rm32_imm8);
    b.build_slash_sz(0xc1, 3, "RCR", RM16Imm8, Cpu::rcr_rm16_imm8, RM32Imm8, Cpu::rcr_rm32_imm8);
    b.build_slash_sz(0xc1, 4, "SHL", RM16Imm8, Cpu::shl_rm16_imm8, RM32Imm8, Cpu::shl_rm32_imm8);
    b.build_slash_sz(0xc1, 5, "SHR", RM16Imm8, Cpu::shr_rm16_imm8, RM32Imm8, Cpu::shr_rm32_imm8);
    b.build_slash_sz(0xc1, 6, "SHL", RM16Imm8, Cpu::shl_rm16_imm8, RM32Imm8, Cpu::shl_rm32_imm8);
    b.build_slash_sz(0xc1, 7, "SAR", RM16Imm8, Cpu::sar_rm16_imm8, RM32Imm8, Cpu::sar_rm32_imm8);

    b.build_slash(0xd0, 0, "ROL", RM8One, Cpu::rol_rm8_1);
    b.build_slash(0xd0, 1, "ROR", RM8One, Cpu::ror_rm8_1);
    b.build_slash(0xd0, 2, "RCL", RM8One, Cpu::rcl_rm8_1);
    b.build_slash(0xd0, 3, "RCR", RM8One, Cpu::rcr_rm8_1);
    b.build_slash(0xd0, 4, "SHL", RM8One, Cpu::shl_rm8_1);
    b.build_slash(0xd0, 5, "SHR", RM8One, Cpu::shr_rm8_1);
    b.build_slash(0xd0, 6, "SHL", RM8One, Cpu::shl_rm8_1);
    b.build_slash(0xd0, 7, "SAR", RM8One, Cpu::sar_rm8_1);

    b.build_slash_sz(0xd1, 0, "ROL", RM16One, Cpu::rol_rm16_1, RM32One, Cpu::rol_rm32_1);
    b.build_slash_sz(0xd1, 1, "ROR", RM16One, Cpu::ror_rm16_1, RM32One, Cpu::ror_rm32_1);
    b.build_slash_sz(0xd1, 2, "RCL", RM16One, Cpu::rcl_rm16_1, RM32One, Cpu::rcl_rm32_1);
    b.build_slash_sz(0xd1, 3, "RCR", RM16One, Cpu::rcr_rm16_1, RM32One, Cpu::rcr_rm32_1);
    b.build_slash_sz(0xd1, 4, "SHL", RM16One, Cpu::shl_rm16_1, RM32One, Cpu::shl_rm32_1);
    b.build_slash_sz(0xd1, 5, "SHR", RM16One, Cpu::shr_rm16_1, RM32One, Cpu::shr_rm32_1);
    b.build_slash_sz(0xd1, 6, "SHL", RM16One, Cpu::shl_rm16_1, RM32One, Cpu::shl_rm32_1);
    b.build_slash_sz(0xd1, 7, "SAR", RM16One, Cpu::sar_rm16_1, RM32One, Cpu::sar_rm32_1);

    b.build_slash(0xd2, 0, "ROL", RM8CL, Cpu::rol_rm8_cl);
    b.build_slash(0xd2, 1, "ROR", RM8CL, Cpu::ror_rm8_cl);
    b.build_slash(0xd2, 2, "RCL", RM8CL, Cpu::rcl_rm8_cl);
    b.build_slash(0xd2, 3, "RCR", RM8CL, Cpu::rcr_rm8_cl);
    b.build_slash(0xd2, 4, "SHL", RM8CL, Cpu::shl_rm8_cl);
    b.build_slash(0xd2, 5, "SHR", RM8CL, Cpu::shr_rm8_cl);
    b.build_slash(0xd2, 6, "SHL", RM8CL, Cpu::shl_rm8_cl);
    b.build_slash(0xd2, 7, "SAR", RM8CL, Cpu::sar_rm8_cl);

    b.build_slash_sz(0xd3, 0, "ROL", RM16CL, Cpu::rol_rm16_cl, RM32CL, Cpu::rol_rm32_cl);
    b.build_slash_sz(0xd3, 1, "ROR", RM16CL, Cpu::ror_rm16_cl, RM32CL, Cpu::ror_rm32_cl);
    b.build_slash_sz(0xd3, 2, "RCL", RM16CL, Cpu::rcl_rm16_cl, RM32CL, Cpu::rcl_rm32_cl);
    b.build_slash_sz(0xd3, 3, "RCR", RM16CL, Cpu::rcr_rm16_cl, RM32CL, Cpu::rcr_rm32_cl);
    b.build_slash_sz(0xd3, 4, "SHL", RM16CL, Cpu::shl_rm16_cl, RM32CL, Cpu::shl_rm32_cl);
    b.build_slash_sz(0xd3, 5, "SHR", RM16CL, Cpu::shr_rm16_cl, RM32CL, Cpu::shr_rm32_cl);
    b.build_slash_sz(0xd3, 6, "SHL", RM16CL, Cpu::shl_rm16_cl, RM32CL, Cpu::shl_rm32_cl);
    b.build_slash_sz(0xd3, 7, "SAR", RM16CL, Cpu::sar_rm16_cl, RM32CL, Cpu::sar_rm32_cl);

    b.build_slash(0xf6, 0, "TEST", RM8Imm8, Cpu::test_rm8_imm8);
    b.build_slash(0xf6, 1, "TEST", RM8Imm8, Cpu::test_rm8_imm8);
    b.build_slash_lock(0xf6, 2, "NOT", RM8, Cpu::not_rm8);
    b.build_slash_lock(0xf6, 3, "NEG", RM8, Cpu::neg_rm8);
    b.build_slash(0xf6, 4, "MUL", RM8, Cpu::mul_rm8);
    b.build_slash(0xf6, 5, "IMUL", RM8, Cpu::imul_rm8);
    b.build_slash(0xf6, 6, "DIV", RM8, Cpu::div_rm8);
    b.build_slash(0xf6, 7, "IDIV", RM8, Cpu::idiv_rm8);

    b.build_slash_sz(0xf7, 0, "TEST", RM16Imm16, Cpu::test_rm16_imm16, RM32Imm32, Cpu::test_rm32_imm32);
    b.build_slash_sz(0xf7, 1, "TEST", RM16Imm16, Cpu::test_rm16_imm16, RM32Imm32, Cpu::test_rm32_imm32);
    b.build_slash_sz_lock(0xf7, 2, "NOT", RM16, Cpu::not_rm16, RM32, Cpu::not_rm32);
    b.build_slash_sz_lock(0xf7, 3, "NEG", RM16, Cpu::neg_rm16, RM32, Cpu::neg_rm32);
    b.build_slash_sz(0xf7, 4, "MUL", RM16, Cpu::mul_rm16, RM32, Cpu::mul_rm32);
    b.build_slash_sz(0xf7, 5, "IMUL", RM16, Cpu::imul_rm16, RM32, Cpu::imul_rm32);
    b.build_slash_sz(0xf7, 6, "DIV", RM16, Cpu::div_rm16, RM32, Cpu::div_rm32);
    b.build_slash_sz(0xf7, 7, "IDIV", RM16, Cpu::idiv_rm16, RM32, Cpu::idiv_rm32);

    b.build_slash_lock(0xfe, 0, "INC", RM8, Cpu::inc_rm8);
    b.build_slash_lock(0xfe, 1, "DEC", RM8, Cpu::dec_rm8);

    b.build_slash_sz_lock(0xff, 0, "INC", RM16, Cpu::inc_rm16, RM32, Cpu::inc_rm32);
    b.build_slash_sz_lock(0xff, 1, "DEC", RM16, Cpu::dec_rm16, RM32, Cpu::dec_rm32);
    b.build_slash_sz(0xff, 2, "CALL", RM16, Cpu::call_rm16, RM32, Cpu::call_rm32);
    b.build_slash_sz(0xff, 3, "CALL", FarMem16, Cpu::call_far_mem16, FarMem32, Cpu::call_far_mem32);
    b.build_slash_sz(0xff, 4, "JMP", RM16, Cpu::jmp_rm16, RM32, Cpu::jmp_rm32);
    b.build_slash_sz(0xff, 5, "JMP", FarMem16, Cpu::jmp_far_mem16, FarMem32, Cpu::jmp_far_mem32);
    b.build_slash_sz(0xff, 6, "PUSH", RM16, Cpu::push_rm16, RM32, Cpu::push_rm32);

    // Instructions starting with 0x0F are multi-byte opcodes.
    b.build_0f_slash(0x00, 0, "SLDT", RM16, Cpu::sldt_rm16);
    b.build_0f_slash(0x00, 1, "STR", RM16, Cpu::str_rm16);
    b.build_0f_slash(0x00, 2, "LLDT", RM16, Cpu::lldt_rm16);
    b.build_0f_slash(0x00, 3, "LTR", RM16, Cpu::ltr_rm16);
    b.build_0f_slash(0x00, 4, "VERR", RM16, Cpu::verr_rm16);
    b.build_0f_slash(0x00, 5, "VERW", RM16, Cpu::verw_rm16);

    b.build_0f_slash(0x01, 0, "SGDT", RM16, Cpu::sgdt);
    b.build_0f_slash(0x01, 1, "SIDT", RM16, Cpu::sidt);
    b.build_0f_slash(0x01, 2, "LGDT", RM16, Cpu::lgdt);
    b.build_0f_slash(0x01, 3, "LIDT", RM16, Cpu::lidt);
    b.build_0f_slash(0x01, 4, "SMSW", RM16, Cpu::smsw_rm16);
    b.build_0f_slash(0x01, 6, "LMSW", RM16, Cpu::lmsw_rm16);
    b.build_0f_slash(0x01, 7, "INVLPG", RM32, Cpu::invlpg);

    b.build_0f_slash_sz_lock(0xba, 4, "BT", RM16Imm8, Cpu::bt_rm16_imm8, RM32Imm8, Cpu::bt_rm32_imm8);
    b.build_0f_slash_sz_lock(0xba, 5, "BTS", RM16Imm8, Cpu::bts_rm16_imm8, RM32Imm8, Cpu::bts_rm32_imm8);
    b.build_0f_slash_sz_lock(0xba, 6, "BTR", RM16Imm8, Cpu::btr_rm16_imm8, RM32Imm8, Cpu::btr_rm32_imm8);
    b.build_0f_slash_sz_lock(0xba, 7, "BTC", RM16Imm8, Cpu::btc_rm16_imm8, RM32Imm8, Cpu::btc_rm32_imm8);

    b.build_0f_sz(0x02, "LAR", Reg16RM16, Cpu::lar_reg16_rm16, Reg32RM32, Cpu::lar_reg32_rm32);
    b.build_0f_sz(0x03, "LSL", Reg16RM16, Cpu::lsl_reg16_rm16, Reg32RM32, Cpu::lsl_reg32_rm32);
    b.build_0f(0x06, "CLTS", Op, Cpu::clts);
    b.build_0f(0x09, "WBINVD", Op, Cpu::wbinvd);
    b.build_0f(0x0b, "UD2", Op, Cpu::ud2);

    b.build_0f(0x1e, "NOP", RM16, Cpu::nop_rm);

    b.build_0f(0x20, "MOV", Reg32CR, Cpu::mov_reg32_cr);
    b.build_0f(0x21, "MOV", Reg32DR, Cpu::mov_reg32_dr);
    b.build_0f(0x22, "MOV", CRReg32, Cpu::mov_cr_reg32);
    b.build_0f(0x23, "MOV", DRReg32, Cpu::mov_dr_reg32);

    b.build_0f(0x31, "RDTSC", Op, Cpu::rdtsc);

    const CMOV_NAMES: [&str; 16] = [
        "CMOVO", "CMOVNO", "CMOVC", "CMOVNC", "CMOVZ", "CMOVNZ", "CMOVNA", "CMOVA", "CMOVS",
        "CMOVNS", "CMOVP", "CMOVNP", "CMOVL", "CMOVNL", "CMOVNG", "CMOVG",
    ];
    for (i, name) in CMOV_NAMES.iter().enumerate() {
        b.build_0f_sz(
            0x40 + i as u8,
            name,
            Reg16RM16,
            Cpu::cmovcc_reg16_rm16,
            Reg32RM32,
            Cpu::cmovcc_reg32_rm32,
        );
    }

    for (i, name) in JCC_NAMES.iter().enumerate() {
        b.build_0f(0x80 + i as u8, name, NearImm, Cpu::jcc_near_imm);
    }

    const SETCC_NAMES: [&str; 16] = [
        "SETO", "SETNO", "SETC", "SETNC", "SETZ", "SETNZ", "SETNA", "SETA", "SETS", "SETNS",
        "SETP", "SETNP", "SETL", "SETNL", "SETNG", "SETG",
    ];
    for (i, name) in SETCC_NAMES.iter().enumerate() {
        b.build_0f(0x90 + i as u8, name, RM8, Cpu::setcc_rm8);
    }

    b.build_0f(0xa0, "PUSH", SegFS, Cpu::push_fs);
    b.build_0f(0xa1, "POP", SegFS, Cpu::pop_fs);
    b.build_0f(0xa2, "CPUID", Op, Cpu::cpuid);
    b.build_0f_sz(0xa3, "BT", RM16Reg16, Cpu::bt_rm16_reg16, RM32Reg32, Cpu::bt_rm32_reg32);
    b.build_0f_sz(
        0xa4,
        "SHLD",
        RM16Reg16Imm8,
        Cpu::shld_rm16_reg16_imm8,
        RM32Reg32Imm8,
        Cpu::shld_rm32_reg32_imm8,
    );
    b.build_0f_sz(
        0xa5,
        "SHLD",
        RM16Reg16CL,
        Cpu::shld_rm16_reg16_cl,
        RM32Reg32CL,
        Cpu::shld_rm32_reg32_cl,
    );
    b.build_0f(0xa8, "PUSH", SegGS, Cpu::push_gs);
    b.build_0f(0xa9, "POP", SegGS, Cpu::pop_gs);
    b.build_0f_sz(0xab, "BTS", RM16Reg16, Cpu::bts_rm16_reg16, RM32Reg32, Cpu::bts_rm32_reg32);
    b.build_0f_sz(
        0xac,
        "SHRD",
        RM16Reg16Imm8,
        Cpu::shrd_rm16_reg16_imm8,
        RM32Reg32Imm8,
        Cpu::shrd_rm32_reg32_imm8,
    );
    b.build_0f_sz(
        0xad,
        "SHRD",
        RM16Reg16CL,
        Cpu::shrd_rm16_reg16_cl,
        RM32Reg32CL,
        Cpu::shrd_rm32_reg32_cl,
    );
    b.build_0f_sz(0xaf, "IMUL", Reg16RM16, Cpu::imul_reg16_rm16, Reg32RM32, Cpu::imul_reg32_rm32);
    b.build_0f_sz(
        0xb0,
        "CMPXCHG",
        RM8Reg8,
        Cpu::cmpxchg_rm8_reg8,
        RM8Reg8,
        Cpu::cmpxchg_rm8_reg8,
    );
    b.build_0f_sz(
        0xb1,
        "CMPXCHG",
        RM16Reg16,
        Cpu::cmpxchg_rm16_reg16,
        RM32Reg32,
        Cpu::cmpxchg_rm32_reg32,
    );
    b.build_0f_sz(0xb2, "LSS", Reg16Mem16, Cpu::lss_reg16_mem16, Reg32Mem32, Cpu::lss_reg32_mem32);
    b.build_0f_sz(0xb3, "BTR", RM16Reg16, Cpu::btr_rm16_reg16, RM32Reg32, Cpu::btr_rm32_reg32);
    b.build_0f_sz(0xb4, "LFS", Reg16Mem16, Cpu::lfs_reg16_mem16, Reg32Mem32, Cpu::lfs_reg32_mem32);
    b.build_0f_sz(0xb5, "LGS", Reg16Mem16, Cpu::lgs_reg16_mem16, Reg32Mem32, Cpu::lgs_reg32_mem32);
    b.build_0f_sz(0xb6, "MOVZX", Reg16RM8, Cpu::movzx_reg16_rm8, Reg32RM8, Cpu::movzx_reg32_rm8);
    set_entry(&mut b.table_0f32, 0xb7, "MOVZX", Reg32RM16, Cpu::movzx_reg32_rm16, false);
    b.build_0f(0xb9, "UD1", Op, Cpu::ud1);
    b.build_0f_sz(0xbb, "BTC", RM16Reg16, Cpu::btc_rm16_reg16, RM32Reg32, Cpu::btc_rm32_reg32);
    b.build_0f_sz(0xbc, "BSF", Reg16RM16, Cpu::bsf_reg16_rm16, Reg32RM32, Cpu::bsf_reg32_rm32);
    b.build_0f_sz(0xbd, "BSR", Reg16RM16, Cpu::bsr_reg16_rm16, Reg32RM32, Cpu::bsr_reg32_rm32);
    b.build_0f_sz(0xbe, "MOVSX", Reg16RM8, Cpu::movsx_reg16_rm8, Reg32RM8, Cpu::movsx_reg32_rm8);
    set_entry(&mut b.table_0f32, 0xbf, "MOVSX", Reg32RM16, Cpu::movsx_reg32_rm16, false);

    b.build_0f_sz(
        0xc0,
        "XADD",
        RM8Reg8,
        Cpu::xadd_rm8_reg8,
        RM8Reg8,
        Cpu::xadd_rm8_reg8,
    );
    b.build_0f_sz(
        0xc1,
        "XADD",
        RM16Reg16,
        Cpu::xadd_rm16_reg16,
        RM32Reg32,
        Cpu::xadd_rm32_reg32,
    );

    for i in 0xc8..=0xcf {
        b.build_0f(i, "BSWAP", Reg32, Cpu::bswap_reg32);
    }

    b.build_0f(0xff, "UD0", Op, Cpu::ud0);

    OpcodeTables {
        table16: b.table16,
        table32: b.table32,
        table_0f16: b.table_0f16,
        table_0f32: b.table_0f32,
    }
}

fn to_segment_prefix(op: u8) -> Option<SegmentRegister> {
    match op {
        0x26 => Some(SegmentRegister::Es),
        0x2e => Some(SegmentRegister::Cs),
        0x36 => Some(SegmentRegister::Ss),
        0x3e => Some(SegmentRegister::Ds),
        0x64 => Some(SegmentRegister::Fs),
        0x65 => Some(SegmentRegister::Gs),
        _ => None,
    }
}

/// A decoded r/m operand: either a register index or a segment:offset pair.
/// Decoding consumes the bytes; resolution (register reads for the effective
/// address) happens when the instruction is bound to the CPU.
#[derive(Debug, Clone, Copy)]
pub struct MemoryOrRegisterReference {
    register_index: Option<usize>,
    segment: SegmentRegister,
    offset: u32,
    a32: bool,
    rm: u8,
    sib: u8,
    displacement_bytes: u8,
    displacement: u32,
    has_sib: bool,
}

impl Default for MemoryOrRegisterReference {
    fn default() -> Self {
        MemoryOrRegisterReference {
            register_index: None,
            segment: SegmentRegister::Ds,
            offset: 0,
            a32: false,
            rm: 0,
            sib: 0,
            displacement_bytes: 0,
            displacement: 0,
            has_sib: false,
        }
    }
}

impl MemoryOrRegisterReference {
    fn decode(&mut self, stream: &mut dyn InstructionStream, a32: bool) -> MemResult<()> {
        self.a32 = a32;
        self.rm = stream.read_instruction8()?;

        if self.a32 {
            self.decode32(stream)?;
            match self.displacement_bytes {
                0 => {}
                1 => {
                    self.displacement = sign_extended::<u8, u32>(stream.read_instruction8()?);
                }
                4 => self.displacement = stream.read_instruction32()?,
                _ => unreachable!("bad displacement byte count"),
            }
        } else {
            self.decode16(stream)?;
            match self.displacement_bytes {
                0 => {}
                1 => {
                    self.displacement =
                        sign_extended::<u8, u16>(stream.read_instruction8()?) as u32;
                }
                2 => self.displacement = stream.read_instruction16()? as u32,
                _ => unreachable!("bad displacement byte count"),
            }
        }
        Ok(())
    }

    fn decode16(&mut self, _stream: &mut dyn InstructionStream) -> MemResult<()> {
        match self.rm & 0xc0 {
            0x00 => {
                if self.rm & 0x07 == 6 {
                    self.displacement_bytes = 2;
                }
            }
            0x40 => self.displacement_bytes = 1,
            0x80 => self.displacement_bytes = 2,
            _ => self.register_index = Some((self.rm & 7) as usize),
        }
        Ok(())
    }

    fn decode32(&mut self, stream: &mut dyn InstructionStream) -> MemResult<()> {
        match self.rm & 0xc0 {
            0x00 => {
                if self.rm & 0x07 == 5 {
                    self.displacement_bytes = 4;
                }
            }
            0x40 => self.displacement_bytes = 1,
            0x80 => self.displacement_bytes = 4,
            _ => {
                self.register_index = Some((self.rm & 7) as usize);
                return Ok(());
            }
        }

        self.has_sib = self.rm & 0x07 == 4;
        if self.has_sib {
            self.sib = stream.read_instruction8()?;
            if self.sib & 0x07 == 5 {
                match self.rm >> 6 & 0x03 {
                    0 | 2 => self.displacement_bytes = 4,
                    1 => self.displacement_bytes = 1,
                    _ => unreachable!("register form has no SIB"),
                }
            }
        }
        Ok(())
    }

    /// Compute the effective address from the current register state. The
    /// default segment is the (possibly overridden) data segment; base
    /// registers involving BP/EBP/ESP switch it to SS unless an explicit
    /// override is present.
    pub fn resolve(&mut self, cpu: &Cpu) {
        if self.register_index.is_some() {
            return;
        }
        if self.a32 {
            self.resolve32(cpu);
        } else {
            self.resolve16(cpu);
        }
    }

    fn default_to_ss(&mut self, cpu: &Cpu) {
        if !cpu.has_segment_prefix() {
            self.segment = SegmentRegister::Ss;
        }
    }

    fn resolve16(&mut self, cpu: &Cpu) {
        self.segment = cpu.current_segment();
        let displacement = self.displacement as u16;
        let offset = match self.rm & 7 {
            0 => cpu.bx().wrapping_add(cpu.si()),
            1 => cpu.bx().wrapping_add(cpu.di()),
            2 => {
                self.default_to_ss(cpu);
                cpu.bp().wrapping_add(cpu.si())
            }
            3 => {
                self.default_to_ss(cpu);
                cpu.bp().wrapping_add(cpu.di())
            }
            4 => cpu.si(),
            5 => cpu.di(),
            6 => {
                if self.rm & 0xc0 == 0 {
                    0
                } else {
                    self.default_to_ss(cpu);
                    cpu.bp()
                }
            }
            _ => cpu.bx(),
        };
        self.offset = offset.wrapping_add(displacement) as u32;
    }

    fn resolve32(&mut self, cpu: &Cpu) {
        self.segment = cpu.current_segment();
        self.offset = match self.rm & 0x07 {
            0 => cpu.eax().wrapping_add(self.displacement),
            1 => cpu.ecx().wrapping_add(self.displacement),
            2 => cpu.edx().wrapping_add(self.displacement),
            3 => cpu.ebx().wrapping_add(self.displacement),
            4 => self.evaluate_sib(cpu),
            6 => cpu.esi().wrapping_add(self.displacement),
            7 => cpu.edi().wrapping_add(self.displacement),
            _ => {
                // 5
                if self.rm & 0xc0 == 0 {
                    self.displacement
                } else {
                    self.default_to_ss(cpu);
                    cpu.ebp().wrapping_add(self.displacement)
                }
            }
        };
    }

    fn evaluate_sib(&mut self, cpu: &Cpu) -> u32 {
        let scale = match self.sib & 0xc0 {
            0x00 => 1,
            0x40 => 2,
            0x80 => 4,
            _ => 8,
        };
        let index = match self.sib >> 3 & 0x07 {
            0 => cpu.eax(),
            1 => cpu.ecx(),
            2 => cpu.edx(),
            3 => cpu.ebx(),
            4 => 0,
            5 => cpu.ebp(),
            6 => cpu.esi(),
            _ => cpu.edi(),
        };

        let mut base = self.displacement;
        match self.sib & 0x07 {
            0 => base = base.wrapping_add(cpu.eax()),
            1 => base = base.wrapping_add(cpu.ecx()),
            2 => base = base.wrapping_add(cpu.edx()),
            3 => base = base.wrapping_add(cpu.ebx()),
            4 => {
                self.default_to_ss(cpu);
                base = base.wrapping_add(cpu.esp());
            }
            6 => base = base.wrapping_add(cpu.esi()),
            7 => base = base.wrapping_add(cpu.edi()),
            _ => {
                // 5: mod=00 means disp32-only, otherwise EBP
                match self.rm >> 6 & 3 {
                    0 => {}
                    _ => {
                        self.default_to_ss(cpu);
                        base = base.wrapping_add(cpu.ebp());
                    }
                }
            }
        }

        index.wrapping_mul(scale).wrapping_add(base)
    }

    pub fn is_register(&self) -> bool {
        self.register_index.is_some()
    }

    pub fn register_index(&self) -> usize {
        self.register_index.expect("register operand")
    }

    pub fn segment(&self) -> SegmentRegister {
        debug_assert!(!self.is_register());
        self.segment
    }

    pub fn offset(&self) -> u32 {
        debug_assert!(!self.is_register());
        if self.a32 {
            self.offset
        } else {
            self.offset & 0xffff
        }
    }

    pub fn read<T: ValueWidth>(&self, cpu: &mut Cpu) -> MemResult<T> {
        if let Some(index) = self.register_index {
            return Ok(cpu.read_reg::<T>(index));
        }
        cpu.read_memory(
            self.segment,
            self.offset(),
            crate::fields::MemoryAccessType::Read,
        )
    }

    pub fn write<T: ValueWidth>(&self, cpu: &mut Cpu, value: T) -> MemResult<()> {
        if let Some(index) = self.register_index {
            cpu.write_reg::<T>(index, value);
            return Ok(());
        }
        cpu.write_memory(self.segment, self.offset(), value)
    }

    pub fn read8(&self, cpu: &mut Cpu) -> MemResult<u8> {
        self.read(cpu)
    }
    pub fn read16(&self, cpu: &mut Cpu) -> MemResult<u16> {
        self.read(cpu)
    }
    pub fn read32(&self, cpu: &mut Cpu) -> MemResult<u32> {
        self.read(cpu)
    }
    pub fn write8(&self, cpu: &mut Cpu, value: u8) -> MemResult<()> {
        self.write(cpu, value)
    }
    pub fn write16(&self, cpu: &mut Cpu, value: u16) -> MemResult<()> {
        self.write(cpu, value)
    }
    pub fn write32(&self, cpu: &mut Cpu, value: u32) -> MemResult<()> {
        self.write(cpu, value)
    }

    /// The SMSW/SLDT/STR/`MOV r/m, seg` quirk: a register destination takes
    /// the full 32-bit value when the operand size is 32, a memory
    /// destination always takes 16 bits.
    pub fn write_special(&self, cpu: &mut Cpu, value: u32, o32: bool) -> MemResult<()> {
        if o32 && self.is_register() {
            cpu.write_reg32(self.register_index(), value);
            return Ok(());
        }
        self.write(cpu, value as u16)
    }
}

/// One decoded instruction: opcode bytes, prefix state, effective sizes,
/// immediates, the r/m reference and the handler to run.
pub struct Instruction {
    op: u8,
    sub_op: u8,
    imm1: u32,
    imm2: u32,
    register_index: usize,
    a32: bool,
    o32: bool,
    has_lock_prefix: bool,
    has_sub_op: bool,
    has_rm: bool,
    imm1_bytes: u32,
    imm2_bytes: u32,
    prefix_bytes: u32,
    segment_prefix: Option<SegmentRegister>,
    has_operand_size_override: bool,
    has_address_size_override: bool,
    rep_prefix: u8,
    pub modrm: MemoryOrRegisterReference,
    handler: Option<Handler>,
    mnemonic: &'static str,
}

impl Instruction {
    pub fn from_stream(
        stream: &mut dyn InstructionStream,
        o32: bool,
        a32: bool,
    ) -> MemResult<Instruction> {
        let mut insn = Instruction {
            op: 0,
            sub_op: 0,
            imm1: 0,
            imm2: 0,
            register_index: 0,
            a32,
            o32,
            has_lock_prefix: false,
            has_sub_op: false,
            has_rm: false,
            imm1_bytes: 0,
            imm2_bytes: 0,
            prefix_bytes: 0,
            segment_prefix: None,
            has_operand_size_override: false,
            has_address_size_override: false,
            rep_prefix: 0,
            modrm: MemoryOrRegisterReference::default(),
            handler: None,
            mnemonic: "",
        };

        loop {
            let opbyte = stream.read_instruction8()?;
            if opbyte == prefix::OPERAND_SIZE_OVERRIDE {
                insn.o32 = !o32;
                insn.has_operand_size_override = true;
            } else if opbyte == prefix::ADDRESS_SIZE_OVERRIDE {
                insn.a32 = !a32;
                insn.has_address_size_override = true;
            } else if opbyte == prefix::REPZ || opbyte == prefix::REPNZ {
                insn.rep_prefix = opbyte;
            } else if opbyte == prefix::LOCK {
                insn.has_lock_prefix = true;
            } else if let Some(segment) = to_segment_prefix(opbyte) {
                insn.segment_prefix = Some(segment);
            } else {
                insn.op = opbyte;
                break;
            }
            insn.prefix_bytes += 1;
        }

        let tables = tables();
        let mut entry: &Entry = if insn.op == 0x0f {
            insn.has_sub_op = true;
            insn.sub_op = stream.read_instruction8()?;
            if insn.o32 {
                &tables.table_0f32[insn.sub_op as usize]
            } else {
                &tables.table_0f16[insn.sub_op as usize]
            }
        } else if insn.o32 {
            &tables.table32[insn.op as usize]
        } else {
            &tables.table16[insn.op as usize]
        };

        insn.has_rm = entry.has_rm;
        if insn.has_rm {
            insn.modrm.decode(stream, insn.a32)?;
            insn.register_index = (insn.modrm.rm >> 3 & 7) as usize;
        } else if insn.has_sub_op {
            insn.register_index = (insn.sub_op & 7) as usize;
        } else {
            insn.register_index = (insn.op & 7) as usize;
        }

        let has_slash = entry.format == Format::MultibyteWithSlash;
        if has_slash {
            match entry.slashes.as_ref() {
                Some(slashes) => entry = &slashes[insn.slash() as usize],
                None => {
                    log::debug!(target: "cpu", "instruction {:#04x} has no slash table", insn.op);
                    return Ok(insn);
                }
            }
        }

        if entry.handler.is_none() {
            if insn.has_sub_op {
                log::debug!(
                    target: "cpu",
                    "instruction 0f {:02x}{} not understood",
                    insn.sub_op,
                    if has_slash { format!(" /{}", insn.slash()) } else { String::new() }
                );
            } else {
                log::debug!(
                    target: "cpu",
                    "instruction {:02x}{} not understood",
                    insn.op,
                    if has_slash { format!(" /{}", insn.slash()) } else { String::new() }
                );
            }
            return Ok(insn);
        }

        if insn.has_lock_prefix && !entry.lock_allowed {
            log::debug!(target: "cpu", "LOCK prefix on a non-lockable instruction raises #UD");
            return Ok(insn);
        }

        insn.mnemonic = entry.mnemonic;
        insn.imm1_bytes = entry.imm1.bytes(insn.a32);
        insn.imm2_bytes = entry.imm2.bytes(insn.a32);

        // Consume immediates if present; the second one comes first in the
        // byte stream (far pointers are offset-then-selector).
        if insn.imm2_bytes != 0 {
            insn.imm2 = stream.read_bytes(insn.imm2_bytes)?;
        }
        if insn.imm1_bytes != 0 {
            insn.imm1 = stream.read_bytes(insn.imm1_bytes)?;
        }

        insn.handler = entry.handler;
        Ok(insn)
    }

    pub fn is_valid(&self) -> bool {
        self.handler.is_some()
    }

    pub fn handler(&self) -> Option<Handler> {
        self.handler
    }

    pub fn mnemonic(&self) -> &'static str {
        self.mnemonic
    }

    pub fn op(&self) -> u8 {
        self.op
    }

    pub fn sub_op(&self) -> u8 {
        self.sub_op
    }

    pub fn rm(&self) -> u8 {
        self.modrm.rm
    }

    pub fn slash(&self) -> u8 {
        debug_assert!(self.has_rm);
        self.modrm.rm >> 3 & 7
    }

    pub fn has_rm(&self) -> bool {
        self.has_rm
    }

    pub fn has_sub_op(&self) -> bool {
        self.has_sub_op
    }

    pub fn register_index(&self) -> usize {
        self.register_index
    }

    pub fn segment_register_index(&self) -> Option<SegmentRegister> {
        SegmentRegister::from_index(self.register_index)
    }

    pub fn segment_prefix(&self) -> Option<SegmentRegister> {
        self.segment_prefix
    }

    pub fn has_segment_prefix(&self) -> bool {
        self.segment_prefix.is_some()
    }

    pub fn has_address_size_override_prefix(&self) -> bool {
        self.has_address_size_override
    }

    pub fn has_operand_size_override_prefix(&self) -> bool {
        self.has_operand_size_override
    }

    pub fn has_lock_prefix(&self) -> bool {
        self.has_lock_prefix
    }

    pub fn has_rep_prefix(&self) -> bool {
        self.rep_prefix != 0
    }

    pub fn rep_prefix(&self) -> u8 {
        self.rep_prefix
    }

    pub fn o32(&self) -> bool {
        self.o32
    }

    pub fn a32(&self) -> bool {
        self.a32
    }

    pub fn imm8(&self) -> u8 {
        debug_assert_eq!(self.imm1_bytes, 1);
        self.imm1 as u8
    }
    pub fn imm16(&self) -> u16 {
        debug_assert_eq!(self.imm1_bytes, 2);
        self.imm1 as u16
    }
    pub fn imm32(&self) -> u32 {
        debug_assert_eq!(self.imm1_bytes, 4);
        self.imm1
    }

    pub fn imm8_1(&self) -> u8 {
        self.imm8()
    }
    pub fn imm8_2(&self) -> u8 {
        debug_assert_eq!(self.imm2_bytes, 1);
        self.imm2 as u8
    }
    pub fn imm16_1(&self) -> u16 {
        self.imm16()
    }
    pub fn imm16_2(&self) -> u16 {
        debug_assert_eq!(self.imm2_bytes, 2);
        self.imm2 as u16
    }
    pub fn imm32_1(&self) -> u32 {
        self.imm32()
    }
    pub fn imm32_2(&self) -> u32 {
        debug_assert_eq!(self.imm2_bytes, 4);
        self.imm2
    }

    /// The address-sized immediate of `moff` and near-branch forms.
    pub fn imm_address(&self) -> u32 {
        if self.a32 {
            self.imm32()
        } else {
            self.imm16() as u32
        }
    }

    pub fn imm_address16_16(&self) -> LogicalAddress {
        LogicalAddress::new(self.imm16_1(), self.imm16_2() as u32)
    }
    pub fn imm_address16_32(&self) -> LogicalAddress {
        LogicalAddress::new(self.imm16_1(), self.imm32_2())
    }

    /// Condition code for Jcc/SETcc/CMOVcc.
    pub fn cc(&self) -> u8 {
        if self.has_sub_op {
            self.sub_op & 0xf
        } else {
            self.op & 0xf
        }
    }

    pub fn reg<T: ValueWidth>(&self, cpu: &Cpu) -> T {
        cpu.read_reg(self.register_index)
    }

    pub fn set_reg<T: ValueWidth>(&self, cpu: &mut Cpu, value: T) {
        cpu.write_reg(self.register_index, value)
    }

    /// Total byte length of the decoded instruction.
    pub fn length(&self) -> u32 {
        let mut length = 1 + self.prefix_bytes;
        if self.has_sub_op {
            length += 1;
        }
        if self.has_rm {
            length += 1;
            if self.modrm.has_sib {
                length += 1;
            }
            length += self.modrm.displacement_bytes as u32;
        }
        length + self.imm1_bytes + self.imm2_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8], o32: bool, a32: bool) -> (Instruction, usize) {
        build_opcode_tables_if_needed();
        let mut stream = SimpleInstructionStream::new(bytes);
        let insn = Instruction::from_stream(&mut stream, o32, a32).expect("decode");
        (insn, stream.position())
    }

    #[test]
    fn decodes_mov_ax_imm16() {
        let (insn, consumed) = decode(&[0xb8, 0x34, 0x12], false, false);
        assert!(insn.is_valid());
        assert_eq!(insn.mnemonic(), "MOV");
        assert_eq!(insn.imm16(), 0x1234);
        assert_eq!(insn.register_index(), 0);
        assert_eq!(consumed, 3);
        assert_eq!(insn.length(), 3);
    }

    #[test]
    fn decodes_slash_groups() {
        // F7 /5 is IMUL r/m16 in the 16-bit table.
        let (insn, consumed) = decode(&[0xf7, 0xe9], false, false);
        assert!(insn.is_valid());
        assert_eq!(insn.mnemonic(), "IMUL");
        assert_eq!(insn.slash(), 5);
        assert!(insn.modrm.is_register());
        assert_eq!(insn.modrm.register_index(), 1);
        assert_eq!(consumed, 2);
    }

    #[test]
    fn prefixes_flip_the_default_sizes() {
        // 66 40 in a 16-bit segment is INC EAX.
        let (insn, _) = decode(&[0x66, 0x40], false, false);
        assert!(insn.o32());
        assert!(!insn.a32());
        assert_eq!(insn.mnemonic(), "INC");
        assert_eq!(insn.length(), 2);
    }

    #[test]
    fn lock_on_non_lockable_instruction_is_invalid() {
        let (insn, _) = decode(&[0xf0, 0x90], false, false); // LOCK NOP
        assert!(!insn.is_valid());
    }

    #[test]
    fn sixteen_bit_modrm_with_displacement() {
        // 8B 46 08: MOV AX, [BP+8] (default segment SS at resolve time).
        let (insn, consumed) = decode(&[0x8b, 0x46, 0x08], false, false);
        assert!(insn.is_valid());
        assert!(!insn.modrm.is_register());
        assert_eq!(insn.modrm.displacement, 8);
        assert_eq!(consumed, 3);
    }

    #[test]
    fn thirty_two_bit_modrm_with_sib() {
        // 8B 04 88: MOV EAX, [EAX+ECX*4] in a 32-bit segment.
        let (insn, consumed) = decode(&[0x8b, 0x04, 0x88], true, true);
        assert!(insn.is_valid());
        assert!(insn.modrm.has_sib);
        assert_eq!(consumed, 3);
        assert_eq!(insn.length(), 3);
    }

    #[test]
    fn two_byte_opcodes_consume_the_sub_op() {
        let (insn, consumed) = decode(&[0x0f, 0x31], false, false);
        assert!(insn.is_valid());
        assert_eq!(insn.mnemonic(), "RDTSC");
        assert!(insn.has_sub_op());
        assert_eq!(consumed, 2);
    }

    #[test]
    fn moff_immediates_follow_the_address_size(){
        let (insn, consumed) = decode(&[0xa0, 0x78, 0x56, 0x34, 0x12], false, true);
        assert!(insn.is_valid());
        assert_eq!(insn.imm_address(), 0x1234_5678);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn segment_override_is_recorded() {
        let (insn, _) = decode(&[0x26, 0x8b, 0x04], false, false); // ES: MOV AX, [SI]
        assert_eq!(insn.segment_prefix(), Some(SegmentRegister::Es));
    }

    #[test]
    fn decoded_length_equals_bytes_consumed() {
        let cases: &[(&[u8], bool, bool)] = &[
            (&[0x90], false, false),
            (&[0x66, 0xb8, 0x78, 0x56, 0x34, 0x12], false, false),
            (&[0x81, 0xc3, 0x34, 0x12], false, false),
            (&[0x0f, 0xba, 0xe0, 0x07], false, false),
            (&[0xc8, 0x40, 0x00, 0x02], false, false),
            (&[0xea, 0x00, 0x10, 0x00, 0xf0], false, false),
            (&[0x8b, 0x84, 0x88, 0x44, 0x33, 0x22, 0x11], true, true),
        ];
        for (bytes, o32, a32) in cases {
            let (insn, consumed) = decode(bytes, *o32, *a32);
            assert!(insn.is_valid(), "case {:02x?}", bytes);
            assert_eq!(insn.length() as usize, consumed, "case {:02x?}", bytes);
        }
    }
}
