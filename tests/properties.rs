// Property tests for the core invariants: flag laziness against eager
// recomputation, partial-register width masking, sign-extension round trips,
// segmentation limit checks, paging idempotence and decoder length
// consistency.

use proptest::prelude::*;

use em86::conversions::{sign_extended, ValueWidth};
use em86::descriptors::SegmentDescriptor;
use em86::parser::{build_opcode_tables_if_needed, Instruction, SimpleInstructionStream};
use em86::processor::Cpu;
use em86::settings::RuntimeOptions;
use em86::{LinearAddress, MemoryAccessType, PhysicalAddress};

fn cpu() -> Cpu {
    Cpu::new(RuntimeOptions::default(), true)
}

fn eager_parity(value: u8) -> bool {
    value.count_ones() % 2 == 0
}

fn check_lazy_flags<T: ValueWidth>(cpu: &mut Cpu, result: T) {
    assert_eq!(cpu.get_zf(), result.to_u64() == 0, "ZF for {:x}", result);
    assert_eq!(cpu.get_sf(), result.sign_bit(), "SF for {:x}", result);
    assert_eq!(
        cpu.get_pf(),
        eager_parity(result.to_u64() as u8),
        "PF for {:x}",
        result
    );
}

proptest! {
    #[test]
    fn lazy_flags_match_eager_add8(dest: u8, src: u8) {
        let mut cpu = cpu();
        let result = cpu.do_add(dest, src);
        prop_assert_eq!(result, dest.wrapping_add(src));
        check_lazy_flags(&mut cpu, result);
    }

    #[test]
    fn lazy_flags_match_eager_sub16(dest: u16, src: u16) {
        let mut cpu = cpu();
        let result = cpu.do_sub(dest, src);
        prop_assert_eq!(result, dest.wrapping_sub(src));
        prop_assert_eq!(cpu.cf(), dest < src);
        check_lazy_flags(&mut cpu, result);
    }

    #[test]
    fn lazy_flags_match_eager_logic32(dest: u32, src: u32) {
        let mut cpu = cpu();
        let result = cpu.do_and(dest, src);
        prop_assert_eq!(result, dest & src);
        prop_assert!(!cpu.cf());
        prop_assert!(!cpu.of());
        check_lazy_flags(&mut cpu, result);
    }

    #[test]
    fn byte_writes_preserve_the_rest_of_the_register(initial: u32, low: u8, high: u8) {
        let mut cpu = cpu();
        cpu.set_eax(initial);
        cpu.set_al(low);
        prop_assert_eq!(cpu.eax(), initial & 0xffff_ff00 | low as u32);
        cpu.set_ah(high);
        prop_assert_eq!(
            cpu.eax(),
            initial & 0xffff_0000 | (high as u32) << 8 | low as u32
        );
    }

    #[test]
    fn word_writes_preserve_the_high_half(initial: u32, word: u16) {
        let mut cpu = cpu();
        cpu.set_ebx(initial);
        cpu.set_bx(word);
        prop_assert_eq!(cpu.ebx(), initial & 0xffff_0000 | word as u32);
    }

    #[test]
    fn sign_extension_round_trips(byte: u8, word: u16) {
        prop_assert_eq!(sign_extended::<u8, u16>(byte), byte as i8 as i16 as u16);
        prop_assert_eq!(sign_extended::<u8, u32>(byte), byte as i8 as i32 as u32);
        prop_assert_eq!(sign_extended::<u16, u32>(word), word as i16 as i32 as u32);
    }

    #[test]
    fn segment_limit_checks_are_exact(
        limit in 0u32..0x2_0000,
        offset in 0u32..0x4_0000,
        size in prop::sample::select(vec![1u32, 2, 4]),
    ) {
        let mut cpu = cpu();
        let descriptor = SegmentDescriptor {
            base: 0,
            limit,
            effective_limit: limit,
            index: 0x10,
            type_code: 0x3, // data, writable
            dpl: 0,
            rpl: 0,
            present: true,
            d: true,
            granularity: false,
            avl: false,
            null: false,
            loaded_in_ss: false,
        };
        // Force protected mode so the checks run.
        cpu.set_control_register(0, cpu.cr0() | 1);
        let expect_ok = offset as u64 + size as u64 - 1 <= limit as u64;
        let result = match size {
            1 => cpu.validate_address::<u8>(&descriptor, offset, MemoryAccessType::Read),
            2 => cpu.validate_address::<u16>(&descriptor, offset, MemoryAccessType::Read),
            _ => cpu.validate_address::<u32>(&descriptor, offset, MemoryAccessType::Read),
        };
        prop_assert_eq!(result.is_ok(), expect_ok);
    }

    #[test]
    fn paging_translation_is_idempotent(page in 0u32..8, offset in 0u32..0x1000) {
        const PTE_P: u32 = 0x01;
        const PTE_RW: u32 = 0x02;
        const PTE_ACCESSED: u32 = 0x20;
        const PTE_DIRTY: u32 = 0x40;

        let mut cpu = cpu();
        let page_directory = 0x10000;
        let page_table = 0x11000;
        cpu.write_physical(
            PhysicalAddress(page_directory),
            page_table | PTE_P | PTE_RW,
        );
        for index in 0u32..8 {
            cpu.write_physical(
                PhysicalAddress(page_table + index * 4),
                (index * 0x1000) | PTE_P | PTE_RW,
            );
        }
        cpu.set_control_register(3, page_directory);
        cpu.set_control_register(0, cpu.cr0() | 0x8000_0001);

        let linear = LinearAddress(page * 0x1000 + offset);
        let first = cpu
            .translate_address(linear, MemoryAccessType::Read, None)
            .unwrap();
        prop_assert_eq!(first.get(), linear.get());

        let pte = cpu.read_physical::<u32>(PhysicalAddress(page_table + page * 4));
        prop_assert_ne!(pte & PTE_ACCESSED, 0);
        prop_assert_eq!(pte & PTE_DIRTY, 0);

        // Translating again changes nothing.
        let second = cpu
            .translate_address(linear, MemoryAccessType::Read, None)
            .unwrap();
        prop_assert_eq!(second, first);
        let pte_again = cpu.read_physical::<u32>(PhysicalAddress(page_table + page * 4));
        prop_assert_eq!(pte_again, pte);

        // A write makes the dirty bit stick.
        cpu.translate_address(linear, MemoryAccessType::Write, None)
            .unwrap();
        let pte_dirty = cpu.read_physical::<u32>(PhysicalAddress(page_table + page * 4));
        prop_assert_ne!(pte_dirty & PTE_DIRTY, 0);
        cpu.translate_address(linear, MemoryAccessType::Read, None)
            .unwrap();
        let pte_after = cpu.read_physical::<u32>(PhysicalAddress(page_table + page * 4));
        prop_assert_ne!(pte_after & PTE_DIRTY, 0);
    }

    #[test]
    fn decoded_length_matches_bytes_consumed(
        bytes in prop::collection::vec(any::<u8>(), 1..24),
        o32: bool,
        a32: bool,
    ) {
        build_opcode_tables_if_needed();
        let mut stream = SimpleInstructionStream::new(&bytes);
        if let Ok(insn) = Instruction::from_stream(&mut stream, o32, a32) {
            if insn.is_valid() {
                prop_assert_eq!(insn.length() as usize, stream.position());
            }
        }
    }
}
