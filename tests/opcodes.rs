// Instruction-level scenarios run on a bare machine: code bytes are placed
// in flat memory, CS:IP points at them, and the CPU single-steps with the
// normal fetch-decode-execute driver.

use em86::processor::Cpu;
use em86::settings::RuntimeOptions;
use em86::{Fault, LinearAddress, LogicalAddress, MemoryAccessType, PhysicalAddress, SegmentRegister};

const CODE_BASE: u32 = 0x400;

fn cpu_with_code(bytes: &[u8]) -> Cpu {
    let mut cpu = Cpu::new(RuntimeOptions::default(), true);
    cpu.set_reset_vector(LogicalAddress::new(0x0000, CODE_BASE));
    cpu.reset();
    cpu.write_segment_register(SegmentRegister::Ss, 0x9000)
        .unwrap();
    cpu.set_sp(0x1000);
    for (index, &byte) in bytes.iter().enumerate() {
        cpu.write_physical(PhysicalAddress(CODE_BASE + index as u32), byte);
    }
    cpu
}

fn step(cpu: &mut Cpu, count: usize) {
    for _ in 0..count {
        cpu.execute_one_instruction();
    }
}

#[test]
fn mov_then_inc_updates_the_lazy_flags() {
    // MOV AX, 0x1234; INC AX
    let mut cpu = cpu_with_code(&[0xb8, 0x34, 0x12, 0x40]);
    cpu.set_cf(true); // INC must leave CF alone
    step(&mut cpu, 2);
    assert_eq!(cpu.ax(), 0x1235);
    assert!(!cpu.of());
    assert!(!cpu.get_zf());
    assert!(!cpu.get_sf());
    assert!(cpu.get_pf()); // 0x35 has four bits set
    assert!(cpu.cf());
}

#[test]
fn inc_wraps_to_zero_with_adjust() {
    // MOV AX, 0xFFFF; INC AX
    let mut cpu = cpu_with_code(&[0xb8, 0xff, 0xff, 0x40]);
    cpu.set_cf(false);
    step(&mut cpu, 2);
    assert_eq!(cpu.ax(), 0x0000);
    assert!(cpu.get_zf());
    assert!(cpu.get_pf());
    assert!(!cpu.get_sf());
    assert!(!cpu.of());
    assert!(!cpu.cf());
    assert!(cpu.af()); // low nibble rolled over
}

#[test]
fn real_mode_interrupt_goes_through_the_ivt() {
    // INT 0x21 with IVT[0x21] = 7856:3412.
    let mut cpu = cpu_with_code(&[0xcd, 0x21]);
    cpu.write_physical(PhysicalAddress(0x84), 0x12u8);
    cpu.write_physical(PhysicalAddress(0x85), 0x34u8);
    cpu.write_physical(PhysicalAddress(0x86), 0x56u8);
    cpu.write_physical(PhysicalAddress(0x87), 0x78u8);
    cpu.set_if(true);
    cpu.set_tf(false);
    let flags_before = cpu.get_flags();

    step(&mut cpu, 1);

    assert_eq!(cpu.cs(), 0x7856);
    assert_eq!(cpu.ip(), 0x3412);
    assert!(!cpu.get_if());
    assert!(!cpu.tf());

    // FLAGS, CS, IP in push order; IP of the next instruction on top.
    let sp = cpu.sp() as u32;
    assert_eq!(sp, 0x1000 - 6);
    let stack_base = 0x90000 + sp;
    assert_eq!(
        cpu.read_physical::<u16>(PhysicalAddress(stack_base)),
        (CODE_BASE + 2) as u16
    );
    assert_eq!(cpu.read_physical::<u16>(PhysicalAddress(stack_base + 2)), 0);
    assert_eq!(
        cpu.read_physical::<u16>(PhysicalAddress(stack_base + 4)),
        flags_before
    );
}

#[test]
fn interrupt_then_iret_round_trips_real_mode() {
    // INT 0x20 to a handler that is a lone IRET.
    let mut cpu = cpu_with_code(&[0xcd, 0x20]);
    // IVT[0x20] = 0000:0800
    cpu.write_physical(PhysicalAddress(0x80), 0x00u8);
    cpu.write_physical(PhysicalAddress(0x81), 0x08u8);
    cpu.write_physical(PhysicalAddress(0x82), 0x00u8);
    cpu.write_physical(PhysicalAddress(0x83), 0x00u8);
    cpu.write_physical(PhysicalAddress(0x800), 0xcfu8); // IRET
    cpu.set_if(true);

    step(&mut cpu, 1);
    assert_eq!(cpu.cs(), 0x0000);
    assert_eq!(cpu.ip(), 0x0800);

    step(&mut cpu, 1);
    assert_eq!(cpu.cs(), 0x0000);
    assert_eq!(cpu.ip() as u32, CODE_BASE + 2);
    assert!(cpu.get_if());
    assert_eq!(cpu.sp(), 0x1000);
}

#[test]
fn shl_by_one_sets_carry_and_overflow() {
    // MOV AL, 0x80; SHL AL, 1
    let mut cpu = cpu_with_code(&[0xb0, 0x80, 0xd0, 0xe0]);
    step(&mut cpu, 2);
    assert_eq!(cpu.al(), 0x00);
    assert!(cpu.cf());
    assert!(cpu.of());
    assert!(cpu.get_zf());
}

#[test]
fn page_fault_reports_the_linear_address() {
    let mut cpu = cpu_with_code(&[0x90]);
    // Enable paging with an empty page directory: everything faults as
    // not-present.
    cpu.set_control_register(3, 0x10000);
    cpu.set_control_register(0, cpu.cr0() | 0x8000_0001);

    let result: Result<u8, Fault> =
        cpu.read_linear(LinearAddress(0x1234_5678), MemoryAccessType::Read, None);
    match result {
        Err(Fault::PageFault { code, address }) => {
            assert_eq!(address, 0x1234_5678);
            // Not-present, read, supervisor.
            assert_eq!(code, 0b000);
        }
        other => panic!("expected a page fault, got {:?}", other),
    }
    assert_eq!(cpu.cr2(), 0x1234_5678);
}

#[test]
fn rep_movsb_faulting_mid_loop_is_restartable() {
    const PTE_P: u32 = 0x01;
    const PTE_RW: u32 = 0x02;

    // REP MOVSB
    let mut cpu = cpu_with_code(&[0xf3, 0xa4]);

    // Identity-map pages 0..4 and leave page 1 (0x1000..0x1fff) not present.
    let page_directory = 0x10000u32;
    let page_table = 0x11000u32;
    cpu.write_physical(PhysicalAddress(page_directory), page_table | PTE_P | PTE_RW);
    for page in 0u32..8 {
        if page == 1 {
            continue;
        }
        cpu.write_physical(
            PhysicalAddress(page_table + page * 4),
            (page * 0x1000) | PTE_P | PTE_RW,
        );
    }
    cpu.set_control_register(3, page_directory);
    cpu.set_control_register(0, cpu.cr0() | 0x8000_0001);

    // Source in page 0, destination runs into the unmapped page on the
    // fifth byte.
    cpu.set_si(0x500);
    cpu.set_di(0x0ffc);
    cpu.set_cx(9);
    cpu.set_df(false);

    cpu.execute_one_instruction();

    // Four iterations completed; the registers are positioned to resume and
    // EIP is back on the REP-prefixed instruction.
    assert_eq!(cpu.cx(), 5);
    assert_eq!(cpu.si(), 0x504);
    assert_eq!(cpu.di(), 0x1000);
    assert_eq!(cpu.eip(), CODE_BASE);
    assert_eq!(cpu.cr2(), 0x1000);
}

#[test]
fn xchg_and_xadd() {
    // MOV AX, 5; MOV BX, 7; XCHG AX, BX; XADD AX, BX
    let mut cpu = cpu_with_code(&[
        0xb8, 0x05, 0x00, // MOV AX, 5
        0xbb, 0x07, 0x00, // MOV BX, 7
        0x93, // XCHG AX, BX
        0x0f, 0xc1, 0xd8, // XADD AX, BX
    ]);
    step(&mut cpu, 3);
    assert_eq!(cpu.ax(), 7);
    assert_eq!(cpu.bx(), 5);
    step(&mut cpu, 1);
    assert_eq!(cpu.bx(), 7); // old destination
    assert_eq!(cpu.ax(), 12); // sum
}

#[test]
fn div_by_zero_delivers_vector_zero() {
    // IVT[0] = 0000:0900; XOR BL, BL; DIV BL
    let mut cpu = cpu_with_code(&[0x30, 0xdb, 0xf6, 0xf3]);
    cpu.write_physical(PhysicalAddress(0x0), 0x00u8);
    cpu.write_physical(PhysicalAddress(0x1), 0x09u8);
    cpu.write_physical(PhysicalAddress(0x2), 0x00u8);
    cpu.write_physical(PhysicalAddress(0x3), 0x00u8);

    step(&mut cpu, 2);
    assert_eq!(cpu.cs(), 0x0000);
    assert_eq!(cpu.ip(), 0x0900);

    // The return address on the stack points at the faulting DIV, so the
    // handler may fix BL and IRET to retry.
    let sp = cpu.sp() as u32;
    assert_eq!(
        cpu.read_physical::<u16>(PhysicalAddress(0x90000 + sp)),
        (CODE_BASE + 2) as u16
    );
}

#[test]
fn loop_decrements_the_counter() {
    // MOV CX, 3; label: LOOP label (jumps back to itself until CX = 0)
    let mut cpu = cpu_with_code(&[0xb9, 0x03, 0x00, 0xe2, 0xfe]);
    step(&mut cpu, 1);
    // First two LOOPs jump back to themselves.
    step(&mut cpu, 1);
    assert_eq!(cpu.cx(), 2);
    assert_eq!(cpu.ip() as u32, CODE_BASE + 3);
    step(&mut cpu, 1);
    assert_eq!(cpu.cx(), 1);
    assert_eq!(cpu.ip() as u32, CODE_BASE + 3);
    // Final LOOP falls through.
    step(&mut cpu, 1);
    assert_eq!(cpu.cx(), 0);
    assert_eq!(cpu.ip() as u32, CODE_BASE + 5);
}

#[test]
fn pusha_popa_round_trips() {
    // PUSHA; MOV AX, 0; MOV BX, 0; POPA
    let mut cpu = cpu_with_code(&[0x60, 0xb8, 0x00, 0x00, 0xbb, 0x00, 0x00, 0x61]);
    cpu.set_ax(0x1111);
    cpu.set_bx(0x2222);
    cpu.set_cx(0x3333);
    cpu.set_dx(0x4444);
    cpu.set_si(0x5555);
    cpu.set_di(0x6666);
    cpu.set_bp(0x7777);
    let sp_before = cpu.sp();
    step(&mut cpu, 4);
    assert_eq!(cpu.ax(), 0x1111);
    assert_eq!(cpu.bx(), 0x2222);
    assert_eq!(cpu.cx(), 0x3333);
    assert_eq!(cpu.dx(), 0x4444);
    assert_eq!(cpu.si(), 0x5555);
    assert_eq!(cpu.di(), 0x6666);
    assert_eq!(cpu.bp(), 0x7777);
    assert_eq!(cpu.sp(), sp_before);
}

#[test]
fn string_copy_with_rep_movsb() {
    // REP MOVSB from DS:SI to ES:DI in flat real mode.
    let mut cpu = cpu_with_code(&[0xf3, 0xa4]);
    for (index, &byte) in b"hello".iter().enumerate() {
        cpu.write_physical(PhysicalAddress(0x600 + index as u32), byte);
    }
    cpu.set_si(0x600);
    cpu.set_di(0x700);
    cpu.set_cx(5);
    step(&mut cpu, 1);
    assert_eq!(cpu.cx(), 0);
    for (index, &byte) in b"hello".iter().enumerate() {
        assert_eq!(
            cpu.read_physical::<u8>(PhysicalAddress(0x700 + index as u32)),
            byte
        );
    }
}

#[test]
fn scasb_with_repnz_finds_a_byte() {
    // REPNZ SCASB looking for 'l' in "hello".
    let mut cpu = cpu_with_code(&[0xf2, 0xae]);
    for (index, &byte) in b"hello".iter().enumerate() {
        cpu.write_physical(PhysicalAddress(0x600 + index as u32), byte);
    }
    cpu.set_di(0x600);
    cpu.set_cx(5);
    cpu.set_al(b'l');
    step(&mut cpu, 1);
    assert!(cpu.get_zf());
    assert_eq!(cpu.di(), 0x603); // one past the match
    assert_eq!(cpu.cx(), 2);
}

#[test]
fn cmpxchg_follows_the_accumulator_contract() {
    // CMPXCHG BX, CX twice: first with a match, then with a mismatch.
    let mut cpu = cpu_with_code(&[0x0f, 0xb1, 0xcb, 0x0f, 0xb1, 0xcb]);
    cpu.set_ax(0x10);
    cpu.set_bx(0x10);
    cpu.set_cx(0x42);
    step(&mut cpu, 1);
    assert!(cpu.get_zf());
    assert_eq!(cpu.bx(), 0x42);

    step(&mut cpu, 1);
    assert!(!cpu.get_zf());
    assert_eq!(cpu.ax(), 0x42); // accumulator learns the current value
}

#[test]
fn bound_faults_outside_the_range() {
    // BOUND AX, [0x600] with bounds [5, 10]; IVT[5] = 0000:0a00.
    let mut cpu = cpu_with_code(&[0x62, 0x06, 0x00, 0x06]);
    cpu.write_physical(PhysicalAddress(0x600), 5u16);
    cpu.write_physical(PhysicalAddress(0x602), 10u16);
    cpu.write_physical(PhysicalAddress(5 * 4), 0x0a00u16);
    cpu.write_physical(PhysicalAddress(5 * 4 + 2), 0x0000u16);

    cpu.set_ax(7);
    step(&mut cpu, 1);
    assert_eq!(cpu.ip() as u32, CODE_BASE + 4); // in range, no trap

    let mut cpu = cpu_with_code(&[0x62, 0x06, 0x00, 0x06]);
    cpu.write_physical(PhysicalAddress(0x600), 5u16);
    cpu.write_physical(PhysicalAddress(0x602), 10u16);
    cpu.write_physical(PhysicalAddress(5 * 4), 0x0a00u16);
    cpu.write_physical(PhysicalAddress(5 * 4 + 2), 0x0000u16);
    cpu.set_ax(11);
    step(&mut cpu, 1);
    assert_eq!(cpu.ip(), 0x0a00); // #BR delivered
}

#[test]
fn hardware_interrupt_splits_a_rep_loop() {
    // A pending IRQ with IF=1 interrupts REP MOVSB between iterations and
    // the instruction resumes afterwards.
    let mut cpu = cpu_with_code(&[0xf3, 0xa4]);
    // IVT[8] (IRQ 0) = 0000:0b00 with a lone IRET there.
    cpu.write_physical(PhysicalAddress(8 * 4), 0x0b00u16);
    cpu.write_physical(PhysicalAddress(8 * 4 + 2), 0x0000u16);
    cpu.write_physical(PhysicalAddress(0xb00), 0xcfu8);

    cpu.set_si(0x600);
    cpu.set_di(0x700);
    cpu.set_cx(4);
    cpu.set_if(true);

    let irq = em86::IrqLine::new(cpu.irq_status(), 0);
    irq.raise_irq();

    // The loop aborts after one iteration with EIP rewound.
    cpu.execute_one_instruction();
    assert_eq!(cpu.eip(), CODE_BASE);
    assert!(cpu.cx() < 4 && cpu.cx() > 0);

    // The driver would now service the IRQ; after the ISR returns, stepping
    // the instruction again finishes the copy.
    let resumed_cx = cpu.cx();
    irq.lower_irq();
    cpu.execute_one_instruction();
    assert_eq!(cpu.cx(), 0);
    assert_eq!(cpu.si(), 0x600 + 4);
    assert!(resumed_cx > 0);
}
