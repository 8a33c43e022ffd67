// Protected-mode scenarios: gate dispatch and IRET symmetry, ring
// transitions through the TSS ring-0 stack, the I/O permission bitmap, and
// hardware task switching.

use em86::descriptors::raw_segment_descriptor;
use em86::processor::Cpu;
use em86::settings::RuntimeOptions;
use em86::{Fault, LinearAddress, LogicalAddress, PhysicalAddress, SegmentRegister};

const CODE_BASE: u32 = 0x400;
const GDT_BASE: u32 = 0x5000;
const IDT_BASE: u32 = 0x6000;
const TSS_BASE: u32 = 0x7000;

fn write_descriptor(cpu: &mut Cpu, index: u32, raw: (u32, u32)) {
    let (hi, lo) = raw;
    cpu.write_physical(PhysicalAddress(GDT_BASE + index * 8), lo);
    cpu.write_physical(PhysicalAddress(GDT_BASE + index * 8 + 4), hi);
}

fn write_idt_gate32(cpu: &mut Cpu, vector: u32, selector: u16, offset: u32, dpl: u8) {
    let lo = (selector as u32) << 16 | (offset & 0xffff);
    let hi = (offset & 0xffff_0000) | 1 << 15 | (dpl as u32) << 13 | 0xe << 8;
    cpu.write_physical(PhysicalAddress(IDT_BASE + vector * 8), lo);
    cpu.write_physical(PhysicalAddress(IDT_BASE + vector * 8 + 4), hi);
}

fn write_code(cpu: &mut Cpu, address: u32, bytes: &[u8]) {
    for (index, &byte) in bytes.iter().enumerate() {
        cpu.write_physical(PhysicalAddress(address + index as u32), byte);
    }
}

/// Flat 4 GiB ring-0 code and data at 0x08/0x10, ring-3 twins at 0x1b/0x23,
/// an available 32-bit TSS at 0x28.
fn enter_protected_mode(cpu: &mut Cpu) {
    write_descriptor(cpu, 1, raw_segment_descriptor(0, 0xf_ffff, 0xb, true, 0, true, true, true));
    write_descriptor(cpu, 2, raw_segment_descriptor(0, 0xf_ffff, 0x3, true, 0, true, true, true));
    write_descriptor(cpu, 3, raw_segment_descriptor(0, 0xf_ffff, 0xb, true, 3, true, true, true));
    write_descriptor(cpu, 4, raw_segment_descriptor(0, 0xf_ffff, 0x3, true, 3, true, true, true));
    write_descriptor(
        cpu,
        5,
        raw_segment_descriptor(TSS_BASE, 0x80, 0x9, false, 0, true, false, false),
    );

    cpu.set_gdtr(LinearAddress(GDT_BASE), 0x3f);
    cpu.set_idtr(LinearAddress(IDT_BASE), 0x7ff);
    cpu.set_control_register(0, cpu.cr0() | 1);
    cpu.write_segment_register(SegmentRegister::Cs, 0x08).unwrap();
    cpu.write_segment_register(SegmentRegister::Ss, 0x10).unwrap();
    cpu.write_segment_register(SegmentRegister::Ds, 0x10).unwrap();
    cpu.write_segment_register(SegmentRegister::Es, 0x10).unwrap();
    cpu.set_esp(0x9000);
}

fn fresh_cpu() -> Cpu {
    let mut cpu = Cpu::new(RuntimeOptions::default(), true);
    cpu.set_reset_vector(LogicalAddress::new(0x0000, CODE_BASE));
    cpu.reset();
    cpu
}

#[test]
fn protected_interrupt_and_iret_are_symmetric() {
    let mut cpu = fresh_cpu();
    enter_protected_mode(&mut cpu);
    write_idt_gate32(&mut cpu, 0x40, 0x08, 0x2000, 0);
    write_code(&mut cpu, 0x2000, &[0xcf]); // IRET

    cpu.set_eip(0x1000);
    cpu.set_cf(true);
    cpu.set_zf(true);
    cpu.set_if(true);
    let eflags_before = cpu.get_eflags();
    let esp_before = cpu.esp();

    cpu.interrupt(0x40, em86::InterruptSource::Internal, None)
        .unwrap();

    assert_eq!(cpu.cs(), 0x08);
    assert_eq!(cpu.eip(), 0x2000);
    assert!(!cpu.get_if()); // interrupt gate
    assert_eq!(cpu.esp(), esp_before - 12);

    // The frame is EIP, CS, EFLAGS from the stack top up.
    assert_eq!(cpu.read_physical::<u32>(PhysicalAddress(cpu.esp())), 0x1000);
    assert_eq!(
        cpu.read_physical::<u32>(PhysicalAddress(cpu.esp() + 4)),
        0x08
    );
    assert_eq!(
        cpu.read_physical::<u32>(PhysicalAddress(cpu.esp() + 8)),
        eflags_before
    );

    cpu.execute_one_instruction(); // the IRET

    assert_eq!(cpu.cs(), 0x08);
    assert_eq!(cpu.eip(), 0x1000);
    assert_eq!(cpu.esp(), esp_before);
    assert_eq!(cpu.get_eflags(), eflags_before);
}

#[test]
fn interrupt_from_ring_three_switches_to_the_tss_stack() {
    let mut cpu = fresh_cpu();
    enter_protected_mode(&mut cpu);

    // TSS ring-0 stack.
    cpu.write_physical(PhysicalAddress(TSS_BASE + 4), 0x9000u32); // esp0
    cpu.write_physical(PhysicalAddress(TSS_BASE + 8), 0x10u16); // ss0
    cpu.write_physical(PhysicalAddress(TSS_BASE + 102), 0x68u16); // iomap base

    // A user-callable gate into ring-0 code.
    write_idt_gate32(&mut cpu, 0x40, 0x08, 0x2000, 3);

    // LTR AX; IRET (to ring 3)
    write_code(&mut cpu, CODE_BASE, &[0x0f, 0x00, 0xd8, 0xcf]);
    cpu.set_ax(0x28);
    cpu.execute_one_instruction();
    assert_eq!(cpu.task_register().selector, 0x28);

    // Craft the ring-3 return frame: EIP, CS, EFLAGS, ESP, SS.
    cpu.set_esp(0x8000);
    cpu.write_physical(PhysicalAddress(0x8000), 0x4000u32);
    cpu.write_physical(PhysicalAddress(0x8004), 0x1bu32);
    cpu.write_physical(PhysicalAddress(0x8008), 0x0202u32);
    cpu.write_physical(PhysicalAddress(0x800c), 0x6000u32);
    cpu.write_physical(PhysicalAddress(0x8010), 0x23u32);
    write_code(&mut cpu, 0x4000, &[0xcd, 0x40]); // INT 0x40

    cpu.execute_one_instruction(); // IRET to ring 3
    assert_eq!(cpu.cpl(), 3);
    assert_eq!(cpu.cs(), 0x1b);
    assert_eq!(cpu.ss(), 0x23);
    assert_eq!(cpu.esp(), 0x6000);
    assert_eq!(cpu.eip(), 0x4000);

    cpu.execute_one_instruction(); // INT 0x40 escalates to ring 0
    assert_eq!(cpu.cpl(), 0);
    assert_eq!(cpu.cs() & !3, 0x08);
    assert_eq!(cpu.ss(), 0x10);
    assert_eq!(cpu.eip(), 0x2000);
    assert_eq!(cpu.esp(), 0x9000 - 20);

    // Frame: EIP, CS, EFLAGS, old ESP, old SS.
    assert_eq!(cpu.read_physical::<u32>(PhysicalAddress(cpu.esp())), 0x4002);
    assert_eq!(
        cpu.read_physical::<u32>(PhysicalAddress(cpu.esp() + 4)),
        0x1b
    );
    assert_eq!(
        cpu.read_physical::<u32>(PhysicalAddress(cpu.esp() + 12)),
        0x6000
    );
    assert_eq!(
        cpu.read_physical::<u32>(PhysicalAddress(cpu.esp() + 16)),
        0x23
    );
}

#[test]
fn io_permission_bitmap_gates_port_access() {
    let mut cpu = fresh_cpu();
    enter_protected_mode(&mut cpu);

    cpu.write_physical(PhysicalAddress(TSS_BASE + 102), 0x68u16); // iomap base
    // Block port 0x60 (byte 12, bit 0), leave 0x61 open.
    cpu.write_physical(PhysicalAddress(TSS_BASE + 0x68 + 12), 0x01u8);

    // LTR AX
    write_code(&mut cpu, CODE_BASE, &[0x0f, 0x00, 0xd8]);
    cpu.set_ax(0x28);
    cpu.execute_one_instruction();

    // VM86 forces the bitmap check regardless of IOPL.
    cpu.set_vm(true);
    cpu.set_iopl(0);

    match cpu.io_in::<u8>(0x60) {
        Err(Fault::GeneralProtectionFault { code: 0, .. }) => {}
        other => panic!("expected #GP(0), got {:?}", other),
    }
    assert!(cpu.io_in::<u8>(0x61).is_ok());

    // With the bit cleared the same port passes.
    cpu.write_physical(PhysicalAddress(TSS_BASE + 0x68 + 12), 0x00u8);
    assert!(cpu.io_in::<u8>(0x60).is_ok());
}

#[test]
fn task_switch_round_trips_the_register_file() {
    const TSS_A: u32 = TSS_BASE; // selector 0x28
    const TSS_B: u32 = 0x7800; // selector 0x30

    let mut cpu = fresh_cpu();
    enter_protected_mode(&mut cpu);
    write_descriptor(
        &mut cpu,
        6,
        raw_segment_descriptor(TSS_B, 0x80, 0x9, false, 0, true, false, false),
    );

    // Task B's saved state: flat segments, code at 0x3000.
    cpu.write_physical(PhysicalAddress(TSS_B + 32), 0x3000u32); // eip
    cpu.write_physical(PhysicalAddress(TSS_B + 36), 0x0202u32); // eflags
    cpu.write_physical(PhysicalAddress(TSS_B + 40), 0xb0b0_b0b0u32); // eax
    cpu.write_physical(PhysicalAddress(TSS_B + 56), 0x8000u32); // esp
    cpu.write_physical(PhysicalAddress(TSS_B + 72), 0x10u16); // es
    cpu.write_physical(PhysicalAddress(TSS_B + 76), 0x08u16); // cs
    cpu.write_physical(PhysicalAddress(TSS_B + 80), 0x10u16); // ss
    cpu.write_physical(PhysicalAddress(TSS_B + 84), 0x10u16); // ds
    cpu.write_physical(PhysicalAddress(TSS_B + 88), 0x10u16); // fs
    cpu.write_physical(PhysicalAddress(TSS_B + 92), 0x10u16); // gs

    // LTR AX; JMP far 0x30:0 (task switch to B).
    write_code(
        &mut cpu,
        CODE_BASE,
        &[0x0f, 0x00, 0xd8, 0xea, 0x00, 0x00, 0x00, 0x00, 0x30, 0x00],
    );
    // Task B immediately jumps back to task A.
    write_code(&mut cpu, 0x3000, &[0xea, 0x00, 0x00, 0x00, 0x00, 0x28, 0x00]);

    cpu.set_ax(0x28);
    cpu.execute_one_instruction(); // LTR

    cpu.set_eax(0x1111_1111);
    cpu.set_ebx(0x2222_2222);
    cpu.set_esi(0x3333_3333);

    cpu.execute_one_instruction(); // JMP into task B
    assert_eq!(cpu.task_register().selector, 0x30);
    assert_eq!(cpu.cs(), 0x08);
    assert_eq!(cpu.eip(), 0x3000);
    assert_eq!(cpu.eax(), 0xb0b0_b0b0);
    assert_eq!(cpu.esp(), 0x8000);
    assert!(!cpu.nt()); // JMP does not nest
    assert_ne!(cpu.cr0() & 0x8, 0); // CR0.TS

    cpu.execute_one_instruction(); // JMP back into task A
    assert_eq!(cpu.task_register().selector, 0x28);
    assert_eq!(cpu.eax(), 0x1111_1111);
    assert_eq!(cpu.ebx(), 0x2222_2222);
    assert_eq!(cpu.esi(), 0x3333_3333);
    assert_eq!(cpu.esp(), 0x9000);
    // Execution resumes right after the original far jump.
    assert_eq!(cpu.eip(), CODE_BASE + 10);
}

#[test]
fn null_selector_access_faults() {
    let mut cpu = fresh_cpu();
    enter_protected_mode(&mut cpu);
    cpu.write_segment_register(SegmentRegister::Es, 0).unwrap();

    let result = cpu.read_memory8(SegmentRegister::Es, 0x100);
    assert!(matches!(
        result,
        Err(Fault::GeneralProtectionFault { code: 0, .. })
    ));
}

#[test]
fn segment_limit_violations_fault() {
    let mut cpu = fresh_cpu();
    // A 256-byte data segment at 0x10.
    write_descriptor(
        &mut cpu,
        1,
        raw_segment_descriptor(0, 0xf_ffff, 0xb, true, 0, true, true, true),
    );
    write_descriptor(
        &mut cpu,
        2,
        raw_segment_descriptor(0, 0xff, 0x3, true, 0, true, false, false),
    );
    cpu.set_gdtr(LinearAddress(GDT_BASE), 0x17);
    cpu.set_control_register(0, cpu.cr0() | 1);
    cpu.write_segment_register(SegmentRegister::Cs, 0x08).unwrap();
    cpu.write_segment_register(SegmentRegister::Ds, 0x10).unwrap();

    assert!(cpu.read_memory8(SegmentRegister::Ds, 0xff).is_ok());
    assert!(matches!(
        cpu.read_memory8(SegmentRegister::Ds, 0x100),
        Err(Fault::GeneralProtectionFault { code: 0, .. })
    ));
    // A word read at the limit also spills over.
    assert!(cpu.read_memory16(SegmentRegister::Ds, 0xff).is_err());
}

#[test]
fn stack_segment_violations_raise_stack_faults() {
    let mut cpu = fresh_cpu();
    enter_protected_mode(&mut cpu);
    // Make SS a tiny 16-byte segment.
    write_descriptor(
        &mut cpu,
        2,
        raw_segment_descriptor(0, 0xf, 0x3, true, 0, true, true, false),
    );
    cpu.write_segment_register(SegmentRegister::Ss, 0x10).unwrap();

    let result = cpu.read_memory8(SegmentRegister::Ss, 0x20);
    assert!(matches!(result, Err(Fault::StackFault { selector: 0, .. })));
}

#[test]
fn lar_and_lsl_probe_descriptors() {
    let mut cpu = fresh_cpu();
    enter_protected_mode(&mut cpu);

    // LAR EAX, ECX; LSL EBX, ECX
    write_code(&mut cpu, CODE_BASE, &[0x0f, 0x02, 0xc1, 0x0f, 0x03, 0xd9]);
    cpu.set_ecx(0x10);
    cpu.execute_one_instruction();
    assert!(cpu.get_zf());
    cpu.execute_one_instruction();
    assert!(cpu.get_zf());
    assert_eq!(cpu.ebx(), 0xf_ffff << 12 | 0xfff); // page-granular limit
}
