//! End-to-end scenarios driving the full assemble -> link -> run pipeline.

use kr32::assembler;
use kr32::cpu::{Cpu, Mode, NullInput};
use kr32::exception::ExceptionCode;
use kr32::linker;

fn assemble_and_run(source: &str, memory_size: usize) -> Cpu {
    let object = assembler::assemble(source).expect("assemble failed");
    let image = linker::link(&object, None).expect("link failed");
    let mut cpu = Cpu::new(memory_size, false);
    cpu.memory.load_image(&image);
    cpu.run(&mut NullInput);
    cpu
}

#[test]
fn identity() {
    let object = assembler::assemble("ldi r0, 0x2A\nhlt").unwrap();
    let image = linker::link(&object, None).unwrap();
    assert_eq!(image, vec![0x01, 0x00, 0x2A, 0x00, 0x00, 0x00, 0x60]);

    let mut cpu = Cpu::new(0x1000, false);
    cpu.memory.load_image(&image);
    cpu.run(&mut NullInput);
    assert_eq!(cpu.registers.gp[0], 0x2A);
    assert!(cpu.halted);
}

#[test]
fn arithmetic() {
    let cpu = assemble_and_run("ldi r1, 5\nldi r2, 3\nsub r0, r1, r2\nhlt", 0x1000);
    assert_eq!(cpu.registers.gp[0], 2);
}

#[test]
fn labels_loop_to_fixed_point() {
    let source = "
        ldi r0, 0
        loop: ldi r1, 1
              add r0, r0, r1
              ldi r2, 3
              sub r2, r2, r0
              jnzi r2, loop
              hlt
    ";
    let cpu = assemble_and_run(source, 0x1000);
    assert_eq!(cpu.registers.gp[0], 3);
}

#[test]
fn stack_push_pop_preserves_value_and_sp() {
    let source = "
        ldi sp, 0x100
        ldi r0, 0x1234
        push r0
        ldi r0, 0
        pop r0
        hlt
    ";
    let cpu = assemble_and_run(source, 0x1000);
    assert_eq!(cpu.registers.gp[0], 0x1234);
    assert_eq!(cpu.registers.sp, 0x100);
}

#[test]
fn unhandled_divide_by_zero_halts() {
    let source = "
        ldi r1, 0
        ldi r2, 0
        div r0, r1, r2
        hlt
    ";
    let cpu = assemble_and_run(source, 0x1000);
    assert!(cpu.halted);
}

#[test]
fn privilege_violation_on_sys_register_access_after_mode_switch() {
    let source = "
        sys 0x04
        ldr r0, sys0
        hlt
    ";
    let cpu = assemble_and_run(source, 0x1000);
    assert!(cpu.halted);
    assert_eq!(cpu.mode, Mode::User);
}

#[test]
fn handler_address_survives_a_caught_exception() {
    // Install a handler, then divide by zero; the handler records the exception
    // code and faulting ip into r3/r4 before halting.
    let source = "
        ldi r0, handler
        ldr sys0, r0
        sys 0x03
        ldi r1, 0
        ldi r2, 0
        div r5, r1, r2
        hlt
        handler:
            ldr r3, sys0
            ldr r4, sys1
            hlt
    ";
    let object = assembler::assemble(source).unwrap();
    let image = linker::link(&object, None).unwrap();
    let mut cpu = Cpu::new(0x1000, false);
    cpu.memory.load_image(&image);
    cpu.run(&mut NullInput);

    assert!(cpu.halted);
    assert_eq!(cpu.registers.gp[3], ExceptionCode::DivideByZero.code() as u32);
}

#[test]
fn container_roundtrips_through_linker() {
    let object = assembler::assemble(".data\n=42\n.text\nhlt").unwrap();
    let container = kr32::container::parse(&object).unwrap();
    assert!(container.sections.iter().any(|s| s.name == ".data"));
    assert!(container.sections.iter().any(|s| s.name == ".text"));

    let image = linker::link(&object, None).unwrap();
    // .text (hlt) first, then .data.
    assert_eq!(image[0], 0x60);
    assert_eq!(image[1], 42);
}
