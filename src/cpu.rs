//! The KR32 CPU: registers, privilege mode, and the fetch/decode/dispatch interpreter.

use log::{error, trace, warn};

use crate::exception::ExceptionCode;
use crate::isa::{Opcode, SP_ID, SYS_ID_BASE};
use crate::memory::{KeyEvent, Memory};

/// The address the instruction pointer is initialized to on reset.
pub const BOOT_VECTOR: u32 = 0x0000_0000;

/// The CPU's two privilege levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    System,
    User,
}

/// The general-purpose and system register file. `ip` is tracked separately by
/// [`Cpu`] since it is not addressable as an operand (mirrors the protected/general
/// register split of the reference implementation).
#[derive(Debug, Clone, Default)]
pub struct Registers {
    pub gp: [u32; 16],
    pub sp: u32,
    pub sys: [u32; 8],
}

/// Something the emulator can poll once per CPU step for keyboard input. A real
/// windowing backend implements this; [`NullInput`] is the headless default.
pub trait InputSource {
    fn poll(&mut self) -> Option<KeyEvent>;
}

/// An input source that never produces events, used when no windowing backend is
/// wired up. Satisfies the MMIO contract without depending on a windowing crate.
pub struct NullInput;

impl InputSource for NullInput {
    fn poll(&mut self) -> Option<KeyEvent> {
        None
    }
}

/// The KR32 CPU.
pub struct Cpu {
    pub registers: Registers,
    ip: u32,
    pub mode: Mode,
    pub memory: Memory,
    pub handler_address: u32,
    is_issuing_exception: bool,
    pub halted: bool,
}

impl Cpu {
    /// Creates a reset CPU with the given memory size. `graphical` enables the MMIO
    /// overlay on the memory.
    pub fn new(memory_size: usize, graphical: bool) -> Self {
        Cpu {
            registers: Registers::default(),
            ip: BOOT_VECTOR,
            mode: Mode::System,
            memory: Memory::new(memory_size, graphical),
            handler_address: 0,
            is_issuing_exception: false,
            halted: false,
        }
    }

    /// Current instruction pointer.
    pub fn ip(&self) -> u32 {
        self.ip
    }

    fn fetch_u8(&mut self) -> u8 {
        let value = self.memory.read_u8(self.ip);
        self.ip = self.ip.wrapping_add(1);
        value
    }

    fn fetch_u32(&mut self) -> u32 {
        let value = self.memory.read_u32(self.ip);
        self.ip = self.ip.wrapping_add(4);
        value
    }

    fn read_register(&self, id: u8) -> Result<u32, ExceptionCode> {
        match id {
            0x00..=0x0F => Ok(self.registers.gp[id as usize]),
            SP_ID => Ok(self.registers.sp),
            SYS_ID_BASE..=0xF7 => {
                if self.mode == Mode::System {
                    Ok(self.registers.sys[(id - SYS_ID_BASE) as usize])
                } else {
                    Err(ExceptionCode::UnprivilegedMemory)
                }
            }
            _ => Err(ExceptionCode::InvalidInstruction),
        }
    }

    fn write_register(&mut self, id: u8, value: u32) -> Result<(), ExceptionCode> {
        match id {
            0x00..=0x0F => {
                self.registers.gp[id as usize] = value;
                Ok(())
            }
            SP_ID => {
                self.registers.sp = value;
                Ok(())
            }
            SYS_ID_BASE..=0xF7 => {
                if self.mode == Mode::System {
                    self.registers.sys[(id - SYS_ID_BASE) as usize] = value;
                    Ok(())
                } else {
                    Err(ExceptionCode::UnprivilegedMemory)
                }
            }
            _ => Err(ExceptionCode::InvalidInstruction),
        }
    }

    /// Reads a register, raising the appropriate exception and returning the `Err(())`
    /// sentinel on failure so callers can use `?` to abort the rest of the instruction.
    fn reg(&mut self, id: u8) -> Result<u32, ()> {
        self.read_register(id).map_err(|e| self.raise_exception(e))
    }

    fn set_reg(&mut self, id: u8, value: u32) -> Result<(), ()> {
        self.write_register(id, value).map_err(|e| self.raise_exception(e))
    }

    /// Push that does not itself raise an exception on failure; used both by the
    /// normal `push` instruction and by exception/interrupt entry.
    fn push_raw(&mut self, value: u32) -> bool {
        if self.registers.sp < 4 {
            return false;
        }
        self.registers.sp -= 4;
        self.memory.write_u32(self.registers.sp, value);
        true
    }

    fn push(&mut self, value: u32) -> Result<(), ()> {
        if self.push_raw(value) {
            Ok(())
        } else {
            self.raise_exception(ExceptionCode::StackOverflow);
            Err(())
        }
    }

    fn pop(&mut self) -> Result<u32, ()> {
        if self.registers.sp >= self.memory.size().saturating_sub(4) {
            self.raise_exception(ExceptionCode::StackUnderflow);
            return Err(());
        }
        let value = self.memory.read_u32(self.registers.sp);
        self.registers.sp = self.registers.sp.wrapping_add(4);
        Ok(value)
    }

    /// A `handler_address` of zero is the reset default and is treated as
    /// "no handler registered", matching the unhandled-exception behavior a program
    /// that never calls `sys 0x03` observes.
    fn handler_registered(&self) -> bool {
        self.handler_address != 0 && self.handler_address < self.memory.size()
    }

    fn raise_exception(&mut self, code: ExceptionCode) {
        if self.is_issuing_exception || !self.handler_registered() {
            self.halted = true;
            eprintln!("Unhandled exception: {code}");
            error!("unhandled exception {code}");
            return;
        }

        let faulting_ip = self.ip;
        if !self.push_raw(faulting_ip) {
            self.halted = true;
            eprintln!("Unhandled exception: {code}");
            error!("stack overflow entering handler for exception {code}");
            return;
        }

        self.is_issuing_exception = true;
        self.registers.sys[7] = 0;
        self.registers.sys[0] = code.code() as u32;
        self.registers.sys[1] = faulting_ip;
        self.ip = self.handler_address;
    }

    /// Raises a software interrupt. `id == 0` is a no-op per the contract.
    pub fn interrupt(&mut self, id: u8) {
        if id == 0 {
            return;
        }
        if !self.push_raw(self.ip) {
            self.halted = true;
            eprintln!("Unhandled exception: stack overflow entering interrupt {id:#04x}");
            error!("stack overflow entering interrupt {id:#04x}");
            return;
        }
        self.registers.sys[7] = id as u32;
        self.ip = self.handler_address;
        // Spec lists an `is_issuing` flag set here alongside the exception one; nothing
        // ever reads an interrupt-specific flag (only `is_issuing_exception` gates
        // nested exceptions), so it is intentionally elided.
    }

    fn syscall(&mut self, id: u8) -> Result<(), ()> {
        match id {
            0x00 => self.registers.sys[0] = BOOT_VECTOR,
            0x01 => self.registers.sys[0] = self.memory.size(),
            0x02 => self.registers.sys[0] = self.handler_address,
            0x03 => self.handler_address = self.registers.sys[0],
            0x04 => {
                if self.mode == Mode::System {
                    self.mode = Mode::User;
                } else {
                    self.raise_exception(ExceptionCode::UnprivilegedInvocation);
                    return Err(());
                }
            }
            _ => {
                self.raise_exception(ExceptionCode::InvalidInstruction);
                return Err(());
            }
        }
        Ok(())
    }

    fn execute(&mut self, opcode: Opcode) -> Result<(), ()> {
        use Opcode::*;
        match opcode {
            Ldi => {
                let r = self.fetch_u8();
                let imm = self.fetch_u32();
                self.set_reg(r, imm)?;
            }
            Ldr => {
                let a = self.fetch_u8();
                let b = self.fetch_u8();
                let v = self.reg(b)?;
                self.set_reg(a, v)?;
            }
            Ldm8 => {
                let a = self.fetch_u8();
                let b = self.fetch_u8();
                let addr = self.reg(b)?;
                let v = self.memory.read_u8(addr) as u32;
                self.set_reg(a, v)?;
            }
            Ldm16 => {
                let a = self.fetch_u8();
                let b = self.fetch_u8();
                let addr = self.reg(b)?;
                let v = self.memory.read_u16(addr) as u32;
                self.set_reg(a, v)?;
            }
            Ldm32 => {
                let a = self.fetch_u8();
                let b = self.fetch_u8();
                let addr = self.reg(b)?;
                let v = self.memory.read_u32(addr);
                self.set_reg(a, v)?;
            }
            Str8 => {
                let a = self.fetch_u8();
                let b = self.fetch_u8();
                let addr = self.reg(a)?;
                let v = self.reg(b)?;
                self.memory.write_u8(addr, v as u8);
            }
            Str16 => {
                let a = self.fetch_u8();
                let b = self.fetch_u8();
                let addr = self.reg(a)?;
                let v = self.reg(b)?;
                self.memory.write_u16(addr, v as u16);
            }
            Str32 => {
                let a = self.fetch_u8();
                let b = self.fetch_u8();
                let addr = self.reg(a)?;
                let v = self.reg(b)?;
                self.memory.write_u32(addr, v);
            }
            Add => self.execute_three_reg(|b, c| b.wrapping_add(c))?,
            Sub => self.execute_three_reg(|b, c| b.wrapping_sub(c))?,
            Mul => self.execute_three_reg(|b, c| b.wrapping_mul(c))?,
            Div => {
                let (a, b, c) = self.fetch_three_reg();
                let vb = self.reg(b)?;
                let vc = self.reg(c)?;
                if vc == 0 {
                    self.raise_exception(ExceptionCode::DivideByZero);
                    return Err(());
                }
                self.set_reg(a, vb / vc)?;
            }
            Rem => {
                let (a, b, c) = self.fetch_three_reg();
                let vb = self.reg(b)?;
                let vc = self.reg(c)?;
                if vc == 0 {
                    self.raise_exception(ExceptionCode::DivideByZero);
                    return Err(());
                }
                self.set_reg(a, vb % vc)?;
            }
            Shr => self.execute_three_reg(|b, c| b.wrapping_shr(c & 0x1F))?,
            Shl => self.execute_three_reg(|b, c| b.wrapping_shl(c & 0x1F))?,
            And => self.execute_three_reg(|b, c| b & c)?,
            Or => self.execute_three_reg(|b, c| b | c)?,
            Xor => self.execute_three_reg(|b, c| b ^ c)?,
            Not => {
                let a = self.fetch_u8();
                let b = self.fetch_u8();
                let vb = self.reg(b)?;
                self.set_reg(a, !vb)?;
            }
            Jnz => {
                let a = self.fetch_u8();
                let b = self.fetch_u8();
                let va = self.reg(a)?;
                let vb = self.reg(b)?;
                if va != 0 {
                    self.ip = vb;
                }
            }
            Jz => {
                let a = self.fetch_u8();
                let b = self.fetch_u8();
                let va = self.reg(a)?;
                let vb = self.reg(b)?;
                if va == 0 {
                    self.ip = vb;
                }
            }
            Jmp => {
                let r = self.fetch_u8();
                let v = self.reg(r)?;
                self.ip = v;
            }
            Link => {
                let r = self.fetch_u8();
                let v = self.reg(r)?;
                let return_ip = self.ip;
                self.push(return_ip)?;
                self.ip = v;
            }
            Ret => {
                let addr = self.pop()?;
                self.ip = addr;
            }
            Push => {
                let r = self.fetch_u8();
                let v = self.reg(r)?;
                self.push(v)?;
            }
            Pop => {
                let r = self.fetch_u8();
                let v = self.pop()?;
                self.set_reg(r, v)?;
            }
            Jnzi => {
                let r = self.fetch_u8();
                let imm = self.fetch_u32();
                let v = self.reg(r)?;
                if v != 0 {
                    self.ip = imm;
                }
            }
            Jzi => {
                let r = self.fetch_u8();
                let imm = self.fetch_u32();
                let v = self.reg(r)?;
                if v == 0 {
                    self.ip = imm;
                }
            }
            Jmpi => {
                let imm = self.fetch_u32();
                self.ip = imm;
            }
            Hlt => {
                self.halted = true;
            }
            Sys => {
                let id = self.fetch_u8();
                self.syscall(id)?;
            }
            Int => {
                let id = self.fetch_u8();
                self.interrupt(id);
            }
        }
        Ok(())
    }

    fn fetch_three_reg(&mut self) -> (u8, u8, u8) {
        let a = self.fetch_u8();
        let b = self.fetch_u8();
        let c = self.fetch_u8();
        (a, b, c)
    }

    fn execute_three_reg(&mut self, f: impl FnOnce(u32, u32) -> u32) -> Result<(), ()> {
        let (a, b, c) = self.fetch_three_reg();
        let vb = self.reg(b)?;
        let vc = self.reg(c)?;
        self.set_reg(a, f(vb, vc))?;
        Ok(())
    }

    /// Executes a single instruction. Does nothing if the CPU is already halted.
    pub fn step(&mut self, input: &mut dyn InputSource) {
        if self.halted {
            return;
        }
        if let Some(event) = input.poll() {
            self.memory.apply_key_event(event);
        }

        let ip = self.ip;
        let opcode_byte = self.fetch_u8();
        trace!("ip={ip:#010x} opcode={opcode_byte:#04x}");
        match Opcode::try_from(opcode_byte) {
            Ok(op) => {
                let _ = self.execute(op);
            }
            Err(()) => self.raise_exception(ExceptionCode::InvalidInstruction),
        }
    }

    /// Runs until the CPU halts.
    pub fn run(&mut self, input: &mut dyn InputSource) {
        while !self.halted {
            self.step(input);
        }
    }

    /// Formats a register dump, used by the `-p`/`--print-status` emulator flag.
    pub fn status(&self) -> String {
        let mut out = String::new();
        for (i, r) in self.registers.gp.iter().enumerate() {
            out.push_str(&format!("r{i}: {r:#010x}\t"));
            if i % 4 == 3 {
                out.push('\n');
            }
        }
        out.push_str(&format!("sp: {:#010x}\t", self.registers.sp));
        out.push_str(&format!("ip: {:#010x}\n", self.ip));
        out.push_str(&format!(
            "mode: {}\thalted: {}\n",
            if self.mode == Mode::System { "system" } else { "user" },
            self.halted,
        ));
        out
    }
}

impl Default for Cpu {
    fn default() -> Self {
        warn!("constructing a Cpu with the default memory size, prefer Cpu::new");
        Cpu::new(0x1000, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_with(program: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(0x1000, false);
        cpu.memory.load_image(program);
        cpu
    }

    #[test]
    fn identity_scenario() {
        // ldi r0, 0x2A ; hlt
        let mut cpu = cpu_with(&[0x01, 0x00, 0x2A, 0x00, 0x00, 0x00, 0x60]);
        cpu.run(&mut NullInput);
        assert_eq!(cpu.registers.gp[0], 0x2A);
        assert!(cpu.halted);
    }

    #[test]
    fn divide_by_zero_without_handler_halts() {
        // ldi r1, 0 ; ldi r2, 0 ; div r0, r1, r2 ; hlt
        let mut cpu = cpu_with(&[
            0x01, 0x01, 0, 0, 0, 0,
            0x01, 0x02, 0, 0, 0, 0,
            0x0C, 0x00, 0x01, 0x02,
            0x60,
        ]);
        cpu.run(&mut NullInput);
        assert!(cpu.halted);
    }

    #[test]
    fn privilege_violation_after_mode_switch() {
        // sys 0x04 ; ldr r0, sys0(0xF0) ; hlt -- ldr a,b reads b into a
        let mut cpu = cpu_with(&[
            0x80, 0x04,
            0x02, 0x00, 0xF0,
            0x60,
        ]);
        cpu.run(&mut NullInput);
        assert!(cpu.halted);
        assert_eq!(cpu.mode, Mode::User);
    }

    #[test]
    fn stack_push_pop_roundtrip() {
        let mut cpu = Cpu::new(0x1000, false);
        cpu.registers.sp = 0x100;
        cpu.push(0x1234).unwrap();
        assert_eq!(cpu.registers.sp, 0xFC);
        let v = cpu.pop().unwrap();
        assert_eq!(v, 0x1234);
        assert_eq!(cpu.registers.sp, 0x100);
    }

    #[test]
    fn stack_overflow_on_push_with_low_sp() {
        let mut cpu = Cpu::new(0x1000, false);
        cpu.registers.sp = 2;
        assert!(cpu.push(1).is_err());
        assert!(cpu.halted);
    }
}
