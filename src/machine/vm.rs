//! Core virtual machine implementation.
//!
//! The engine owns the register file, the segmented memory, and the I/O
//! devices. Each step fetches the 32-bit word at PC, decodes it, advances PC
//! past the instruction, and dispatches on the opcode. Any error unwinds the
//! step with a [`VmError`]; the engine records it together with the PC of the
//! faulting instruction and makes no attempt to retry.

use crate::machine::decoder::{self, AddressingMode, Instruction, INSTRUCTION_SIZE};
use crate::machine::errors::{Fault, VmError};
use crate::machine::io::{Console, IoPorts, StdConsole};
use crate::machine::isa::Opcode;
use crate::machine::memory::{Memory, STACK_BASE, STACK_SIZE};
use crate::machine::program::{Image, SymbolTable};
use crate::machine::vm::registers::{Flag, Registers, R0_ACC};
use std::fmt::Write as _;
use std::time::Instant;

pub mod registers;


/// Base of the interrupt vector table, inside the code segment.
pub const VECTOR_TABLE_BASE: u16 = 0x0100;
/// Number of vector-table entries; each entry is one dword handler address.
pub const VECTOR_TABLE_ENTRIES: u8 = 32;

/// Identification word returned by CPUID: version 1.1.
const CPUID_VERSION: u32 = 0x0001_0001;

/// One past the highest valid stack address.
const STACK_TOP: u32 = STACK_BASE as u32 + STACK_SIZE as u32;

/// The virtual machine engine.
pub struct Vm {
    pub(crate) memory: Memory,
    pub(crate) registers: Registers,
    pub(crate) io: IoPorts,
    pub(crate) halted: bool,
    debug_mode: bool,
    pub(crate) instruction_count: u64,
    /// Most recently decoded instruction, kept for diagnostics.
    current_instr: Instruction,
    /// Diagnostic slot; filled when a step faults, cleared only by reset or
    /// an explicit host call.
    fault: Option<Fault>,
    pub(crate) exit_code: u32,
    /// Linear congruential generator state for the random syscalls.
    pub(crate) rng_state: u32,
    /// Wall-clock origin for the get-time syscall.
    pub(crate) started: Instant,
    /// Next synthetic descriptor handed out by the stub file syscalls.
    pub(crate) next_file_handle: u32,
    symbols: Option<SymbolTable>,
}

impl Vm {
    /// Creates a machine with zeroed memory, a seeded heap, and stdio as the
    /// console.
    pub fn new(memory_size: usize) -> Self {
        Self::with_console(memory_size, Box::new(StdConsole))
    }

    /// Creates a machine with a caller-supplied console, used by tests and
    /// embedding hosts.
    pub fn with_console(memory_size: usize, console: Box<dyn Console>) -> Self {
        Self {
            memory: Memory::new(memory_size),
            registers: Registers::new(),
            io: IoPorts::new(console),
            halted: false,
            debug_mode: false,
            instruction_count: 0,
            current_instr: Instruction::default(),
            fault: None,
            exit_code: 0,
            rng_state: 0,
            started: Instant::now(),
            next_file_handle: 3,
            symbols: None,
        }
    }

    /// Places an image's segments into memory and points PC at its entry.
    ///
    /// In debug mode the trailing symbol table, if any, is parsed and kept
    /// for the external debugger.
    pub fn load_image(&mut self, image: &Image) -> Result<(), VmError> {
        self.memory.load_segment(image.code_base, &image.code)?;
        if !image.data.is_empty() {
            self.memory.load_segment(image.data_base, &image.data)?;
        }
        self.registers.set_pc(image.code_base);
        if self.debug_mode && !image.symbol_data.is_empty() {
            self.symbols = Some(SymbolTable::parse(&image.symbol_data)?);
        }
        Ok(())
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn set_debug_mode(&mut self, enabled: bool) {
        self.debug_mode = enabled;
    }

    /// Return code set by the exit syscall.
    pub fn exit_code(&self) -> u32 {
        self.exit_code
    }

    /// Number of successfully executed instructions.
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    pub fn register(&self, index: u8) -> u32 {
        self.registers.get(index)
    }

    pub fn set_register(&mut self, index: u8, value: u32) {
        self.registers.set(index, value);
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// The recorded fault from the last failed step, if any.
    pub fn last_fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    /// Explicit host-side acknowledgement of a fault.
    pub fn clear_fault(&mut self) {
        self.fault = None;
    }

    /// Parsed debug symbols, present after loading an image in debug mode.
    pub fn symbols(&self) -> Option<&SymbolTable> {
        self.symbols.as_ref()
    }

    /// Installs an interrupt handler address into the vector table.
    pub fn set_interrupt_handler(&mut self, vector: u8, handler: u16) -> Result<(), VmError> {
        if vector >= VECTOR_TABLE_ENTRIES {
            return Err(VmError::UnhandledInterrupt { vector });
        }
        self.memory
            .write_dword(VECTOR_TABLE_BASE + vector as u16 * 4, handler as u32)
    }

    /// Reinitializes CPU state: registers, flags, halt/debug bits, counters,
    /// and the fault slot. Memory contents are preserved.
    fn reset_cpu(&mut self) {
        self.registers.reset();
        self.halted = false;
        self.debug_mode = false;
        self.instruction_count = 0;
        self.current_instr = Instruction::default();
        self.fault = None;
    }

    /// Full host-level reset: CPU state plus zeroed memory with a reseeded
    /// heap.
    pub fn reset(&mut self) {
        self.reset_cpu();
        self.memory.clear();
        self.exit_code = 0;
    }

    /// Runs until the machine halts or a step faults.
    pub fn run(&mut self) -> Result<(), VmError> {
        while !self.halted {
            self.step()?;
        }
        Ok(())
    }

    /// Executes exactly one instruction.
    ///
    /// On success the instruction count advances. On failure the error and
    /// the PC of the faulting instruction are recorded and returned.
    pub fn step(&mut self) -> Result<(), VmError> {
        if self.halted {
            return Ok(());
        }

        let pc32 = self.registers.pc();
        let pc = pc32 as u16;
        let result = if pc32 > u16::MAX as u32 {
            Err(VmError::SegmentationFault {
                address: pc,
                size: INSTRUCTION_SIZE,
            })
        } else {
            self.fetch_and_execute(pc)
        };

        match result {
            Ok(()) => {
                self.instruction_count += 1;
                Ok(())
            }
            Err(error) => {
                self.fault = Some(Fault {
                    error: error.clone(),
                    pc,
                });
                Err(error)
            }
        }
    }

    fn fetch_and_execute(&mut self, pc: u16) -> Result<(), VmError> {
        let word = self.memory.read_dword(pc)?;
        let instr = decoder::decode(word);
        self.current_instr = instr;
        // PC moves past the instruction before dispatch; CALL and INT rely
        // on it already naming the return address.
        self.registers.set_pc(pc as u32 + INSTRUCTION_SIZE as u32);
        self.execute(&instr)
    }

    fn execute(&mut self, instr: &Instruction) -> Result<(), VmError> {
        match Opcode::try_from(instr.opcode)? {
            // Data transfer
            Opcode::Nop => Ok(()),
            Opcode::Load => self.op_load(instr),
            Opcode::Store => self.op_store(instr),
            Opcode::Move => self.op_move(instr),
            Opcode::LoadB => self.op_loadb(instr),
            Opcode::StoreB => self.op_storeb(instr),
            Opcode::LoadW => self.op_loadw(instr),
            Opcode::StoreW => self.op_storew(instr),
            Opcode::Lea => self.op_lea(instr),
            // Arithmetic
            Opcode::Add => self.op_add(instr),
            Opcode::Sub => self.op_sub(instr),
            Opcode::Mul => self.op_mul(instr),
            Opcode::Div => self.op_div(instr),
            Opcode::Mod => self.op_mod(instr),
            Opcode::Inc => self.op_inc(instr),
            Opcode::Dec => self.op_dec(instr),
            Opcode::Neg => self.op_neg(instr),
            Opcode::Cmp => self.op_cmp(instr),
            Opcode::AddC => self.op_addc(instr),
            Opcode::SubC => self.op_subc(instr),
            // Logical
            Opcode::And => self.op_and(instr),
            Opcode::Or => self.op_or(instr),
            Opcode::Xor => self.op_xor(instr),
            Opcode::Not => self.op_not(instr),
            Opcode::Shl => self.op_shl(instr),
            Opcode::Shr => self.op_shr(instr),
            Opcode::Sar => self.op_sar(instr),
            Opcode::Rol => self.op_rol(instr),
            Opcode::Ror => self.op_ror(instr),
            Opcode::Test => self.op_test(instr),
            // Control flow
            Opcode::Jmp => self.op_jump_if(instr, true),
            Opcode::Jz => self.jump_on_flag(instr, |r| r.flag(Flag::Zero)),
            Opcode::Jnz => self.jump_on_flag(instr, |r| !r.flag(Flag::Zero)),
            Opcode::Jn => self.jump_on_flag(instr, |r| r.flag(Flag::Negative)),
            Opcode::Jp => {
                self.jump_on_flag(instr, |r| !r.flag(Flag::Negative) && !r.flag(Flag::Zero))
            }
            Opcode::Jo => self.jump_on_flag(instr, |r| r.flag(Flag::Overflow)),
            Opcode::Jc => self.jump_on_flag(instr, |r| r.flag(Flag::Carry)),
            Opcode::Jbe => {
                self.jump_on_flag(instr, |r| r.flag(Flag::Carry) || r.flag(Flag::Zero))
            }
            Opcode::Ja => {
                self.jump_on_flag(instr, |r| !r.flag(Flag::Carry) && !r.flag(Flag::Zero))
            }
            Opcode::Call => self.op_call(instr),
            Opcode::Ret => self.op_ret(instr),
            Opcode::Syscall => self.syscall(instr.immediate),
            Opcode::Loop => self.op_loop(instr),
            // Stack
            Opcode::Push => self.op_push(instr),
            Opcode::Pop => self.op_pop(instr),
            Opcode::PushF => self.push(self.registers.sr()),
            Opcode::PopF => {
                let flags = self.pop()?;
                self.registers.set_sr(flags);
                Ok(())
            }
            Opcode::PushA => self.op_pusha(),
            Opcode::PopA => self.op_popa(),
            Opcode::Enter => self.op_enter(instr),
            Opcode::Leave => self.op_leave(),
            // System
            Opcode::Halt => {
                self.halted = true;
                Ok(())
            }
            Opcode::Int => self.op_int(instr),
            Opcode::Cli => {
                self.registers.set_flag(Flag::InterruptEnable, false);
                Ok(())
            }
            Opcode::Sti => {
                self.registers.set_flag(Flag::InterruptEnable, true);
                Ok(())
            }
            Opcode::Iret => self.op_iret(),
            Opcode::In => self.op_in(instr),
            Opcode::Out => self.op_out(instr),
            Opcode::CpuId => {
                self.registers.set(R0_ACC, CPUID_VERSION);
                Ok(())
            }
            Opcode::Reset => {
                self.reset_cpu();
                Ok(())
            }
            Opcode::Debug => {
                self.debug_mode = true;
                Ok(())
            }
            // Memory management
            Opcode::Alloc => self.op_alloc(instr),
            Opcode::Free => self.op_free(instr),
            Opcode::MemCpy => self.op_memcpy(instr),
            Opcode::MemSet => self.op_memset(instr),
            Opcode::Protect => self.op_protect(instr),
        }
    }

    // ==================== Operand resolution ====================

    /// Resolves an operand to a 32-bit value per the addressing mode.
    fn operand_value(&self, instr: &Instruction, second: bool) -> Result<u32, VmError> {
        match instr.addressing_mode()? {
            AddressingMode::Immediate => Ok(instr.immediate as u32),
            AddressingMode::Register => {
                let reg = if second { instr.reg2 } else { instr.reg1 };
                Ok(self.registers.get(reg))
            }
            _ => {
                let address = self.operand_address(instr, second)?;
                self.memory.read_dword(address)
            }
        }
    }

    /// Resolves an operand to its 16-bit effective address.
    ///
    /// Immediate and register operands have no address; asking for one is an
    /// encoding error.
    fn operand_address(&self, instr: &Instruction, second: bool) -> Result<u16, VmError> {
        let reg = if second { instr.reg2 } else { instr.reg1 };
        match instr.addressing_mode()? {
            AddressingMode::Direct => Ok(instr.immediate),
            AddressingMode::Indirect => Ok(self.registers.get(reg) as u16),
            AddressingMode::Indexed => {
                Ok((self.registers.get(reg) as u16).wrapping_add(instr.immediate))
            }
            AddressingMode::StackRelative => {
                Ok((self.registers.sp() as u16).wrapping_add(instr.immediate))
            }
            AddressingMode::BaseRelative => {
                Ok((self.registers.bp() as u16).wrapping_add(instr.immediate))
            }
            AddressingMode::Immediate | AddressingMode::Register => {
                Err(VmError::InvalidAddressingMode { mode: instr.mode })
            }
        }
    }

    // ==================== Data transfer ====================

    fn op_load(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let value = self.operand_value(instr, true)?;
        self.registers.set(instr.reg1, value);
        Ok(())
    }

    fn op_loadb(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let value = if instr.addressing_mode()? == AddressingMode::Immediate {
            (instr.immediate & 0xFF) as u32
        } else {
            let address = self.operand_address(instr, true)?;
            self.memory.read_byte(address)? as u32
        };
        self.registers.set(instr.reg1, value);
        Ok(())
    }

    fn op_loadw(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let value = if instr.addressing_mode()? == AddressingMode::Immediate {
            instr.immediate as u32
        } else {
            let address = self.operand_address(instr, true)?;
            self.memory.read_word(address)? as u32
        };
        self.registers.set(instr.reg1, value);
        Ok(())
    }

    fn op_store(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let address = self.operand_address(instr, true)?;
        self.memory.write_dword(address, self.registers.get(instr.reg1))
    }

    fn op_storeb(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let address = self.operand_address(instr, true)?;
        self.memory
            .write_byte(address, self.registers.get(instr.reg1) as u8)
    }

    fn op_storew(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let address = self.operand_address(instr, true)?;
        self.memory
            .write_word(address, self.registers.get(instr.reg1) as u16)
    }

    fn op_move(&mut self, instr: &Instruction) -> Result<(), VmError> {
        self.registers.set(instr.reg1, self.registers.get(instr.reg2));
        Ok(())
    }

    fn op_lea(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let address = self.operand_address(instr, true)?;
        self.registers.set(instr.reg1, address as u32);
        Ok(())
    }

    // ==================== Arithmetic ====================

    fn op_add(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let b = self.operand_value(instr, true)?;
        let result = a.wrapping_add(b);
        self.registers.set_flag(Flag::Carry, result < a);
        self.registers.set_flag(Flag::Overflow, add_overflow(a, b, result));
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_addc(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let b = self.operand_value(instr, true)?;
        let carry = self.registers.flag(Flag::Carry) as u32;
        let result = a.wrapping_add(b).wrapping_add(carry);
        self.registers
            .set_flag(Flag::Carry, result < a || (carry == 1 && result == a));
        self.registers.set_flag(Flag::Overflow, add_overflow(a, b, result));
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_sub(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let b = self.operand_value(instr, true)?;
        let result = a.wrapping_sub(b);
        self.registers.set_flag(Flag::Carry, a < b);
        self.registers.set_flag(Flag::Overflow, sub_overflow(a, b, result));
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_subc(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let b = self.operand_value(instr, true)?;
        let carry = self.registers.flag(Flag::Carry) as u32;
        let result = a.wrapping_sub(b).wrapping_sub(carry);
        self.registers
            .set_flag(Flag::Carry, a < b || (carry == 1 && a == b));
        self.registers.set_flag(Flag::Overflow, sub_overflow(a, b, result));
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_mul(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let b = self.operand_value(instr, true)?;
        let result = a.wrapping_mul(b);
        let wide = a as u64 * b as u64;
        self.registers.set_flag(Flag::Overflow, wide > u32::MAX as u64);
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_div(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let b = self.operand_value(instr, true)?;
        if b == 0 {
            return Err(VmError::DivisionByZero);
        }
        let result = a / b;
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_mod(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let b = self.operand_value(instr, true)?;
        if b == 0 {
            return Err(VmError::DivisionByZero);
        }
        let result = a % b;
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_inc(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let result = a.wrapping_add(1);
        self.registers.set_flag(Flag::Overflow, a == i32::MAX as u32);
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_dec(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let result = a.wrapping_sub(1);
        self.registers.set_flag(Flag::Overflow, a == 0x8000_0000);
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_neg(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let result = a.wrapping_neg();
        self.registers.set_flag(Flag::Overflow, a == 0x8000_0000);
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_cmp(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let b = self.operand_value(instr, true)?;
        let result = a.wrapping_sub(b);
        self.registers.set_flag(Flag::Carry, a < b);
        self.registers.set_flag(Flag::Overflow, sub_overflow(a, b, result));
        self.registers.update_zn(result);
        Ok(())
    }

    // ==================== Logical ====================

    fn op_and(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let result = self.registers.get(instr.reg1) & self.operand_value(instr, true)?;
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_or(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let result = self.registers.get(instr.reg1) | self.operand_value(instr, true)?;
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_xor(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let result = self.registers.get(instr.reg1) ^ self.operand_value(instr, true)?;
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_not(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let result = !self.registers.get(instr.reg1);
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_shl(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let count = self.operand_value(instr, true)? & 0x1F;
        if count > 0 {
            self.registers
                .set_flag(Flag::Carry, (a >> (32 - count)) & 1 != 0);
        }
        let result = a << count;
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_shr(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let count = self.operand_value(instr, true)? & 0x1F;
        if count > 0 {
            self.registers
                .set_flag(Flag::Carry, (a >> (count - 1)) & 1 != 0);
        }
        let result = a >> count;
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_sar(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let count = self.operand_value(instr, true)? & 0x1F;
        if count > 0 {
            self.registers
                .set_flag(Flag::Carry, (a >> (count - 1)) & 1 != 0);
        }
        let result = ((a as i32) >> count) as u32;
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_rol(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let count = self.operand_value(instr, true)? & 0x1F;
        let result = if count > 0 {
            let rotated = a.rotate_left(count);
            self.registers.set_flag(Flag::Carry, rotated & 1 != 0);
            rotated
        } else {
            a
        };
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_ror(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let a = self.registers.get(instr.reg1);
        let count = self.operand_value(instr, true)? & 0x1F;
        let result = if count > 0 {
            let rotated = a.rotate_right(count);
            self.registers
                .set_flag(Flag::Carry, rotated & 0x8000_0000 != 0);
            rotated
        } else {
            a
        };
        self.registers.set(instr.reg1, result);
        self.registers.update_zn(result);
        Ok(())
    }

    fn op_test(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let result = self.registers.get(instr.reg1) & self.operand_value(instr, true)?;
        self.registers.update_zn(result);
        Ok(())
    }

    // ==================== Control flow ====================

    /// Jump targets come from the immediate, a register, or memory,
    /// depending on the mode.
    fn jump_target(&self, instr: &Instruction) -> Result<u32, VmError> {
        match instr.addressing_mode()? {
            AddressingMode::Immediate => Ok(instr.immediate as u32),
            AddressingMode::Register => Ok(self.registers.get(instr.reg1)),
            _ => self.operand_value(instr, false),
        }
    }

    fn op_jump_if(&mut self, instr: &Instruction, condition: bool) -> Result<(), VmError> {
        let target = self.jump_target(instr)?;
        if condition {
            self.registers.set_pc(target);
        }
        Ok(())
    }

    fn jump_on_flag(
        &mut self,
        instr: &Instruction,
        condition: impl Fn(&Registers) -> bool,
    ) -> Result<(), VmError> {
        let taken = condition(&self.registers);
        self.op_jump_if(instr, taken)
    }

    fn op_call(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let target = self.jump_target(instr)?;
        // PC already names the next instruction.
        self.push(self.registers.pc())?;
        self.registers.set_pc(target);
        Ok(())
    }

    fn op_ret(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let return_address = self.pop()?;
        self.registers.set_pc(return_address);
        if instr.immediate > 0 {
            // Release caller-pushed arguments.
            let sp = self.registers.sp().wrapping_add(instr.immediate as u32);
            self.registers.set_sp(sp);
        }
        Ok(())
    }

    fn op_loop(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let target = self.jump_target(instr)?;
        let value = self.registers.get(instr.reg1).wrapping_sub(1);
        self.registers.set(instr.reg1, value);
        if value != 0 {
            self.registers.set_pc(target);
        }
        Ok(())
    }

    // ==================== Stack ====================

    /// Pushes one dword. The stack grows downward; leaving the window
    /// `[STACK_BASE, STACK_BASE + STACK_SIZE]` is a stack overflow.
    pub(crate) fn push(&mut self, value: u32) -> Result<(), VmError> {
        let sp = self.registers.sp();
        if sp < STACK_BASE as u32 + 4 || sp > STACK_TOP {
            return Err(VmError::StackOverflow);
        }
        let new_sp = sp - 4;
        self.memory.write_dword(new_sp as u16, value)?;
        self.registers.set_sp(new_sp);
        Ok(())
    }

    /// Pops one dword; popping past the top of the stack segment is a stack
    /// underflow.
    pub(crate) fn pop(&mut self) -> Result<u32, VmError> {
        let sp = self.registers.sp();
        if sp < STACK_BASE as u32 || sp > STACK_TOP - 4 {
            return Err(VmError::StackUnderflow);
        }
        let value = self.memory.read_dword(sp as u16)?;
        self.registers.set_sp(sp + 4);
        Ok(value)
    }

    fn op_push(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let value = if instr.addressing_mode()? == AddressingMode::Immediate {
            instr.immediate as u32
        } else {
            self.registers.get(instr.reg1)
        };
        self.push(value)
    }

    fn op_pop(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let value = self.pop()?;
        self.registers.set(instr.reg1, value);
        Ok(())
    }

    /// Pushes R0 through R15. The slot for SP holds the value SP had before
    /// the first push.
    fn op_pusha(&mut self) -> Result<(), VmError> {
        let original_sp = self.registers.sp();
        for index in 0..16u8 {
            let value = if index == registers::R2_SP {
                original_sp
            } else {
                self.registers.get(index)
            };
            self.push(value)?;
        }
        Ok(())
    }

    /// Pops R15 down to R0, skipping the SP slot so the in-progress walk is
    /// not derailed.
    fn op_popa(&mut self) -> Result<(), VmError> {
        for index in (0..16u8).rev() {
            if index == registers::R2_SP {
                self.registers.set_sp(self.registers.sp() + 4);
            } else {
                let value = self.pop()?;
                self.registers.set(index, value);
            }
        }
        Ok(())
    }

    fn op_enter(&mut self, instr: &Instruction) -> Result<(), VmError> {
        self.push(self.registers.bp())?;
        self.registers.set_bp(self.registers.sp());

        let locals = instr.immediate as u32;
        let new_sp = self.registers.sp().wrapping_sub(locals);
        if locals > self.registers.sp() || new_sp < STACK_BASE as u32 {
            // Unwind the half-built frame before reporting.
            self.registers.set_sp(self.registers.bp());
            let saved_bp = self.pop()?;
            self.registers.set_bp(saved_bp);
            return Err(VmError::StackOverflow);
        }
        self.registers.set_sp(new_sp);
        Ok(())
    }

    fn op_leave(&mut self) -> Result<(), VmError> {
        self.registers.set_sp(self.registers.bp());
        let saved_bp = self.pop()?;
        self.registers.set_bp(saved_bp);
        Ok(())
    }

    // ==================== Interrupts ====================

    fn op_int(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let vector = (instr.immediate & 0xFF) as u8;
        if !self.registers.flag(Flag::InterruptEnable) {
            return Err(VmError::NestedInterrupt { vector });
        }
        self.raise_interrupt(vector)
    }

    /// Vectors through the interrupt table: push flags, push the return PC,
    /// disable interrupts, jump to the handler.
    fn raise_interrupt(&mut self, vector: u8) -> Result<(), VmError> {
        if vector >= VECTOR_TABLE_ENTRIES {
            return Err(VmError::UnhandledInterrupt { vector });
        }
        let handler = self
            .memory
            .read_dword(VECTOR_TABLE_BASE + vector as u16 * 4)?;
        if handler == 0 {
            return Err(VmError::UnhandledInterrupt { vector });
        }

        self.push(self.registers.sr())?;
        self.push(self.registers.pc())?;
        self.registers.set_flag(Flag::InterruptEnable, false);
        self.registers.set_pc(handler);
        Ok(())
    }

    fn op_iret(&mut self) -> Result<(), VmError> {
        let return_address = self.pop()?;
        let flags = self.pop()?;
        self.registers.set_pc(return_address);
        self.registers.set_sr(flags);
        Ok(())
    }

    // ==================== I/O ====================

    fn op_in(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let value = self.io.read(instr.immediate);
        self.registers.set(instr.reg1, value);
        Ok(())
    }

    fn op_out(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let port = instr.reg1 as u16;
        let value = if instr.addressing_mode()? == AddressingMode::Immediate {
            instr.immediate as u32
        } else {
            self.registers.get(instr.reg2)
        };
        self.io.write(port, value);
        Ok(())
    }

    // ==================== Memory management ====================

    fn op_alloc(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let size = self.operand_value(instr, true)?;
        let address = self.memory.allocate(size.min(u16::MAX as u32) as u16)?;
        self.registers.set(instr.reg1, address as u32);
        Ok(())
    }

    fn op_free(&mut self, instr: &Instruction) -> Result<(), VmError> {
        self.memory.free(self.registers.get(instr.reg1) as u16)
    }

    fn op_memcpy(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let dest = self.registers.get(instr.reg1) as u16;
        let src = self.registers.get(instr.reg2) as u16;
        self.memory.copy(dest, src, instr.immediate)
    }

    fn op_memset(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let dest = self.registers.get(instr.reg1) as u16;
        let value = self.registers.get(instr.reg2) as u8;
        self.memory.fill(dest, value, instr.immediate)
    }

    fn op_protect(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let address = self.registers.get(instr.reg1) as u16;
        let flags = self.operand_value(instr, true)? as u8;
        self.memory.protect(address, flags)
    }

    // ==================== Diagnostics ====================

    /// Renders the machine state for fault reports and the debugger.
    pub fn dump_state(&self) -> String {
        let mut out = String::new();
        let r = &self.registers;

        let _ = writeln!(out, "=== VM State ===");
        let _ = writeln!(
            out,
            "R0(ACC): 0x{:08X}  R1(BP):  0x{:08X}  R2(SP):  0x{:08X}  R3(PC):  0x{:08X}",
            r.get(0),
            r.get(1),
            r.get(2),
            r.get(3)
        );
        let _ = writeln!(
            out,
            "R4(SR):  0x{:08X}  R5:      0x{:08X}  R6:      0x{:08X}  R7:      0x{:08X}",
            r.get(4),
            r.get(5),
            r.get(6),
            r.get(7)
        );
        let _ = writeln!(
            out,
            "R8:      0x{:08X}  R9:      0x{:08X}  R10:     0x{:08X}  R11:     0x{:08X}",
            r.get(8),
            r.get(9),
            r.get(10),
            r.get(11)
        );
        let _ = writeln!(
            out,
            "R12:     0x{:08X}  R13:     0x{:08X}  R14:     0x{:08X}  R15(LR): 0x{:08X}",
            r.get(12),
            r.get(13),
            r.get(14),
            r.get(15)
        );

        let flags: String = Flag::LETTERS
            .iter()
            .map(|&(flag, letter)| if r.flag(flag) { letter } else { '-' })
            .collect();
        let _ = writeln!(out, "Flags: [{flags}]");
        let _ = writeln!(out, "Halted: {}  Debug: {}", self.halted, self.debug_mode);
        let _ = writeln!(out, "Instruction count: {}", self.instruction_count);

        let i = &self.current_instr;
        let _ = writeln!(
            out,
            "Last instruction: OP=0x{:02X} ({}) MODE=0x{:01X} R1=0x{:01X} R2=0x{:01X} IMM=0x{:04X}",
            i.opcode,
            Opcode::mnemonic_of(i.opcode),
            i.mode,
            i.reg1,
            i.reg2,
            i.immediate
        );

        if let Some(fault) = &self.fault {
            let _ = writeln!(out, "Fault: {fault}");
        }

        out
    }
}

/// Signed overflow of `a + b`.
fn add_overflow(a: u32, b: u32, result: u32) -> bool {
    (a ^ b) & 0x8000_0000 == 0 && (result ^ a) & 0x8000_0000 != 0
}

/// Signed overflow of `a - b`.
fn sub_overflow(a: u32, b: u32, result: u32) -> bool {
    (a ^ b) & 0x8000_0000 != 0 && (result ^ a) & 0x8000_0000 != 0
}
