//! Instruction Set Architecture (ISA) definitions.
//!
//! The [`for_each_opcode!`](crate::for_each_opcode) macro holds the canonical
//! opcode table and invokes a callback macro for code generation, so the enum,
//! the `TryFrom<u8>` decoder, and the mnemonic table can never drift apart.
//!
//! Opcode values are grouped by function: 0x00-0x1F data transfer, 0x20-0x3F
//! arithmetic, 0x40-0x5F logical, 0x60-0x7F control flow, 0x80-0x9F stack,
//! 0xA0-0xBF system, 0xC0-0xDF memory management. The grouping is an encoding
//! convention only; dispatch is over the enum, not numeric ranges.

use crate::machine::errors::VmError;

/// Invokes a callback macro with the complete opcode definition list.
#[macro_export]
macro_rules! for_each_opcode {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Data transfer
            // =========================
            /// NOP ; no operation
            Nop = 0x00, "NOP",
            /// LOAD reg, src ; load 32-bit value into register
            Load = 0x01, "LOAD",
            /// STORE reg, dst ; store register to memory
            Store = 0x02, "STORE",
            /// MOVE dst, src ; copy register to register
            Move = 0x03, "MOVE",
            /// LOADB reg, src ; load byte, zero-extended
            LoadB = 0x04, "LOADB",
            /// STOREB reg, dst ; store low byte of register
            StoreB = 0x05, "STOREB",
            /// LOADW reg, src ; load 16-bit word, zero-extended
            LoadW = 0x06, "LOADW",
            /// STOREW reg, dst ; store low 16 bits of register
            StoreW = 0x07, "STOREW",
            /// LEA reg, src ; load effective address without dereferencing
            Lea = 0x08, "LEA",
            // =========================
            // Arithmetic
            // =========================
            /// ADD reg, src ; reg += src (Z N C O)
            Add = 0x20, "ADD",
            /// SUB reg, src ; reg -= src (Z N C O)
            Sub = 0x21, "SUB",
            /// MUL reg, src ; unsigned multiply (Z N O)
            Mul = 0x22, "MUL",
            /// DIV reg, src ; unsigned divide, traps on zero (Z N)
            Div = 0x23, "DIV",
            /// MOD reg, src ; unsigned remainder, traps on zero (Z N)
            Mod = 0x24, "MOD",
            /// INC reg ; increment (Z N O)
            Inc = 0x25, "INC",
            /// DEC reg ; decrement (Z N O)
            Dec = 0x26, "DEC",
            /// NEG reg ; two's-complement negate (Z N O)
            Neg = 0x27, "NEG",
            /// CMP reg, src ; compare without storing (Z N C O)
            Cmp = 0x28, "CMP",
            /// ADDC reg, src ; add with carry (Z N C O)
            AddC = 0x2A, "ADDC",
            /// SUBC reg, src ; subtract with borrow (Z N C O)
            SubC = 0x2B, "SUBC",
            // =========================
            // Logical
            // =========================
            /// AND reg, src ; bitwise and (Z N)
            And = 0x40, "AND",
            /// OR reg, src ; bitwise or (Z N)
            Or = 0x41, "OR",
            /// XOR reg, src ; bitwise xor (Z N)
            Xor = 0x42, "XOR",
            /// NOT reg ; bitwise not (Z N)
            Not = 0x43, "NOT",
            /// SHL reg, count ; shift left (Z N C)
            Shl = 0x44, "SHL",
            /// SHR reg, count ; logical shift right (Z N C)
            Shr = 0x45, "SHR",
            /// SAR reg, count ; arithmetic shift right (Z N C)
            Sar = 0x46, "SAR",
            /// ROL reg, count ; rotate left (Z N C)
            Rol = 0x47, "ROL",
            /// ROR reg, count ; rotate right (Z N C)
            Ror = 0x48, "ROR",
            /// TEST reg, src ; and without storing (Z N)
            Test = 0x49, "TEST",
            // =========================
            // Control flow
            // =========================
            /// JMP target ; unconditional jump
            Jmp = 0x60, "JMP",
            /// JZ target ; jump if zero
            Jz = 0x61, "JZ",
            /// JNZ target ; jump if not zero
            Jnz = 0x62, "JNZ",
            /// JN target ; jump if negative
            Jn = 0x63, "JN",
            /// JP target ; jump if strictly positive (!N && !Z)
            Jp = 0x64, "JP",
            /// JO target ; jump if overflow
            Jo = 0x65, "JO",
            /// JC target ; jump if carry
            Jc = 0x66, "JC",
            /// JBE target ; jump if below or equal, unsigned (C || Z)
            Jbe = 0x67, "JBE",
            /// JA target ; jump if above, unsigned (!C && !Z)
            Ja = 0x68, "JA",
            /// CALL target ; push return address and jump
            Call = 0x6A, "CALL",
            /// RET [n] ; pop return address, optionally release n bytes of args
            Ret = 0x6B, "RET",
            /// SYSCALL n ; host service call
            Syscall = 0x6C, "SYSCALL",
            /// LOOP reg, target ; decrement and jump if not zero
            Loop = 0x6F, "LOOP",
            // =========================
            // Stack
            // =========================
            /// PUSH reg/imm ; push value
            Push = 0x80, "PUSH",
            /// POP reg ; pop value
            Pop = 0x81, "POP",
            /// PUSHF ; push status register
            PushF = 0x82, "PUSHF",
            /// POPF ; pop status register
            PopF = 0x83, "POPF",
            /// PUSHA ; push all registers
            PushA = 0x84, "PUSHA",
            /// POPA ; pop all registers, skipping the SP slot
            PopA = 0x85, "POPA",
            /// ENTER size ; push BP, set up frame, reserve locals
            Enter = 0x86, "ENTER",
            /// LEAVE ; tear down frame
            Leave = 0x87, "LEAVE",
            // =========================
            // System
            // =========================
            /// HALT ; stop execution
            Halt = 0xA0, "HALT",
            /// INT vector ; software interrupt
            Int = 0xA1, "INT",
            /// CLI ; disable interrupts
            Cli = 0xA2, "CLI",
            /// STI ; enable interrupts
            Sti = 0xA3, "STI",
            /// IRET ; return from interrupt
            Iret = 0xA4, "IRET",
            /// IN reg, port ; read I/O port
            In = 0xA5, "IN",
            /// OUT port, reg/imm ; write I/O port
            Out = 0xA6, "OUT",
            /// CPUID ; identification word into R0
            CpuId = 0xA7, "CPUID",
            /// RESET ; reinitialize CPU state
            Reset = 0xA8, "RESET",
            /// DEBUG ; raise the debug-mode flag
            Debug = 0xA9, "DEBUG",
            // =========================
            // Memory management
            // =========================
            /// ALLOC reg, size ; heap allocation, payload address into reg
            Alloc = 0xC0, "ALLOC",
            /// FREE reg ; release the block containing [reg]
            Free = 0xC1, "FREE",
            /// MEMCPY dst, src, n ; block copy
            MemCpy = 0xC2, "MEMCPY",
            /// MEMSET dst, val, n ; block fill
            MemSet = 0xC3, "MEMSET",
            /// PROTECT reg, flags ; set block protection
            Protect = 0xC4, "PROTECT",
        }
    };
}

#[macro_export]
macro_rules! define_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $value:literal, $mnemonic:literal
        ),* $(,)?
    ) => {
        /// Machine opcode, one variant per defined instruction.
        #[repr(u8)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $value,
            )*
        }

        impl TryFrom<u8> for Opcode {
            type Error = VmError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $value => Ok(Opcode::$name), )*
                    _ => Err(VmError::InvalidInstruction { opcode: value }),
                }
            }
        }

        impl Opcode {
            /// Returns the assembly mnemonic for this opcode.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Pure opcode-to-mnemonic mapping for diagnostics; unknown bytes
            /// render as "UNKNOWN" instead of failing.
            pub const fn mnemonic_of(opcode: u8) -> &'static str {
                match opcode {
                    $( $value => $mnemonic, )*
                    _ => "UNKNOWN",
                }
            }
        }
    };
}

for_each_opcode!(define_opcodes);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_match_encoding_groups() {
        assert_eq!(Opcode::Nop as u8, 0x00);
        assert_eq!(Opcode::Lea as u8, 0x08);
        assert_eq!(Opcode::Add as u8, 0x20);
        assert_eq!(Opcode::SubC as u8, 0x2B);
        assert_eq!(Opcode::And as u8, 0x40);
        assert_eq!(Opcode::Jmp as u8, 0x60);
        assert_eq!(Opcode::Loop as u8, 0x6F);
        assert_eq!(Opcode::Push as u8, 0x80);
        assert_eq!(Opcode::Halt as u8, 0xA0);
        assert_eq!(Opcode::Alloc as u8, 0xC0);
        assert_eq!(Opcode::Protect as u8, 0xC4);
    }

    #[test]
    fn try_from_roundtrip() {
        for byte in 0..=0xFFu8 {
            if let Ok(op) = Opcode::try_from(byte) {
                assert_eq!(op as u8, byte);
            }
        }
    }

    #[test]
    fn try_from_invalid() {
        assert!(matches!(
            Opcode::try_from(0xFF),
            Err(VmError::InvalidInstruction { opcode: 0xFF })
        ));
        // 0x29 sits inside the arithmetic range but is not assigned.
        assert!(Opcode::try_from(0x29).is_err());
    }

    #[test]
    fn mnemonics() {
        assert_eq!(Opcode::Load.mnemonic(), "LOAD");
        assert_eq!(Opcode::Syscall.mnemonic(), "SYSCALL");
        assert_eq!(Opcode::mnemonic_of(0xC0), "ALLOC");
        assert_eq!(Opcode::mnemonic_of(0xFF), "UNKNOWN");
    }
}
