//! Error taxonomy for the virtual machine.
//!
//! Every fault carries enough context to render a useful diagnostic, and maps
//! to a stable numeric code via [`VmError::code`]. The codes are part of the
//! external contract (debuggers and test harnesses match on them) and must
//! never be renumbered.

use crate::types::encoding::DecodeError;
use std::fmt;
use vm32_derive::Error;

/// Errors that can occur during decoding, execution, or image loading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// Unknown opcode reached the dispatcher.
    #[error("invalid opcode 0x{opcode:02X}")]
    InvalidInstruction { opcode: u8 },
    /// Addressing mode nibble outside the defined range, or a mode that the
    /// instruction cannot accept (e.g. storing to an immediate).
    #[error("invalid addressing mode 0x{mode:01X}")]
    InvalidAddressingMode { mode: u8 },
    /// Access outside the backing memory, or a heap access that is not fully
    /// contained in one allocated block.
    #[error("memory access violation: address 0x{address:04X}, size {size}")]
    SegmentationFault { address: u16, size: u16 },
    /// Push below the bottom of the stack segment.
    #[error("stack overflow")]
    StackOverflow,
    /// Pop above the top of the stack segment.
    #[error("stack underflow")]
    StackUnderflow,
    #[error("division by zero")]
    DivisionByZero,
    /// Free or protect of an address that is not an allocated heap payload.
    #[error("invalid heap address 0x{address:04X}")]
    InvalidAddress { address: u16 },
    /// Free of a block that is already free. Shares the invalid-address code;
    /// the message distinguishes it.
    #[error("Double free detected at 0x{address:04X}")]
    DoubleFree { address: u16 },
    #[error("invalid system call {number}")]
    InvalidSyscall { number: u16 },
    /// Heap exhausted or the request can never fit.
    #[error("memory allocation of {requested} bytes failed")]
    MemoryAllocation { requested: u16 },
    #[error("misaligned access at 0x{address:04X}")]
    InvalidAlignment { address: u16 },
    /// INT through an empty or out-of-range vector-table entry.
    #[error("unhandled interrupt {vector}")]
    UnhandledInterrupt { vector: u8 },
    #[error("I/O error: {0}")]
    Io(String),
    /// Heap access whose required permission is not granted by the block.
    #[error("protection fault: address 0x{address:04X} requires {required}")]
    ProtectionFault { address: u16, required: ProtectionSet },
    /// INT while the interrupt-enable flag is clear.
    #[error("nested interrupt {vector} while interrupts are disabled")]
    NestedInterrupt { vector: u8 },
    /// Malformed program image or symbol table.
    #[error("bad program image: {reason}")]
    ImageFormat { reason: String },
}

impl VmError {
    /// Returns the stable numeric error code.
    ///
    /// The values mirror the binary container's error contract:
    /// 1 invalid-instruction, 2 segmentation-fault, 3 stack-overflow,
    /// 4 stack-underflow, 5 division-by-zero, 6 invalid-address,
    /// 7 invalid-syscall, 8 memory-allocation, 9 invalid-alignment,
    /// 10 unhandled-interrupt, 11 io-error, 12 protection-fault,
    /// 13 nested-interrupt. Code 0 is reserved for "no error".
    pub const fn code(&self) -> u8 {
        match self {
            VmError::InvalidInstruction { .. } | VmError::InvalidAddressingMode { .. } => 1,
            VmError::SegmentationFault { .. } => 2,
            VmError::StackOverflow => 3,
            VmError::StackUnderflow => 4,
            VmError::DivisionByZero => 5,
            VmError::InvalidAddress { .. } | VmError::DoubleFree { .. } => 6,
            VmError::InvalidSyscall { .. } => 7,
            VmError::MemoryAllocation { .. } => 8,
            VmError::InvalidAlignment { .. } => 9,
            VmError::UnhandledInterrupt { .. } => 10,
            VmError::Io(_) | VmError::ImageFormat { .. } => 11,
            VmError::ProtectionFault { .. } => 12,
            VmError::NestedInterrupt { .. } => 13,
        }
    }
}

impl From<DecodeError> for VmError {
    fn from(err: DecodeError) -> Self {
        let reason = match err {
            DecodeError::UnexpectedEof => "truncated",
            DecodeError::InvalidValue => "invalid field value",
            DecodeError::LengthOverflow => "length prefix exceeds input",
        };
        VmError::ImageFormat {
            reason: reason.to_string(),
        }
    }
}

/// Required-permission set rendered in protection-fault messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionSet(pub u8);

impl fmt::Display for ProtectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        for (bit, name) in [(1, "read"), (2, "write"), (4, "execute")] {
            if self.0 & bit != 0 {
                if wrote {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                wrote = true;
            }
        }
        if !wrote {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// A recorded fault: the error plus the address of the instruction that
/// raised it. This is the diagnostic slot the engine fills when a step fails;
/// it is cleared only by reset or an explicit host call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// The error that stopped execution.
    pub error: VmError,
    /// Address of the faulting instruction (the PC before the fetch).
    pub pc: u16,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error {} at 0x{:04X}: {}",
            self.error.code(),
            self.pc,
            self.error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(VmError::InvalidInstruction { opcode: 0xFF }.code(), 1);
        assert_eq!(
            VmError::SegmentationFault {
                address: 0,
                size: 4
            }
            .code(),
            2
        );
        assert_eq!(VmError::StackOverflow.code(), 3);
        assert_eq!(VmError::StackUnderflow.code(), 4);
        assert_eq!(VmError::DivisionByZero.code(), 5);
        assert_eq!(VmError::InvalidAddress { address: 0 }.code(), 6);
        assert_eq!(VmError::DoubleFree { address: 0 }.code(), 6);
        assert_eq!(VmError::InvalidSyscall { number: 99 }.code(), 7);
        assert_eq!(VmError::MemoryAllocation { requested: 0 }.code(), 8);
        assert_eq!(VmError::InvalidAlignment { address: 1 }.code(), 9);
        assert_eq!(VmError::UnhandledInterrupt { vector: 0 }.code(), 10);
        assert_eq!(VmError::Io(String::new()).code(), 11);
        assert_eq!(
            VmError::ProtectionFault {
                address: 0,
                required: ProtectionSet(2)
            }
            .code(),
            12
        );
        assert_eq!(VmError::NestedInterrupt { vector: 0 }.code(), 13);
    }

    #[test]
    fn double_free_message() {
        let err = VmError::DoubleFree { address: 0xC008 };
        assert!(err.to_string().starts_with("Double free detected"));
    }

    #[test]
    fn protection_set_display() {
        assert_eq!(ProtectionSet(0).to_string(), "none");
        assert_eq!(ProtectionSet(1).to_string(), "read");
        assert_eq!(ProtectionSet(3).to_string(), "read+write");
        assert_eq!(ProtectionSet(7).to_string(), "read+write+execute");
    }

    #[test]
    fn fault_display_includes_pc_and_code() {
        let fault = Fault {
            error: VmError::DivisionByZero,
            pc: 0x0010,
        };
        assert_eq!(fault.to_string(), "error 5 at 0x0010: division by zero");
    }
}
