// CPU fault taxonomy. Faults are plain values travelling on the Result
// channel out of the execute path; the fetch-execute driver catches them at
// the instruction boundary and turns them into interrupt delivery.

use thiserror::Error;

/// A fault raised somewhere inside instruction execution. The selector error
/// codes use the architectural encoding (index | table | external bits); #PF
/// carries the synthesized error code, the linear address having already been
/// latched into CR2 by the page walker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("#DE divide error: {0}")]
    DivideError(String),
    #[error("#UD invalid opcode: {0}")]
    InvalidOpcode(String),
    #[error("#BR bound range exceeded: {0}")]
    BoundRangeExceeded(String),
    #[error("#NP({selector:#06x}) segment not present: {reason}")]
    NotPresent { selector: u16, reason: String },
    #[error("#SS({selector:#06x}) stack fault: {reason}")]
    StackFault { selector: u16, reason: String },
    #[error("#GP({code:#06x}) general protection fault: {reason}")]
    GeneralProtectionFault { code: u16, reason: String },
    #[error("#TS({selector:#06x}) invalid TSS: {reason}")]
    InvalidTss { selector: u16, reason: String },
    #[error("#PF({code:#06x}) page fault at linear {address:#010x}")]
    PageFault { code: u16, address: u32 },
}

impl Fault {
    pub fn vector(&self) -> u8 {
        match self {
            Fault::DivideError(_) => 0x0,
            Fault::BoundRangeExceeded(_) => 0x5,
            Fault::InvalidOpcode(_) => 0x6,
            Fault::InvalidTss { .. } => 0xa,
            Fault::NotPresent { .. } => 0xb,
            Fault::StackFault { .. } => 0xc,
            Fault::GeneralProtectionFault { .. } => 0xd,
            Fault::PageFault { .. } => 0xe,
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            Fault::DivideError(_) | Fault::InvalidOpcode(_) | Fault::BoundRangeExceeded(_) => None,
            Fault::NotPresent { selector, .. }
            | Fault::StackFault { selector, .. }
            | Fault::InvalidTss { selector, .. } => Some(*selector),
            Fault::GeneralProtectionFault { code, .. } => Some(*code),
            Fault::PageFault { code, .. } => Some(*code),
        }
    }
}

/// Why the execute path bailed out of the current instruction. A pending
/// external IRQ observed inside a REP loop is not a fault; the driver rewinds
/// EIP so the prefixed instruction resumes after the ISR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    Fault(Fault),
    HardwareInterruptDuringRep,
}

impl From<Fault> for Trap {
    fn from(fault: Fault) -> Trap {
        Trap::Fault(fault)
    }
}

pub type MemResult<T> = Result<T, Fault>;
pub type ExecResult = Result<(), Trap>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_and_codes() {
        let gp = Fault::GeneralProtectionFault {
            code: 0x1234,
            reason: "test".into(),
        };
        assert_eq!(gp.vector(), 0xd);
        assert_eq!(gp.code(), Some(0x1234));

        let ud = Fault::InvalidOpcode("test".into());
        assert_eq!(ud.vector(), 0x6);
        assert_eq!(ud.code(), None);

        let pf = Fault::PageFault {
            code: 0b101,
            address: 0x1234_5678,
        };
        assert_eq!(pf.vector(), 0xe);
        assert_eq!(pf.code(), Some(0b101));
    }
}
