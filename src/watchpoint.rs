//! Hardware watchpoint programming via x86_64 debug registers.
//!
//! DR0 holds the watched address, DR7 the enable bit and the access and
//! length fields for that slot, DR6 reports which slot fired. Only slot 0
//! is used: one variable per session.

use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};
use crate::tracee::Tracee;
use crate::types::{ProcessState, VirtAddr};

const SLOT: usize = 0;
const DR_STATUS: usize = 6;
const DR_CONTROL: usize = 7;

/// What kind of access traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// DR7 condition 0b01.
    Write,
    /// DR7 condition 0b11.
    ReadWrite,
}

impl AccessType {
    fn dr7_condition(self) -> u64 {
        match self {
            AccessType::Write => 0b01,
            AccessType::ReadWrite => 0b11,
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Write => write!(f, "write"),
            AccessType::ReadWrite => write!(f, "rw"),
        }
    }
}

/// Width of the watched region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchLength {
    Byte1,
    Byte2,
    Byte4,
    Byte8,
}

impl WatchLength {
    /// DR7 length encoding; note 8 bytes is 0b10, not 0b11.
    fn dr7_length(self) -> u64 {
        match self {
            WatchLength::Byte1 => 0b00,
            WatchLength::Byte2 => 0b01,
            WatchLength::Byte4 => 0b11,
            WatchLength::Byte8 => 0b10,
        }
    }

    pub fn bytes(self) -> u64 {
        match self {
            WatchLength::Byte1 => 1,
            WatchLength::Byte2 => 2,
            WatchLength::Byte4 => 4,
            WatchLength::Byte8 => 8,
        }
    }

    pub fn from_bytes(n: u64) -> Option<Self> {
        match n {
            1 => Some(WatchLength::Byte1),
            2 => Some(WatchLength::Byte2),
            4 => Some(WatchLength::Byte4),
            8 => Some(WatchLength::Byte8),
            _ => None,
        }
    }
}

/// The values written into the debug registers for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugRegisterProgram {
    pub address: VirtAddr,
    pub length: WatchLength,
    pub access: AccessType,
    pub enabled: bool,
}

impl DebugRegisterProgram {
    fn enable_bit() -> u64 {
        1 << (SLOT * 2)
    }

    fn slot_mask() -> u64 {
        (0b11 << (SLOT * 2)) | (0b1111 << (SLOT * 4 + 16))
    }

    /// Merge this program into an existing DR7 value, leaving other slots
    /// untouched.
    pub fn dr7(&self, current: u64) -> u64 {
        let mut dr7 = current & !Self::slot_mask();
        if self.enabled {
            dr7 |= Self::enable_bit();
        }
        dr7 |= self.access.dr7_condition() << (SLOT * 4 + 16);
        dr7 |= self.length.dr7_length() << (SLOT * 4 + 18);
        dr7
    }
}

/// The session's single hardware watchpoint.
#[derive(Debug)]
pub struct Watchpoint {
    program: DebugRegisterProgram,
}

impl Watchpoint {
    /// The hardware ignores the low address bits, so the address must be
    /// aligned to the watched length.
    pub fn new(address: VirtAddr, length: WatchLength, access: AccessType) -> Result<Self> {
        if !address.is_aligned(length.bytes()) {
            return Err(Error::Misaligned {
                addr: address,
                align: length.bytes(),
            });
        }
        Ok(Watchpoint {
            program: DebugRegisterProgram {
                address,
                length,
                access,
                enabled: false,
            },
        })
    }

    /// Four bytes, trapping on loads and stores.
    pub fn read_write_u32(address: VirtAddr) -> Result<Self> {
        Watchpoint::new(address, WatchLength::Byte4, AccessType::ReadWrite)
    }

    pub fn program(&self) -> &DebugRegisterProgram {
        &self.program
    }

    pub fn is_armed(&self) -> bool {
        self.program.enabled
    }

    pub fn arm<T: Tracee>(&mut self, tracee: &mut T) -> Result<()> {
        tracee.write_debug_reg(SLOT, self.program.address.addr())?;
        let current = tracee.read_debug_reg(DR_CONTROL)?;
        let armed = DebugRegisterProgram {
            enabled: true,
            ..self.program
        };
        tracee.write_debug_reg(DR_CONTROL, armed.dr7(current))?;
        self.program = armed;
        debug!(
            addr = %self.program.address,
            len = self.program.length.bytes(),
            access = %self.program.access,
            "watchpoint armed"
        );
        Ok(())
    }

    /// Clear the enable bit. A no-op when already disarmed or when the
    /// child has exited, since its register file is gone.
    pub fn disarm<T: Tracee>(&mut self, tracee: &mut T) -> Result<()> {
        if !self.program.enabled {
            return Ok(());
        }
        if tracee.state() == ProcessState::Exited {
            self.program.enabled = false;
            return Ok(());
        }

        let current = tracee.read_debug_reg(DR_CONTROL)?;
        tracee.write_debug_reg(DR_CONTROL, current & !DebugRegisterProgram::enable_bit())?;
        self.program.enabled = false;
        debug!("watchpoint disarmed");
        Ok(())
    }

    /// Whether the last SIGTRAP came from this watchpoint. Clears DR6.
    pub fn take_hit<T: Tracee>(&self, tracee: &mut T) -> Result<bool> {
        let dr6 = tracee.read_debug_reg(DR_STATUS)?;
        if dr6 == 0 {
            return Ok(false);
        }
        tracee.write_debug_reg(DR_STATUS, 0)?;
        Ok(dr6 & (1 << SLOT) != 0)
    }
}
