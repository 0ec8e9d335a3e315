//! Symbol name → static address lookup.
//!
//! Two interchangeable resolvers sit behind [`SymbolResolver`]:
//!
//! - [`NmResolver`] asks binutils' `nm -C` and scans its output.
//! - [`ElfResolver`] reads the symbol table itself through [`crate::elf`].
//!
//! Both apply the same policy: the first entry with the exact name wins,
//! and if that entry is undefined or weak the lookup fails instead of
//! handing back an address that would not be the variable's storage.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::elf::ElfFile;
use crate::types::VirtAddr;

pub trait SymbolResolver {
    /// Static address of `symbol` in `binary`, `None` if absent or rejected.
    fn resolve(&self, binary: &Path, symbol: &str) -> Option<VirtAddr>;
}

/// Which resolver to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolverKind {
    #[default]
    Nm,
    Elf,
}

impl std::str::FromStr for ResolverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nm" => Ok(ResolverKind::Nm),
            "elf" | "native" => Ok(ResolverKind::Elf),
            _ => Err(format!("unknown resolver: {s} (use 'nm' or 'elf')")),
        }
    }
}

impl SymbolResolver for ResolverKind {
    fn resolve(&self, binary: &Path, symbol: &str) -> Option<VirtAddr> {
        match self {
            ResolverKind::Nm => NmResolver::default().resolve(binary, symbol),
            ResolverKind::Elf => ElfResolver.resolve(binary, symbol),
        }
    }
}

/// One parsed line of `nm` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmEntry {
    /// Absent for undefined symbols.
    pub addr: Option<u64>,
    pub kind: char,
    pub name: String,
}

impl NmEntry {
    fn is_rejected(&self) -> bool {
        matches!(self.kind, 'U' | 'w' | 'W' | 'v' | 'V')
    }
}

fn parse_nm_line(line: &str) -> Option<NmEntry> {
    let line = line.trim_end();
    // Undefined entries leave the address column blank.
    let (addr, rest) = if line.starts_with(' ') {
        (None, line.trim_start())
    } else {
        let (addr, rest) = line.split_once(' ')?;
        (Some(u64::from_str_radix(addr, 16).ok()?), rest)
    };

    let (kind, name) = rest.split_once(' ')?;
    let mut chars = kind.chars();
    let kind = chars.next()?;
    if chars.next().is_some() || name.is_empty() {
        return None;
    }

    Some(NmEntry {
        addr,
        kind,
        name: name.to_string(),
    })
}

pub fn parse_nm_output(output: &str) -> Vec<NmEntry> {
    output.lines().filter_map(parse_nm_line).collect()
}

/// Apply the first-match / reject-weak-or-undefined policy to `nm` output.
pub fn lookup_nm(output: &str, symbol: &str) -> Option<VirtAddr> {
    let entry = output
        .lines()
        .filter_map(parse_nm_line)
        .find(|e| e.name == symbol)?;

    if entry.is_rejected() {
        debug!(symbol, kind = %entry.kind, "symbol is weak or undefined");
        return None;
    }
    entry.addr.filter(|&a| a != 0).map(VirtAddr)
}

/// Resolves through an external `nm` process.
#[derive(Debug, Clone)]
pub struct NmResolver {
    program: String,
}

impl Default for NmResolver {
    fn default() -> Self {
        NmResolver {
            program: "nm".to_string(),
        }
    }
}

impl NmResolver {
    pub fn with_program(program: impl Into<String>) -> Self {
        NmResolver {
            program: program.into(),
        }
    }
}

impl SymbolResolver for NmResolver {
    fn resolve(&self, binary: &Path, symbol: &str) -> Option<VirtAddr> {
        let output = match Command::new(&self.program).arg("-C").arg(binary).output() {
            Ok(output) => output,
            Err(e) => {
                debug!(program = %self.program, error = %e, "cannot spawn symbol tool");
                return None;
            }
        };
        if !output.status.success() {
            debug!(status = %output.status, "symbol tool failed");
            return None;
        }
        lookup_nm(&String::from_utf8_lossy(&output.stdout), symbol)
    }
}

/// Resolves by reading the ELF symbol table directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElfResolver;

impl SymbolResolver for ElfResolver {
    fn resolve(&self, binary: &Path, symbol: &str) -> Option<VirtAddr> {
        let elf = match ElfFile::load(binary) {
            Ok(elf) => elf,
            Err(e) => {
                debug!(error = %e, "cannot load symbol table");
                return None;
            }
        };
        elf.find_symbol(symbol)
            .filter(|s| s.is_watchable())
            .map(|s| s.addr)
    }
}
