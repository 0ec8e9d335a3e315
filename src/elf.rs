//! Native ELF symbol table access.
//!
//! Memory-maps the binary and collects the named symbols once, so a lookup
//! never re-parses the file.

use std::path::Path;

use memmap2::Mmap;
use object::{Object, ObjectKind, ObjectSymbol, SymbolKind};

use crate::error::{Error, Result};
use crate::types::VirtAddr;

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub addr: VirtAddr,
    pub size: u64,
    pub is_data: bool,
    pub is_weak: bool,
    pub is_undefined: bool,
}

impl Symbol {
    /// Defined, strong, with a real address.
    pub fn is_watchable(&self) -> bool {
        !self.is_undefined && !self.is_weak && self.addr.addr() != 0
    }
}

pub struct ElfFile {
    _mmap: Mmap,
    symbols: Vec<Symbol>,
    position_independent: bool,
}

impl ElfFile {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("open ELF '{}': {}", path.display(), e),
            ))
        })?;
        let mmap = unsafe { Mmap::map(&file) }?;
        let obj = object::File::parse(&*mmap).map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("parse ELF '{}': {}", path.display(), e),
            ))
        })?;

        let symbols = obj
            .symbols()
            .chain(obj.dynamic_symbols())
            .filter_map(|sym| {
                let name = sym.name().ok().filter(|n| !n.is_empty())?;
                Some(Symbol {
                    name: name.to_string(),
                    addr: VirtAddr(sym.address()),
                    size: sym.size(),
                    is_data: sym.kind() == SymbolKind::Data,
                    is_weak: sym.is_weak(),
                    is_undefined: sym.is_undefined(),
                })
            })
            .collect();

        // ET_DYN covers PIE executables; ET_EXEC is linked at a fixed address.
        let position_independent = obj.kind() != ObjectKind::Executable;

        Ok(ElfFile {
            symbols,
            position_independent,
            _mmap: mmap,
        })
    }

    /// First symbol table entry with exactly this name, in file order.
    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    pub fn is_position_independent(&self) -> bool {
        self.position_independent
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }
}

/// Whether `path` needs relocating by its load base.
///
/// Unreadable or unparsable files are assumed to be position-independent,
/// which is what every modern toolchain emits by default.
pub fn is_position_independent(path: &Path) -> bool {
    ElfFile::load(path)
        .map(|elf| elf.is_position_independent())
        .unwrap_or(true)
}
