//! `/proc/[pid]/maps` parsing and load-base discovery.
//!
//! Position-independent executables are mapped at a randomized base.
//! The static address of a symbol only becomes a runtime address once that
//! base is known, and the maps file is the one place it is recorded.

use std::fmt;
use std::path::PathBuf;

use nix::unistd::Pid;

use crate::error::Result;
use crate::types::VirtAddr;

/// One line of `/proc/[pid]/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub perms: String,
    pub offset: u64,
    pub pathname: String,
}

impl MemoryRegion {
    /// Backed by a file (as opposed to anonymous, `[heap]`, `[vdso]`...).
    pub fn is_file_backed(&self) -> bool {
        self.pathname.starts_with('/')
    }
}

pub fn read_memory_maps(pid: Pid) -> Result<Vec<MemoryRegion>> {
    let content = std::fs::read_to_string(format!("/proc/{}/maps", pid))?;
    Ok(parse_maps(&content))
}

/// Parse the contents of a maps file, skipping malformed lines.
pub fn parse_maps(content: &str) -> Vec<MemoryRegion> {
    content.lines().filter_map(parse_map_line).collect()
}

fn parse_map_line(line: &str) -> Option<MemoryRegion> {
    // 7f8a1000-7f8a2000 r-xp 00000000 08:01 12345  /lib/libc.so.6
    let mut parts = line.split_whitespace();

    let (start, end) = parts.next()?.split_once('-')?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let pathname = parts.collect::<Vec<_>>().join(" ");

    Some(MemoryRegion {
        start: VirtAddr(u64::from_str_radix(start, 16).ok()?),
        end: VirtAddr(u64::from_str_radix(end, 16).ok()?),
        perms: perms.to_string(),
        offset: u64::from_str_radix(offset, 16).ok()?,
        pathname,
    })
}

pub fn get_exe_path(pid: Pid) -> Result<PathBuf> {
    Ok(std::fs::read_link(format!("/proc/{}/exe", pid))?)
}

/// Start of the first file-backed region whose path contains `binary_path`.
///
/// Maps are listed in ascending address order, so the first match is the
/// lowest mapping of that file.
pub fn find_load_base(maps: &[MemoryRegion], binary_path: &str) -> Option<VirtAddr> {
    if binary_path.is_empty() {
        return None;
    }
    maps.iter()
        .filter(|r| r.is_file_backed())
        .find(|r| r.pathname.contains(binary_path))
        .map(|r| r.start)
}

/// How the load base of the target was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBase {
    /// The path given on the command line matched a mapping.
    Direct(VirtAddr),
    /// Only the kernel-resolved `/proc/[pid]/exe` path matched.
    ViaExecutable(VirtAddr),
    Unresolved,
}

impl LoadBase {
    pub fn base(self) -> Option<VirtAddr> {
        match self {
            LoadBase::Direct(base) | LoadBase::ViaExecutable(base) => Some(base),
            LoadBase::Unresolved => None,
        }
    }
}

impl fmt::Display for LoadBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBase::Direct(base) => write!(f, "{}", base),
            LoadBase::ViaExecutable(base) => write!(f, "{} (via /proc/pid/exe)", base),
            LoadBase::Unresolved => write!(f, "unresolved"),
        }
    }
}

/// Find the load base, retrying with the resolved executable path.
///
/// `exe_path` is only consulted when the direct search misses, e.g. when the
/// target was launched through a relative path or a symlink.
pub fn locate_load_base<F>(maps: &[MemoryRegion], binary_path: &str, exe_path: F) -> LoadBase
where
    F: FnOnce() -> Option<PathBuf>,
{
    if let Some(base) = find_load_base(maps, binary_path) {
        return LoadBase::Direct(base);
    }

    let resolved = exe_path();
    match resolved.as_deref().and_then(|p| p.to_str()) {
        Some(exe) => match find_load_base(maps, exe) {
            Some(base) => LoadBase::ViaExecutable(base),
            None => LoadBase::Unresolved,
        },
        None => LoadBase::Unresolved,
    }
}
