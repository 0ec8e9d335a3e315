use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::symbols::ResolverKind;

/// Everything a watch session needs, independent of how it was parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    pub symbol: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub resolver: ResolverKind,
    /// Fail instead of falling back to the static address when the load
    /// base of a position-independent target cannot be found.
    pub require_load_base: bool,
}

impl WatchConfig {
    pub fn new(symbol: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        WatchConfig {
            symbol: symbol.into(),
            program: program.into(),
            args: Vec::new(),
            resolver: ResolverKind::default(),
            require_load_base: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(Error::Usage("missing --var".into()));
        }
        if self.program.as_os_str().is_empty() {
            return Err(Error::Usage("missing --exec".into()));
        }
        Ok(())
    }

    /// The program path as matched against `/proc/[pid]/maps`.
    pub fn program_str(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}
