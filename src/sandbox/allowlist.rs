//! The capability table: the only path from sandboxed code to host resources.
//!
//! Module names map to a fixed set of [`Capability`] values. Anything not in
//! the table is denied. The table is built once at startup and shared,
//! immutable, by every execution.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// File I/O rooted at the configured sandbox directory.
    Fs,
    /// Pure path manipulation, no host access.
    Path,
    /// Raw TCP send/receive and address parsing.
    Net,
    /// Process spawning with a cleared environment.
    ChildProcess,
    /// gzip / deflate codecs.
    Zlib,
    /// UUIDs, random bytes and SHA-2 digests.
    Crypto,
    /// Outbound HTTP client helper.
    Fetch,
}

const ALL: &[Capability] = &[
    Capability::Fs,
    Capability::Path,
    Capability::Net,
    Capability::ChildProcess,
    Capability::Zlib,
    Capability::Crypto,
    Capability::Fetch,
];

impl Capability {
    /// The name scripts pass to `require`.
    pub fn module_name(self) -> &'static str {
        match self {
            Capability::Fs => "fs",
            Capability::Path => "path",
            Capability::Net => "net",
            Capability::ChildProcess => "child_process",
            Capability::Zlib => "zlib",
            Capability::Crypto => "crypto",
            Capability::Fetch => "fetch",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleAllowlist {
    modules: BTreeMap<&'static str, Capability>,
}

impl ModuleAllowlist {
    /// Every capability. Used by the authenticated entry points.
    pub fn standard() -> Self {
        Self::from_capabilities(ALL.iter().copied())
    }

    /// Everything except the HTTP client. Used by the unauthenticated entry point.
    pub fn public() -> Self {
        Self::from_capabilities(ALL.iter().copied().filter(|c| *c != Capability::Fetch))
    }

    fn from_capabilities(capabilities: impl Iterator<Item = Capability>) -> Self {
        Self {
            modules: capabilities.map(|c| (c.module_name(), c)).collect(),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<Capability, ModuleNotAllowed> {
        self.modules
            .get(name)
            .copied()
            .ok_or_else(|| ModuleNotAllowed::new(name))
    }

    pub fn grants(&self, capability: Capability) -> bool {
        self.modules.values().any(|c| *c == capability)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.keys().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleNotAllowed {
    pub name: String,
}

impl ModuleNotAllowed {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for ModuleNotAllowed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module '{}' is not allowed for import", self.name)
    }
}

impl std::error::Error for ModuleNotAllowed {}
