//! WASM symbol resolution and instrumentation compatibility
//!
//! Maps function indices to names using the module's `name` custom section and
//! checks the instrumentation version the module was built against.
//!
//! The instrumenting compiler exports two globals whose constant initializers
//! carry the version it implements:
//!
//! ```text
//! (global (export "wasm_instr_version_major") i32 (i32.const 0))
//! (global (export "wasm_instr_version_minor") i32 (i32.const 0))
//! ```
//!
//! Modules without these globals predate versioning; they are accepted with
//! [`Compatibility::NoCompatibilityInfo`]. Modules that declare a version this
//! crate does not understand are rejected.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use wasmparser::{ConstExpr, ExternalKind, KnownCustom, Name, Operator, Parser, Payload, TypeRef};

/// Export name of the major instrumentation version global
pub const VERSION_MAJOR_GLOBAL: &str = "wasm_instr_version_major";
/// Export name of the minor instrumentation version global
pub const VERSION_MINOR_GLOBAL: &str = "wasm_instr_version_minor";

/// Errors raised while reading a module's metadata
#[derive(Error, Debug)]
pub enum SymbolError {
    #[error("failed to decode wasm module: {0}")]
    Decode(#[from] wasmparser::BinaryReaderError),

    #[error("name section not found")]
    NameSectionMissing,

    #[error("expected instrumentation version >= {expected} but got {found}")]
    Incompatible {
        expected: InstrVersion,
        found: InstrVersion,
    },

    #[error("version global `{0}` has no readable constant initializer")]
    InvalidVersionGlobal(&'static str),
}

pub type Result<T> = std::result::Result<T, SymbolError>;

/// Instrumentation version (major, minor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrVersion {
    pub major: u32,
    pub minor: u32,
}

impl InstrVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for InstrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Minimum instrumentation version a module must declare
pub type CompatibilityBaseline = InstrVersion;

impl InstrVersion {
    /// Version implemented by this crate's correlator
    pub const CURRENT: CompatibilityBaseline = InstrVersion::new(0, 0);
}

impl Default for InstrVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Outcome of a successful compatibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// Declared version is within the baseline's range
    Compatible(InstrVersion),
    /// Module carries no version globals (legacy or uninstrumented)
    NoCompatibilityInfo,
}

/// Function index → declared name table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionNames(HashMap<u32, String>);

impl FunctionNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: u32, name: impl Into<String>) {
        self.0.insert(index, name.into());
    }

    /// Raw (possibly mangled) name for `index`
    pub fn get(&self, index: u32) -> Option<&str> {
        self.0.get(&index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries sorted by function index
    pub fn sorted(&self) -> Vec<(u32, &str)> {
        let mut entries: Vec<_> = self.0.iter().map(|(i, n)| (*i, n.as_str())).collect();
        entries.sort_by_key(|(i, _)| *i);
        entries
    }
}

/// Demangle a symbol name, falling back to the input unchanged
///
/// Never fails: anything that is not a valid Rust mangled symbol is returned
/// as-is.
pub fn resolve_name(raw: &str) -> String {
    match rustc_demangle::try_demangle(raw) {
        Ok(demangled) => format!("{:#}", demangled),
        Err(_) => raw.to_string(),
    }
}

/// Decode the function names from the module's `name` custom section
///
/// A module declaring an instrumentation version incompatible with
/// [`InstrVersion::CURRENT`] is rejected; one declaring none is accepted.
pub fn parse_function_names(module: &[u8]) -> Result<FunctionNames> {
    let meta = ModuleMetadata::decode(module)?;
    meta.compatibility(InstrVersion::CURRENT)?;
    meta.names.ok_or(SymbolError::NameSectionMissing)
}

/// Check the module's declared instrumentation version against `baseline`
pub fn check_compatibility(module: &[u8], baseline: CompatibilityBaseline) -> Result<Compatibility> {
    ModuleMetadata::decode(module)?.compatibility(baseline)
}

/// Everything the resolver needs from a single pass over the binary
#[derive(Debug, Default)]
struct ModuleMetadata {
    imported_globals: u32,
    /// Constant initializers of defined globals, in definition order
    global_inits: Vec<Option<u32>>,
    major_export: Option<u32>,
    minor_export: Option<u32>,
    names: Option<FunctionNames>,
}

impl ModuleMetadata {
    fn decode(module: &[u8]) -> Result<Self> {
        let mut meta = ModuleMetadata::default();

        for payload in Parser::new(0).parse_all(module) {
            match payload? {
                Payload::ImportSection(reader) => {
                    for import in reader {
                        if let TypeRef::Global(_) = import?.ty {
                            meta.imported_globals += 1;
                        }
                    }
                }
                Payload::GlobalSection(reader) => {
                    for global in reader {
                        meta.global_inits.push(const_u32(&global?.init_expr));
                    }
                }
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export?;
                        if export.kind != ExternalKind::Global {
                            continue;
                        }
                        match export.name {
                            VERSION_MAJOR_GLOBAL => meta.major_export = Some(export.index),
                            VERSION_MINOR_GLOBAL => meta.minor_export = Some(export.index),
                            _ => {}
                        }
                    }
                }
                Payload::CustomSection(reader) => {
                    if let KnownCustom::Name(subsections) = reader.as_known() {
                        let names = meta.names.get_or_insert_with(FunctionNames::new);
                        for subsection in subsections {
                            if let Name::Function(map) = subsection? {
                                for naming in map {
                                    let naming = naming?;
                                    names.insert(naming.index, naming.name);
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(meta)
    }

    fn compatibility(&self, baseline: CompatibilityBaseline) -> Result<Compatibility> {
        let (Some(major_index), Some(minor_index)) = (self.major_export, self.minor_export) else {
            return Ok(Compatibility::NoCompatibilityInfo);
        };

        let found = InstrVersion {
            major: self.global_value(major_index, VERSION_MAJOR_GLOBAL)?,
            minor: self.global_value(minor_index, VERSION_MINOR_GLOBAL)?,
        };

        if found.major != baseline.major || found.minor < baseline.minor {
            return Err(SymbolError::Incompatible {
                expected: baseline,
                found,
            });
        }

        Ok(Compatibility::Compatible(found))
    }

    /// Resolve an exported global index (imports come first) to its value
    fn global_value(&self, index: u32, export: &'static str) -> Result<u32> {
        index
            .checked_sub(self.imported_globals)
            .and_then(|defined| self.global_inits.get(defined as usize).copied().flatten())
            .ok_or(SymbolError::InvalidVersionGlobal(export))
    }
}

fn const_u32(expr: &ConstExpr<'_>) -> Option<u32> {
    let mut reader = expr.get_operators_reader();
    match reader.read().ok()? {
        Operator::I32Const { value } => Some(value as u32),
        Operator::I64Const { value } => u32::try_from(value).ok(),
        _ => None,
    }
}

/// Function names and compatibility of one instrumented module
#[derive(Debug, Clone)]
pub struct SymbolResolver {
    names: FunctionNames,
    compatibility: Compatibility,
}

impl SymbolResolver {
    /// Read names and check the version gate in one pass
    ///
    /// Fails if the module cannot be decoded, has no name section, or
    /// declares an incompatible instrumentation version.
    pub fn new(module: &[u8], baseline: CompatibilityBaseline) -> Result<Self> {
        let meta = ModuleMetadata::decode(module)?;
        let compatibility = meta.compatibility(baseline)?;
        if compatibility == Compatibility::NoCompatibilityInfo {
            tracing::warn!("module declares no instrumentation version; treating it as legacy");
        }
        let names = meta.names.ok_or(SymbolError::NameSectionMissing)?;
        tracing::debug!(functions = names.len(), "loaded wasm function names");

        Ok(Self {
            names,
            compatibility,
        })
    }

    pub fn compatibility(&self) -> Compatibility {
        self.compatibility
    }

    pub fn names(&self) -> &FunctionNames {
        &self.names
    }

    /// Demangled name of the function at `index`, if the module declares one
    pub fn name_of(&self, index: u32) -> Option<String> {
        self.names.get(index).map(resolve_name)
    }
}
