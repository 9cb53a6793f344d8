use anyhow::Error as AnyError;
use thiserror::Error;

/// Engine errors surfaced to the embedding runtime.
///
/// Invariant violations (a host import fired without a compilation context, an
/// unknown value-type encoding, a failed `munmap`) are not represented here;
/// they indicate internal state corruption and abort the process with a
/// `BUG:`-prefixed panic instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {}", .0)]
    InvalidArgument(&'static str),

    /// Mapping a code segment failed. Surfaced as an I/O-class error to the
    /// caller of `compile_module`.
    #[error("Code mapping error: {}", .0)]
    CodeMapping(#[from] std::io::Error),

    /// The code generator rejected a function body, trapped, or produced
    /// output the engine could not read back.
    #[error("Code generator error: {}", .0)]
    Generator(String),

    /// A direct-call relocation target does not fit the call instruction's
    /// displacement range.
    #[error("Relocation target out of range: callee {}, site {:#x}", .0, .1)]
    RelocationOutOfRange(u32, u64),

    /// An attempt to instantiate a module whose id was never compiled.
    #[error("source module for {} must be compiled before instantiation", .0)]
    NotCompiled(String),

    /// An imported function's VM context was missing from the registry.
    #[error("Import resolution error: {}", .0)]
    ImportResolution(String),

    /// An unsupported feature was used.
    #[error("Unsupported feature: {}", .0)]
    Unsupported(String),

    /// A catch-all for internal errors that are likely unrecoverable by the
    /// embedding runtime.
    #[error("Internal error: {}", .0)]
    InternalError(#[source] AnyError),
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Error {
        Error::InternalError(e.into())
    }
}

#[macro_export]
macro_rules! craneback_format_err {
    ($($arg:tt)*) => { $crate::error::Error::InternalError(anyhow::format_err!($($arg)*)) }
}
