//! `craneback` is an ahead-of-time WebAssembly engine built around an
//! external, sandboxed Cranelift code generator.
//!
//! The generator is itself a Wasm module; the engine instantiates it in a
//! nested runtime ([`generator`]), feeds it one function body at a time, and
//! answers its queries about module shape and VM-context layout. Emitted
//! bodies are laid out into a single executable mapping with direct-call
//! relocations resolved in place ([`engine`]). Each module instance gets an
//! opaque VM context that generated code dereferences at runtime to find
//! linear memories and imported functions ([`vmcontext`]), and host code
//! enters generated functions through per-signature trampolines
//! ([`trampoline`], [`arch`]).

#![deny(bare_trait_objects)]

pub mod arch;
pub mod engine;
pub mod error;
pub mod generator;
pub mod mmap;
pub mod module;
pub mod trampoline;
pub mod vmcontext;

pub use crate::engine::{CompiledModule, Engine};
pub use crate::error::Error;
pub use crate::generator::TargetKind;
pub use crate::mmap::CodeSegment;
pub use crate::module::{
    FunctionInstanceHandle, InstanceId, ModuleHandle, ModuleId, ModuleInstanceHandle, ValType,
};
pub use crate::trampoline::{CallEngine, ModuleEngine};
pub use crate::vmcontext::{VmContext, VmContextLayout};
