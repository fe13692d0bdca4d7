//! # ptxforge-core
//!
//! Lowers LLVM IR to PTX for NVIDIA GPUs and loads the result as a CUDA module.
//!
//! Provides:
//! - Toolkit version to PTX ISA resolution
//! - NVPTX code generation through a runtime-loaded LLVM
//! - PTX post-processing (directive rewriting, inline-asm marker removal)
//! - Module loading via an external `ptxas` or the driver JIT
//!
//! Neither LLVM nor the CUDA driver is linked at build time; both are opened
//! with `libloading` the first time they are needed.

pub mod codegen;
pub mod config;
pub mod driver;
pub mod error;
pub mod forge;
pub mod llvm;
pub mod loader;
pub mod program;
pub mod ptx;
pub mod target;
pub mod version;

pub use codegen::{CodeGenerator, CodegenBackend, GeneratorLimits, MachineSpec};
pub use config::ForgeConfig;
pub use driver::{CompiledModule, CudaDriver, Driver};
pub use error::ForgeError;
pub use forge::Forge;
pub use llvm::LlvmBackend;
pub use loader::{load_module, LoadStrategy};
pub use program::IntermediateProgram;
pub use target::TargetDescriptor;
pub use version::{resolve_isa_version, IsaVersion};

pub type Result<T> = std::result::Result<T, ForgeError>;
