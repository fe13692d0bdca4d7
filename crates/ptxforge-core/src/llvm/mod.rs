//! LLVM NVPTX backend, loaded at runtime.
//!
//! Provides:
//! - Runtime-loaded LLVM C API (`ffi`)
//! - One-time NVPTX target registration (`init`)
//! - [`LlvmBackend`], the [`crate::codegen::CodegenBackend`] that parses,
//!   verifies and lowers IR to PTX

pub mod backend;
pub mod ffi;
pub mod init;

pub use backend::LlvmBackend;
pub use init::initialize_nvptx;
