//! One-time NVPTX target registration.

use std::sync::OnceLock;

use super::ffi::{self, LlvmApi};
use crate::error::ForgeError;
use crate::Result;

static NVPTX_REGISTERED: OnceLock<()> = OnceLock::new();

/// Load LLVM and register the NVPTX target info, target, MC layer and asm
/// printer. Registration runs once per process no matter how many threads
/// race on the first call.
pub fn initialize_nvptx(library: Option<&str>) -> Result<&'static LlvmApi> {
    let api = ffi::llvm_api(library).ok_or_else(|| ForgeError::LibraryNotAvailable {
        library: ffi::library_label(library),
    })?;
    NVPTX_REGISTERED.get_or_init(|| {
        unsafe {
            (api.initialize_nvptx_target_info)();
            (api.initialize_nvptx_target)();
            (api.initialize_nvptx_target_mc)();
            (api.initialize_nvptx_asm_printer)();
        }
        tracing::debug!("registered LLVM NVPTX target");
    });
    Ok(api)
}

/// Whether NVPTX registration has already happened in this process.
pub fn is_initialized() -> bool {
    NVPTX_REGISTERED.get().is_some()
}
