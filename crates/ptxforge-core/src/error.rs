//! Error taxonomy for lowering, patching and loading.

/// Errors raised anywhere between IR input and a loaded module.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("CUDA toolkit {version} is not supported (10.0 or newer is required)")]
    UnsupportedToolkitVersion { version: u32 },

    #[error("target configuration failed: {0}")]
    TargetConfiguration(String),

    /// The loader rejected the generated text. Carries the exact assembly
    /// that was submitted and whatever log the loader captured.
    #[error("generated PTX was rejected as invalid: {log}")]
    InvalidAssembly { assembly: String, log: String },

    #[error("external tool '{tool}' failed (status: {status}): {log}")]
    ExternalToolFailure {
        tool: String,
        status: String,
        log: String,
    },

    #[error("shared library not available: {library}")]
    LibraryNotAvailable { library: String },

    #[error("CUDA driver error {code} ({name}) in {call}")]
    Driver {
        call: String,
        code: i32,
        name: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ForgeError {
    /// Whether this failure points at the generated assembly itself.
    pub fn is_invalid_assembly(&self) -> bool {
        matches!(self, ForgeError::InvalidAssembly { .. })
    }
}
