//! Configuration for lowering and module loading.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codegen::GeneratorLimits;
use crate::driver::JitOptions;
use crate::error::ForgeError;
use crate::version::IsaVersion;
use crate::Result;

/// Configuration shared by the code generator and the module loader.
///
/// Missing keys in a JSON file fall back to [`ForgeConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// External PTX assembler, looked up on `PATH` when not a path.
    pub assembler: String,

    /// Probe for the external assembler at all. When false the driver JIT
    /// is always used.
    pub use_external_assembler: bool,

    /// Directory for the assembler's temporary files (system temp dir if unset).
    pub temp_dir: Option<PathBuf>,

    /// Size of the driver JIT error log buffer in bytes.
    pub error_log_bytes: usize,

    /// Size of the driver JIT info log buffer in bytes.
    pub info_log_bytes: usize,

    /// Ask the driver JIT for verbose logs.
    pub jit_verbose: bool,

    /// Newest compute capability the LLVM NVPTX backend schedules for.
    pub max_generator_compute_capability: u32,

    /// Newest PTX ISA the LLVM NVPTX backend emits (`major * 10 + minor`).
    pub max_generator_isa: u32,

    /// Explicit LLVM shared library (e.g. `/usr/lib/llvm-17/lib/libLLVM.so`).
    pub llvm_library: Option<String>,

    /// Explicit CUDA driver library (e.g. `libcuda.so.1`).
    pub cuda_library: Option<String>,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            assembler: "ptxas".into(),
            use_external_assembler: true,
            temp_dir: None,
            error_log_bytes: 8192,
            info_log_bytes: 8192,
            jit_verbose: true,
            max_generator_compute_capability: 75,
            max_generator_isa: 64,
            llvm_library: None,
            cuda_library: None,
        }
    }
}

impl ForgeConfig {
    /// Load a config from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
            .map_err(|e| ForgeError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse a config from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ForgeError::Config(e.to_string()))
    }

    /// Apply `PTXFORGE_*` environment overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(assembler) = lookup("PTXFORGE_ASSEMBLER") {
            self.assembler = assembler;
        }
        if let Some(dir) = lookup("PTXFORGE_TMPDIR") {
            self.temp_dir = Some(PathBuf::from(dir));
        }
        if let Some(lib) = lookup("PTXFORGE_LLVM_LIBRARY") {
            self.llvm_library = Some(lib);
        }
        if let Some(lib) = lookup("PTXFORGE_CUDA_LIBRARY") {
            self.cuda_library = Some(lib);
        }
        if lookup("PTXFORGE_NO_PTXAS").is_some() {
            self.use_external_assembler = false;
        }
        self
    }

    /// Driver JIT options derived from this config.
    pub fn jit_options(&self) -> JitOptions {
        JitOptions {
            error_log_bytes: self.error_log_bytes,
            info_log_bytes: self.info_log_bytes,
            verbose: self.jit_verbose,
        }
    }

    /// Generator ceilings derived from this config.
    pub fn generator_limits(&self) -> GeneratorLimits {
        GeneratorLimits {
            max_compute_capability: self.max_generator_compute_capability,
            max_isa: IsaVersion::new(self.max_generator_isa),
        }
    }

    /// Directory used for temporary files.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
