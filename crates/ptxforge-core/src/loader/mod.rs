//! PTX to loaded module.
//!
//! Two interchangeable strategies:
//! - [`ExternalAssembler`]: `ptxas` on `PATH` compiles to a cubin, which the
//!   driver loads from disk
//! - [`DriverJit`]: the driver compiles the PTX in-process
//!
//! [`select_strategy`] probes for the assembler once per call and picks one.
//! There is no fallback between strategies after selection.

mod jit;
mod ptxas;

pub use jit::DriverJit;
pub use ptxas::ExternalAssembler;

use std::process::{Command, Stdio};

use crate::config::ForgeConfig;
use crate::driver::{CompiledModule, Driver};
use crate::error::ForgeError;
use crate::Result;

/// A way of turning PTX text into a loaded module.
pub trait LoadStrategy {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Load `assembly` for a device of the given compute capability.
    fn load(&self, assembly: &str, compute_capability: u32) -> Result<CompiledModule>;
}

/// Run `<program> --version`. Returns the banner if it exits successfully.
pub fn probe_assembler(program: &str) -> Option<String> {
    let output = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let mut banner = String::from_utf8_lossy(&output.stdout).into_owned();
    banner.push_str(&String::from_utf8_lossy(&output.stderr));
    Some(banner.trim().to_string())
}

/// Pick the loading strategy: the external assembler when it answers a
/// version probe, the driver JIT otherwise.
pub fn select_strategy<'a, D: Driver>(
    driver: &'a D,
    config: &'a ForgeConfig,
) -> Box<dyn LoadStrategy + 'a> {
    if config.use_external_assembler {
        if let Some(banner) = probe_assembler(&config.assembler) {
            let version = banner.lines().last().unwrap_or_default();
            tracing::debug!("using external assembler '{}' ({})", config.assembler, version);
            return Box::new(ExternalAssembler::new(driver, &config.assembler, config.temp_dir()));
        }
        tracing::debug!("'{}' not usable, falling back to driver JIT", config.assembler);
    }
    Box::new(DriverJit::new(driver, config.jit_options()))
}

/// Select a strategy and load `assembly` with it.
pub fn load_module<D: Driver>(
    driver: &D,
    config: &ForgeConfig,
    assembly: &str,
    compute_capability: u32,
) -> Result<CompiledModule> {
    let strategy = select_strategy(driver, config);
    let module = strategy.load(assembly, compute_capability)?;
    tracing::info!("loaded PTX module for sm_{} via {}", compute_capability, strategy.name());
    Ok(module)
}

/// Log the rejected text and the loader's diagnostic before the error
/// leaves the loader; the assembly is not kept anywhere else.
pub(crate) fn surface(err: ForgeError) -> ForgeError {
    match &err {
        ForgeError::InvalidAssembly { assembly, log } => {
            tracing::error!("generated PTX was rejected by the loader: {}", log);
            tracing::error!("rejected PTX:\n{}", assembly);
        }
        ForgeError::ExternalToolFailure { tool, status, log } => {
            tracing::error!("{} failed ({}): {}", tool, status, log);
        }
        _ => {}
    }
    err
}
