use super::{surface, LoadStrategy};
use crate::driver::{CompiledModule, Driver, JitModule, JitOptions};
use crate::Result;

/// Hand the PTX text to the driver, which compiles it in-process.
pub struct DriverJit<'a, D> {
    driver: &'a D,
    options: JitOptions,
}

impl<'a, D: Driver> DriverJit<'a, D> {
    pub fn new(driver: &'a D, options: JitOptions) -> Self {
        Self { driver, options }
    }
}

impl<D: Driver> LoadStrategy for DriverJit<'_, D> {
    fn name(&self) -> &'static str {
        "driver-jit"
    }

    fn load(&self, assembly: &str, compute_capability: u32) -> Result<CompiledModule> {
        tracing::debug!(
            "JIT compiling {} bytes of PTX for sm_{}",
            assembly.len(),
            compute_capability
        );
        let JitModule { module, info_log } = self
            .driver
            .load_data(assembly, &self.options)
            .map_err(|e| surface(e.into_forge_error(assembly)))?;
        if !info_log.is_empty() {
            tracing::debug!("driver JIT:\n{}", info_log);
        }
        Ok(module)
    }
}
