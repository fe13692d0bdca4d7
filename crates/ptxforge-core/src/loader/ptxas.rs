//! External `ptxas` assembly to a cubin on disk, then a file load.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tempfile::{Builder, TempPath};

use super::{surface, LoadStrategy};
use crate::driver::{CompiledModule, Driver};
use crate::error::ForgeError;
use crate::target::sm_name;
use crate::Result;

/// Assemble with an external `ptxas`, then load the object from disk.
///
/// The source, the diagnostic log and the object are all temporary files
/// in `temp_dir`; each is removed when `load` returns, on every path.
pub struct ExternalAssembler<'a, D> {
    driver: &'a D,
    program: String,
    temp_dir: PathBuf,
}

impl<'a, D: Driver> ExternalAssembler<'a, D> {
    pub fn new(driver: &'a D, program: &str, temp_dir: PathBuf) -> Self {
        Self {
            driver,
            program: program.to_string(),
            temp_dir,
        }
    }

    fn read_log(path: &std::path::Path) -> String {
        std::fs::read_to_string(path)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default()
    }
}

impl<D: Driver> LoadStrategy for ExternalAssembler<'_, D> {
    fn name(&self) -> &'static str {
        "ptxas"
    }

    fn load(&self, assembly: &str, compute_capability: u32) -> Result<CompiledModule> {
        let mut source = Builder::new()
            .prefix("ptxforge_k_")
            .suffix(".ptx")
            .tempfile_in(&self.temp_dir)?;
        source.write_all(assembly.as_bytes())?;
        source.flush()?;

        let log = Builder::new()
            .prefix("ptxforge_l_")
            .suffix(".log")
            .tempfile_in(&self.temp_dir)?;
        let object = TempPath::try_from_path(source.path().with_extension("cubin"))?;

        let gpu_name = format!("--gpu-name={}", sm_name(compute_capability));
        tracing::debug!(
            "{} -v {} {} -o {}",
            self.program,
            gpu_name,
            source.path().display(),
            object.display()
        );

        let status = Command::new(&self.program)
            .arg("-v")
            .arg(&gpu_name)
            .arg(source.path())
            .arg("-o")
            .arg(&*object)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.as_file().try_clone()?))
            .stderr(Stdio::from(log.as_file().try_clone()?))
            .status();

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return Err(surface(ForgeError::ExternalToolFailure {
                    tool: self.program.clone(),
                    status: format!("could not start: {}", e),
                    log: String::new(),
                }))
            }
        };
        let diagnostics = Self::read_log(log.path());

        if !status.success() {
            tracing::debug!("assembler input:\n{}", assembly);
            return Err(surface(ForgeError::ExternalToolFailure {
                tool: self.program.clone(),
                status: status.to_string(),
                log: diagnostics,
            }));
        }
        if !diagnostics.is_empty() {
            tracing::debug!("{}:\n{}", self.program, diagnostics);
        }

        // A zero exit without an object is still a failure.
        if File::open(&*object).is_err() {
            return Err(surface(ForgeError::ExternalToolFailure {
                tool: self.program.clone(),
                status: format!("{}, but no object was written", status),
                log: diagnostics,
            }));
        }

        self.driver
            .load_file(&object)
            .map_err(|e| surface(e.into_forge_error(assembly)))
    }
}
