//! One-stop pipeline: IR in, patched PTX or a loaded module out.

use crate::codegen::{CodeGenerator, CodegenBackend};
use crate::config::ForgeConfig;
use crate::driver::{CompiledModule, CudaDriver, Driver};
use crate::llvm::LlvmBackend;
use crate::loader;
use crate::program::IntermediateProgram;
use crate::target::TargetDescriptor;
use crate::Result;

/// Bundles a config, a code generator backend and a driver.
pub struct Forge<B = LlvmBackend, D = CudaDriver> {
    config: ForgeConfig,
    generator: CodeGenerator<B>,
    driver: D,
}

/// Code generator over the LLVM library named in `config` (or the default).
pub fn llvm_code_generator(config: &ForgeConfig) -> CodeGenerator<LlvmBackend> {
    let backend = match &config.llvm_library {
        Some(library) => LlvmBackend::with_library(library.clone()),
        None => LlvmBackend::new(),
    };
    CodeGenerator::new(backend, config.generator_limits())
}

impl Forge<LlvmBackend, CudaDriver> {
    /// LLVM backend plus the CUDA driver, both loaded at runtime.
    pub fn new(config: ForgeConfig) -> Result<Self> {
        let driver = CudaDriver::with_library(config.cuda_library.as_deref())?;
        let generator = llvm_code_generator(&config);
        Ok(Self {
            config,
            generator,
            driver,
        })
    }
}

impl<B: CodegenBackend, D: Driver> Forge<B, D> {
    pub fn with_parts(config: ForgeConfig, backend: B, driver: D) -> Self {
        let generator = CodeGenerator::new(backend, config.generator_limits());
        Self {
            config,
            generator,
            driver,
        }
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn generator(&self) -> &CodeGenerator<B> {
        &self.generator
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// IR to patched PTX for `target`.
    pub fn compile(&self, program: &IntermediateProgram, target: &TargetDescriptor) -> Result<String> {
        self.generator.compile_to_ptx(program, target)
    }

    /// Load PTX text through the configured strategy.
    pub fn load(&self, assembly: &str, compute_capability: u32) -> Result<CompiledModule> {
        loader::load_module(&self.driver, &self.config, assembly, compute_capability)
    }

    pub fn compile_and_load(
        &self,
        program: &IntermediateProgram,
        target: &TargetDescriptor,
    ) -> Result<CompiledModule> {
        let assembly = self.compile(program, target)?;
        self.load(&assembly, target.compute_capability())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::MachineSpec;
    use crate::driver::{DriverError, JitModule, JitOptions};
    use crate::error::ForgeError;
    use std::cell::RefCell;
    use std::path::Path;

    struct FixedBackend;

    impl CodegenBackend for FixedBackend {
        fn emit_assembly(&self, _program: &IntermediateProgram, machine: &MachineSpec) -> Result<String> {
            Ok(format!(
                ".version 6.4\n.target {}\n.address_size 64\n\n.visible .entry k()\n{{\n\t// begin inline asm\n\tret;\n\t// end inline asm\n}}\n",
                machine.cpu
            ))
        }
    }

    #[derive(Default)]
    struct JitOnlyDriver {
        loaded: RefCell<Vec<String>>,
        reject: bool,
    }

    impl Driver for JitOnlyDriver {
        fn load_file(&self, _path: &Path) -> std::result::Result<CompiledModule, DriverError> {
            unreachable!("external assembler disabled")
        }

        fn load_data(&self, assembly: &str, _options: &JitOptions) -> std::result::Result<JitModule, DriverError> {
            self.loaded.borrow_mut().push(assembly.to_string());
            if self.reject {
                return Err(DriverError {
                    call: "cuModuleLoadDataEx".into(),
                    code: crate::driver::ffi::CUDA_ERROR_UNSUPPORTED_PTX_VERSION,
                    name: "CUDA_ERROR_UNSUPPORTED_PTX_VERSION".into(),
                    log: String::new(),
                });
            }
            Ok(JitModule {
                module: unsafe { CompiledModule::from_raw(std::ptr::null_mut()) },
                info_log: String::new(),
            })
        }
    }

    fn forge(driver: JitOnlyDriver) -> Forge<FixedBackend, JitOnlyDriver> {
        let config = ForgeConfig {
            use_external_assembler: false,
            ..ForgeConfig::default()
        };
        Forge::with_parts(config, FixedBackend, driver)
    }

    fn program() -> IntermediateProgram {
        IntermediateProgram::from_ir_text("k", "define void @k() { ret void }")
    }

    #[test]
    fn test_compile_and_load_submits_patched_text() {
        let forge = forge(JitOnlyDriver::default());
        let target = TargetDescriptor::new(86, 11030);
        forge.compile_and_load(&program(), &target).unwrap();

        let loaded = forge.driver().loaded.borrow();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].starts_with(".version 7.3\n.target sm_86\n"));
        assert!(!loaded[0].contains("inline asm"));
    }

    #[test]
    fn test_rejected_module_keeps_submitted_text() {
        let forge = forge(JitOnlyDriver {
            reject: true,
            ..JitOnlyDriver::default()
        });
        let target = TargetDescriptor::new(70, 11000);
        let ptx = forge.compile(&program(), &target).unwrap();
        match forge.load(&ptx, 70) {
            Err(ForgeError::InvalidAssembly { assembly, log }) => {
                assert_eq!(assembly, ptx);
                assert_eq!(log, "CUDA_ERROR_UNSUPPORTED_PTX_VERSION");
            }
            other => panic!("expected InvalidAssembly, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_generator_uses_config_limits() {
        let config = ForgeConfig {
            max_generator_compute_capability: 80,
            ..ForgeConfig::default()
        };
        let forge = Forge::with_parts(config, FixedBackend, JitOnlyDriver::default());
        assert_eq!(forge.generator().limits().max_compute_capability, 80);
    }
}
