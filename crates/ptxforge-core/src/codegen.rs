//! IR to PTX code generation.
//!
//! [`CodeGenerator`] decides what machine to build for a target (triple,
//! clamped architecture and ISA, optimisation and floating-point options)
//! and hands the program plus that [`MachineSpec`] to a [`CodegenBackend`].
//! The LLVM backend lives in [`crate::llvm`]; tests substitute their own.

use std::fmt;

use crate::program::IntermediateProgram;
use crate::ptx;
use crate::target::{sm_name, TargetDescriptor};
use crate::version::IsaVersion;
use crate::Result;

/// 64-bit NVPTX target triple.
pub const NVPTX_TRIPLE: &str = "nvptx64-nvidia-cuda";

/// What the generator backend itself supports, independent of the toolkit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorLimits {
    /// Newest architecture with a scheduling model in the backend.
    pub max_compute_capability: u32,
    /// Newest PTX ISA the backend knows how to print.
    pub max_isa: IsaVersion,
}

impl Default for GeneratorLimits {
    fn default() -> Self {
        Self {
            max_compute_capability: 75,
            max_isa: IsaVersion::new(64),
        }
    }
}

/// Codegen optimisation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationLevel {
    None,
    Less,
    Default,
    Aggressive,
}

/// Relocation model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocModel {
    Default,
    Static,
    Pic,
}

/// Code model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeModel {
    Default,
}

/// Floating-point codegen options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloatOptions {
    /// Contract mul+add into fma.
    pub fuse_fp_ops: bool,
    /// Assume no NaN operands or results.
    pub no_nans: bool,
    /// Assume no infinite operands or results.
    pub no_infs: bool,
    pub unsafe_math: bool,
}

impl FloatOptions {
    /// Fused ops, no NaNs, infinities allowed, no unsafe math.
    pub const fn kernel_default() -> Self {
        Self {
            fuse_fp_ops: true,
            no_nans: true,
            no_infs: false,
            unsafe_math: false,
        }
    }
}

/// Everything a backend needs to build its target machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub triple: String,
    /// Processor name, `sm_<cc>` clamped to the backend ceiling.
    pub cpu: String,
    /// Subtarget features, `+ptx<isa>` clamped to the backend ceiling.
    pub features: String,
    pub opt_level: OptimizationLevel,
    pub reloc_model: RelocModel,
    pub code_model: CodeModel,
    pub float: FloatOptions,
    /// Use 32-bit pointers for shared, const and local address spaces.
    pub short_pointers: bool,
    /// Mark every defined function `alwaysinline` before emission.
    pub always_inline: bool,
}

impl MachineSpec {
    /// Machine for `target`, with architecture and ISA clamped to `limits`.
    pub fn for_target(target: &TargetDescriptor, isa: IsaVersion, limits: &GeneratorLimits) -> Self {
        let cc = target.compute_capability().min(limits.max_compute_capability);
        Self {
            triple: NVPTX_TRIPLE.to_string(),
            cpu: sm_name(cc),
            features: isa.clamp_to(limits.max_isa).feature(),
            opt_level: OptimizationLevel::Aggressive,
            reloc_model: RelocModel::Default,
            code_model: CodeModel::Default,
            float: FloatOptions::kernel_default(),
            short_pointers: true,
            always_inline: true,
        }
    }
}

impl fmt::Display for MachineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "triple={} cpu={} features={} opt={:?} reloc={:?}",
            self.triple, self.cpu, self.features, self.opt_level, self.reloc_model
        )
    }
}

/// Lowers a program to raw PTX text for a given machine.
///
/// Implementations must verify the program before emitting and report
/// lookup, verification or machine construction failures as
/// [`crate::ForgeError::TargetConfiguration`].
pub trait CodegenBackend {
    fn emit_assembly(&self, program: &IntermediateProgram, machine: &MachineSpec) -> Result<String>;
}

impl<B: CodegenBackend + ?Sized> CodegenBackend for &B {
    fn emit_assembly(&self, program: &IntermediateProgram, machine: &MachineSpec) -> Result<String> {
        (**self).emit_assembly(program, machine)
    }
}

/// Raw backend output plus the decisions that produced it.
#[derive(Debug, Clone)]
pub struct GeneratedAssembly {
    /// PTX exactly as the backend emitted it.
    pub text: String,
    /// Unclamped ISA version for the requested toolkit.
    pub isa: IsaVersion,
    pub machine: MachineSpec,
}

/// Drives a [`CodegenBackend`] for a [`TargetDescriptor`].
pub struct CodeGenerator<B> {
    backend: B,
    limits: GeneratorLimits,
}

impl<B: CodegenBackend> CodeGenerator<B> {
    pub fn new(backend: B, limits: GeneratorLimits) -> Self {
        Self { backend, limits }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn limits(&self) -> &GeneratorLimits {
        &self.limits
    }

    /// Lower `program` to unpatched PTX.
    pub fn generate(
        &self,
        program: &IntermediateProgram,
        target: &TargetDescriptor,
    ) -> Result<GeneratedAssembly> {
        let isa = target.isa_version()?;
        let machine = MachineSpec::for_target(target, isa, &self.limits);

        if target.compute_capability() > self.limits.max_compute_capability {
            tracing::warn!(
                "{} is newer than the code generator supports, scheduling for {}",
                target.sm_name(),
                machine.cpu
            );
        }
        if isa > self.limits.max_isa {
            tracing::warn!(
                "PTX ISA {} clamped to {} for the code generator",
                isa,
                self.limits.max_isa
            );
        }

        tracing::debug!("lowering '{}' with {}", program.name(), machine);
        let text = self.backend.emit_assembly(program, &machine)?;
        tracing::debug!("emitted {} bytes of PTX for '{}'", text.len(), program.name());

        Ok(GeneratedAssembly { text, isa, machine })
    }

    /// Lower `program` and patch the result for the requested target.
    pub fn compile_to_ptx(
        &self,
        program: &IntermediateProgram,
        target: &TargetDescriptor,
    ) -> Result<String> {
        let GeneratedAssembly { mut text, isa, .. } = self.generate(program, target)?;
        ptx::postprocess(&mut text, isa, target.compute_capability());
        Ok(text)
    }
}
