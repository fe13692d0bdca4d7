//! IR parsing, verification and PTX emission through the LLVM C API.

use std::ffi::{c_char, c_int, c_void, CString};
use std::sync::OnceLock;

use super::ffi::{self, LlvmApi, ModuleRef};
use super::init::initialize_nvptx;
use crate::codegen::{CodeModel, CodegenBackend, MachineSpec, OptimizationLevel, RelocModel};
use crate::error::ForgeError;
use crate::program::IntermediateProgram;
use crate::Result;

/// NVPTX command-line options are process-wide; the first compilation fixes them.
static CODEGEN_OPTIONS: OnceLock<Vec<String>> = OnceLock::new();

/// [`CodegenBackend`] backed by a runtime-loaded LLVM with NVPTX support.
#[derive(Debug, Clone, Default)]
pub struct LlvmBackend {
    library: Option<String>,
}

impl LlvmBackend {
    /// Use the default LLVM library search.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific LLVM shared library.
    pub fn with_library(library: impl Into<String>) -> Self {
        Self {
            library: Some(library.into()),
        }
    }

    /// Whether LLVM with NVPTX can be loaded.
    pub fn is_available(&self) -> bool {
        initialize_nvptx(self.library.as_deref()).is_ok()
    }
}

/// LLVM-owned pointer released with `dispose` when dropped.
struct Owned {
    ptr: *mut c_void,
    dispose: unsafe extern "C" fn(*mut c_void),
}

impl Owned {
    fn new(ptr: *mut c_void, dispose: unsafe extern "C" fn(*mut c_void)) -> Self {
        Self { ptr, dispose }
    }
}

impl Drop for Owned {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { (self.dispose)(self.ptr) }
        }
    }
}

fn c_string(value: &str, what: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| ForgeError::TargetConfiguration(format!("{} contains a null byte: {:?}", what, value)))
}

fn opt_level(level: OptimizationLevel) -> c_int {
    match level {
        OptimizationLevel::None => ffi::LLVM_CODEGEN_LEVEL_NONE,
        OptimizationLevel::Less => ffi::LLVM_CODEGEN_LEVEL_LESS,
        OptimizationLevel::Default => ffi::LLVM_CODEGEN_LEVEL_DEFAULT,
        OptimizationLevel::Aggressive => ffi::LLVM_CODEGEN_LEVEL_AGGRESSIVE,
    }
}

fn reloc_mode(model: RelocModel) -> c_int {
    match model {
        RelocModel::Default => ffi::LLVM_RELOC_DEFAULT,
        RelocModel::Static => ffi::LLVM_RELOC_STATIC,
        RelocModel::Pic => ffi::LLVM_RELOC_PIC,
    }
}

fn code_model(model: CodeModel) -> c_int {
    match model {
        CodeModel::Default => ffi::LLVM_CODE_MODEL_DEFAULT,
    }
}

/// `llc`-style flags implied by a machine spec.
pub fn command_line_options(machine: &MachineSpec) -> Vec<String> {
    let mut args = vec!["ptxforge".to_string()];
    if machine.short_pointers {
        args.push("-nvptx-short-ptr".to_string());
    }
    let fma_level = if machine.float.fuse_fp_ops { 2 } else { 0 };
    args.push(format!("-nvptx-fma-level={}", fma_level));
    args
}

/// Function attributes carrying the floating-point options.
pub fn float_attributes(machine: &MachineSpec) -> [(&'static str, &'static str); 3] {
    let flag = |on: bool| if on { "true" } else { "false" };
    [
        ("no-nans-fp-math", flag(machine.float.no_nans)),
        ("no-infs-fp-math", flag(machine.float.no_infs)),
        ("unsafe-fp-math", flag(machine.float.unsafe_math)),
    ]
}

fn apply_command_line_options(api: &LlvmApi, machine: &MachineSpec) -> Result<()> {
    let wanted = command_line_options(machine);
    let applied = CODEGEN_OPTIONS.get_or_init(|| {
        let args: Vec<CString> = wanted
            .iter()
            .filter_map(|arg| CString::new(arg.as_str()).ok())
            .collect();
        let argv: Vec<*const c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
        unsafe { (api.parse_command_line_options)(argv.len() as c_int, argv.as_ptr(), std::ptr::null()) };
        tracing::debug!("LLVM options: {}", wanted[1..].join(" "));
        wanted.clone()
    });
    if *applied != wanted {
        tracing::warn!(
            "LLVM options already set to [{}], ignoring [{}]",
            applied[1..].join(" "),
            wanted[1..].join(" ")
        );
    }
    Ok(())
}

impl LlvmBackend {
    /// # Safety
    /// `api` must be the loaded LLVM API; `module` must belong to `context`.
    unsafe fn annotate_functions(
        &self,
        api: &LlvmApi,
        context: *mut c_void,
        module: ModuleRef,
        machine: &MachineSpec,
    ) {
        let always_inline = {
            let name = "alwaysinline";
            let kind = (api.get_enum_attribute_kind_for_name)(name.as_ptr().cast(), name.len());
            (api.create_enum_attribute)(context, kind, 0)
        };
        let float_attrs: Vec<_> = float_attributes(machine)
            .iter()
            .map(|(key, value)| {
                (api.create_string_attribute)(
                    context,
                    key.as_ptr().cast(),
                    key.len() as u32,
                    value.as_ptr().cast(),
                    value.len() as u32,
                )
            })
            .collect();

        let mut function = (api.get_first_function)(module);
        while !function.is_null() {
            if (api.is_declaration)(function) == 0 {
                if machine.always_inline {
                    (api.add_attribute_at_index)(function, ffi::LLVM_ATTRIBUTE_FUNCTION_INDEX, always_inline);
                }
                for &attr in &float_attrs {
                    (api.add_attribute_at_index)(function, ffi::LLVM_ATTRIBUTE_FUNCTION_INDEX, attr);
                }
            }
            function = (api.get_next_function)(function);
        }
    }
}

impl CodegenBackend for LlvmBackend {
    fn emit_assembly(&self, program: &IntermediateProgram, machine: &MachineSpec) -> Result<String> {
        let api = initialize_nvptx(self.library.as_deref())?;
        apply_command_line_options(api, machine)?;

        let name = c_string(program.name(), "module name")?;
        let triple = c_string(&machine.triple, "target triple")?;
        let cpu = c_string(&machine.cpu, "cpu")?;
        let features = c_string(&machine.features, "features")?;

        unsafe {
            let context = Owned::new((api.context_create)(), api.context_dispose);

            // Parse. The memory buffer is consumed by LLVMParseIRInContext.
            let bytes = program.bytes();
            let buffer = (api.create_memory_buffer_with_memory_range_copy)(
                bytes.as_ptr().cast(),
                bytes.len(),
                name.as_ptr(),
            );
            let mut raw_module: ModuleRef = std::ptr::null_mut();
            let mut message: *mut c_char = std::ptr::null_mut();
            if (api.parse_ir_in_context)(context.ptr, buffer, &mut raw_module, &mut message) != 0 {
                return Err(ForgeError::TargetConfiguration(format!(
                    "cannot parse '{}': {}",
                    program.name(),
                    api.take_message(message)
                )));
            }
            api.take_message(message);
            let module = Owned::new(raw_module, api.dispose_module);

            // Verify before anything touches codegen.
            let mut message: *mut c_char = std::ptr::null_mut();
            let broken = (api.verify_module)(module.ptr, ffi::LLVM_RETURN_STATUS_ACTION, &mut message) != 0;
            let report = api.take_message(message);
            if broken {
                return Err(ForgeError::TargetConfiguration(format!(
                    "module '{}' failed verification: {}",
                    program.name(),
                    report
                )));
            }

            // Target machine.
            (api.set_target)(module.ptr, triple.as_ptr());
            let mut target: ffi::TargetRef = std::ptr::null_mut();
            let mut message: *mut c_char = std::ptr::null_mut();
            if (api.get_target_from_triple)(triple.as_ptr(), &mut target, &mut message) != 0 {
                return Err(ForgeError::TargetConfiguration(format!(
                    "no target for '{}': {}",
                    machine.triple,
                    api.take_message(message)
                )));
            }
            api.take_message(message);
            let target_machine = Owned::new(
                (api.create_target_machine)(
                    target,
                    triple.as_ptr(),
                    cpu.as_ptr(),
                    features.as_ptr(),
                    opt_level(machine.opt_level),
                    reloc_mode(machine.reloc_model),
                    code_model(machine.code_model),
                ),
                api.dispose_target_machine,
            );
            if target_machine.ptr.is_null() {
                return Err(ForgeError::TargetConfiguration(format!(
                    "cannot create target machine ({})",
                    machine
                )));
            }

            let layout = Owned::new((api.create_target_data_layout)(target_machine.ptr), api.dispose_target_data);
            (api.set_module_data_layout)(module.ptr, layout.ptr);
            drop(layout);

            self.annotate_functions(api, context.ptr, module.ptr, machine);

            // Emit.
            let mut output: ffi::MemoryBufferRef = std::ptr::null_mut();
            let mut message: *mut c_char = std::ptr::null_mut();
            if (api.target_machine_emit_to_memory_buffer)(
                target_machine.ptr,
                module.ptr,
                ffi::LLVM_ASSEMBLY_FILE,
                &mut message,
                &mut output,
            ) != 0
            {
                return Err(ForgeError::TargetConfiguration(format!(
                    "PTX emission failed for '{}': {}",
                    program.name(),
                    api.take_message(message)
                )));
            }
            api.take_message(message);
            let output = Owned::new(output, api.dispose_memory_buffer);

            let start = (api.get_buffer_start)(output.ptr);
            let size = (api.get_buffer_size)(output.ptr);
            let text = if start.is_null() || size == 0 {
                String::new()
            } else {
                let bytes = std::slice::from_raw_parts(start.cast::<u8>(), size);
                String::from_utf8_lossy(bytes).into_owned()
            };

            // Release order: module before its context.
            drop(output);
            drop(target_machine);
            drop(module);
            drop(context);
            Ok(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::GeneratorLimits;
    use crate::target::TargetDescriptor;
    use crate::version::IsaVersion;

    fn spec() -> MachineSpec {
        MachineSpec::for_target(
            &TargetDescriptor::new(80, 11020),
            IsaVersion::new(72),
            &GeneratorLimits::default(),
        )
    }

    #[test]
    fn test_command_line_options() {
        assert_eq!(
            command_line_options(&spec()),
            vec!["ptxforge", "-nvptx-short-ptr", "-nvptx-fma-level=2"]
        );
        let mut no_fusion = spec();
        no_fusion.float.fuse_fp_ops = false;
        no_fusion.short_pointers = false;
        assert_eq!(command_line_options(&no_fusion), vec!["ptxforge", "-nvptx-fma-level=0"]);
    }

    #[test]
    fn test_float_attributes() {
        assert_eq!(
            float_attributes(&spec()),
            [
                ("no-nans-fp-math", "true"),
                ("no-infs-fp-math", "false"),
                ("unsafe-fp-math", "false"),
            ]
        );
    }

    #[test]
    fn test_enum_mappings() {
        assert_eq!(opt_level(OptimizationLevel::Aggressive), 3);
        assert_eq!(reloc_mode(RelocModel::Default), 0);
        assert_eq!(code_model(CodeModel::Default), 0);
    }

    #[test]
    fn test_emit_when_llvm_present() {
        let backend = LlvmBackend::new();
        if !backend.is_available() {
            return;
        }
        let ir = r#"
target triple = "nvptx64-nvidia-cuda"

define void @scale(float* %p) {
entry:
  %v = load float, float* %p
  %r = fmul float %v, 2.0
  store float %r, float* %p
  ret void
}

!nvvm.annotations = !{!0}
!0 = !{void (float*)* @scale, !"kernel", i32 1}
"#;
        let program = IntermediateProgram::from_ir_text("scale", ir);
        match backend.emit_assembly(&program, &spec()) {
            Ok(text) => {
                assert!(text.contains(".version 6.4"));
                assert!(text.contains(".target sm_75"));
                assert!(text.contains(".entry scale"));
            }
            // Opaque-pointer LLVM releases reject typed pointers at parse time.
            Err(ForgeError::TargetConfiguration(msg)) => assert!(msg.contains("cannot parse")),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_malformed_ir_is_configuration_error() {
        let backend = LlvmBackend::new();
        if !backend.is_available() {
            return;
        }
        let program = IntermediateProgram::from_ir_text("bad", "define void @f( {");
        let err = backend.emit_assembly(&program, &spec()).unwrap_err();
        assert!(matches!(err, ForgeError::TargetConfiguration(_)));
    }
}
