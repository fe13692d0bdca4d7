//! Runtime-loaded LLVM C API function pointers via dlopen.
//!
//! Only the handful of entry points needed to parse IR, build an NVPTX
//! target machine and emit assembly are resolved. Any LLVM shared library
//! built with the NVPTX target works.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::sync::OnceLock;

use libloading::Library;

// ---------------------------------------------------------------------------
// Opaque handles and enums
// ---------------------------------------------------------------------------

pub type LlvmBool = c_int;
pub type ContextRef = *mut c_void;
pub type ModuleRef = *mut c_void;
pub type MemoryBufferRef = *mut c_void;
pub type TargetRef = *mut c_void;
pub type TargetMachineRef = *mut c_void;
pub type TargetDataRef = *mut c_void;
pub type ValueRef = *mut c_void;
pub type AttributeRef = *mut c_void;

// LLVMVerifierFailureAction
pub const LLVM_RETURN_STATUS_ACTION: c_int = 2;

// LLVMCodeGenOptLevel
pub const LLVM_CODEGEN_LEVEL_NONE: c_int = 0;
pub const LLVM_CODEGEN_LEVEL_LESS: c_int = 1;
pub const LLVM_CODEGEN_LEVEL_DEFAULT: c_int = 2;
pub const LLVM_CODEGEN_LEVEL_AGGRESSIVE: c_int = 3;

// LLVMRelocMode
pub const LLVM_RELOC_DEFAULT: c_int = 0;
pub const LLVM_RELOC_STATIC: c_int = 1;
pub const LLVM_RELOC_PIC: c_int = 2;

// LLVMCodeModel
pub const LLVM_CODE_MODEL_DEFAULT: c_int = 0;

// LLVMCodeGenFileType
pub const LLVM_ASSEMBLY_FILE: c_int = 0;

pub const LLVM_ATTRIBUTE_FUNCTION_INDEX: c_uint = c_uint::MAX;

// ---------------------------------------------------------------------------
// C API function signatures
// ---------------------------------------------------------------------------

type FnInitialize = unsafe extern "C" fn();
type FnParseCommandLineOptions = unsafe extern "C" fn(c_int, *const *const c_char, *const c_char);
type FnContextCreate = unsafe extern "C" fn() -> ContextRef;
type FnContextDispose = unsafe extern "C" fn(ContextRef);
type FnCreateMemoryBufferWithMemoryRangeCopy =
    unsafe extern "C" fn(*const c_char, usize, *const c_char) -> MemoryBufferRef;
type FnParseIrInContext = unsafe extern "C" fn(
    ContextRef,
    MemoryBufferRef,      // consumed
    *mut ModuleRef,
    *mut *mut c_char,     // error message
) -> LlvmBool;
type FnVerifyModule = unsafe extern "C" fn(ModuleRef, c_int, *mut *mut c_char) -> LlvmBool;
type FnSetTarget = unsafe extern "C" fn(ModuleRef, *const c_char);
type FnGetTargetFromTriple =
    unsafe extern "C" fn(*const c_char, *mut TargetRef, *mut *mut c_char) -> LlvmBool;
type FnCreateTargetMachine = unsafe extern "C" fn(
    TargetRef,
    *const c_char,        // triple
    *const c_char,        // cpu
    *const c_char,        // features
    c_int,                // opt level
    c_int,                // reloc mode
    c_int,                // code model
) -> TargetMachineRef;
type FnCreateTargetDataLayout = unsafe extern "C" fn(TargetMachineRef) -> TargetDataRef;
type FnSetModuleDataLayout = unsafe extern "C" fn(ModuleRef, TargetDataRef);
type FnGetFirstFunction = unsafe extern "C" fn(ModuleRef) -> ValueRef;
type FnGetNextFunction = unsafe extern "C" fn(ValueRef) -> ValueRef;
type FnIsDeclaration = unsafe extern "C" fn(ValueRef) -> LlvmBool;
type FnGetEnumAttributeKindForName = unsafe extern "C" fn(*const c_char, usize) -> c_uint;
type FnCreateEnumAttribute = unsafe extern "C" fn(ContextRef, c_uint, u64) -> AttributeRef;
type FnCreateStringAttribute =
    unsafe extern "C" fn(ContextRef, *const c_char, c_uint, *const c_char, c_uint) -> AttributeRef;
type FnAddAttributeAtIndex = unsafe extern "C" fn(ValueRef, c_uint, AttributeRef);
type FnTargetMachineEmitToMemoryBuffer = unsafe extern "C" fn(
    TargetMachineRef,
    ModuleRef,
    c_int,                // file type
    *mut *mut c_char,     // error message
    *mut MemoryBufferRef,
) -> LlvmBool;
type FnGetBufferStart = unsafe extern "C" fn(MemoryBufferRef) -> *const c_char;
type FnGetBufferSize = unsafe extern "C" fn(MemoryBufferRef) -> usize;
type FnDisposeMemoryBuffer = unsafe extern "C" fn(MemoryBufferRef);
type FnDisposeMessage = unsafe extern "C" fn(*mut c_char);
type FnDisposeTargetData = unsafe extern "C" fn(TargetDataRef);
type FnDisposeTargetMachine = unsafe extern "C" fn(TargetMachineRef);
type FnDisposeModule = unsafe extern "C" fn(ModuleRef);

// ---------------------------------------------------------------------------
// Loaded API struct
// ---------------------------------------------------------------------------

pub struct LlvmApi {
    _lib: Library,
    pub initialize_nvptx_target_info: FnInitialize,
    pub initialize_nvptx_target: FnInitialize,
    pub initialize_nvptx_target_mc: FnInitialize,
    pub initialize_nvptx_asm_printer: FnInitialize,
    pub parse_command_line_options: FnParseCommandLineOptions,
    pub context_create: FnContextCreate,
    pub context_dispose: FnContextDispose,
    pub create_memory_buffer_with_memory_range_copy: FnCreateMemoryBufferWithMemoryRangeCopy,
    pub parse_ir_in_context: FnParseIrInContext,
    pub verify_module: FnVerifyModule,
    pub set_target: FnSetTarget,
    pub get_target_from_triple: FnGetTargetFromTriple,
    pub create_target_machine: FnCreateTargetMachine,
    pub create_target_data_layout: FnCreateTargetDataLayout,
    pub set_module_data_layout: FnSetModuleDataLayout,
    pub get_first_function: FnGetFirstFunction,
    pub get_next_function: FnGetNextFunction,
    pub is_declaration: FnIsDeclaration,
    pub get_enum_attribute_kind_for_name: FnGetEnumAttributeKindForName,
    pub create_enum_attribute: FnCreateEnumAttribute,
    pub create_string_attribute: FnCreateStringAttribute,
    pub add_attribute_at_index: FnAddAttributeAtIndex,
    pub target_machine_emit_to_memory_buffer: FnTargetMachineEmitToMemoryBuffer,
    pub get_buffer_start: FnGetBufferStart,
    pub get_buffer_size: FnGetBufferSize,
    pub dispose_memory_buffer: FnDisposeMemoryBuffer,
    pub dispose_message: FnDisposeMessage,
    pub dispose_target_data: FnDisposeTargetData,
    pub dispose_target_machine: FnDisposeTargetMachine,
    pub dispose_module: FnDisposeModule,
}

// Safety: the C API functions used here are safe to call from any thread as
// long as each LLVMContext is confined to one thread, which the backend
// guarantees by creating a fresh context per compilation.
unsafe impl Send for LlvmApi {}
unsafe impl Sync for LlvmApi {}

#[cfg(target_os = "macos")]
const DEFAULT_LIBRARIES: &[&str] = &["libLLVM.dylib"];
#[cfg(target_os = "windows")]
const DEFAULT_LIBRARIES: &[&str] = &["LLVM-C.dll"];
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const DEFAULT_LIBRARIES: &[&str] = &[
    "libLLVM.so",
    "libLLVM-18.so",
    "libLLVM-17.so",
    "libLLVM-16.so",
    "libLLVM-15.so",
    "libLLVM-14.so",
];

static LLVM_API: OnceLock<Option<LlvmApi>> = OnceLock::new();

macro_rules! symbol {
    ($lib:expr, $ty:ty, $name:literal) => {
        *$lib.get::<$ty>(concat!($name, "\0").as_bytes()).ok()?
    };
}

impl LlvmApi {
    fn try_load_from(name: &str) -> Option<Self> {
        let lib = unsafe { Library::new(name) }.ok()?;
        unsafe {
            let api = LlvmApi {
                initialize_nvptx_target_info: symbol!(lib, FnInitialize, "LLVMInitializeNVPTXTargetInfo"),
                initialize_nvptx_target: symbol!(lib, FnInitialize, "LLVMInitializeNVPTXTarget"),
                initialize_nvptx_target_mc: symbol!(lib, FnInitialize, "LLVMInitializeNVPTXTargetMC"),
                initialize_nvptx_asm_printer: symbol!(lib, FnInitialize, "LLVMInitializeNVPTXAsmPrinter"),
                parse_command_line_options: symbol!(lib, FnParseCommandLineOptions, "LLVMParseCommandLineOptions"),
                context_create: symbol!(lib, FnContextCreate, "LLVMContextCreate"),
                context_dispose: symbol!(lib, FnContextDispose, "LLVMContextDispose"),
                create_memory_buffer_with_memory_range_copy: symbol!(
                    lib,
                    FnCreateMemoryBufferWithMemoryRangeCopy,
                    "LLVMCreateMemoryBufferWithMemoryRangeCopy"
                ),
                parse_ir_in_context: symbol!(lib, FnParseIrInContext, "LLVMParseIRInContext"),
                verify_module: symbol!(lib, FnVerifyModule, "LLVMVerifyModule"),
                set_target: symbol!(lib, FnSetTarget, "LLVMSetTarget"),
                get_target_from_triple: symbol!(lib, FnGetTargetFromTriple, "LLVMGetTargetFromTriple"),
                create_target_machine: symbol!(lib, FnCreateTargetMachine, "LLVMCreateTargetMachine"),
                create_target_data_layout: symbol!(lib, FnCreateTargetDataLayout, "LLVMCreateTargetDataLayout"),
                set_module_data_layout: symbol!(lib, FnSetModuleDataLayout, "LLVMSetModuleDataLayout"),
                get_first_function: symbol!(lib, FnGetFirstFunction, "LLVMGetFirstFunction"),
                get_next_function: symbol!(lib, FnGetNextFunction, "LLVMGetNextFunction"),
                is_declaration: symbol!(lib, FnIsDeclaration, "LLVMIsDeclaration"),
                get_enum_attribute_kind_for_name: symbol!(
                    lib,
                    FnGetEnumAttributeKindForName,
                    "LLVMGetEnumAttributeKindForName"
                ),
                create_enum_attribute: symbol!(lib, FnCreateEnumAttribute, "LLVMCreateEnumAttribute"),
                create_string_attribute: symbol!(lib, FnCreateStringAttribute, "LLVMCreateStringAttribute"),
                add_attribute_at_index: symbol!(lib, FnAddAttributeAtIndex, "LLVMAddAttributeAtIndex"),
                target_machine_emit_to_memory_buffer: symbol!(
                    lib,
                    FnTargetMachineEmitToMemoryBuffer,
                    "LLVMTargetMachineEmitToMemoryBuffer"
                ),
                get_buffer_start: symbol!(lib, FnGetBufferStart, "LLVMGetBufferStart"),
                get_buffer_size: symbol!(lib, FnGetBufferSize, "LLVMGetBufferSize"),
                dispose_memory_buffer: symbol!(lib, FnDisposeMemoryBuffer, "LLVMDisposeMemoryBuffer"),
                dispose_message: symbol!(lib, FnDisposeMessage, "LLVMDisposeMessage"),
                dispose_target_data: symbol!(lib, FnDisposeTargetData, "LLVMDisposeTargetData"),
                dispose_target_machine: symbol!(lib, FnDisposeTargetMachine, "LLVMDisposeTargetMachine"),
                dispose_module: symbol!(lib, FnDisposeModule, "LLVMDisposeModule"),
                _lib: lib,
            };
            Some(api)
        }
    }

    fn try_load(explicit: Option<&str>) -> Option<Self> {
        match explicit {
            Some(name) => Self::try_load_from(name),
            None => DEFAULT_LIBRARIES.iter().find_map(|name| Self::try_load_from(name)),
        }
    }

    /// Take ownership of an LLVM-allocated message and free it.
    ///
    /// # Safety
    /// `msg` must be null or a message allocated by this LLVM library.
    pub unsafe fn take_message(&self, msg: *mut c_char) -> String {
        if msg.is_null() {
            return String::new();
        }
        let text = CStr::from_ptr(msg).to_string_lossy().trim_end().to_string();
        (self.dispose_message)(msg);
        text
    }
}

/// Get the runtime-loaded LLVM API. Returns None if no LLVM library loads.
///
/// The first call decides which library is used for the rest of the process.
pub fn llvm_api(explicit: Option<&str>) -> Option<&'static LlvmApi> {
    LLVM_API.get_or_init(|| LlvmApi::try_load(explicit)).as_ref()
}

/// Name of the library `llvm_api` would try first, for error messages.
pub fn library_label(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_LIBRARIES.join(" / "))
}
