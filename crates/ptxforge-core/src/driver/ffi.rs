//! Runtime-loaded CUDA driver API function pointers via dlopen.
//!
//! No build-time CUDA dependency: any driver that ships `libcuda.so.1`
//! (or `nvcuda.dll`) works.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::sync::OnceLock;

use libloading::Library;

use crate::error::ForgeError;

// ---------------------------------------------------------------------------
// Status codes and enums
// ---------------------------------------------------------------------------

pub type CuResult = c_int;
pub const CUDA_SUCCESS: CuResult = 0;
pub const CUDA_ERROR_INVALID_IMAGE: CuResult = 200;
pub const CUDA_ERROR_INVALID_PTX: CuResult = 218;
pub const CUDA_ERROR_UNSUPPORTED_PTX_VERSION: CuResult = 222;

pub type CuDevice = c_int;
pub type CuModule = *mut c_void;
pub type CuContext = *mut c_void;

// CUdevice_attribute
pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: c_int = 75;
pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: c_int = 76;

// CUjit_option
pub type CuJitOption = c_int;
pub const CU_JIT_INFO_LOG_BUFFER: CuJitOption = 3;
pub const CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES: CuJitOption = 4;
pub const CU_JIT_ERROR_LOG_BUFFER: CuJitOption = 5;
pub const CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES: CuJitOption = 6;
pub const CU_JIT_LOG_VERBOSE: CuJitOption = 12;

// ---------------------------------------------------------------------------
// Driver API function signatures
// ---------------------------------------------------------------------------

type FnCuInit = unsafe extern "C" fn(c_uint) -> CuResult;
type FnCuDriverGetVersion = unsafe extern "C" fn(*mut c_int) -> CuResult;
type FnCuDeviceGet = unsafe extern "C" fn(*mut CuDevice, c_int) -> CuResult;
type FnCuDeviceGetAttribute = unsafe extern "C" fn(*mut c_int, c_int, CuDevice) -> CuResult;
type FnCuDevicePrimaryCtxRetain = unsafe extern "C" fn(*mut CuContext, CuDevice) -> CuResult;
type FnCuDevicePrimaryCtxRelease = unsafe extern "C" fn(CuDevice) -> CuResult;
type FnCuCtxSetCurrent = unsafe extern "C" fn(CuContext) -> CuResult;
type FnCuModuleLoad = unsafe extern "C" fn(*mut CuModule, *const c_char) -> CuResult;
type FnCuModuleLoadDataEx = unsafe extern "C" fn(
    *mut CuModule,
    *const c_void,        // image
    c_uint,               // numOptions
    *mut CuJitOption,     // options
    *mut *mut c_void,     // optionValues
) -> CuResult;
type FnCuModuleUnload = unsafe extern "C" fn(CuModule) -> CuResult;
type FnCuGetErrorName = unsafe extern "C" fn(CuResult, *mut *const c_char) -> CuResult;

// ---------------------------------------------------------------------------
// Loaded API struct
// ---------------------------------------------------------------------------

pub struct CudaApi {
    _lib: Library,
    pub cu_init: FnCuInit,
    pub cu_driver_get_version: FnCuDriverGetVersion,
    pub cu_device_get: FnCuDeviceGet,
    pub cu_device_get_attribute: FnCuDeviceGetAttribute,
    pub cu_device_primary_ctx_retain: FnCuDevicePrimaryCtxRetain,
    pub cu_device_primary_ctx_release: FnCuDevicePrimaryCtxRelease,
    pub cu_ctx_set_current: FnCuCtxSetCurrent,
    pub cu_module_load: FnCuModuleLoad,
    pub cu_module_load_data_ex: FnCuModuleLoadDataEx,
    pub cu_module_unload: FnCuModuleUnload,
    pub cu_get_error_name: FnCuGetErrorName,
}

// Safety: the driver API is thread-safe and the pointers stay valid for as
// long as `_lib` is loaded, which is the life of the process.
unsafe impl Send for CudaApi {}
unsafe impl Sync for CudaApi {}

#[cfg(target_os = "windows")]
const DEFAULT_LIBRARIES: &[&str] = &["nvcuda.dll"];
#[cfg(not(target_os = "windows"))]
const DEFAULT_LIBRARIES: &[&str] = &["libcuda.so.1", "libcuda.so"];

static CUDA_API: OnceLock<Option<CudaApi>> = OnceLock::new();

impl CudaApi {
    fn try_load_from(name: &str) -> Option<Self> {
        let lib = unsafe { Library::new(name) }.ok()?;
        unsafe {
            let api = CudaApi {
                cu_init: *lib.get::<FnCuInit>(b"cuInit\0").ok()?,
                cu_driver_get_version: *lib.get::<FnCuDriverGetVersion>(b"cuDriverGetVersion\0").ok()?,
                cu_device_get: *lib.get::<FnCuDeviceGet>(b"cuDeviceGet\0").ok()?,
                cu_device_get_attribute: *lib.get::<FnCuDeviceGetAttribute>(b"cuDeviceGetAttribute\0").ok()?,
                cu_device_primary_ctx_retain: *lib.get::<FnCuDevicePrimaryCtxRetain>(b"cuDevicePrimaryCtxRetain\0").ok()?,
                cu_device_primary_ctx_release: *lib.get::<FnCuDevicePrimaryCtxRelease>(b"cuDevicePrimaryCtxRelease\0").ok()?,
                cu_ctx_set_current: *lib.get::<FnCuCtxSetCurrent>(b"cuCtxSetCurrent\0").ok()?,
                cu_module_load: *lib.get::<FnCuModuleLoad>(b"cuModuleLoad\0").ok()?,
                cu_module_load_data_ex: *lib.get::<FnCuModuleLoadDataEx>(b"cuModuleLoadDataEx\0").ok()?,
                cu_module_unload: *lib.get::<FnCuModuleUnload>(b"cuModuleUnload\0").ok()?,
                cu_get_error_name: *lib.get::<FnCuGetErrorName>(b"cuGetErrorName\0").ok()?,
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
}

/// Get the runtime-loaded driver API. Returns None if no driver library loads.
///
/// The first call decides which library is used for the rest of the process;
/// `explicit` is ignored afterwards.
pub fn cuda_api(explicit: Option<&str>) -> Option<&'static CudaApi> {
    CUDA_API.get_or_init(|| CudaApi::try_load(explicit)).as_ref()
}

/// Name of the library `cuda_api` would try first, for error messages.
pub fn library_label(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_LIBRARIES.join(" / "))
}

// ---------------------------------------------------------------------------
// Error checking helpers
// ---------------------------------------------------------------------------

/// Symbolic name of a driver status code (`CUDA_ERROR_INVALID_PTX`).
pub fn error_name(api: &CudaApi, code: CuResult) -> String {
    let mut name: *const c_char = std::ptr::null();
    let status = unsafe { (api.cu_get_error_name)(code, &mut name) };
    if status != CUDA_SUCCESS || name.is_null() {
        return format!("CUresult({})", code);
    }
    unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
}

/// Check a driver API return code.
pub fn check_cu(api: &CudaApi, code: CuResult, call: &str) -> Result<(), ForgeError> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(ForgeError::Driver {
            call: call.to_string(),
            code,
            name: error_name(api, code),
        })
    }
}
