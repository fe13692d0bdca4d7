//! CUDA driver access for module loading and device queries.
//!
//! Provides:
//! - The [`Driver`] seam used by the module loader (file-based and
//!   data-based module loads)
//! - [`CudaDriver`], backed by the runtime-loaded driver library
//! - [`CompiledModule`], the opaque handle handed back to callers
//!
//! Context management stays with the caller: a CUDA context must be
//! current on the calling thread before anything is loaded.

pub mod ffi;

use std::ffi::{c_uint, c_void, CString};
use std::path::Path;
use std::sync::OnceLock;

use crate::error::ForgeError;
use crate::Result;

use ffi::{check_cu, CudaApi, CuModule, CuResult};

/// A loaded CUDA module. The caller owns it and decides when to unload it.
#[derive(Debug)]
pub struct CompiledModule(CuModule);

// Safety: CUmodule handles are plain driver-side identifiers, usable from
// any thread with the owning context current.
unsafe impl Send for CompiledModule {}
unsafe impl Sync for CompiledModule {}

impl CompiledModule {
    /// Wrap a raw `CUmodule`.
    ///
    /// # Safety
    /// `raw` must be a module handle returned by the CUDA driver (or null
    /// for a handle that is never passed back to the driver).
    pub unsafe fn from_raw(raw: CuModule) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> CuModule {
        self.0
    }

    pub fn into_raw(self) -> CuModule {
        self.0
    }
}

/// Log capture settings for a data-based (JIT) load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitOptions {
    pub error_log_bytes: usize,
    pub info_log_bytes: usize,
    pub verbose: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            error_log_bytes: 8192,
            info_log_bytes: 8192,
            verbose: true,
        }
    }
}

/// A module produced by the driver JIT, with its informational log.
#[derive(Debug)]
pub struct JitModule {
    pub module: CompiledModule,
    pub info_log: String,
}

/// A failed driver call, with whatever log the driver produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub call: String,
    pub code: CuResult,
    pub name: String,
    pub log: String,
}

impl DriverError {
    /// Whether the driver refused the image itself rather than failing for
    /// an environmental reason.
    pub fn rejects_assembly(&self) -> bool {
        matches!(
            self.code,
            ffi::CUDA_ERROR_INVALID_IMAGE
                | ffi::CUDA_ERROR_INVALID_PTX
                | ffi::CUDA_ERROR_UNSUPPORTED_PTX_VERSION
        )
    }

    /// Map to the crate error, attaching `assembly` when it was the cause.
    pub fn into_forge_error(self, assembly: &str) -> ForgeError {
        if self.rejects_assembly() {
            let log = if self.log.is_empty() {
                self.name
            } else {
                format!("{}: {}", self.name, self.log)
            };
            ForgeError::InvalidAssembly {
                assembly: assembly.to_string(),
                log,
            }
        } else {
            ForgeError::Driver {
                call: self.call,
                code: self.code,
                name: self.name,
            }
        }
    }
}

/// The two driver entry points the module loader consumes.
pub trait Driver {
    /// Load a compiled object (cubin) from disk.
    fn load_file(&self, path: &Path) -> std::result::Result<CompiledModule, DriverError>;

    /// Compile and load PTX text in-process.
    fn load_data(
        &self,
        assembly: &str,
        options: &JitOptions,
    ) -> std::result::Result<JitModule, DriverError>;
}

/// The CUDA driver, loaded at runtime.
#[derive(Clone, Copy)]
pub struct CudaDriver {
    api: &'static CudaApi,
}

static CU_INIT: OnceLock<CuResult> = OnceLock::new();

impl CudaDriver {
    /// Load the default driver library and initialize it.
    pub fn new() -> Result<Self> {
        Self::with_library(None)
    }

    /// Load a specific driver library (first call in the process wins).
    pub fn with_library(library: Option<&str>) -> Result<Self> {
        let api = ffi::cuda_api(library).ok_or_else(|| ForgeError::LibraryNotAvailable {
            library: ffi::library_label(library),
        })?;
        let code = *CU_INIT.get_or_init(|| unsafe { (api.cu_init)(0) });
        check_cu(api, code, "cuInit")?;
        Ok(Self { api })
    }

    /// Whether a CUDA driver library can be loaded and initialized.
    pub fn is_available() -> bool {
        Self::new().is_ok()
    }

    /// Driver version in the toolkit encoding (e.g. 11030).
    pub fn driver_version(&self) -> Result<u32> {
        let mut version = 0;
        check_cu(
            self.api,
            unsafe { (self.api.cu_driver_get_version)(&mut version) },
            "cuDriverGetVersion",
        )?;
        Ok(version.max(0) as u32)
    }

    /// Compute capability of a device as `major * 10 + minor`.
    pub fn compute_capability(&self, ordinal: u32) -> Result<u32> {
        let device = self.device(ordinal)?;
        let major = self.attribute(device, ffi::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor = self.attribute(device, ffi::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
        Ok(major * 10 + minor)
    }

    /// Retain device `ordinal`'s primary context and make it current on
    /// this thread. Released when the guard drops.
    pub fn activate_primary_context(&self, ordinal: u32) -> Result<PrimaryContext> {
        let device = self.device(ordinal)?;
        let mut ctx: ffi::CuContext = std::ptr::null_mut();
        check_cu(
            self.api,
            unsafe { (self.api.cu_device_primary_ctx_retain)(&mut ctx, device) },
            "cuDevicePrimaryCtxRetain",
        )?;
        let guard = PrimaryContext {
            api: self.api,
            device,
        };
        check_cu(
            self.api,
            unsafe { (self.api.cu_ctx_set_current)(ctx) },
            "cuCtxSetCurrent",
        )?;
        Ok(guard)
    }

    fn device(&self, ordinal: u32) -> Result<ffi::CuDevice> {
        let mut device: ffi::CuDevice = 0;
        check_cu(
            self.api,
            unsafe { (self.api.cu_device_get)(&mut device, ordinal as i32) },
            "cuDeviceGet",
        )?;
        Ok(device)
    }

    fn attribute(&self, device: ffi::CuDevice, attribute: i32) -> Result<u32> {
        let mut value = 0;
        check_cu(
            self.api,
            unsafe { (self.api.cu_device_get_attribute)(&mut value, attribute, device) },
            "cuDeviceGetAttribute",
        )?;
        Ok(value.max(0) as u32)
    }

    /// Release a module.
    pub fn unload(&self, module: CompiledModule) -> Result<()> {
        check_cu(
            self.api,
            unsafe { (self.api.cu_module_unload)(module.into_raw()) },
            "cuModuleUnload",
        )
    }

    fn failure(&self, call: &str, code: CuResult, log: String) -> DriverError {
        DriverError {
            call: call.to_string(),
            code,
            name: ffi::error_name(self.api, code),
            log,
        }
    }
}

/// A retained primary context, current on the thread that activated it.
pub struct PrimaryContext {
    api: &'static CudaApi,
    device: ffi::CuDevice,
}

impl Drop for PrimaryContext {
    fn drop(&mut self) {
        unsafe {
            (self.api.cu_ctx_set_current)(std::ptr::null_mut());
            (self.api.cu_device_primary_ctx_release)(self.device);
        }
    }
}

impl Driver for CudaDriver {
    fn load_file(&self, path: &Path) -> std::result::Result<CompiledModule, DriverError> {
        let c_path = CString::new(path.to_string_lossy().as_bytes()).map_err(|_| DriverError {
            call: "cuModuleLoad".into(),
            code: 1,
            name: "CUDA_ERROR_INVALID_VALUE".into(),
            log: format!("path contains a null byte: {}", path.display()),
        })?;
        let mut module: CuModule = std::ptr::null_mut();
        let code = unsafe { (self.api.cu_module_load)(&mut module, c_path.as_ptr()) };
        if code != ffi::CUDA_SUCCESS {
            return Err(self.failure("cuModuleLoad", code, String::new()));
        }
        Ok(CompiledModule(module))
    }

    fn load_data(
        &self,
        assembly: &str,
        options: &JitOptions,
    ) -> std::result::Result<JitModule, DriverError> {
        let image = CString::new(assembly).map_err(|_| DriverError {
            call: "cuModuleLoadDataEx".into(),
            code: ffi::CUDA_ERROR_INVALID_PTX,
            name: "CUDA_ERROR_INVALID_PTX".into(),
            log: "assembly contains a null byte".into(),
        })?;

        let mut error_log = vec![0u8; options.error_log_bytes];
        let mut info_log = vec![0u8; options.info_log_bytes];
        let mut keys = [
            ffi::CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES,
            ffi::CU_JIT_ERROR_LOG_BUFFER,
            ffi::CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES,
            ffi::CU_JIT_INFO_LOG_BUFFER,
            ffi::CU_JIT_LOG_VERBOSE,
        ];
        // Sizes and flags are passed by value in the pointer slots.
        let mut values: [*mut c_void; 5] = [
            error_log.len() as *mut c_void,
            error_log.as_mut_ptr().cast(),
            info_log.len() as *mut c_void,
            info_log.as_mut_ptr().cast(),
            usize::from(options.verbose) as *mut c_void,
        ];

        let mut module: CuModule = std::ptr::null_mut();
        let code = unsafe {
            (self.api.cu_module_load_data_ex)(
                &mut module,
                image.as_ptr().cast(),
                keys.len() as c_uint,
                keys.as_mut_ptr(),
                values.as_mut_ptr(),
            )
        };

        let info_log = log_buffer_to_string(&info_log);
        if code != ffi::CUDA_SUCCESS {
            let mut log = log_buffer_to_string(&error_log);
            if !info_log.is_empty() {
                if !log.is_empty() {
                    log.push('\n');
                }
                log.push_str(&info_log);
            }
            return Err(self.failure("cuModuleLoadDataEx", code, log));
        }
        Ok(JitModule {
            module: CompiledModule(module),
            info_log,
        })
    }
}

/// Text up to the first NUL of a driver-filled log buffer.
pub(crate) fn log_buffer_to_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).trim_end().to_string()
}
