//! External assembler strategy against scripted stand-ins for `ptxas`.

#![cfg(unix)]

use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use ptxforge_core::driver::{CompiledModule, Driver, DriverError, JitModule, JitOptions};
use ptxforge_core::loader::{load_module, probe_assembler, select_strategy};
use ptxforge_core::{ForgeConfig, ForgeError};

/// Spawning freshly written scripts from parallel tests can hit ETXTBSY.
static SPAWN: Mutex<()> = Mutex::new(());

const PTX: &str = ".version 7.3\n.target sm_86\n.address_size 64\n\n.visible .entry k()\n{\n\tret;\n}\n";

const ASSEMBLER_OK: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
    echo "ptxas: NVIDIA (R) Ptx optimizing assembler"
    echo "Cuda compilation tools, release 11.3, V11.3.58"
    exit 0
fi
printf '%s\n' "$@" > "$(dirname "$0")/args"
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "-o" ]; then out="$2"; fi
    shift
done
echo "ptxas info    : Compiling entry function 'k' for 'sm_86'" >&2
printf 'ELF-cubin' > "$out"
"#;

const ASSEMBLER_FAILS: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then exit 0; fi
echo "ptxas /tmp/k.ptx, line 6; error   : Unknown symbol 'foo'" >&2
echo "ptxas fatal   : Ptx assembly aborted due to errors" >&2
exit 255
"#;

const ASSEMBLER_BROKEN: &str = "#!/bin/sh\nexit 1\n";

#[derive(Default)]
struct RecordingDriver {
    reject_objects: bool,
    objects: RefCell<Vec<(PathBuf, Vec<u8>)>>,
    jit_loads: RefCell<usize>,
}

impl Driver for RecordingDriver {
    fn load_file(&self, path: &Path) -> Result<CompiledModule, DriverError> {
        let contents = fs::read(path).unwrap_or_default();
        self.objects.borrow_mut().push((path.to_path_buf(), contents));
        if self.reject_objects {
            return Err(DriverError {
                call: "cuModuleLoad".into(),
                code: 200,
                name: "CUDA_ERROR_INVALID_IMAGE".into(),
                log: String::new(),
            });
        }
        Ok(unsafe { CompiledModule::from_raw(std::ptr::null_mut()) })
    }

    fn load_data(&self, _assembly: &str, _options: &JitOptions) -> Result<JitModule, DriverError> {
        *self.jit_loads.borrow_mut() += 1;
        Ok(JitModule {
            module: unsafe { CompiledModule::from_raw(std::ptr::null_mut()) },
            info_log: String::new(),
        })
    }
}

struct Scratch {
    bin: tempfile::TempDir,
    work: tempfile::TempDir,
    config: ForgeConfig,
}

impl Scratch {
    fn with_assembler(script: &str) -> Self {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let assembler = bin.path().join("ptxas");
        fs::write(&assembler, script).unwrap();
        fs::set_permissions(&assembler, fs::Permissions::from_mode(0o755)).unwrap();
        let config = ForgeConfig {
            assembler: assembler.to_string_lossy().into_owned(),
            temp_dir: Some(work.path().to_path_buf()),
            ..ForgeConfig::default()
        };
        Self {
            bin,
            work,
            config,
        }
    }

    fn leftover_files(&self) -> usize {
        fs::read_dir(self.work.path()).unwrap().count()
    }

    /// Arguments of the last assembler run, one per line.
    fn recorded_args(&self) -> Vec<String> {
        fs::read_to_string(self.bin.path().join("args"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

#[test]
fn test_version_banner_is_reported() {
    let _guard = SPAWN.lock();
    let scratch = Scratch::with_assembler(ASSEMBLER_OK);
    let banner = probe_assembler(&scratch.config.assembler).unwrap();
    assert!(banner.ends_with("V11.3.58"));
}

#[test]
fn test_failing_version_check_selects_jit() {
    let _guard = SPAWN.lock();
    let scratch = Scratch::with_assembler(ASSEMBLER_BROKEN);
    assert_eq!(probe_assembler(&scratch.config.assembler), None);

    let driver = RecordingDriver::default();
    assert_eq!(select_strategy(&driver, &scratch.config).name(), "driver-jit");
}

#[test]
fn test_assembled_object_is_loaded_and_cleaned_up() {
    let _guard = SPAWN.lock();
    let scratch = Scratch::with_assembler(ASSEMBLER_OK);
    let driver = RecordingDriver::default();

    assert_eq!(select_strategy(&driver, &scratch.config).name(), "ptxas");
    load_module(&driver, &scratch.config, PTX, 86).unwrap();

    let objects = driver.objects.borrow();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].1, b"ELF-cubin");
    assert!(objects[0].0.starts_with(scratch.work.path()));
    assert!(!objects[0].0.exists());
    assert_eq!(*driver.jit_loads.borrow(), 0);
    assert_eq!(scratch.leftover_files(), 0);
}

#[test]
fn test_assembler_failure_reports_log_and_cleans_up() {
    let _guard = SPAWN.lock();
    let scratch = Scratch::with_assembler(ASSEMBLER_FAILS);
    let driver = RecordingDriver::default();

    match load_module(&driver, &scratch.config, PTX, 86) {
        Err(ForgeError::ExternalToolFailure { tool, status, log }) => {
            assert_eq!(tool, scratch.config.assembler);
            assert!(status.contains("255"));
            assert!(log.contains("Unknown symbol 'foo'"));
        }
        other => panic!("expected ExternalToolFailure, got {:?}", other.map(|_| ())),
    }
    assert!(driver.objects.borrow().is_empty());
    assert_eq!(scratch.leftover_files(), 0);
}

#[test]
fn test_rejected_object_is_invalid_assembly_and_cleaned_up() {
    let _guard = SPAWN.lock();
    let scratch = Scratch::with_assembler(ASSEMBLER_OK);
    let driver = RecordingDriver {
        reject_objects: true,
        ..RecordingDriver::default()
    };

    let err = load_module(&driver, &scratch.config, PTX, 86).unwrap_err();
    match err {
        ForgeError::InvalidAssembly { assembly, log } => {
            assert_eq!(assembly, PTX);
            assert_eq!(log, "CUDA_ERROR_INVALID_IMAGE");
        }
        other => panic!("expected InvalidAssembly, got {:?}", other),
    }
    assert_eq!(scratch.leftover_files(), 0);
}

#[test]
fn test_assembler_command_line() {
    let _guard = SPAWN.lock();
    let scratch = Scratch::with_assembler(ASSEMBLER_OK);
    let driver = RecordingDriver::default();

    load_module(&driver, &scratch.config, PTX, 75).unwrap();

    let args = scratch.recorded_args();
    assert_eq!(args.len(), 5, "{:?}", args);
    assert_eq!(args[0], "-v");
    assert_eq!(args[1], "--gpu-name=sm_75");
    assert_eq!(args[3], "-o");

    let input = Path::new(&args[2]);
    assert_eq!(input.parent(), Some(scratch.work.path()));
    assert_eq!(input.extension().and_then(|e| e.to_str()), Some("ptx"));
    let output = Path::new(&args[4]);
    assert_eq!(output.parent(), Some(scratch.work.path()));
    assert_ne!(input, output);
    assert_eq!(driver.objects.borrow()[0].0, output);
}

#[test]
fn test_concurrent_loads_use_distinct_files() {
    let _guard = SPAWN.lock();
    let scratch = Scratch::with_assembler(ASSEMBLER_OK);
    let config = &scratch.config;

    let objects: Vec<Vec<PathBuf>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(move || {
                    let driver = RecordingDriver::default();
                    load_module(&driver, config, PTX, 86).unwrap();
                    let objects = driver.objects.take();
                    assert_eq!(objects[0].1, b"ELF-cubin");
                    objects.into_iter().map(|(path, _)| path).collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut paths: Vec<PathBuf> = objects.into_iter().flatten().collect();
    assert_eq!(paths.len(), 8);
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 8);
    assert_eq!(scratch.leftover_files(), 0);
}
