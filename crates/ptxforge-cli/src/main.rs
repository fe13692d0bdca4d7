use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ptxforge_core::codegen::NVPTX_TRIPLE;
use ptxforge_core::forge::llvm_code_generator;
use ptxforge_core::loader::{probe_assembler, select_strategy};
use ptxforge_core::{
    ptx, resolve_isa_version, CudaDriver, ForgeConfig, IntermediateProgram, LlvmBackend, Result,
    TargetDescriptor,
};

#[derive(Parser)]
#[command(
    name = "ptxforge",
    about = "LLVM IR to PTX for NVIDIA GPUs",
    long_about = "Lower LLVM IR to PTX, patch the result for the installed toolkit,\nand load it through ptxas or the CUDA driver JIT.",
    version
)]
struct Cli {
    /// JSON config file (defaults apply for missing keys)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show LLVM, CUDA and assembler availability
    Info {
        /// Device ordinal to query
        #[arg(long, default_value = "0")]
        device: u32,
    },
    /// Print the PTX ISA version for a toolkit version
    Isa {
        /// Toolkit version, e.g. 11030 for CUDA 11.3
        #[arg(long)]
        toolkit: u32,
    },
    /// Rewrite directives and strip inline-asm markers in a PTX file
    Patch {
        input: PathBuf,
        /// Compute capability, e.g. 86
        #[arg(long)]
        cc: u32,
        #[arg(long)]
        toolkit: u32,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Lower an .ll or .bc file to patched PTX
    Compile {
        input: PathBuf,
        #[arg(long)]
        cc: u32,
        #[arg(long)]
        toolkit: u32,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load a PTX file on a device and report the strategy used
    Load {
        input: PathBuf,
        /// Compute capability (queried from the device if omitted)
        #[arg(long)]
        cc: Option<u32>,
        #[arg(long, default_value = "0")]
        device: u32,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Info { device } => cmd_info(&config, device),
        Commands::Isa { toolkit } => cmd_isa(toolkit),
        Commands::Patch { input, cc, toolkit, output } => cmd_patch(&input, cc, toolkit, output.as_deref()),
        Commands::Compile { input, cc, toolkit, output } => {
            cmd_compile(&config, &input, cc, toolkit, output.as_deref())
        }
        Commands::Load { input, cc, device } => cmd_load(&config, &input, cc, device),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ForgeConfig> {
    let config = match path {
        Some(path) => ForgeConfig::from_json_file(path)?,
        None => ForgeConfig::default(),
    };
    let config = config.with_env_overrides();
    tracing::debug!("config: {:?}", config);
    Ok(config)
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "[x]"
    } else {
        "[ ]"
    }
}

fn cmd_info(config: &ForgeConfig, device: u32) -> Result<()> {
    println!("ptxforge v{}\n", env!("CARGO_PKG_VERSION"));

    let llvm = match &config.llvm_library {
        Some(lib) => LlvmBackend::with_library(lib.clone()),
        None => LlvmBackend::new(),
    };
    println!("Code generation");
    println!("  Triple:      {}", NVPTX_TRIPLE);
    println!("  LLVM NVPTX:  {}", mark(llvm.is_available()));
    let limits = config.generator_limits();
    println!("  Ceiling:     sm_{} / PTX ISA {}", limits.max_compute_capability, limits.max_isa);

    println!("\nAssembler");
    match probe_assembler(&config.assembler) {
        Some(banner) => {
            let version = banner.lines().last().unwrap_or_default();
            println!("  {:<12} [x] {}", config.assembler, version);
        }
        None => println!("  {:<12} [ ] (driver JIT will be used)", config.assembler),
    }
    if !config.use_external_assembler {
        println!("  External assembler disabled by config");
    }

    println!("\nCUDA driver");
    match CudaDriver::with_library(config.cuda_library.as_deref()) {
        Ok(driver) => match TargetDescriptor::detect(&driver, device) {
            Ok(target) => {
                println!("  Driver version: {}", target.toolkit_version());
                println!("  Device {}:       {}", device, target.sm_name());
                match target.isa_version() {
                    Ok(isa) => println!("  PTX ISA:        {}", isa),
                    Err(e) => println!("  PTX ISA:        {}", e),
                }
            }
            Err(e) => println!("  Device {}:       {} {}", device, mark(false), e),
        },
        Err(e) => println!("  {} {}", mark(false), e),
    }
    Ok(())
}

fn cmd_isa(toolkit: u32) -> Result<()> {
    let isa = resolve_isa_version(toolkit)?;
    println!("{}", isa);
    Ok(())
}

fn write_output(text: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, text)?;
            eprintln!("Wrote {} ({} bytes)", path.display(), text.len());
        }
        None => print!("{}", text),
    }
    Ok(())
}

fn cmd_patch(input: &Path, cc: u32, toolkit: u32, output: Option<&Path>) -> Result<()> {
    let isa = resolve_isa_version(toolkit)?;
    let mut text = std::fs::read_to_string(input)?;
    ptx::postprocess(&mut text, isa, cc);
    write_output(&text, output)
}

fn cmd_compile(
    config: &ForgeConfig,
    input: &Path,
    cc: u32,
    toolkit: u32,
    output: Option<&Path>,
) -> Result<()> {
    let program = IntermediateProgram::from_file(input)?;
    let generator = llvm_code_generator(config);
    let text = generator.compile_to_ptx(&program, &TargetDescriptor::new(cc, toolkit))?;
    write_output(&text, output)
}

fn cmd_load(config: &ForgeConfig, input: &Path, cc: Option<u32>, device: u32) -> Result<()> {
    let text = std::fs::read_to_string(input)?;
    let driver = CudaDriver::with_library(config.cuda_library.as_deref())?;
    let cc = match cc {
        Some(cc) => cc,
        None => driver.compute_capability(device)?,
    };
    let _context = driver.activate_primary_context(device)?;

    let strategy = select_strategy(&driver, config);
    let module = strategy.load(&text, cc)?;
    println!("Loaded {} for sm_{} via {}", input.display(), cc, strategy.name());
    driver.unload(module)
}
