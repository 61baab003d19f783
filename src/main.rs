use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use wasmica::{CompiledModule, Engine, EngineConfig, InvokeError, Value};

#[derive(Parser)]
#[command(name = "wasmica")]
#[command(about = "A WebAssembly runtime that compiles modules to native code", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a WebAssembly module
    Run {
        /// The .wasm file to run
        file: PathBuf,
        /// Directory pre-opens, as guest_path::host_path (or a bare path
        /// mapped to itself)
        #[arg(long = "dir")]
        dirs: Vec<String>,
        /// Export to invoke (defaults to _start)
        #[arg(long)]
        invoke: Option<String>,
        /// Arguments for the invoked export (i32/i64/f32/f64 literals)
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            dirs,
            invoke,
            args,
        } => match run_file(&file, &dirs, invoke.as_deref(), &args) {
            Ok(code) => ExitCode::from(code),
            Err(e) => {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn run_file(
    path: &PathBuf,
    dirs: &[String],
    invoke: Option<&str>,
    args: &[String],
) -> anyhow::Result<u8> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("could not read {}", path.display()))?;

    let mut config = EngineConfig::default();
    for dir in dirs {
        let (guest, host) = match dir.split_once("::") {
            Some((g, h)) => (g.to_string(), PathBuf::from(h)),
            None => (dir.clone(), PathBuf::from(dir)),
        };
        config.preopen_dirs.push((guest, host));
    }
    config.args = std::iter::once(path.display().to_string())
        .chain(args.iter().cloned())
        .collect();

    let mut engine = Engine::new(config);
    let compiled = Arc::new(
        CompiledModule::compile(&engine, &bytes).context("module compilation failed")?,
    );
    let mut instance =
        wasmica::Instance::new(&mut engine, compiled.clone()).context("instantiation failed")?;

    let export = invoke.unwrap_or("_start");
    let sig = compiled
        .module()
        .exported_func(export)
        .map(|idx| compiled.module().func_type(idx).clone())
        .ok_or_else(|| anyhow!("module has no export named {export:?}"))?;

    // Without --invoke the trailing arguments belong to the WASI program,
    // not to the export's parameters.
    let func_args: &[String] = if invoke.is_some() { args } else { &[] };
    let values = parse_args(&sig.params, func_args)?;
    match instance.invoke(export, &values) {
        Ok(results) => {
            for value in results {
                println!("{}", format_value(value));
            }
            Ok(0)
        }
        Err(InvokeError::Exit(code)) => Ok(code.min(255) as u8),
        Err(e) => Err(e.into()),
    }
}

fn parse_args(
    params: &[wasmica::module::ValType],
    args: &[String],
) -> anyhow::Result<Vec<Value>> {
    use wasmica::module::ValType;
    if args.len() != params.len() {
        bail!(
            "export takes {} argument(s), {} given",
            params.len(),
            args.len()
        );
    }
    params
        .iter()
        .zip(args)
        .map(|(ty, raw)| {
            let value = match ty {
                ValType::I32 => Value::I32(raw.parse()?),
                ValType::I64 => Value::I64(raw.parse()?),
                ValType::F32 => Value::F32(raw.parse()?),
                ValType::F64 => Value::F64(raw.parse()?),
                other => bail!("cannot pass a {other:?} argument from the command line"),
            };
            Ok(value)
        })
        .collect()
}

fn format_value(value: Value) -> String {
    match value {
        Value::I32(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::F32(v) => v.to_string(),
        Value::F64(v) => v.to_string(),
        Value::V128(v) => format!("{v:#034x}"),
    }
}
