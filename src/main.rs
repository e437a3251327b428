use anyhow::{bail, Context};
use clap::Parser;
use optimage::{
    apply, Applied, Error, Mode, OptimizationOutcome, Optimizer, Parallel, Registry, Status,
    DEVICE,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::EnvFilter;

const EXIT_IMPROVABLE: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_NOT_A_FILE: u8 = 3;
const EXIT_UNSUPPORTED: u8 = 4;
const EXIT_MISSING_TOOL: u8 = 6;
const EXIT_APPLY_FAILED: u8 = 7;

/// Losslessly compress JPEG and PNG files.
#[derive(Parser, Debug)]
#[command(name = "optimage", version)]
struct Args {
    /// The files to compress
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// Replace the input file in case we can compress it
    #[arg(long, conflicts_with = "output")]
    replace: bool,
    /// Write the compressed file here instead of replacing the input
    #[arg(long)]
    output: Option<PathBuf>,
    /// Allow --output to overwrite an existing file
    #[arg(long, requires = "output")]
    force: bool,
    /// Seconds each optimizer may run before it is killed
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    timeout: u64,
    /// Per-optimizer timeout, e.g. zopflipng=300
    #[arg(long = "adapter-timeout", value_name = "NAME=SECS", value_parser = parse_adapter_timeout)]
    adapter_timeouts: Vec<(String, u64)>,
    /// Run the optimizers for a file one after another
    #[arg(long)]
    sequential: bool,
    /// Number of files processed at the same time
    #[arg(long, short = 'j', default_value_t = DEVICE)]
    jobs: u8,
    /// Show size and timing of every optimizer
    #[arg(long)]
    stats: bool,
    /// Print a JSON report per file
    #[arg(long)]
    json: bool,
    /// Verbose logging
    #[arg(long, hide = true)]
    debug: bool,
}

fn parse_adapter_timeout(value: &str) -> Result<(String, u64), String> {
    let (name, secs) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=SECS, got \"{value}\""))?;
    let secs = secs
        .parse()
        .map_err(|e| format!("invalid seconds in \"{value}\": {e}"))?;
    Ok((name.to_string(), secs))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);
    match run(&args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::WARN };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn run(args: &Args) -> anyhow::Result<u8> {
    if args.output.is_some() && args.files.len() > 1 {
        bail!("--output can only be used with a single input file");
    }
    let mut registry = Registry::default();
    for (name, secs) in &args.adapter_timeouts {
        registry = registry
            .with_timeout(name, Duration::from_secs(*secs))
            .with_context(|| format!("--adapter-timeout {name}={secs}"))?;
    }
    let optimizer = Optimizer::builder()
        .with_registry(registry)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_concurrency(!args.sequential)
        .build();
    let mode = match (&args.output, args.replace) {
        (Some(destination), _) => Mode::WriteTo {
            destination: destination.clone(),
            overwrite: args.force,
        },
        (None, true) => Mode::Replace,
        (None, false) => Mode::Report,
    };
    let results = Parallel::from_paths(args.files.clone())
        .with_device(args.jobs)
        .build(&optimizer)
        .run();
    let mut exit = 0;
    for (path, result) in results {
        exit = exit.max(handle(args, &mode, &path, result));
    }
    Ok(exit)
}

/// The line printed for an input that could not be optimized. The cause
/// is only shown with `--debug`, except for unsupported formats.
fn input_error_message(path: &Path, error: &Error, verbose: bool) -> String {
    match error {
        Error::UnsupportedFormat { .. } => error.to_string(),
        _ if verbose => error.to_string(),
        _ => format!("{} is not an image file", path.display()),
    }
}

/// Reports one file and applies its result, returning its exit code.
fn handle(args: &Args, mode: &Mode, path: &Path, result: Result<OptimizationOutcome, Error>) -> u8 {
    let status = Status::of(&result);
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("{}", input_error_message(path, &e, args.debug));
            return match status {
                Status::UnsupportedFormat => EXIT_UNSUPPORTED,
                _ => EXIT_NOT_A_FILE,
            };
        }
    };
    if args.json {
        match serde_json::to_string(&outcome.report()) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("cannot serialize report for {}: {e}", path.display()),
        }
    }
    if args.stats {
        println!("{}:", path.display());
        for diagnostic in outcome.diagnostics() {
            println!("  {diagnostic}");
        }
    }
    let (Some(best), Some(savings)) = (outcome.best(), outcome.savings()) else {
        let missing = outcome.missing_tools();
        if !outcome.diagnostics().is_empty() && missing.len() == outcome.diagnostics().len() {
            eprintln!(
                "The executable \"{}\" was not found. Please install it and re-run this command.",
                missing[0]
            );
            return EXIT_MISSING_TOOL;
        }
        if !args.json {
            println!("{}: no smaller lossless encoding found", path.display());
        }
        return 0;
    };
    match apply(&outcome, mode) {
        Ok(Applied::Reported) => {
            if !args.json {
                println!(
                    "File can be losslessly compressed to {} bytes ({savings})",
                    best.size()
                );
                println!("Replace it by running either:");
                println!("  optimage --replace {}", path.display());
                println!("  optimage --output <FILENAME> {}", path.display());
            }
            EXIT_IMPROVABLE
        }
        Ok(_) => {
            if !args.json {
                println!(
                    "File was losslessly compressed to {} bytes ({savings})",
                    best.size()
                );
            }
            0
        }
        Err(e) => {
            eprintln!("{e}");
            EXIT_APPLY_FAILED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn input_errors_keep_their_cause_under_debug() {
        let path = Path::new("broken.png");
        let undecodable = Error::UndecodableInput {
            path: path.to_path_buf(),
            format: optimage::Format::Png,
            reason: "truncated IDAT".to_string(),
        };
        assert_eq!(
            input_error_message(path, &undecodable, false),
            "broken.png is not an image file"
        );
        assert!(input_error_message(path, &undecodable, true).contains("truncated IDAT"));

        let denied = Error::InputRead {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
        };
        assert_eq!(
            input_error_message(path, &denied, true),
            "broken.png is not an image file: permission denied"
        );
    }

    #[test]
    fn unsupported_format_always_says_why() {
        let path = Path::new("a.gif");
        let error = Error::UnsupportedFormat {
            path: path.to_path_buf(),
        };
        assert_eq!(
            input_error_message(path, &error, false),
            "a.gif is not a JPEG or PNG file"
        );
    }
}
