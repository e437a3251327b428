//! External optimizers and the per-format registry that selects them.
use crate::error::AdapterFailure;
use crate::format::{Format, ImageFile};
use crate::runner::{ExitKind, ProcessOutput, ProcessRunner};
use crate::Error;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// The optimizers this crate ships a command line for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// `pngcrush`, PNG.
    Pngcrush,
    /// `optipng`, PNG.
    Optipng,
    /// `zopflipng`, PNG.
    Zopflipng,
    /// `jpegtran`, JPEG.
    Jpegtran,
    /// `jpegoptim`, JPEG, works in place.
    Jpegoptim,
}

/// Where an adapter's command line comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    /// One of the stock command lines.
    Builtin(Builtin),
    /// A caller-supplied command template.
    Custom,
}

/// One element of a command-line template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Passed through unchanged.
    Literal(OsString),
    /// Path of the private copy of the input.
    Input,
    /// Path the tool must write its result to.
    Output,
}

impl Arg {
    /// Shorthand for [`Arg::Literal`].
    pub fn literal(value: impl Into<OsString>) -> Self {
        Arg::Literal(value.into())
    }
}

/// A configured external compressor scoped to one format.
#[derive(Debug, Clone)]
pub struct OptimizerAdapter {
    kind: ToolKind,
    name: String,
    format: Format,
    program: String,
    args: Vec<Arg>,
    prefill_output: bool,
    success_codes: Vec<i32>,
    timeout: Option<Duration>,
}

impl OptimizerAdapter {
    /// The stock command line for a known tool.
    pub fn builtin(tool: Builtin) -> Self {
        use Arg::{Input, Output};
        let lit = Arg::literal;
        let (name, format, args, prefill_output) = match tool {
            Builtin::Pngcrush => (
                "pngcrush",
                Format::Png,
                vec![lit("-rem"), lit("alla"), lit("-reduce"), lit("-brute"), lit("-q"), Input, Output],
                false,
            ),
            Builtin::Optipng => (
                "optipng",
                Format::Png,
                vec![lit("-out"), Output, lit("-o9"), lit("-quiet"), Input],
                false,
            ),
            Builtin::Zopflipng => (
                "zopflipng",
                Format::Png,
                vec![lit("-m"), lit("--lossy_transparent"), lit("--filters=0me"), Input, Output],
                false,
            ),
            Builtin::Jpegtran => (
                "jpegtran",
                Format::Jpeg,
                vec![
                    lit("-copy"),
                    lit("none"),
                    lit("-optimize"),
                    lit("-perfect"),
                    lit("-outfile"),
                    Output,
                    Input,
                ],
                false,
            ),
            // jpegoptim rewrites its argument in place.
            Builtin::Jpegoptim => (
                "jpegoptim",
                Format::Jpeg,
                vec![lit("--strip-all"), lit("--quiet"), Output],
                true,
            ),
        };
        Self {
            kind: ToolKind::Builtin(tool),
            name: name.to_string(),
            format,
            program: name.to_string(),
            args,
            prefill_output,
            success_codes: vec![0],
            timeout: None,
        }
    }
    /// An adapter running `program` with an argument template.
    pub fn custom(
        name: impl Into<String>,
        format: Format,
        program: impl Into<String>,
        args: Vec<Arg>,
    ) -> Self {
        Self {
            kind: ToolKind::Custom,
            name: name.into(),
            format,
            program: program.into(),
            args,
            prefill_output: false,
            success_codes: vec![0],
            timeout: None,
        }
    }
    /// Seed the output path with a copy of the input before the tool runs,
    /// for tools that only optimize in place.
    pub fn with_prefilled_output(self, prefill_output: bool) -> Self {
        Self {
            prefill_output,
            ..self
        }
    }
    /// Exit codes that mean the tool succeeded. Defaults to `[0]`.
    pub fn with_success_codes(self, success_codes: Vec<i32>) -> Self {
        Self {
            success_codes,
            ..self
        }
    }
    /// Overrides the engine-wide timeout for this adapter only.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }
    /// Stock or custom command line.
    pub fn kind(&self) -> ToolKind {
        self.kind
    }
    /// Unique name within a [`Registry`].
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The one format this adapter accepts.
    pub fn format(&self) -> Format {
        self.format
    }
    /// The per-adapter timeout override, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
    /// Whether `code` is one of the configured success exit codes.
    pub fn is_success(&self, code: i32) -> bool {
        self.success_codes.contains(&code)
    }
    fn render_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| match arg {
                Arg::Literal(value) => value.clone(),
                Arg::Input => input.as_os_str().to_owned(),
                Arg::Output => output.as_os_str().to_owned(),
            })
            .collect()
    }
    /// Runs the tool against a private copy of `image` inside `scratch_dir`.
    ///
    /// `scratch_dir` must belong to this invocation alone; the input copy and
    /// the output are both placed in it.
    pub fn invoke(
        &self,
        runner: &dyn ProcessRunner,
        image: &ImageFile,
        scratch_dir: &Path,
        default_timeout: Duration,
    ) -> Result<RunResult, AdapterFailure> {
        let ext = image.format().extension();
        let input = scratch_dir.join(format!("input.{ext}"));
        let output = scratch_dir.join(format!("output.{ext}"));
        fs::write(&input, image.bytes()).map_err(|e| AdapterFailure::Scratch(e.to_string()))?;
        if self.prefill_output {
            fs::write(&output, image.bytes()).map_err(|e| AdapterFailure::Scratch(e.to_string()))?;
        }
        let timeout = self.timeout.unwrap_or(default_timeout);
        let args = self.render_args(&input, &output);
        let process = runner.run(&self.program, &args, scratch_dir, timeout);
        debug!(
            "{} finished with {:?} in {:.2}s",
            self.name,
            process.exit,
            process.duration.as_secs_f64()
        );
        let claims_success = matches!(process.exit, ExitKind::Exited(code) if self.is_success(code));
        let produced = fs::metadata(&output).map(|m| m.is_file() && m.len() > 0).unwrap_or(false);
        Ok(RunResult {
            adapter: self.name.clone(),
            program: self.program.clone(),
            timeout,
            process,
            output: (claims_success && produced).then_some(output),
            success_codes: self.success_codes.clone(),
        })
    }
}

/// The result of one adapter invocation.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Name of the adapter that ran.
    pub adapter: String,
    /// The program that was started.
    pub program: String,
    /// The timeout that applied.
    pub timeout: Duration,
    /// How the process ended and what it printed.
    pub process: ProcessOutput,
    /// Present only if the tool reported success and left a non-empty file.
    pub output: Option<PathBuf>,
    success_codes: Vec<i32>,
}

impl RunResult {
    /// The produced file, or why there is none.
    pub fn into_output(self) -> Result<PathBuf, AdapterFailure> {
        if let Some(path) = self.output {
            return Ok(path);
        }
        Err(match self.process.exit {
            ExitKind::Exited(code) if self.success_codes.contains(&code) => AdapterFailure::EmptyOutput,
            ExitKind::Exited(code) => AdapterFailure::NonZeroExit {
                code,
                output: self.process.combined_output(),
            },
            ExitKind::Signaled => AdapterFailure::Terminated,
            ExitKind::TimedOut => AdapterFailure::Timeout {
                after: self.timeout,
            },
            ExitKind::NotFound => AdapterFailure::ToolMissing {
                program: self.program,
            },
            ExitKind::SpawnFailed(reason) => AdapterFailure::Spawn(reason),
        })
    }
}

/// Read-only mapping from format to the adapters that handle it.
#[derive(Debug, Clone)]
pub struct Registry {
    adapters: Vec<OptimizerAdapter>,
}

impl Registry {
    /// Validates and freezes an adapter list.
    ///
    /// Both JPEG and PNG need at least one adapter, names must be unique and
    /// no adapter may claim [`Format::Unknown`].
    pub fn new(adapters: Vec<OptimizerAdapter>) -> Result<Self, Error> {
        let mut names = HashSet::new();
        for adapter in &adapters {
            if adapter.format == Format::Unknown {
                return Err(Error::Registry(format!(
                    "adapter \"{}\" is not bound to JPEG or PNG",
                    adapter.name
                )));
            }
            if !names.insert(adapter.name.as_str()) {
                return Err(Error::Registry(format!(
                    "adapter \"{}\" is registered twice",
                    adapter.name
                )));
            }
        }
        for format in [Format::Jpeg, Format::Png] {
            if !adapters.iter().any(|a| a.format == format) {
                return Err(Error::Registry(format!("no adapters registered for {format}")));
            }
        }
        Ok(Self { adapters })
    }
    /// Adapters for `format` in registration order.
    pub fn adapters_for(&self, format: Format) -> Vec<&OptimizerAdapter> {
        self.adapters.iter().filter(|a| a.format == format).collect()
    }
    /// Sets a timeout override on the adapter called `name`.
    pub fn with_timeout(mut self, name: &str, timeout: Duration) -> Result<Self, Error> {
        let adapter = self
            .adapters
            .iter_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::Registry(format!("unknown adapter \"{name}\"")))?;
        adapter.timeout = Some(timeout);
        Ok(self)
    }
}

impl Default for Registry {
    /// pngcrush, optipng and zopflipng for PNG; jpegtran and jpegoptim for JPEG.
    fn default() -> Self {
        let adapters = [
            Builtin::Pngcrush,
            Builtin::Optipng,
            Builtin::Zopflipng,
            Builtin::Jpegtran,
            Builtin::Jpegoptim,
        ]
        .into_iter()
        .map(OptimizerAdapter::builtin)
        .collect();
        Self { adapters }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::SystemRunner;

    fn names(registry: &Registry, format: Format) -> Vec<&str> {
        registry.adapters_for(format).into_iter().map(|a| a.name()).collect()
    }

    #[test]
    fn default_registry_order() {
        let registry = Registry::default();
        assert_eq!(names(&registry, Format::Png), ["pngcrush", "optipng", "zopflipng"]);
        assert_eq!(names(&registry, Format::Jpeg), ["jpegtran", "jpegoptim"]);
        assert!(registry.adapters_for(Format::Unknown).is_empty());
    }

    #[test]
    fn renders_templates() {
        let adapter = OptimizerAdapter::builtin(Builtin::Jpegtran);
        let args = adapter.render_args(Path::new("in.jpg"), Path::new("out.jpg"));
        assert_eq!(
            args,
            ["-copy", "none", "-optimize", "-perfect", "-outfile", "out.jpg", "in.jpg"]
                .map(OsString::from)
        );
        assert_eq!(adapter.kind(), ToolKind::Builtin(Builtin::Jpegtran));
        let custom = OptimizerAdapter::custom("c", Format::Png, "cp", vec![Arg::Input, Arg::Output]);
        assert_eq!(custom.kind(), ToolKind::Custom);
    }

    #[test]
    fn rejects_a_format_without_adapters() {
        let png_only = vec![OptimizerAdapter::builtin(Builtin::Optipng)];
        assert!(matches!(Registry::new(png_only), Err(Error::Registry(_))));
    }

    #[test]
    fn rejects_duplicates_and_unknown_formats() {
        let duplicate = vec![
            OptimizerAdapter::builtin(Builtin::Optipng),
            OptimizerAdapter::builtin(Builtin::Optipng),
            OptimizerAdapter::builtin(Builtin::Jpegtran),
        ];
        assert!(Registry::new(duplicate).is_err());
        let unknown = vec![
            OptimizerAdapter::custom("x", Format::Unknown, "true", vec![]),
            OptimizerAdapter::builtin(Builtin::Optipng),
            OptimizerAdapter::builtin(Builtin::Jpegtran),
        ];
        assert!(Registry::new(unknown).is_err());
    }

    #[test]
    fn timeout_override_needs_a_known_name() {
        let registry = Registry::default()
            .with_timeout("optipng", Duration::from_secs(5))
            .unwrap();
        let optipng = registry.adapters_for(Format::Png)[1];
        assert_eq!(optipng.timeout(), Some(Duration::from_secs(5)));
        assert!(Registry::default().with_timeout("pngout", Duration::from_secs(5)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn classifies_failures() {
        let scratch = tempfile::tempdir().unwrap();
        let image = ImageFile::from_bytes("a.png", b"\x89PNG\r\n\x1A\npayload".to_vec());
        let runner = SystemRunner::new();
        let invoke = |adapter: OptimizerAdapter| {
            adapter
                .invoke(&runner, &image, scratch.path(), Duration::from_secs(10))
                .unwrap()
                .into_output()
        };

        let missing = OptimizerAdapter::custom("m", Format::Png, "optimage-no-such-tool", vec![]);
        assert_eq!(
            invoke(missing),
            Err(AdapterFailure::ToolMissing {
                program: "optimage-no-such-tool".to_string()
            })
        );
        let failing = OptimizerAdapter::custom("f", Format::Png, "false", vec![]);
        assert!(matches!(invoke(failing), Err(AdapterFailure::NonZeroExit { code: 1, .. })));
        let silent = OptimizerAdapter::custom("s", Format::Png, "true", vec![]);
        assert_eq!(invoke(silent), Err(AdapterFailure::EmptyOutput));
        let copy = OptimizerAdapter::custom("c", Format::Png, "cp", vec![Arg::Input, Arg::Output]);
        let output = invoke(copy).unwrap();
        assert_eq!(fs::read(output).unwrap(), image.bytes());
    }

    #[cfg(unix)]
    #[test]
    fn prefilled_output_for_in_place_tools() {
        let scratch = tempfile::tempdir().unwrap();
        let image = ImageFile::from_bytes("a.jpg", b"\xFF\xD8\xFFpayload".to_vec());
        let touch = OptimizerAdapter::custom("t", Format::Jpeg, "true", vec![Arg::Output])
            .with_prefilled_output(true);
        let result = touch
            .invoke(&SystemRunner::new(), &image, scratch.path(), Duration::from_secs(10))
            .unwrap();
        let output = result.into_output().unwrap();
        assert_eq!(output.file_name().unwrap(), "output.jpg");
        assert_eq!(fs::read(output).unwrap(), image.bytes());
    }

    #[cfg(unix)]
    #[test]
    fn custom_success_codes() {
        let scratch = tempfile::tempdir().unwrap();
        let image = ImageFile::from_bytes("a.png", b"\x89PNG\r\n\x1A\npayload".to_vec());
        let lenient = OptimizerAdapter::custom(
            "l",
            Format::Png,
            "sh",
            vec![Arg::literal("-c"), Arg::literal("cp \"$0\" \"$1\"; exit 2"), Arg::Input, Arg::Output],
        )
        .with_success_codes(vec![0, 2]);
        let result = lenient
            .invoke(&SystemRunner::new(), &image, scratch.path(), Duration::from_secs(10))
            .unwrap();
        assert!(result.into_output().is_ok());
    }
}
