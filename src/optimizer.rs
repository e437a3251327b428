use crate::adapter::{OptimizerAdapter, Registry};
use crate::defaults::{SCRATCH_PREFIX, TIMEOUT};
use crate::equivalence::{Comparison, EquivalenceChecker, ImageDecoder, PixelDecoder, PixelGrid};
use crate::error::AdapterFailure;
use crate::format::{Format, ImageFile};
use crate::runner::{ProcessRunner, SystemRunner};
use crate::Error;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Custom configuration for building an [`Optimizer`].
pub struct OptimizerBuilder {
    registry: Registry,
    runner: Box<dyn ProcessRunner>,
    decoder: Box<dyn PixelDecoder>,
    timeout: Duration,
    concurrent: bool,
    scratch_root: Option<PathBuf>,
}

impl OptimizerBuilder {
    /// Replaces the built-in adapters.
    pub fn with_registry(self, registry: Registry) -> Self {
        Self { registry, ..self }
    }
    /// Timeout for adapters that do not set their own.
    /// Defaults to 60 seconds.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
    /// Whether the adapters for one file run at the same time.
    /// Defaults to `true`; the selected result is the same either way.
    pub fn with_concurrency(self, concurrent: bool) -> Self {
        Self { concurrent, ..self }
    }
    /// Directory under which scratch directories are created.
    /// Defaults to the system temporary directory.
    pub fn with_scratch_root(self, root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: Some(root.into()),
            ..self
        }
    }
    /// Replaces how external programs are started.
    pub fn with_runner(self, runner: impl ProcessRunner + 'static) -> Self {
        Self {
            runner: Box::new(runner),
            ..self
        }
    }
    /// Replaces how images are decoded for the equivalence check.
    pub fn with_decoder(self, decoder: impl PixelDecoder + 'static) -> Self {
        Self {
            decoder: Box::new(decoder),
            ..self
        }
    }
    /// Builds the [`Optimizer`].
    pub fn build(self) -> Optimizer {
        Optimizer {
            registry: self.registry,
            runner: self.runner,
            checker: EquivalenceChecker::with_decoder(self.decoder),
            timeout: self.timeout,
            concurrent: self.concurrent,
            scratch_root: self.scratch_root,
        }
    }
}

/// Runs every applicable optimizer on a file and keeps the smallest
/// output that decodes to the same pixels as the input.
pub struct Optimizer {
    registry: Registry,
    runner: Box<dyn ProcessRunner>,
    checker: EquivalenceChecker<Box<dyn PixelDecoder>>,
    timeout: Duration,
    concurrent: bool,
    scratch_root: Option<PathBuf>,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Optimizer {
    /// Starts from the built-in adapters, the system process runner and the
    /// `image` crate decoder.
    pub fn builder() -> OptimizerBuilder {
        OptimizerBuilder {
            registry: Registry::default(),
            runner: Box::new(SystemRunner::new()),
            decoder: Box::new(ImageDecoder),
            timeout: TIMEOUT,
            concurrent: true,
            scratch_root: None,
        }
    }
    /// Optimizes the file at `path`.
    ///
    /// Failures of individual adapters are recorded in the outcome's
    /// diagnostics; only problems with the input itself are returned as
    /// errors.
    pub fn optimize(&self, path: impl AsRef<Path>) -> Result<OptimizationOutcome, Error> {
        let image = ImageFile::open(path)?;
        self.optimize_image(&image)
    }
    /// Optimizes an input that is already in memory.
    pub fn optimize_image(&self, image: &ImageFile) -> Result<OptimizationOutcome, Error> {
        let original_size = image.size();
        if original_size == 0 {
            debug!("{} is empty, nothing to optimize", image.path().display());
            return Ok(OptimizationOutcome {
                path: image.path().to_path_buf(),
                format: image.format(),
                original_size,
                best: None,
                diagnostics: Vec::new(),
            });
        }
        let format = image.format();
        if format == Format::Unknown {
            return Err(Error::UnsupportedFormat {
                path: image.path().to_path_buf(),
            });
        }
        if !image.extension_agrees() {
            warn!(
                "{} contains {format} data; its extension says otherwise",
                image.path().display()
            );
        }
        let original = self
            .checker
            .decode(image.bytes())
            .map_err(|reason| Error::UndecodableInput {
                path: image.path().to_path_buf(),
                format,
                reason,
            })?;
        let adapters = self.registry.adapters_for(format);
        let evaluations = if self.concurrent {
            self.evaluate_concurrently(&adapters, image, &original)
        } else {
            adapters
                .iter()
                .enumerate()
                .map(|(index, adapter)| self.evaluate(index, adapter, image, &original))
                .collect()
        };

        let mut diagnostics = Vec::with_capacity(evaluations.len());
        let mut candidates = Vec::new();
        for evaluation in evaluations {
            diagnostics.push(evaluation.diagnostic);
            candidates.extend(evaluation.candidate);
        }
        let best = select(candidates, original_size);
        info!(
            "{}: best compressor for \"{}\"",
            best.as_ref().map(|c| c.adapter.as_str()).unwrap_or("None"),
            image.path().display()
        );
        Ok(OptimizationOutcome {
            path: image.path().to_path_buf(),
            format,
            original_size,
            best,
            diagnostics,
        })
    }

    fn evaluate_concurrently(
        &self,
        adapters: &[&OptimizerAdapter],
        image: &ImageFile,
        original: &PixelGrid,
    ) -> Vec<Evaluation> {
        let scoped = crossbeam::scope(|scope| {
            let handles: Vec<_> = adapters
                .iter()
                .enumerate()
                .map(|(index, adapter)| {
                    scope.spawn(move |_| self.evaluate(index, adapter, image, original))
                })
                .collect();
            handles
                .into_iter()
                .zip(adapters)
                .map(|(handle, adapter)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Evaluation::crashed(adapter))
                })
                .collect::<Vec<_>>()
        });
        scoped.unwrap_or_else(|_| adapters.iter().map(|a| Evaluation::crashed(a)).collect())
    }

    /// Runs one adapter in its own scratch directory and validates the output.
    fn evaluate(
        &self,
        index: usize,
        adapter: &OptimizerAdapter,
        image: &ImageFile,
        original: &PixelGrid,
    ) -> Evaluation {
        let started = Instant::now();
        let result = self.try_candidate(index, adapter, image, original);
        let elapsed = started.elapsed();
        match &result {
            Ok(candidate) => debug!("{}: {} bytes", adapter.name(), candidate.size),
            Err(failure) => debug!("{}: {failure}", adapter.name()),
        }
        let (size, failure, candidate) = match result {
            Ok(candidate) => (Some(candidate.size), None, Some(candidate)),
            Err(failure) => (None, Some(failure), None),
        };
        Evaluation {
            diagnostic: Diagnostic {
                adapter: adapter.name().to_string(),
                elapsed,
                size,
                failure,
            },
            candidate,
        }
    }

    fn try_candidate(
        &self,
        index: usize,
        adapter: &OptimizerAdapter,
        image: &ImageFile,
        original: &PixelGrid,
    ) -> Result<Candidate, AdapterFailure> {
        let scratch = self
            .scratch_dir()
            .map_err(|e| AdapterFailure::Scratch(e.to_string()))?;
        let output = adapter
            .invoke(self.runner.as_ref(), image, scratch.path(), self.timeout)?
            .into_output()?;
        let bytes = fs::read(&output).map_err(|e| AdapterFailure::Scratch(e.to_string()))?;
        let size = bytes.len() as u64;
        if size > image.size() {
            return Err(AdapterFailure::OutputLargerThanOriginal { size });
        }
        match self.checker.compare_to(original, &bytes) {
            Ok(Comparison::Equivalent) => Ok(Candidate {
                adapter: adapter.name().to_string(),
                index,
                size,
                path: output,
                _scratch: scratch,
            }),
            Ok(mismatch) => Err(AdapterFailure::EquivalenceCheckFailed(mismatch.to_string())),
            Err(reason) => Err(AdapterFailure::EquivalenceCheckFailed(reason)),
        }
    }

    fn scratch_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);
        match &self.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
    }
}

/// Smallest candidate, ties going to the adapter registered first.
/// `None` unless it is strictly smaller than the original.
fn select(candidates: Vec<Candidate>, original_size: u64) -> Option<Candidate> {
    candidates
        .into_iter()
        .min_by_key(|c| (c.size, c.index))
        .filter(|c| c.size < original_size)
}

struct Evaluation {
    diagnostic: Diagnostic,
    candidate: Option<Candidate>,
}

impl Evaluation {
    fn crashed(adapter: &OptimizerAdapter) -> Self {
        Self {
            diagnostic: Diagnostic {
                adapter: adapter.name().to_string(),
                elapsed: Duration::ZERO,
                size: None,
                failure: Some(AdapterFailure::Internal("evaluation panicked".to_string())),
            },
            candidate: None,
        }
    }
}

/// A validated output that is no larger than the original.
///
/// The candidate owns the scratch directory holding its file; dropping it
/// removes the file.
#[derive(Debug)]
pub struct Candidate {
    adapter: String,
    index: usize,
    size: u64,
    path: PathBuf,
    _scratch: TempDir,
}

impl Candidate {
    /// Name of the adapter that produced this file.
    pub fn adapter(&self) -> &str {
        &self.adapter
    }
    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
    /// Location inside the candidate's scratch directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What happened to one adapter during a run.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    /// Adapter name.
    pub adapter: String,
    /// Wall time of the whole evaluation.
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    /// Size of a validated output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Why the adapter produced no candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<AdapterFailure>,
}

impl Diagnostic {
    /// Whether the adapter produced a valid candidate.
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.elapsed.as_secs_f64();
        match (&self.size, &self.failure) {
            (_, Some(failure)) => {
                // Tool output can span many lines; keep the summary on one.
                let reason = failure.to_string();
                let first_line = reason.lines().next().unwrap_or_default();
                write!(f, "{:<12} failed ({elapsed:.2}s): {first_line}", self.adapter)
            }
            (Some(size), None) => write!(f, "{:<12} {size} bytes ({elapsed:.2}s)", self.adapter),
            (None, None) => write!(f, "{:<12} no result ({elapsed:.2}s)", self.adapter),
        }
    }
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Bytes removed relative to the original.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Savings {
    /// Original size minus candidate size.
    pub bytes: u64,
    /// `bytes` as a percentage of the original size.
    pub percent: f64,
}

impl fmt::Display for Savings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "savings: {} bytes = {:.2}%", self.bytes, self.percent)
    }
}

/// Engine-level verdict for one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// A strictly smaller equivalent file was found.
    Improved,
    /// Nothing beat the original; it stays as it is.
    NoImprovement,
    /// The content is neither JPEG nor PNG.
    UnsupportedFormat,
    /// The input could not be read or decoded.
    InputReadError,
}

impl Status {
    /// Classifies the result of [`Optimizer::optimize`].
    pub fn of(result: &Result<OptimizationOutcome, Error>) -> Status {
        match result {
            Ok(outcome) => outcome.status(),
            Err(Error::UnsupportedFormat { .. }) => Status::UnsupportedFormat,
            Err(_) => Status::InputReadError,
        }
    }
}

/// The final verdict of one optimization run.
#[derive(Debug)]
pub struct OptimizationOutcome {
    path: PathBuf,
    format: Format,
    original_size: u64,
    best: Option<Candidate>,
    diagnostics: Vec<Diagnostic>,
}

impl OptimizationOutcome {
    /// The input path.
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// Detected format of the input.
    pub fn format(&self) -> Format {
        self.format
    }
    /// Input size in bytes.
    pub fn original_size(&self) -> u64 {
        self.original_size
    }
    /// The winning candidate, if any beat the original.
    pub fn best(&self) -> Option<&Candidate> {
        self.best.as_ref()
    }
    /// One entry per adapter, in registry order.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
    /// [`Status::Improved`] or [`Status::NoImprovement`].
    pub fn status(&self) -> Status {
        match self.best {
            Some(_) => Status::Improved,
            None => Status::NoImprovement,
        }
    }
    /// What the winner saves, if there is one.
    pub fn savings(&self) -> Option<Savings> {
        let best = self.best.as_ref()?;
        let bytes = self.original_size - best.size;
        Some(Savings {
            bytes,
            percent: bytes as f64 * 100.0 / self.original_size as f64,
        })
    }
    /// Programs that could not be found, in registry order.
    pub fn missing_tools(&self) -> Vec<&str> {
        self.diagnostics
            .iter()
            .filter_map(|d| match &d.failure {
                Some(AdapterFailure::ToolMissing { program }) => Some(program.as_str()),
                _ => None,
            })
            .collect()
    }
    /// A serializable summary.
    pub fn report(&self) -> Report {
        let savings = self.savings();
        Report {
            path: self.path.clone(),
            format: self.format,
            status: self.status(),
            original_size: self.original_size,
            best_adapter: self.best.as_ref().map(|c| c.adapter.clone()),
            best_size: self.best.as_ref().map(|c| c.size),
            savings_bytes: savings.map(|s| s.bytes),
            savings_percent: savings.map(|s| s.percent),
            diagnostics: self.diagnostics.clone(),
        }
    }
}

/// [`OptimizationOutcome`] without the scratch files, ready for output.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// The input path.
    pub path: PathBuf,
    /// Detected format.
    pub format: Format,
    /// Verdict for this input.
    pub status: Status,
    /// Input size in bytes.
    pub original_size: u64,
    /// Name of the winning adapter.
    pub best_adapter: Option<String>,
    /// Size of the winning output.
    pub best_size: Option<u64>,
    /// See [`Savings::bytes`].
    pub savings_bytes: Option<u64>,
    /// See [`Savings::percent`].
    pub savings_percent: Option<f64>,
    /// One entry per adapter, in registry order.
    pub diagnostics: Vec<Diagnostic>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(adapter: &str, index: usize, size: u64) -> Candidate {
        Candidate {
            adapter: adapter.to_string(),
            index,
            size,
            path: PathBuf::from("unused"),
            _scratch: tempfile::tempdir().unwrap(),
        }
    }

    #[test]
    fn selects_the_smallest() {
        let best = select(
            vec![candidate("a", 0, 90), candidate("b", 1, 70), candidate("c", 2, 80)],
            100,
        );
        assert_eq!(best.unwrap().adapter(), "b");
    }

    #[test]
    fn ties_go_to_registry_order() {
        let best = select(vec![candidate("late", 2, 70), candidate("early", 0, 70)], 100);
        assert_eq!(best.unwrap().adapter(), "early");
    }

    #[test]
    fn equal_size_is_no_improvement() {
        assert!(select(vec![candidate("a", 0, 100)], 100).is_none());
        assert!(select(Vec::new(), 100).is_none());
    }

    #[test]
    fn savings_are_reported_with_two_decimals() {
        let outcome = OptimizationOutcome {
            path: PathBuf::from("a.png"),
            format: Format::Png,
            original_size: 119,
            best: Some(candidate("fake", 0, 67)),
            diagnostics: Vec::new(),
        };
        let savings = outcome.savings().unwrap();
        assert_eq!(savings.bytes, 52);
        assert_eq!(savings.to_string(), "savings: 52 bytes = 43.70%");
        assert_eq!(outcome.status(), Status::Improved);
    }

    #[test]
    fn empty_input_is_not_an_error() {
        let optimizer = Optimizer::default();
        let outcome = optimizer
            .optimize_image(&ImageFile::from_bytes("empty.png", Vec::new()))
            .unwrap();
        assert_eq!(outcome.status(), Status::NoImprovement);
        assert!(outcome.savings().is_none());
        assert!(outcome.diagnostics().is_empty());
    }

    #[test]
    fn unknown_content_is_rejected() {
        let result = Optimizer::default().optimize_image(&ImageFile::from_bytes("a.png", b"GIF89a".to_vec()));
        assert_eq!(Status::of(&result), Status::UnsupportedFormat);
    }

    #[test]
    fn corrupt_input_is_a_read_error() {
        let bytes = b"\x89PNG\r\n\x1A\ngarbage".to_vec();
        let result = Optimizer::default().optimize_image(&ImageFile::from_bytes("a.png", bytes));
        assert!(matches!(result, Err(Error::UndecodableInput { .. })));
        assert_eq!(Status::of(&result), Status::InputReadError);
    }

    #[test]
    fn diagnostic_lines() {
        let ok = Diagnostic {
            adapter: "optipng".to_string(),
            elapsed: Duration::from_millis(1500),
            size: Some(67),
            failure: None,
        };
        assert_eq!(ok.to_string(), "optipng      67 bytes (1.50s)");
        let failed = Diagnostic {
            adapter: "pngcrush".to_string(),
            elapsed: Duration::ZERO,
            size: None,
            failure: Some(AdapterFailure::NonZeroExit {
                code: 1,
                output: "line one\nline two".to_string(),
            }),
        };
        assert_eq!(
            failed.to_string(),
            "pngcrush     failed (0.00s): exited with status 1"
        );
    }
}
