use crate::defaults::DEVICE;
use crate::optimizer::{OptimizationOutcome, Optimizer};
use crate::Error;
use crossbeam::channel;
use crossbeam::deque::{Injector, Steal};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Custom configuration for building a [`Parallel`].
#[derive(Debug, Clone)]
pub struct ParallelBuilder {
    paths: Vec<PathBuf>,
    device_num: u8,
}

impl ParallelBuilder {
    /// Specifies the number of files optimized at the same time.
    /// Defaults to 4.
    pub fn with_device(self, device_num: u8) -> ParallelBuilder {
        ParallelBuilder {
            paths: self.paths,
            device_num: device_num.max(1),
        }
    }
    /// Builds a new Parallel that shares `optimizer` between its threads.
    pub fn build(self, optimizer: &Optimizer) -> Parallel<'_> {
        Parallel {
            paths: self.paths,
            device_num: self.device_num,
            optimizer,
        }
    }
}

/// Optimizes many files on a pool of worker threads.
pub struct Parallel<'a> {
    paths: Vec<PathBuf>,
    device_num: u8,
    optimizer: &'a Optimizer,
}

/// One file's path with its result.
pub type FileResult = (PathBuf, Result<OptimizationOutcome, Error>);

impl<'a> Parallel<'a> {
    /// Creates a new ParallelBuilder.
    pub fn from_paths(paths: Vec<PathBuf>) -> ParallelBuilder {
        ParallelBuilder {
            paths,
            device_num: DEVICE,
        }
    }
    /// Optimizes every file and returns the results in input order.
    ///
    /// Each file is independent: an unreadable or unsupported file only
    /// yields an `Err` in its own slot.
    pub fn run(self) -> Vec<FileResult> {
        let total = self.paths.len();
        let queue = Injector::new();
        for (index, path) in self.paths.into_iter().enumerate() {
            queue.push((index, path));
        }
        let (tx, rx) = channel::unbounded();
        let workers = usize::from(self.device_num).min(total.max(1));
        let optimizer = self.optimizer;
        let scoped = crossbeam::scope(|scope| {
            for id in 0..workers {
                let queue = &queue;
                let tx = tx.clone();
                scope.spawn(move |_| loop {
                    match queue.steal() {
                        Steal::Success((index, path)) => {
                            debug!("worker {id} optimizing {}", path.display());
                            let result = optimizer.optimize(&path);
                            if tx.send((index, path, result)).is_err() {
                                break;
                            }
                        }
                        Steal::Retry => continue,
                        Steal::Empty => break,
                    }
                });
            }
        });
        drop(tx);
        if scoped.is_err() {
            warn!("a worker thread panicked; its files are missing from the results");
        }
        let mut results: Vec<_> = rx.into_iter().collect();
        results.sort_by_key(|(index, _, _)| *index);
        results
            .into_iter()
            .map(|(_, path, result)| (path, result))
            .collect()
    }
}
