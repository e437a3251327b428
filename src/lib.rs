#![warn(missing_docs)]
//! Lossless JPEG and PNG optimization by racing external tools.
//!
//! Every input is handed to each optimizer registered for its format
//! (pngcrush, optipng and zopflipng for PNG; jpegtran and jpegoptim for JPEG).
//! Each tool works on a private copy inside its own scratch directory and is
//! killed if it runs past its timeout. Outputs are decoded and compared pixel
//! by pixel with the original, and the smallest one that still shows the same
//! image wins. Fully transparent pixels only have to stay fully transparent;
//! their colour channels may change.
//!
//! A tool that is missing, crashes, hangs or produces a different image only
//! costs its own candidate: the failure is recorded in the outcome's
//! [`Diagnostic`]s and the remaining tools are still evaluated.
//!
//! # Examples
//!
//! `with_` methods are optional.
//!
//! ## Single files with [`Optimizer`]
//!```no_run
//! use optimage::{apply, Mode, Optimizer};
//! use std::time::Duration;
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let optimizer = Optimizer::builder()
//!         .with_timeout(Duration::from_secs(30))
//!         .build();
//!     let outcome = optimizer.optimize("logo.png")?;
//!     if let Some(savings) = outcome.savings() {
//!         println!("{savings}");
//!         apply(&outcome, &Mode::Replace)?;
//!     }
//!     Ok(())
//! }
//!```
//!
//! ## Many files with [`Parallel`]
//! Results come back in the order the paths were given, whatever order the
//! worker threads finish in.
//!```no_run
//! use optimage::{Optimizer, Parallel};
//! use std::path::PathBuf;
//! let optimizer = Optimizer::default();
//! let paths = vec![PathBuf::from("a.png"), PathBuf::from("b.jpg")];
//! for (path, result) in Parallel::from_paths(paths).with_device(2).build(&optimizer).run() {
//!     match result {
//!         Ok(outcome) => println!("{}: {:?}", path.display(), outcome.status()),
//!         Err(e) => eprintln!("{e}"),
//!     }
//! }
//!```
//!
//! ## Checking equivalence directly
//!```
//! use image::{ImageFormat, Rgba, RgbaImage};
//! use optimage::EquivalenceChecker;
//! use std::io::Cursor;
//! fn encode(img: &RgbaImage) -> Vec<u8> {
//!     let mut bytes = Vec::new();
//!     img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
//!     bytes
//! }
//! let a = RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 0]));
//! let b = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 255, 0]));
//! assert!(EquivalenceChecker::new().equivalent(&encode(&a), &encode(&b)));
//!```
mod adapter;
mod apply;
mod bulk;
mod defaults;
mod equivalence;
mod error;
mod format;
mod optimizer;
mod runner;

pub use self::{
    adapter::{Arg, Builtin, OptimizerAdapter, Registry, RunResult, ToolKind},
    apply::{apply, Applied, Mode},
    bulk::{FileResult, Parallel, ParallelBuilder},
    defaults::{DEVICE, TIMEOUT},
    equivalence::{
        compare_grids, pixels_equal, Comparison, EquivalenceChecker, ImageDecoder, PixelDecoder,
        PixelGrid,
    },
    error::{AdapterFailure, Error},
    format::{Format, ImageFile},
    optimizer::{
        Candidate, Diagnostic, OptimizationOutcome, Optimizer, OptimizerBuilder, Report, Savings,
        Status,
    },
    runner::{ExitKind, ProcessOutput, ProcessRunner, SystemRunner},
};
