//! `mzbaseline` fits baselines to the raw intensities a multi-collector mass
//! spectrometer records for each channel, subtracts them, and propagates the
//! measurement uncertainty through to the logs of the corrected intensities.
//!
//! Each channel is a [`RawIntensityModel`]: a background series measured
//! away from the peak and an on-peak series measured on it. Calling
//! [`RawIntensityModel::generate`] builds the measurement variance from the
//! [`CollectorModel`] of the detector, fits the requested baseline function
//! ([`FitFunctionType`]) to the background, and evaluates it over both series.
//! [`RawIntensityModel::propagate_uncertainties`] then builds the Jacobian chain
//! and stores the covariance of the log-corrected on-peak intensities.
//!
//! When many channels need reducing at once, [`reduce_all`] spreads them over
//! a thread pool when the `parallelism` feature is enabled.
//!
//! # Usage
//! ```
//! use mzbaseline::{
//!     AcquisitionSeries, Channel, CollectorModel, FitFunctionType, RawIntensityModel,
//!     ReductionConfig,
//! };
//!
//! let background = AcquisitionSeries::evenly_spaced(vec![10.0, 10.0, 10.0, 10.0], 0.0, 1000.0);
//! let on_peak = AcquisitionSeries::evenly_spaced(vec![110.0, 120.0, 130.0], 5000.0, 1000.0);
//! let mut model = RawIntensityModel::new(
//!     Channel::new("Pb206"),
//!     CollectorModel::ion_counter(0.0),
//!     1000.0,
//!     background,
//!     on_peak,
//!     ReductionConfig::default(),
//! )
//! .unwrap();
//!
//! let report = model.generate().unwrap();
//! assert_eq!(report.selected, FitFunctionType::Mean);
//! assert!((model.on_peak().corrected()[0] - 100.0).abs() < 1e-6);
//!
//! let sopbclr = model.propagate_uncertainties().unwrap();
//! assert_eq!(sopbclr.shape(), (3, 3));
//! ```
//!
//! ## Features
//! - `parallelism` (default) reduces channels on the `rayon` thread pool.
//! - `serde` derives `Serialize` and `Deserialize` for configuration and fit results.
#![allow(unused_imports)]
pub mod batch;
pub mod channel;
pub mod collector;
pub mod config;
pub mod fit_functions;
pub mod model;
pub mod numeric;
pub mod propagation;
pub mod series;
pub mod variance;

pub use crate::batch::{reduce_all, reduce_channel, ChannelReport, InterferenceCorrections};
pub use crate::channel::Channel;
pub use crate::collector::{CollectorKind, CollectorModel};
pub use crate::config::ReductionConfig;
pub use crate::fit_functions::{
    BaselineFunction, FitError, FitFunction, FitFunctionType, SolverConfig,
};
pub use crate::model::{GenerateReport, ModelError, RawIntensityModel};
pub use crate::propagation::{JacobianChain, PropagationError};
pub use crate::series::AcquisitionSeries;
pub use crate::variance::{PropagationMode, VarianceModel};
