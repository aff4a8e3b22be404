//! Baseline functions of normalized acquisition time fit to the active
//! background samples of a channel.
//!
//! Every function carries the sensitivity of its parameters to the measured
//! background (`J11`) and knows how to build the Jacobian blocks relating its
//! parameters (`J21`) and the raw on-peak intensities (`J22`) to the
//! baseline-corrected on-peak intensities.
//!
//! # Models
//! - [`ConstantFunction`]
//! - [`MeanFunction`]
//! - [`LineFunction`]
//!
//! Mean and line functions are fit by maximizing the likelihood of the background
//! with [`OverdispersionSolver`], both with and without an overdispersion term,
//! see [`BaselineFitter`].
use std::fmt::{Debug, Display};

use nalgebra::{DMatrix, DVector};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::propagation::PropagationError;
use crate::variance::{VarianceError, VarianceModel};

mod constant;
mod fitter;
mod line;
mod mean;
mod registry;
mod solver;

pub use constant::ConstantFunction;
pub use fitter::{BaselineFitter, FitOutcome};
pub use line::LineFunction;
pub use mean::MeanFunction;
pub use registry::FitFunctionRegistry;
pub use solver::{FitError, OverdispersionSolver, SolverConfig, SolverResult};

/// The kinds of baseline function that can be selected for a channel
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FitFunctionType {
    /// No baseline is subtracted
    None,
    Constant,
    #[default]
    Mean,
    Line,
}

impl FitFunctionType {
    pub const fn short_name(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Constant => "CONSTANT",
            Self::Mean => "MEAN",
            Self::Line => "LINE",
        }
    }

    /// The number of parameters a function of this type has
    pub const fn parameter_count(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Constant | Self::Mean => 1,
            Self::Line => 2,
        }
    }
}

impl Display for FitFunctionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short_name())
    }
}

/// The fitted state shared by every baseline function
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FittedParameters {
    pub values: DVector<f64>,
    /// The covariance of [`FittedParameters::values`]
    pub covariance: DMatrix<f64>,
    /// The sensitivity of the parameters to every background sample, zero for inactive samples
    pub j11: Option<DMatrix<f64>>,
    /// The extra variance per sample beyond the measurement model, when estimated
    pub overdispersion: Option<f64>,
}

impl FittedParameters {
    pub fn new(
        values: DVector<f64>,
        covariance: DMatrix<f64>,
        j11: Option<DMatrix<f64>>,
        overdispersion: Option<f64>,
    ) -> Self {
        Self {
            values,
            covariance,
            j11,
            overdispersion,
        }
    }
}

/// The background samples a baseline function is fit against
#[derive(Debug, Clone, Copy)]
pub struct BaselineFitArgs<'a> {
    /// Normalized acquisition times
    pub times: &'a [f64],
    pub intensities: &'a [f64],
    pub active: &'a [bool],
    /// The background covariance, one row per background sample
    pub variance: &'a VarianceModel,
}

impl<'a> BaselineFitArgs<'a> {
    pub fn new(
        times: &'a [f64],
        intensities: &'a [f64],
        active: &'a [bool],
        variance: &'a VarianceModel,
    ) -> Self {
        Self {
            times,
            intensities,
            active,
            variance,
        }
    }

    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }

    pub fn active_positions(&self) -> Vec<usize> {
        self.active
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.then_some(i))
            .collect()
    }

    /// The active observations as a column vector
    pub fn active_observations(&self, positions: &[usize]) -> DVector<f64> {
        DVector::from_iterator(positions.len(), positions.iter().map(|i| self.intensities[*i]))
    }

    /// The active times as a column vector
    pub fn active_times(&self, positions: &[usize]) -> DVector<f64> {
        DVector::from_iterator(positions.len(), positions.iter().map(|i| self.times[*i]))
    }

    /// The covariance restricted to the active samples
    pub fn active_variance(&self, positions: &[usize]) -> Result<VarianceModel, VarianceError> {
        self.variance.select(positions)
    }

    pub(crate) fn check(&self) -> Result<(), FitError> {
        let n = self.len();
        if self.times.len() != n || self.active.len() != n || self.variance.dim() != n {
            return Err(FitError::DimensionMismatch(format!(
                "{} intensities, {} times, {} mask entries and a variance model of dimension {}",
                n,
                self.times.len(),
                self.active.len(),
                self.variance.dim()
            )));
        }
        Ok(())
    }
}

/// Re-embed a `p x n_active` sensitivity block into `p x n` with zero columns
/// at inactive positions
pub(crate) fn expand_columns(block: &DMatrix<f64>, positions: &[usize], n: usize) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(block.nrows(), n);
    for (k, i) in positions.iter().enumerate() {
        out.set_column(*i, &block.column(k));
    }
    out
}

/// Check that `active_mask` selects `active_count` entries of `values` and
/// return the selected positions
pub(crate) fn check_active_rows(
    active_count: usize,
    active_mask: &[bool],
    values: &[f64],
) -> Result<Vec<usize>, PropagationError> {
    if active_mask.len() != values.len() {
        return Err(PropagationError::DimensionMismatch(format!(
            "active mask has {} entries for {} values",
            active_mask.len(),
            values.len()
        )));
    }
    let positions: Vec<usize> = active_mask
        .iter()
        .enumerate()
        .filter_map(|(i, a)| a.then_some(i))
        .collect();
    if positions.len() != active_count || active_count == 0 {
        return Err(PropagationError::DimensionMismatch(format!(
            "expected {} active rows, mask selects {}",
            active_count,
            positions.len()
        )));
    }
    Ok(positions)
}

/// `J22`, the identity sensitivity of corrected intensities to raw on-peak intensities
pub(crate) fn identity_j22(
    active_count: usize,
    active_mask: &[bool],
    normalized_times: &[f64],
) -> Result<DMatrix<f64>, PropagationError> {
    check_active_rows(active_count, active_mask, normalized_times)?;
    Ok(DMatrix::identity(active_count, active_count))
}

/// Describes a fitted baseline function
pub trait BaselineFunction: Clone + Debug {
    fn fit_type(&self) -> FitFunctionType;

    fn fitted(&self) -> &FittedParameters;

    /// The baseline value at normalized time `t`
    fn evaluate(&self, t: f64) -> f64;

    /// The sensitivity of corrected on-peak intensities to the function's parameters.
    ///
    /// `needed_values` are normalized on-peak times, or raw on-peak intensities
    /// for [`FitFunctionType::Line`].
    fn make_j21(
        &self,
        active_count: usize,
        active_mask: &[bool],
        needed_values: &[f64],
    ) -> Result<DMatrix<f64>, PropagationError>;

    /// The sensitivity of corrected on-peak intensities to raw on-peak intensities
    fn make_j22(
        &self,
        active_count: usize,
        active_mask: &[bool],
        normalized_times: &[f64],
    ) -> Result<DMatrix<f64>, PropagationError> {
        identity_j22(active_count, active_mask, normalized_times)
    }

    fn short_name(&self) -> &'static str {
        self.fit_type().short_name()
    }

    fn parameters(&self) -> &[f64] {
        self.fitted().values.as_slice()
    }

    fn parameter_covariance(&self) -> &DMatrix<f64> {
        &self.fitted().covariance
    }

    fn matrix_j11(&self) -> Option<&DMatrix<f64>> {
        self.fitted().j11.as_ref()
    }

    fn overdispersion(&self) -> Option<f64> {
        self.fitted().overdispersion
    }

    fn is_overdispersion_variant(&self) -> bool {
        self.overdispersion().is_some()
    }

    /// Whether every parameter variance is finite and strictly positive
    fn verify_positive_variances(&self) -> bool {
        let cov = self.parameter_covariance();
        !cov.is_empty() && cov.diagonal().iter().all(|v| v.is_finite() && *v > 0.0)
    }

    /// Evaluate the function at every time in `times`
    fn predict(&self, times: &[f64]) -> Vec<f64> {
        times.iter().map(|t| self.evaluate(*t)).collect()
    }

    /// Render the parameters and their standard errors
    fn show_parameters(&self) -> String {
        let cov = self.parameter_covariance();
        let mut parts: Vec<String> = self
            .parameters()
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let err = cov
                    .get((i, i))
                    .map(|x| x.max(0.0).sqrt())
                    .unwrap_or(f64::NAN);
                format!("p{i}={v:.6} ± {err:.6}")
            })
            .collect();
        if let Some(od) = self.overdispersion() {
            parts.push(format!("xi={:.6}", od.max(0.0).sqrt()));
        }
        format!("{} [{}]", self.short_name(), parts.join(", "))
    }
}

/// A dispatching wrapper over the baseline function models
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FitFunction {
    Constant(ConstantFunction),
    Mean(MeanFunction),
    Line(LineFunction),
}

macro_rules! dispatch_fit {
    ($d:ident, $r:ident, $e:expr) => {
        match $d {
            FitFunction::Constant($r) => $e,
            FitFunction::Mean($r) => $e,
            FitFunction::Line($r) => $e,
        }
    };
}

impl From<ConstantFunction> for FitFunction {
    fn from(value: ConstantFunction) -> Self {
        Self::Constant(value)
    }
}

impl From<MeanFunction> for FitFunction {
    fn from(value: MeanFunction) -> Self {
        Self::Mean(value)
    }
}

impl From<LineFunction> for FitFunction {
    fn from(value: LineFunction) -> Self {
        Self::Line(value)
    }
}

impl BaselineFunction for FitFunction {
    fn fit_type(&self) -> FitFunctionType {
        dispatch_fit!(self, f, f.fit_type())
    }

    fn fitted(&self) -> &FittedParameters {
        dispatch_fit!(self, f, f.fitted())
    }

    fn evaluate(&self, t: f64) -> f64 {
        dispatch_fit!(self, f, f.evaluate(t))
    }

    fn make_j21(
        &self,
        active_count: usize,
        active_mask: &[bool],
        needed_values: &[f64],
    ) -> Result<DMatrix<f64>, PropagationError> {
        dispatch_fit!(self, f, f.make_j21(active_count, active_mask, needed_values))
    }

    fn make_j22(
        &self,
        active_count: usize,
        active_mask: &[bool],
        normalized_times: &[f64],
    ) -> Result<DMatrix<f64>, PropagationError> {
        dispatch_fit!(self, f, f.make_j22(active_count, active_mask, normalized_times))
    }
}

impl Display for FitFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.show_parameters())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fit_type_names() {
        assert_eq!(FitFunctionType::Mean.short_name(), "MEAN");
        assert_eq!(FitFunctionType::None.to_string(), "NONE");
        assert_eq!(FitFunctionType::Line.parameter_count(), 2);
        assert!(FitFunctionType::Constant < FitFunctionType::Line);
    }

    #[test]
    fn test_expand_columns() {
        let block = DMatrix::from_row_slice(1, 2, &[0.5, 0.5]);
        let out = expand_columns(&block, &[0, 2], 3);
        assert_eq!(out.as_slice(), &[0.5, 0.0, 0.5]);
    }

    #[test]
    fn test_active_rows() {
        let mask = [true, false, true, true];
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(check_active_rows(3, &mask, &values).unwrap(), vec![0, 2, 3]);
        assert!(check_active_rows(4, &mask, &values).is_err());
        assert!(check_active_rows(3, &mask, &values[..3]).is_err());
        assert!(check_active_rows(0, &[false], &[1.0]).is_err());
        let j22 = identity_j22(3, &mask, &values).unwrap();
        assert_eq!(j22, DMatrix::identity(3, 3));
    }

    #[test]
    fn test_show_parameters() {
        let f = MeanFunction::from_fitted(FittedParameters::new(
            DVector::from_element(1, 10.0),
            DMatrix::from_element(1, 1, 4.0),
            None,
            Some(0.25),
        ));
        let rendered = FitFunction::from(f).to_string();
        assert!(rendered.starts_with("MEAN [p0=10.000000 ± 2.000000"));
        assert!(rendered.contains("xi=0.500000"));
    }
}
