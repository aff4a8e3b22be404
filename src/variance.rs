//! Measurement covariance over the concatenation of background and on-peak
//! samples.
//!
//! A [`VarianceModel`] is either a full covariance matrix ("full propagation")
//! or only its diagonal ("fast propagation"). Both share the same algebra so
//! the fitting and propagation code never branches on the mode.
use std::fmt::Display;

use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::collector::{CollectorError, CollectorModel};
use crate::numeric::{mean, symmetrize};
use crate::series::AcquisitionSeries;

/// The variance assigned to every background sample when the background
/// carries no measurable variance at all
pub const DEGENERATE_VARIANCE_FLOOR: f64 = 1e-10;

/// All the ways building or combining a variance model can fail
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VarianceError {
    #[error(transparent)]
    InvalidVarianceModel(#[from] CollectorError),
    #[error("Variance model has dimension {observed}, expected {expected}")]
    DimensionMismatch { expected: usize, observed: usize },
}

/// Whether to carry the full covariance matrix or only its diagonal
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PropagationMode {
    #[default]
    Full,
    Fast,
}

impl PropagationMode {
    pub fn from_full_propagation(full_propagation: bool) -> Self {
        if full_propagation {
            Self::Full
        } else {
            Self::Fast
        }
    }
}

impl Display for PropagationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => f.write_str("FULL PROPAGATION"),
            Self::Fast => f.write_str("FAST PROPAGATION"),
        }
    }
}

/// A covariance matrix or its diagonal
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum VarianceModel {
    Full(DMatrix<f64>),
    Diagonal(DVector<f64>),
}

macro_rules! dispatch_variance {
    ($d:expr, $m:ident => $full:expr, $v:ident => $diag:expr) => {
        match $d {
            VarianceModel::Full($m) => $full,
            VarianceModel::Diagonal($v) => $diag,
        }
    };
}

impl VarianceModel {
    pub fn mode(&self) -> PropagationMode {
        match self {
            Self::Full(_) => PropagationMode::Full,
            Self::Diagonal(_) => PropagationMode::Fast,
        }
    }

    /// The number of samples covered
    pub fn dim(&self) -> usize {
        dispatch_variance!(self, m => m.nrows(), v => v.len())
    }

    /// The per-sample variances
    pub fn diagonal(&self) -> DVector<f64> {
        dispatch_variance!(self, m => m.diagonal(), v => v.clone())
    }

    pub fn mean_of_diagonal(&self) -> Option<f64> {
        mean(self.diagonal().as_slice())
    }

    /// Replace every diagonal entry with `value`
    pub fn set_diagonal(&mut self, value: f64) {
        dispatch_variance!(self, m => m.fill_diagonal(value), v => v.fill(value))
    }

    /// Add `value` to every diagonal entry
    pub fn inflate(&mut self, value: f64) {
        dispatch_variance!(
            self,
            m => {
                for i in 0..m.nrows() {
                    m[(i, i)] += value;
                }
            },
            v => v.add_scalar_mut(value)
        )
    }

    /// Add `other` elementwise. A diagonal model only takes the diagonal of a full `other`.
    pub fn add_assign(&mut self, other: &VarianceModel) -> Result<(), VarianceError> {
        if self.dim() != other.dim() {
            return Err(VarianceError::DimensionMismatch {
                expected: self.dim(),
                observed: other.dim(),
            });
        }
        match (self, other) {
            (Self::Full(a), Self::Full(b)) => *a += b,
            (Self::Full(a), Self::Diagonal(b)) => {
                for (i, x) in b.iter().enumerate() {
                    a[(i, i)] += x;
                }
            }
            (Self::Diagonal(a), Self::Full(b)) => *a += b.diagonal(),
            (Self::Diagonal(a), Self::Diagonal(b)) => *a += b,
        }
        Ok(())
    }

    /// The leading principal block of size `n`
    pub fn leading_block(&self, n: usize) -> Result<VarianceModel, VarianceError> {
        if n > self.dim() {
            return Err(VarianceError::DimensionMismatch {
                expected: n,
                observed: self.dim(),
            });
        }
        Ok(dispatch_variance!(
            self,
            m => Self::Full(m.view((0, 0), (n, n)).into_owned()),
            v => Self::Diagonal(v.rows(0, n).into_owned())
        ))
    }

    /// Extract the rows and columns at `indices`, using the same index set for both
    pub fn select(&self, indices: &[usize]) -> Result<VarianceModel, VarianceError> {
        self.check_indices(indices, self.dim())?;
        Ok(dispatch_variance!(
            self,
            m => Self::Full(m.select_rows(indices).select_columns(indices)),
            v => Self::Diagonal(v.select_rows(indices))
        ))
    }

    /// Embed this model at `indices` of a zero-filled model of size `dim`.
    /// The inverse of [`VarianceModel::select`] on the selected positions.
    pub fn expand(&self, indices: &[usize], dim: usize) -> Result<VarianceModel, VarianceError> {
        if indices.len() != self.dim() {
            return Err(VarianceError::DimensionMismatch {
                expected: self.dim(),
                observed: indices.len(),
            });
        }
        self.check_indices(indices, dim)?;
        Ok(dispatch_variance!(
            self,
            m => {
                let mut out = DMatrix::zeros(dim, dim);
                for (a, i) in indices.iter().enumerate() {
                    for (b, j) in indices.iter().enumerate() {
                        out[(*i, *j)] = m[(a, b)];
                    }
                }
                Self::Full(out)
            },
            v => {
                let mut out = DVector::zeros(dim);
                for (a, i) in indices.iter().enumerate() {
                    out[*i] = v[a];
                }
                Self::Diagonal(out)
            }
        ))
    }

    fn check_indices(&self, indices: &[usize], dim: usize) -> Result<(), VarianceError> {
        match indices.iter().find(|i| **i >= dim) {
            Some(i) => Err(VarianceError::DimensionMismatch {
                expected: dim,
                observed: i + 1,
            }),
            None => Ok(()),
        }
    }

    /// The dense covariance matrix
    pub fn to_dense(&self) -> DMatrix<f64> {
        dispatch_variance!(self, m => m.clone(), v => DMatrix::from_diagonal(v))
    }

    /// Compute `J S J^T`
    pub fn sandwich(&self, jacobian: &DMatrix<f64>) -> Result<DMatrix<f64>, VarianceError> {
        if jacobian.ncols() != self.dim() {
            return Err(VarianceError::DimensionMismatch {
                expected: self.dim(),
                observed: jacobian.ncols(),
            });
        }
        Ok(symmetrize(dispatch_variance!(
            self,
            m => jacobian * m * jacobian.transpose(),
            v => {
                let mut scaled = jacobian.clone();
                for (mut col, x) in scaled.column_iter_mut().zip(v.iter()) {
                    col *= *x;
                }
                scaled * jacobian.transpose()
            }
        )))
    }

    /// The inverse in the same representation, `None` when not positive definite
    pub fn inverse(&self) -> Option<VarianceModel> {
        dispatch_variance!(
            self,
            m => m.clone().cholesky().map(|c| Self::Full(c.inverse())),
            v => {
                if v.iter().all(|x| *x > 0.0 && x.is_finite()) {
                    Some(Self::Diagonal(v.map(|x| 1.0 / x)))
                } else {
                    None
                }
            }
        )
    }

    /// Compute `X^T S`
    pub fn transpose_product(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        dispatch_variance!(
            self,
            m => x.transpose() * m,
            v => {
                let mut xt = x.transpose();
                for (mut col, w) in xt.column_iter_mut().zip(v.iter()) {
                    col *= *w;
                }
                xt
            }
        )
    }

    /// Compute `S r`
    pub fn apply(&self, r: &DVector<f64>) -> DVector<f64> {
        dispatch_variance!(self, m => m * r, v => v.component_mul(r))
    }

    pub fn trace(&self) -> f64 {
        dispatch_variance!(self, m => m.trace(), v => v.sum())
    }

    /// The sum of squared entries
    pub fn norm_squared(&self) -> f64 {
        dispatch_variance!(self, m => m.norm_squared(), v => v.norm_squared())
    }

    /// The natural log of the determinant, `None` when not positive definite
    pub fn log_determinant(&self) -> Option<f64> {
        dispatch_variance!(
            self,
            m => m.clone().cholesky().map(|c| {
                2.0 * c.l_dirty().diagonal().iter().map(|x| x.ln()).sum::<f64>()
            }),
            v => {
                if v.iter().all(|x| *x > 0.0) {
                    Some(v.iter().map(|x| x.ln()).sum())
                } else {
                    None
                }
            }
        )
    }
}

/// The positions kept when extracting the active block of the concatenated
/// background ⧺ on-peak covariance: every background position followed by the
/// active on-peak positions, offset by the background length.
pub fn active_indices(background_len: usize, on_peak_active: &[bool]) -> Vec<usize> {
    (0..background_len)
        .chain(
            on_peak_active
                .iter()
                .enumerate()
                .filter_map(|(i, a)| a.then_some(background_len + i)),
        )
        .collect()
}

/// The result of [`VarianceModelBuilder::prepare`]
#[derive(Debug, Clone)]
pub struct PreparedVariance {
    /// The covariance over background ⧺ on-peak
    pub full: VarianceModel,
    /// The leading background block, floored when degenerate
    pub background: VarianceModel,
    /// Whether the background diagonal averaged exactly zero
    pub degenerate: bool,
}

/// Assembles the measurement covariance for one channel
#[derive(Debug, Clone, Copy)]
pub struct VarianceModelBuilder<'a> {
    collector: &'a CollectorModel,
    mode: PropagationMode,
    integration_time: f64,
}

impl<'a> VarianceModelBuilder<'a> {
    pub fn new(collector: &'a CollectorModel, mode: PropagationMode, integration_time: f64) -> Self {
        Self {
            collector,
            mode,
            integration_time,
        }
    }

    /// Build the per-sample variance diagonal of both series from the collector noise model
    pub fn build_diagonal(
        &self,
        background: &AcquisitionSeries,
        on_peak: &AcquisitionSeries,
    ) -> Result<Vec<f64>, VarianceError> {
        let intensities = concat(background.intensities(), on_peak.intensities());
        let factors = concat(
            background.analog_correction_factors(),
            on_peak.analog_correction_factors(),
        );
        Ok(self.collector.build_variance_diagonal(
            background.len(),
            &factors,
            &intensities,
            self.integration_time,
        )?)
    }

    /// Build the variance model for both series.
    ///
    /// `diagonal` overrides the collector noise model when given. The external
    /// correction is added once and consumed only when the model is built.
    pub fn prepare(
        &self,
        background: &AcquisitionSeries,
        on_peak: &AcquisitionSeries,
        diagonal: Option<&[f64]>,
        external_correction: &mut Option<VarianceModel>,
    ) -> Result<PreparedVariance, VarianceError> {
        let intensities = concat(background.intensities(), on_peak.intensities());
        let diagonal = match diagonal {
            Some(d) => d.to_vec(),
            None => self.build_diagonal(background, on_peak)?,
        };
        let mut full = self
            .collector
            .build_variance_model(&diagonal, &intensities, self.mode)?;

        if let Some(correction) = external_correction.as_ref() {
            debug!("Adding external correction of dimension {}", correction.dim());
            full.add_assign(correction)?;
        }

        let mut background_block = full.leading_block(background.len())?;
        external_correction.take();
        let degenerate = background_block.mean_of_diagonal() == Some(0.0);
        if degenerate {
            info!(
                "Background variance is zero, flooring {} diagonal entries at {DEGENERATE_VARIANCE_FLOOR}",
                background_block.dim()
            );
            background_block.set_diagonal(DEGENERATE_VARIANCE_FLOOR);
        }

        Ok(PreparedVariance {
            full,
            background: background_block,
            degenerate,
        })
    }
}

fn concat(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}
