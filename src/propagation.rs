//! First order propagation of the measurement covariance through baseline
//! subtraction and the log transform.
//!
//! For the `m` active on-peak samples of a channel with `nb` background samples:
//!
//! ```math
//! J_{OnPeak} = \left[ J_{21} J_{11} \;\middle|\; J_{22} \right],\quad
//! S_{opbc} = J_{OnPeak}\, S_{active}\, J_{OnPeak}^T,\quad
//! S_{opbclr} = (J_{logr} J_{logr}^T) \circ S_{opbc}
//! ```
//!
//! where `S_active` keeps every background row/column and the active on-peak
//! rows/columns of the measurement covariance, and `J_logr` holds the
//! reciprocals of the active corrected on-peak intensities.
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::fit_functions::{BaselineFunction, FitFunction, FitFunctionType};
use crate::model::FitState;
use crate::variance::{active_indices, VarianceError, VarianceModel};

/// All the ways propagating uncertainty for a channel can fail
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PropagationError {
    #[error("Matrix dimensions do not agree: {0}")]
    DimensionMismatch(String),
    #[error("The fit function has no J11 sensitivity")]
    MissingJ11,
    #[error("No fit function has been generated")]
    NoFitFunction,
    #[error("No variance model is retained, generate the fit functions first")]
    MissingVarianceModel,
    #[error("Fit functions are not ready for propagation, the model is in state {0:?}")]
    NotReady(FitState),
    #[error("Corrected on-peak intensity {index} is zero and has no log")]
    ZeroCorrectedIntensity { index: usize },
    #[error(transparent)]
    Variance(#[from] VarianceError),
}

/// Everything [`propagate`] reads for one channel
#[derive(Debug, Clone, Copy)]
pub struct PropagationInputs<'a> {
    pub function: &'a FitFunction,
    /// The covariance over background ⧺ on-peak
    pub variance: &'a VarianceModel,
    pub background_len: usize,
    pub on_peak_active: &'a [bool],
    pub normalized_on_peak_times: &'a [f64],
    /// Raw on-peak intensities
    pub on_peak_intensities: &'a [f64],
    /// Baseline-corrected on-peak intensities
    pub on_peak_corrected: &'a [f64],
}

impl PropagationInputs<'_> {
    /// The values [`BaselineFunction::make_j21`] consumes: raw on-peak
    /// intensities for lines, normalized on-peak times otherwise
    pub fn needed_values(&self) -> &[f64] {
        match self.function.fit_type() {
            FitFunctionType::Line => self.on_peak_intensities,
            _ => self.normalized_on_peak_times,
        }
    }

    pub fn active_count(&self) -> usize {
        self.on_peak_active.iter().filter(|a| **a).count()
    }
}

/// The intermediate matrices of one propagation, owned by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianChain {
    pub j11: DMatrix<f64>,
    pub j21: DMatrix<f64>,
    pub j22: DMatrix<f64>,
    pub j_on_peak: DMatrix<f64>,
    /// Covariance of the baseline-corrected active on-peak intensities
    pub sopbc: DMatrix<f64>,
    pub jlogr: DVector<f64>,
    pub jmat: DMatrix<f64>,
    /// Covariance of the logs of the baseline-corrected active on-peak intensities
    pub sopbclr: DMatrix<f64>,
}

impl JacobianChain {
    /// The number of active on-peak samples covered
    pub fn active_count(&self) -> usize {
        self.sopbc.nrows()
    }
}

fn mismatch(message: String) -> PropagationError {
    PropagationError::DimensionMismatch(message)
}

/// Build the Jacobian chain and propagate the measurement covariance through it
pub fn propagate(inputs: &PropagationInputs) -> Result<JacobianChain, PropagationError> {
    let nb = inputs.background_len;
    let n_on_peak = inputs.on_peak_active.len();
    if inputs.variance.dim() != nb + n_on_peak {
        return Err(mismatch(format!(
            "variance model has dimension {}, expected {} background and {} on-peak samples",
            inputs.variance.dim(),
            nb,
            n_on_peak
        )));
    }
    if inputs.on_peak_corrected.len() != n_on_peak {
        return Err(mismatch(format!(
            "{} corrected intensities for {} on-peak samples",
            inputs.on_peak_corrected.len(),
            n_on_peak
        )));
    }
    let active_count = inputs.active_count();

    let j11 = inputs
        .function
        .matrix_j11()
        .ok_or(PropagationError::MissingJ11)?
        .clone();
    if j11.ncols() != nb {
        return Err(mismatch(format!(
            "J11 has {} columns for {} background samples",
            j11.ncols(),
            nb
        )));
    }

    let j21 = inputs
        .function
        .make_j21(active_count, inputs.on_peak_active, inputs.needed_values())?;
    let j22 = inputs.function.make_j22(
        active_count,
        inputs.on_peak_active,
        inputs.normalized_on_peak_times,
    )?;
    if j21.ncols() != j11.nrows() || j21.nrows() != active_count || j22.shape() != (active_count, active_count) {
        return Err(mismatch(format!(
            "J21 is {:?}, J11 is {:?} and J22 is {:?} for {} active samples",
            j21.shape(),
            j11.shape(),
            j22.shape(),
            active_count
        )));
    }

    let mut j_on_peak = DMatrix::zeros(active_count, nb + active_count);
    j_on_peak
        .view_mut((0, 0), (active_count, nb))
        .copy_from(&(&j21 * &j11));
    j_on_peak
        .view_mut((0, nb), (active_count, active_count))
        .copy_from(&j22);

    let indices = active_indices(nb, inputs.on_peak_active);
    let s_active = inputs.variance.select(&indices)?;
    let sopbc = s_active.sandwich(&j_on_peak)?;

    let mut reciprocals = Vec::with_capacity(active_count);
    for (index, (corrected, active)) in inputs
        .on_peak_corrected
        .iter()
        .zip(inputs.on_peak_active.iter())
        .enumerate()
    {
        if *active {
            let r = 1.0 / corrected;
            if !r.is_finite() {
                return Err(PropagationError::ZeroCorrectedIntensity { index });
            }
            reciprocals.push(r);
        }
    }
    let jlogr = DVector::from_vec(reciprocals);
    let jmat = &jlogr * jlogr.transpose();
    let sopbclr = jmat.component_mul(&sopbc);

    Ok(JacobianChain {
        j11,
        j21,
        j22,
        j_on_peak,
        sopbc,
        jlogr,
        jmat,
        sopbclr,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fit_functions::{FittedParameters, LineFunction, MeanFunction};

    fn mean_function(j11: DMatrix<f64>) -> FitFunction {
        MeanFunction::from_fitted(FittedParameters::new(
            DVector::from_element(1, 10.0),
            DMatrix::from_element(1, 1, 2.5),
            Some(j11),
            None,
        ))
        .into()
    }

    #[rstest::fixture]
    fn covariance() -> VarianceModel {
        VarianceModel::Full(DMatrix::from_fn(6, 6, |i, j| {
            if i == j {
                10.0 + 10.0 * i as f64
            } else {
                0.5
            }
        }))
    }

    #[rstest::rstest]
    fn test_hadamard_product(covariance: VarianceModel) {
        let function = mean_function(DMatrix::from_element(1, 2, 0.5));
        let corrected = [100.0, 110.0, 120.0, 130.0];
        let inputs = PropagationInputs {
            function: &function,
            variance: &covariance,
            background_len: 2,
            on_peak_active: &[true; 4],
            normalized_on_peak_times: &[0.0, 1.0, 2.0, 3.0],
            on_peak_intensities: &[110.0, 120.0, 130.0, 140.0],
            on_peak_corrected: &corrected,
        };
        let chain = propagate(&inputs).unwrap();
        assert_eq!(chain.j_on_peak.shape(), (4, 6));
        assert_eq!(chain.sopbc.shape(), (4, 4));
        assert_eq!(chain.sopbclr.shape(), chain.sopbc.shape());
        assert!(chain.sopbc[(0, 1)].abs() > 0.0);

        for i in 0..4 {
            for j in 0..4 {
                let expected = chain.sopbc[(i, j)] / (corrected[i] * corrected[j]);
                assert!((chain.sopbclr[(i, j)] - expected).abs() < 1e-15);
            }
        }
        let matrix_product = &chain.jmat * &chain.sopbc;
        assert!((matrix_product - &chain.sopbclr).abs().max() > 1e-9);

        // baseline block 0.25 * (10 + 20 + 1), two cross terms of -0.5, on-peak covariance 0.5
        assert!((chain.sopbc[(0, 1)] - 7.25).abs() < 1e-9);
    }

    #[rstest::rstest]
    fn test_masked_rows(covariance: VarianceModel) {
        let function = mean_function(DMatrix::from_element(1, 2, 0.5));
        let active = [true, false, true, true];
        let inputs = PropagationInputs {
            function: &function,
            variance: &covariance,
            background_len: 2,
            on_peak_active: &active,
            normalized_on_peak_times: &[0.0, 1.0, 2.0, 3.0],
            on_peak_intensities: &[110.0, 120.0, 130.0, 140.0],
            on_peak_corrected: &[100.0, 110.0, 120.0, 130.0],
        };
        let chain = propagate(&inputs).unwrap();
        assert_eq!(chain.j21.nrows(), 3);
        assert_eq!(chain.j22.nrows(), 3);
        assert_eq!(chain.sopbc.shape(), (3, 3));
        assert_eq!(chain.jlogr.as_slice(), &[1.0 / 100.0, 1.0 / 120.0, 1.0 / 130.0]);
        // the second active row is on-peak sample 2, full index 4
        let dense = covariance.to_dense();
        let expected = 0.25 * 31.0 - 2.0 * 0.5 * (dense[(0, 4)] + dense[(1, 4)]) + dense[(4, 4)];
        assert!((chain.sopbc[(1, 1)] - expected).abs() < 1e-9);
    }

    #[rstest::rstest]
    fn test_failures(covariance: VarianceModel) {
        let function = mean_function(DMatrix::from_element(1, 2, 0.5));
        let mut inputs = PropagationInputs {
            function: &function,
            variance: &covariance,
            background_len: 2,
            on_peak_active: &[false; 4],
            normalized_on_peak_times: &[0.0, 1.0, 2.0, 3.0],
            on_peak_intensities: &[110.0, 120.0, 130.0, 140.0],
            on_peak_corrected: &[100.0, 110.0, 120.0, 130.0],
        };
        assert!(matches!(
            propagate(&inputs),
            Err(PropagationError::DimensionMismatch(_))
        ));

        inputs.on_peak_active = &[true; 4];
        inputs.on_peak_corrected = &[100.0, 0.0, 120.0, 130.0];
        assert_eq!(
            propagate(&inputs).unwrap_err(),
            PropagationError::ZeroCorrectedIntensity { index: 1 }
        );

        inputs.on_peak_corrected = &[100.0, 110.0, 120.0, 130.0];
        inputs.background_len = 3;
        assert!(propagate(&inputs).is_err());

        let no_j11: FitFunction = MeanFunction::from_fitted(FittedParameters::new(
            DVector::from_element(1, 1.0),
            DMatrix::from_element(1, 1, 1.0),
            None,
            None,
        ))
        .into();
        inputs.background_len = 2;
        inputs.function = &no_j11;
        assert_eq!(propagate(&inputs).unwrap_err(), PropagationError::MissingJ11);
    }

    #[rstest::rstest]
    fn test_line_uses_intensities(covariance: VarianceModel) {
        let line: FitFunction = LineFunction::from_fitted(FittedParameters::new(
            DVector::from_vec(vec![10.0, 0.0]),
            DMatrix::identity(2, 2),
            Some(DMatrix::from_element(2, 2, 0.5)),
            None,
        ))
        .into();
        let inputs = PropagationInputs {
            function: &line,
            variance: &covariance,
            background_len: 2,
            on_peak_active: &[true; 4],
            normalized_on_peak_times: &[0.0, 1.0, 2.0, 3.0],
            on_peak_intensities: &[110.0, 120.0, 130.0, 140.0],
            on_peak_corrected: &[100.0, 110.0, 120.0, 130.0],
        };
        assert_eq!(inputs.needed_values(), &[110.0, 120.0, 130.0, 140.0]);
        let chain = propagate(&inputs).unwrap();
        assert_eq!(chain.j21[(2, 1)], -130.0);
        assert_eq!(chain.j_on_peak.shape(), (4, 6));
    }
}
