use nalgebra::{DMatrix, DVector};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::propagation::PropagationError;

use super::fitter::{fit_polynomial, Estimator};
use super::{
    check_active_rows, BaselineFitArgs, BaselineFunction, FitError, FitFunctionType,
    FittedParameters,
};

/// A flat baseline at the variance-weighted mean of the background
///
/// ```math
/// y = \beta_0
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MeanFunction {
    fitted: FittedParameters,
}

impl MeanFunction {
    pub fn from_fitted(fitted: FittedParameters) -> Self {
        Self { fitted }
    }

    /// The generalized least squares mean of the active background
    pub fn fit(args: &BaselineFitArgs) -> Result<Self, FitError> {
        fit_polynomial(args, 1, Estimator::ClosedForm).map(Self::from_fitted)
    }

    /// The mean used when no model can be fit to the background.
    ///
    /// The parameter and its variance are both `forced_value`; the sensitivity
    /// is that of an unweighted average over the active samples.
    pub fn arithmetic(args: &BaselineFitArgs, forced_value: f64) -> Self {
        let positions = args.active_positions();
        let mut j11 = DMatrix::zeros(1, args.len());
        if !positions.is_empty() {
            let weight = 1.0 / positions.len() as f64;
            for i in positions {
                j11[(0, i)] = weight;
            }
        }
        Self::from_fitted(FittedParameters::new(
            DVector::from_element(1, forced_value),
            DMatrix::from_element(1, 1, forced_value),
            Some(j11),
            None,
        ))
    }
}

impl BaselineFunction for MeanFunction {
    fn fit_type(&self) -> FitFunctionType {
        FitFunctionType::Mean
    }

    fn fitted(&self) -> &FittedParameters {
        &self.fitted
    }

    fn evaluate(&self, _t: f64) -> f64 {
        self.fitted.values[0]
    }

    fn make_j21(
        &self,
        active_count: usize,
        active_mask: &[bool],
        needed_values: &[f64],
    ) -> Result<DMatrix<f64>, PropagationError> {
        check_active_rows(active_count, active_mask, needed_values)?;
        Ok(DMatrix::from_element(active_count, 1, -1.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::variance::VarianceModel;

    #[test]
    fn test_weighted_mean() {
        let times = [-3.0, -2.0, -1.0];
        let intensities = [1.0, 4.0, 100.0];
        let active = [true, true, false];
        let variance = VarianceModel::Diagonal(DVector::from_vec(vec![1.0, 2.0, 1.0]));
        let args = BaselineFitArgs::new(&times, &intensities, &active, &variance);
        let mean = MeanFunction::fit(&args).unwrap();
        // weights 1 and 1/2
        assert!((mean.evaluate(0.0) - 2.0).abs() < 1e-12);
        assert!((mean.parameter_covariance()[(0, 0)] - 2.0 / 3.0).abs() < 1e-12);
        let j11 = mean.matrix_j11().unwrap();
        assert!((j11[(0, 0)] - 2.0 / 3.0).abs() < 1e-12);
        assert!((j11[(0, 1)] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(j11[(0, 2)], 0.0);
        assert!(mean.verify_positive_variances());
        assert!(!mean.is_overdispersion_variant());
    }

    #[test]
    fn test_arithmetic_fallback() {
        let times = [-3.0, -2.0, -1.0];
        let intensities = [1.0, 4.0, 100.0];
        let active = [true, false, true];
        let variance = VarianceModel::Diagonal(DVector::from_element(3, 1.0));
        let args = BaselineFitArgs::new(&times, &intensities, &active, &variance);
        let mean = MeanFunction::arithmetic(&args, 0.75);
        assert_eq!(mean.short_name(), "MEAN");
        assert_eq!(mean.parameters(), &[0.75]);
        assert_eq!(mean.parameter_covariance()[(0, 0)], 0.75);
        assert_eq!(mean.matrix_j11().unwrap().as_slice(), &[0.5, 0.0, 0.5]);
    }

    #[test]
    fn test_j21() {
        let mean = MeanFunction::from_fitted(FittedParameters::new(
            DVector::from_element(1, 1.0),
            DMatrix::from_element(1, 1, 1.0),
            None,
            None,
        ));
        let j21 = mean
            .make_j21(3, &[true, false, true, true], &[0.0, 1.0, 2.0, 3.0])
            .unwrap();
        assert_eq!(j21.shape(), (3, 1));
        assert!(j21.iter().all(|v| *v == -1.0));
        assert!(mean.make_j21(4, &[true, false, true, true], &[0.0; 4]).is_err());
    }
}
