use nalgebra::DMatrix;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::propagation::PropagationError;

use super::fitter::{fit_polynomial, Estimator};
use super::{
    check_active_rows, BaselineFitArgs, BaselineFunction, FitError, FitFunctionType,
    FittedParameters,
};

/// A baseline drifting linearly in normalized time
///
/// ```math
/// y = \beta_0 + \beta_1 t
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LineFunction {
    fitted: FittedParameters,
}

impl LineFunction {
    pub fn from_fitted(fitted: FittedParameters) -> Self {
        Self { fitted }
    }

    /// The generalized least squares line through the active background
    pub fn fit(args: &BaselineFitArgs) -> Result<Self, FitError> {
        fit_polynomial(args, 2, Estimator::ClosedForm).map(Self::from_fitted)
    }

    pub fn intercept(&self) -> f64 {
        self.fitted.values[0]
    }

    pub fn slope(&self) -> f64 {
        self.fitted.values[1]
    }
}

impl BaselineFunction for LineFunction {
    fn fit_type(&self) -> FitFunctionType {
        FitFunctionType::Line
    }

    fn fitted(&self) -> &FittedParameters {
        &self.fitted
    }

    fn evaluate(&self, t: f64) -> f64 {
        self.intercept() + self.slope() * t
    }

    /// One row `[-1, -v]` per active sample, `v` taken from `needed_values`
    fn make_j21(
        &self,
        active_count: usize,
        active_mask: &[bool],
        needed_values: &[f64],
    ) -> Result<DMatrix<f64>, PropagationError> {
        let positions = check_active_rows(active_count, active_mask, needed_values)?;
        let mut j21 = DMatrix::zeros(active_count, 2);
        for (row, i) in positions.into_iter().enumerate() {
            j21[(row, 0)] = -1.0;
            j21[(row, 1)] = -needed_values[i];
        }
        Ok(j21)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::variance::VarianceModel;
    use nalgebra::DVector;

    #[test]
    fn test_fit_and_j21() {
        let times = [-4.0, -3.0, -2.0, -1.0];
        let intensities = [3.0, 3.5, 4.0, 4.5];
        let active = [true; 4];
        let variance = VarianceModel::Full(DMatrix::from_diagonal_element(4, 4, 0.1));
        let args = BaselineFitArgs::new(&times, &intensities, &active, &variance);
        let line = LineFunction::fit(&args).unwrap();
        assert!((line.intercept() - 5.0).abs() < 1e-9);
        assert!((line.slope() - 0.5).abs() < 1e-9);
        assert!((line.evaluate(2.0) - 6.0).abs() < 1e-9);
        assert_eq!(line.matrix_j11().unwrap().shape(), (2, 4));
        assert!(line.verify_positive_variances());

        let j21 = line
            .make_j21(2, &[false, true, true], &[110.0, 120.0, 130.0])
            .unwrap();
        assert_eq!(j21, DMatrix::from_row_slice(2, 2, &[-1.0, -120.0, -1.0, -130.0]));
    }

    #[test]
    fn test_underdetermined() {
        let variance = VarianceModel::Diagonal(DVector::from_element(2, 1.0));
        let args = BaselineFitArgs::new(&[-2.0, -1.0], &[1.0, 2.0], &[true, false], &variance);
        assert_eq!(LineFunction::fit(&args).unwrap_err(), FitError::SingularNormalMatrix);
    }
}
