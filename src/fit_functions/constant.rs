use nalgebra::{DMatrix, DVector};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::propagation::PropagationError;

use super::fitter::{fit_polynomial, Estimator};
use super::{
    check_active_rows, BaselineFitArgs, BaselineFunction, FitError, FitFunctionType,
    FittedParameters,
};

/// A fixed baseline level, either supplied or estimated in closed form
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConstantFunction {
    fitted: FittedParameters,
}

impl ConstantFunction {
    pub fn from_fitted(fitted: FittedParameters) -> Self {
        Self { fitted }
    }

    /// A supplied level, carrying no sensitivity to the `background_len` measured samples
    pub fn supplied(value: f64, background_len: usize) -> Self {
        Self::from_fitted(FittedParameters::new(
            DVector::from_element(1, value),
            DMatrix::zeros(1, 1),
            Some(DMatrix::zeros(1, background_len)),
            None,
        ))
    }

    /// The variance-weighted level of the active background
    pub fn fit(args: &BaselineFitArgs) -> Result<Self, FitError> {
        fit_polynomial(args, 1, Estimator::ClosedForm).map(Self::from_fitted)
    }

    pub fn value(&self) -> f64 {
        self.fitted.values[0]
    }
}

impl BaselineFunction for ConstantFunction {
    fn fit_type(&self) -> FitFunctionType {
        FitFunctionType::Constant
    }

    fn fitted(&self) -> &FittedParameters {
        &self.fitted
    }

    fn evaluate(&self, _t: f64) -> f64 {
        self.value()
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
    use crate::variance::{VarianceModel, DEGENERATE_VARIANCE_FLOOR};

    #[test]
    fn test_degenerate_background() {
        let variance = VarianceModel::Diagonal(DVector::from_element(4, DEGENERATE_VARIANCE_FLOOR));
        let times = [-4.0, -3.0, -2.0, -1.0];
        let intensities = [0.0; 4];
        let active = [true; 4];
        let args = BaselineFitArgs::new(&times, &intensities, &active, &variance);
        let constant = ConstantFunction::fit(&args).unwrap();
        assert_eq!(constant.value(), 0.0);
        assert_eq!(constant.short_name(), "CONSTANT");
        assert!(constant.verify_positive_variances());
        let j11 = constant.matrix_j11().unwrap();
        assert!(j11.iter().all(|v| (v - 0.25).abs() < 1e-9));
    }

    #[test]
    fn test_supplied() {
        let constant = ConstantFunction::supplied(3.5, 5);
        assert_eq!(constant.evaluate(-10.0), 3.5);
        assert_eq!(constant.matrix_j11().unwrap().shape(), (1, 5));
        assert!(constant.matrix_j11().unwrap().iter().all(|v| *v == 0.0));
        let j21 = constant.make_j21(2, &[true, true], &[0.0, 1.0]).unwrap();
        assert_eq!(j21.as_slice(), &[-1.0, -1.0]);
    }
}
