use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use super::{
    expand_columns, BaselineFitArgs, BaselineFunction, ConstantFunction, FitError, FitFunction,
    FitFunctionRegistry, FitFunctionType, FittedParameters, LineFunction, MeanFunction,
    OverdispersionSolver, SolverConfig,
};

/// A design matrix whose column `k` is `t^k`
pub(crate) fn design_matrix(times: &DVector<f64>, parameter_count: usize) -> DMatrix<f64> {
    DMatrix::from_fn(times.len(), parameter_count, |i, k| times[i].powi(k as i32))
}

/// How to estimate a polynomial baseline
#[derive(Debug, Clone, Copy)]
pub(crate) enum Estimator<'a> {
    ClosedForm,
    Likelihood {
        config: &'a SolverConfig,
        overdispersion: bool,
    },
}

/// Fit a polynomial in normalized time with `parameter_count` terms to the active background
pub(crate) fn fit_polynomial(
    args: &BaselineFitArgs,
    parameter_count: usize,
    estimator: Estimator,
) -> Result<FittedParameters, FitError> {
    args.check()?;
    let positions = args.active_positions();
    if positions.is_empty() {
        return Err(FitError::NoActiveSamples);
    }
    let design = design_matrix(&args.active_times(&positions), parameter_count);
    let solver = OverdispersionSolver::new(
        design,
        args.active_observations(&positions),
        args.active_variance(&positions)?,
    )?;
    let (result, overdispersion) = match estimator {
        Estimator::ClosedForm => (solver.generalized_least_squares()?, None),
        Estimator::Likelihood {
            config,
            overdispersion,
        } => {
            let result = solver.solve(config, overdispersion)?;
            let xi = overdispersion.then_some(result.xi);
            (result, xi)
        }
    };
    let j11 = expand_columns(&result.sensitivity, &positions, args.len());
    Ok(FittedParameters::new(
        result.beta,
        result.covariance,
        Some(j11),
        overdispersion,
    ))
}

/// What happened while fitting the requested baseline function
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    /// The fit type that ended up selected
    pub selected: FitFunctionType,
    /// Why the requested fit was replaced by the arithmetic mean fallback
    pub degraded: Option<FitError>,
}

impl FitOutcome {
    pub fn ok(selected: FitFunctionType) -> Self {
        Self {
            selected,
            degraded: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// Fits baseline functions to one channel's background and records them in a
/// [`FitFunctionRegistry`]
#[derive(Debug, Clone, Copy)]
pub struct BaselineFitter<'a> {
    args: BaselineFitArgs<'a>,
    config: &'a SolverConfig,
}

impl<'a> BaselineFitter<'a> {
    pub fn new(args: BaselineFitArgs<'a>, config: &'a SolverConfig) -> Self {
        Self { args, config }
    }

    fn likelihood_fit(&self, fit_type: FitFunctionType, overdispersion: bool) -> Result<FitFunction, FitError> {
        let estimator = Estimator::Likelihood {
            config: self.config,
            overdispersion,
        };
        let fitted = fit_polynomial(&self.args, fit_type.parameter_count(), estimator)?;
        let func: FitFunction = match fit_type {
            FitFunctionType::Line => LineFunction::from_fitted(fitted).into(),
            _ => MeanFunction::from_fitted(fitted).into(),
        };
        if func.verify_positive_variances() {
            Ok(func)
        } else {
            Err(FitError::NonPositiveVariance)
        }
    }

    /// Fit `fit_type` by likelihood maximization, with and without overdispersion.
    ///
    /// When the fit without overdispersion fails, both maps receive the forced
    /// arithmetic mean and [`FitFunctionType::Mean`] is selected. When only the
    /// overdispersed fit fails, both maps receive the fit without it.
    pub fn fit_nonlinear(
        &self,
        fit_type: FitFunctionType,
        registry: &mut FitFunctionRegistry,
        forced_mean_value: f64,
    ) -> FitOutcome {
        match self.likelihood_fit(fit_type, false) {
            Ok(no_od) => {
                match self.likelihood_fit(fit_type, true) {
                    Ok(with_od) => registry.insert_pair(fit_type, with_od, no_od),
                    Err(err) => {
                        debug!("Overdispersed {fit_type} fit failed ({err}), reusing the plain fit");
                        registry.insert_both(fit_type, no_od);
                    }
                }
                FitOutcome::ok(fit_type)
            }
            Err(err) => {
                warn!("{fit_type} fit failed ({err}), using arithmetic mean fallback");
                self.force_mean(registry, forced_mean_value);
                FitOutcome {
                    selected: FitFunctionType::Mean,
                    degraded: Some(err),
                }
            }
        }
    }

    /// Store the arithmetic mean seeded with `forced_mean_value` in both maps
    pub fn force_mean(&self, registry: &mut FitFunctionRegistry, forced_mean_value: f64) -> FitOutcome {
        let func = MeanFunction::arithmetic(&self.args, forced_mean_value);
        registry.insert_both(FitFunctionType::Mean, func.into());
        FitOutcome::ok(FitFunctionType::Mean)
    }

    /// Fit a constant, or take `supplied` as its value
    pub fn fit_constant(
        &self,
        registry: &mut FitFunctionRegistry,
        supplied: Option<f64>,
    ) -> Result<FitOutcome, FitError> {
        let func = match supplied {
            Some(value) => ConstantFunction::supplied(value, self.args.len()),
            None => ConstantFunction::fit(&self.args)?,
        };
        registry.insert_both(FitFunctionType::Constant, func.into());
        Ok(FitOutcome::ok(FitFunctionType::Constant))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::variance::VarianceModel;

    #[test_log::test]
    fn test_nonlinear_mean() {
        let times = [-4.0, -3.0, -2.0, -1.0];
        let intensities = [10.0, 10.0, 10.0, 10.0];
        let active = [true; 4];
        let variance = VarianceModel::Full(DMatrix::from_diagonal_element(4, 4, 10.0));
        let args = BaselineFitArgs::new(&times, &intensities, &active, &variance);
        let config = SolverConfig::default();
        let fitter = BaselineFitter::new(args, &config);
        let mut registry = FitFunctionRegistry::default();
        let outcome = fitter.fit_nonlinear(FitFunctionType::Mean, &mut registry, 0.0);
        assert_eq!(outcome, FitOutcome::ok(FitFunctionType::Mean));
        let with_od = registry.get(FitFunctionType::Mean, true).unwrap();
        let no_od = registry.get(FitFunctionType::Mean, false).unwrap();
        assert!(with_od.is_overdispersion_variant());
        assert!(!no_od.is_overdispersion_variant());
        assert!((no_od.evaluate(100.0) - 10.0).abs() < 1e-9);
        assert_eq!(no_od.matrix_j11().unwrap().shape(), (1, 4));
    }

    #[test_log::test]
    fn test_overdispersed_fit_failure_reuses_plain_fit() {
        let times = [-8.0, -7.0, -6.0, -5.0, -4.0, -3.0, -2.0, -1.0];
        let intensities = [4.0, 16.0, 6.0, 14.0, 5.0, 15.0, 7.0, 13.0];
        let active = [true; 8];
        let variance = VarianceModel::Diagonal(DVector::from_element(8, 1.0));
        let args = BaselineFitArgs::new(&times, &intensities, &active, &variance);
        // the plain fit starts at its optimum, the overdispersion needs more than one step
        let config = SolverConfig::default().max_iter(1);
        let fitter = BaselineFitter::new(args, &config);
        assert_eq!(
            fitter.likelihood_fit(FitFunctionType::Mean, true).unwrap_err(),
            FitError::SolverNonConvergence { iterations: 1 }
        );

        let mut registry = FitFunctionRegistry::default();
        let outcome = fitter.fit_nonlinear(FitFunctionType::Mean, &mut registry, 0.0);
        assert_eq!(outcome.selected, FitFunctionType::Mean);
        assert!(outcome.degraded.is_none());
        let with_od = registry.get(FitFunctionType::Mean, true).unwrap();
        assert_eq!(Some(with_od), registry.get(FitFunctionType::Mean, false));
        assert!(!with_od.is_overdispersion_variant());
        assert!(!registry.has_overdispersion(FitFunctionType::Mean));
        assert!((with_od.evaluate(0.0) - 10.0).abs() < 1e-9);
    }

    #[test_log::test]
    fn test_fallback() {
        let times = [-2.0, -1.0];
        let intensities = [5.0, 7.0];
        let active = [false, false];
        let variance = VarianceModel::Diagonal(DVector::from_element(2, 1.0));
        let args = BaselineFitArgs::new(&times, &intensities, &active, &variance);
        let config = SolverConfig::default();
        let fitter = BaselineFitter::new(args, &config);
        let mut registry = FitFunctionRegistry::default();
        let outcome = fitter.fit_nonlinear(FitFunctionType::Line, &mut registry, 42.0);
        assert_eq!(outcome.selected, FitFunctionType::Mean);
        assert_eq!(outcome.degraded, Some(FitError::NoActiveSamples));
        for od in [true, false] {
            let f = registry.get(FitFunctionType::Mean, od).unwrap();
            assert_eq!(f.short_name(), "MEAN");
            assert_eq!(f.parameters(), &[42.0]);
        }
        assert!(!registry.contains(FitFunctionType::Line));
    }

    #[test]
    fn test_line_fit() {
        let times = [-4.0, -3.0, -2.0, -1.0];
        let intensities = [1.0, 2.0, 3.0, 4.0];
        let active = [true, true, false, true];
        let variance = VarianceModel::Diagonal(DVector::from_element(4, 0.5));
        let args = BaselineFitArgs::new(&times, &intensities, &active, &variance);
        let fitted = fit_polynomial(&args, 2, Estimator::ClosedForm).unwrap();
        assert!((fitted.values[0] - 5.0).abs() < 1e-9);
        assert!((fitted.values[1] - 1.0).abs() < 1e-9);
        let j11 = fitted.j11.unwrap();
        assert_eq!(j11.shape(), (2, 4));
        assert_eq!(j11.column(2).iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0]);
        assert!(fitted.overdispersion.is_none());
    }

    #[test]
    fn test_mismatched_args() {
        let variance = VarianceModel::Diagonal(DVector::from_element(3, 1.0));
        let args = BaselineFitArgs::new(&[0.0, 1.0], &[1.0, 2.0], &[true, true], &variance);
        assert!(matches!(
            fit_polynomial(&args, 1, Estimator::ClosedForm),
            Err(FitError::DimensionMismatch(_))
        ));
    }
}
