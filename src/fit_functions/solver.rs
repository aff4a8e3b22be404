//! A damped Fisher-scoring (Levenberg-Marquardt) maximizer of the Gaussian
//! log-likelihood of background samples under a linear baseline model with an
//! optional overdispersion term.
//!
//! ```math
//! \ell(\beta, \xi) = -\frac{1}{2}\left[\log|V| + r^T V^{-1} r + n\log 2\pi\right],\quad
//! V = S + \xi I,\quad r = y - X\beta
//! ```
use std::f64::consts::PI;

use log::trace;
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::variance::{VarianceError, VarianceModel};

/// All the ways fitting a baseline function can fail
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("The solver did not converge after {iterations} iterations")]
    SolverNonConvergence { iterations: usize },
    #[error("The normal matrix is singular")]
    SingularNormalMatrix,
    #[error("There are no active background samples to fit")]
    NoActiveSamples,
    #[error("The likelihood is not finite")]
    NonFiniteLikelihood,
    #[error("The fitted parameter variances are not all positive")]
    NonPositiveVariance,
    #[error("Fit arguments do not agree in size: {0}")]
    DimensionMismatch(String),
    #[error(transparent)]
    Variance(#[from] VarianceError),
}

/// Hyperparameters for the overdispersion solver
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SolverConfig {
    /// The maximum number of iterations to attempt
    pub max_iter: usize,
    /// The relative change in log-likelihood below which the solve has converged
    pub convergence: f64,
    /// The starting damping factor
    pub damping: f64,
    /// The factor the damping is scaled by after each rejected or accepted step
    pub damping_scale: f64,
    /// The damping past which no improving step is considered to exist
    pub max_damping: f64,
}

impl SolverConfig {
    /// The maximum number of iterations to attempt
    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// The relative change in log-likelihood below which the solve has converged
    pub fn convergence(mut self, convergence: f64) -> Self {
        self.convergence = convergence;
        self
    }

    pub fn damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn damping_scale(mut self, damping_scale: f64) -> Self {
        self.damping_scale = damping_scale;
        self
    }

    pub fn max_damping(mut self, max_damping: f64) -> Self {
        self.max_damping = max_damping;
        self
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iter: 200,
            convergence: 1e-12,
            damping: 1e-3,
            damping_scale: 10.0,
            max_damping: 1e12,
        }
    }
}

/// The outcome of a solve over the active samples
#[derive(Debug, Clone, PartialEq)]
pub struct SolverResult {
    pub beta: DVector<f64>,
    /// The overdispersion, `0` when it was not estimated
    pub xi: f64,
    /// The covariance of `beta`, the inverse of its Fisher information
    pub covariance: DMatrix<f64>,
    /// The variance of `xi` when it was estimated
    pub xi_variance: Option<f64>,
    /// `(X^T V^-1 X)^-1 X^T V^-1`, one column per active sample
    pub sensitivity: DMatrix<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
}

struct Evaluation {
    log_likelihood: f64,
    v_inv: VarianceModel,
    residuals: DVector<f64>,
}

/// Fits `y = X beta` against a measurement covariance, optionally estimating
/// an overdispersion term added to every variance
#[derive(Debug, Clone)]
pub struct OverdispersionSolver {
    design: DMatrix<f64>,
    observations: DVector<f64>,
    variance: VarianceModel,
}

impl OverdispersionSolver {
    pub fn new(
        design: DMatrix<f64>,
        observations: DVector<f64>,
        variance: VarianceModel,
    ) -> Result<Self, FitError> {
        let n = observations.len();
        if n == 0 {
            return Err(FitError::NoActiveSamples);
        }
        if design.nrows() != n || variance.dim() != n {
            return Err(FitError::DimensionMismatch(format!(
                "design has {} rows and variance dimension {} for {} observations",
                design.nrows(),
                variance.dim(),
                n
            )));
        }
        Ok(Self {
            design,
            observations,
            variance,
        })
    }

    pub fn parameter_count(&self) -> usize {
        self.design.ncols()
    }

    fn evaluate(&self, beta: &DVector<f64>, xi: f64) -> Result<Evaluation, FitError> {
        let mut v = self.variance.clone();
        if xi != 0.0 {
            v.inflate(xi);
        }
        let v_inv = v.inverse().ok_or(FitError::SingularNormalMatrix)?;
        let log_det = v.log_determinant().ok_or(FitError::SingularNormalMatrix)?;
        let residuals = &self.observations - &self.design * beta;
        let quad = residuals.dot(&v_inv.apply(&residuals));
        let n = self.observations.len() as f64;
        let log_likelihood = -0.5 * (log_det + quad + n * (2.0 * PI).ln());
        if !log_likelihood.is_finite() {
            return Err(FitError::NonFiniteLikelihood);
        }
        Ok(Evaluation {
            log_likelihood,
            v_inv,
            residuals,
        })
    }

    /// The closed form generalized least squares estimate with `xi = 0`
    pub fn generalized_least_squares(&self) -> Result<SolverResult, FitError> {
        let v_inv = self.variance.inverse().ok_or(FitError::SingularNormalMatrix)?;
        let xtv = v_inv.transpose_product(&self.design);
        let normal_inv = (&xtv * &self.design)
            .cholesky()
            .ok_or(FitError::SingularNormalMatrix)?
            .inverse();
        let sensitivity = &normal_inv * xtv;
        let beta = &sensitivity * &self.observations;
        let log_likelihood = self.evaluate(&beta, 0.0)?.log_likelihood;
        Ok(SolverResult {
            beta,
            xi: 0.0,
            covariance: normal_inv,
            xi_variance: None,
            sensitivity,
            log_likelihood,
            iterations: 0,
        })
    }

    /// The Fisher information and score at the evaluated point
    fn information(&self, eval: &Evaluation, overdispersion: bool) -> (DMatrix<f64>, DVector<f64>) {
        let p = self.parameter_count();
        let q = if overdispersion { p + 1 } else { p };
        let xtv = eval.v_inv.transpose_product(&self.design);
        let mut info = DMatrix::zeros(q, q);
        let mut score = DVector::zeros(q);
        info.view_mut((0, 0), (p, p))
            .copy_from(&(&xtv * &self.design));
        score.rows_mut(0, p).copy_from(&(&xtv * &eval.residuals));
        if overdispersion {
            let v_inv_r = eval.v_inv.apply(&eval.residuals);
            score[p] = 0.5 * (v_inv_r.norm_squared() - eval.v_inv.trace());
            info[(p, p)] = 0.5 * eval.v_inv.norm_squared();
        }
        (info, score)
    }

    /// Maximize the likelihood, estimating the overdispersion when `overdispersion` is set
    pub fn solve(&self, config: &SolverConfig, overdispersion: bool) -> Result<SolverResult, FitError> {
        let p = self.parameter_count();
        let mut beta = self.generalized_least_squares()?.beta;
        let mut xi = 0.0;
        let mut current = self.evaluate(&beta, xi)?;
        let mut damping = config.damping;
        let mut converged = false;
        let mut iterations = 0;

        while iterations < config.max_iter {
            iterations += 1;
            let (info, score) = self.information(&current, overdispersion);
            let mut damped = info.clone();
            for i in 0..damped.nrows() {
                damped[(i, i)] += damping * info[(i, i)];
            }
            let step = damped
                .cholesky()
                .ok_or(FitError::SingularNormalMatrix)?
                .solve(&score);

            let candidate_beta = &beta + step.rows(0, p);
            let candidate_xi = if overdispersion {
                (xi + step[p]).max(0.0)
            } else {
                0.0
            };
            let accepted = match self.evaluate(&candidate_beta, candidate_xi) {
                Ok(next) if next.log_likelihood >= current.log_likelihood => Some(next),
                _ => None,
            };

            match accepted {
                Some(next) => {
                    let delta = next.log_likelihood - current.log_likelihood;
                    trace!(
                        "Iteration {iterations}: log-likelihood {:.6} (+{delta:.3e}), xi {candidate_xi:.6e}, damping {damping:.1e}",
                        next.log_likelihood
                    );
                    beta = candidate_beta;
                    xi = candidate_xi;
                    current = next;
                    damping = (damping / config.damping_scale).max(f64::EPSILON);
                    if delta <= config.convergence * (1.0 + current.log_likelihood.abs()) {
                        converged = true;
                        break;
                    }
                }
                None => {
                    damping *= config.damping_scale;
                    trace!("Iteration {iterations}: step rejected, damping {damping:.1e}");
                    if damping > config.max_damping {
                        converged = true;
                        break;
                    }
                }
            }
        }

        if !converged {
            return Err(FitError::SolverNonConvergence { iterations });
        }

        let (info, _) = self.information(&current, overdispersion);
        let info_inv = info
            .clone()
            .cholesky()
            .ok_or(FitError::SingularNormalMatrix)?
            .inverse();
        let covariance = info_inv.view((0, 0), (p, p)).into_owned();
        let xi_variance = overdispersion.then(|| info_inv[(p, p)]);

        let normal_inv = info
            .view((0, 0), (p, p))
            .into_owned()
            .cholesky()
            .ok_or(FitError::SingularNormalMatrix)?
            .inverse();
        let sensitivity = normal_inv * current.v_inv.transpose_product(&self.design);

        Ok(SolverResult {
            beta,
            xi,
            covariance,
            xi_variance,
            sensitivity,
            log_likelihood: current.log_likelihood,
            iterations,
        })
    }
}
