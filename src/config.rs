//! Settings controlling how a channel is reduced.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::fit_functions::{FitFunctionType, SolverConfig};
use crate::variance::PropagationMode;

/// Settings for reducing one channel
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ReductionConfig {
    /// Carry the full covariance matrix rather than only its diagonal
    pub full_propagation: bool,
    /// Read fit functions fit with an overdispersion term
    pub overdispersion_selected: bool,
    /// The baseline function to fit
    pub fit_function_type: FitFunctionType,
    /// Skip fitting and use the forced mean directly
    pub force_mean_for_common_lead_ratios: bool,
    /// The parameter and variance of the arithmetic mean used when no fit succeeds
    pub forced_mean_value: f64,
    /// A fixed level to use for [`FitFunctionType::Constant`] instead of estimating it
    pub constant_value: Option<f64>,
    /// The integration time of one sample in seconds, the sampling period when absent
    pub integration_time: Option<f64>,
    /// Hyperparameters for the likelihood solver
    pub solver: SolverConfig,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            full_propagation: true,
            overdispersion_selected: true,
            fit_function_type: FitFunctionType::Mean,
            force_mean_for_common_lead_ratios: false,
            forced_mean_value: 0.0,
            constant_value: None,
            integration_time: None,
            solver: SolverConfig::default(),
        }
    }
}

impl ReductionConfig {
    pub fn propagation_mode(&self) -> PropagationMode {
        PropagationMode::from_full_propagation(self.full_propagation)
    }

    /// Carry the full covariance matrix rather than only its diagonal
    pub fn full_propagation(mut self, full_propagation: bool) -> Self {
        self.full_propagation = full_propagation;
        self
    }

    /// Read fit functions fit with an overdispersion term
    pub fn overdispersion_selected(mut self, overdispersion_selected: bool) -> Self {
        self.overdispersion_selected = overdispersion_selected;
        self
    }

    pub fn fit_function_type(mut self, fit_function_type: FitFunctionType) -> Self {
        self.fit_function_type = fit_function_type;
        self
    }

    /// Skip fitting and store the mean of `forced_mean_value`
    pub fn force_mean(mut self, forced_mean_value: f64) -> Self {
        self.force_mean_for_common_lead_ratios = true;
        self.forced_mean_value = forced_mean_value;
        self
    }

    pub fn forced_mean_value(mut self, forced_mean_value: f64) -> Self {
        self.forced_mean_value = forced_mean_value;
        self
    }

    pub fn constant_value(mut self, constant_value: Option<f64>) -> Self {
        self.constant_value = constant_value;
        self
    }

    pub fn integration_time(mut self, integration_time: Option<f64>) -> Self {
        self.integration_time = integration_time;
        self
    }

    pub fn solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }
}
