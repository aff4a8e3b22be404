//! The per-channel baseline reduction model.
//!
//! A [`RawIntensityModel`] owns the background and on-peak series of one
//! channel. [`RawIntensityModel::generate`] prepares the measurement variance,
//! fits the requested baseline function and writes fitted and corrected values
//! back onto both series. [`RawIntensityModel::propagate_uncertainties`] then
//! derives the covariance of the logs of the corrected on-peak intensities.
use std::fmt::Display;

use log::{debug, error, warn};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::channel::Channel;
use crate::collector::CollectorModel;
use crate::config::ReductionConfig;
use crate::fit_functions::{
    BaselineFitArgs, BaselineFitter, BaselineFunction, FitError, FitFunction, FitFunctionRegistry,
    FitFunctionType, FitOutcome,
};
use crate::propagation::{propagate, JacobianChain, PropagationError, PropagationInputs};
use crate::series::{AcquisitionSeries, SeriesError};
use crate::variance::{PropagationMode, VarianceError, VarianceModel, VarianceModelBuilder};

/// All the ways working with a [`RawIntensityModel`] can fail
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error(transparent)]
    Variance(#[from] VarianceError),
    #[error(transparent)]
    Series(#[from] SeriesError),
    #[error("The sampling period must be positive, got {0} ms")]
    InvalidSamplingPeriod(f64),
    #[error("{0} is not supported for raw intensity models")]
    UnsupportedOperation(&'static str),
}

/// How far [`RawIntensityModel::generate`] has progressed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FitState {
    #[default]
    Raw,
    VariancePrepared,
    FitSelected,
    FitEvaluated,
    Ready,
}

/// A summary of one [`RawIntensityModel::generate`] call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateReport {
    pub channel: Channel,
    pub mode: PropagationMode,
    /// The fit type in effect after the degenerate background guard and any fallback
    pub selected: FitFunctionType,
    /// Whether the background carried no variance and was floored
    pub degenerate_background: bool,
    /// Why the requested fit was replaced by the arithmetic mean, if it was
    pub degraded: Option<FitError>,
}

impl GenerateReport {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// The baseline reduction state of one channel
#[derive(Debug, Clone)]
pub struct RawIntensityModel {
    channel: Channel,
    collector: CollectorModel,
    /// The sampling period in milliseconds
    period_ms: f64,
    background: AcquisitionSeries,
    on_peak: AcquisitionSeries,
    config: ReductionConfig,
    selected_fit_function_type: FitFunctionType,
    fit_functions: FitFunctionRegistry,
    state: FitState,
    variance_diagonal: Option<Vec<f64>>,
    variance: Option<VarianceModel>,
    sopbclr: Option<DMatrix<f64>>,
    interference_correction: Option<VarianceModel>,
    below_detection: bool,
}

impl RawIntensityModel {
    pub fn new(
        channel: Channel,
        collector: CollectorModel,
        period_ms: f64,
        background: AcquisitionSeries,
        on_peak: AcquisitionSeries,
        config: ReductionConfig,
    ) -> Result<Self, ModelError> {
        if !(period_ms.is_finite() && period_ms > 0.0) {
            return Err(ModelError::InvalidSamplingPeriod(period_ms));
        }
        let selected_fit_function_type = config.fit_function_type;
        Ok(Self {
            channel,
            collector,
            period_ms,
            background,
            on_peak,
            config,
            selected_fit_function_type,
            fit_functions: FitFunctionRegistry::default(),
            state: FitState::Raw,
            variance_diagonal: None,
            variance: None,
            sopbclr: None,
            interference_correction: None,
            below_detection: false,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn collector(&self) -> &CollectorModel {
        &self.collector
    }

    /// The sampling period in milliseconds
    pub fn period_ms(&self) -> f64 {
        self.period_ms
    }

    pub fn background(&self) -> &AcquisitionSeries {
        &self.background
    }

    pub fn on_peak(&self) -> &AcquisitionSeries {
        &self.on_peak
    }

    /// Mutable access to the background series, e.g. to toggle samples
    pub fn background_mut(&mut self) -> &mut AcquisitionSeries {
        &mut self.background
    }

    /// Mutable access to the on-peak series, e.g. to toggle samples
    pub fn on_peak_mut(&mut self) -> &mut AcquisitionSeries {
        &mut self.on_peak
    }

    pub fn config(&self) -> &ReductionConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ReductionConfig {
        &mut self.config
    }

    pub fn state(&self) -> FitState {
        self.state
    }

    pub fn below_detection(&self) -> bool {
        self.below_detection
    }

    pub fn set_below_detection(&mut self, below_detection: bool) {
        self.below_detection = below_detection;
    }

    /// Request a fit type for the next [`RawIntensityModel::generate`] and read it from now on
    pub fn set_selected_fit_function_type(&mut self, fit_type: FitFunctionType) {
        self.config.fit_function_type = fit_type;
        self.selected_fit_function_type = fit_type;
    }

    pub fn selected_fit_function_type(&self) -> FitFunctionType {
        self.selected_fit_function_type
    }

    /// The selected function, read from the map matching the overdispersion flag
    pub fn selected_fit_function(&self) -> Option<&FitFunction> {
        self.fit_functions
            .get(self.selected_fit_function_type, self.config.overdispersion_selected)
    }

    /// Not meaningful for intensities, only ratios are fit across a session
    pub fn selected_down_hole_fit_function(&self) -> Result<&FitFunction, ModelError> {
        error!("selected_down_hole_fit_function called on intensity model {}", self.channel);
        Err(ModelError::UnsupportedOperation("selected_down_hole_fit_function"))
    }

    /// Not meaningful for intensities, only ratios have corrected statistics
    pub fn corrected_ratio_statistics(&self) -> Result<(), ModelError> {
        error!("corrected_ratio_statistics called on intensity model {}", self.channel);
        Err(ModelError::UnsupportedOperation("corrected_ratio_statistics"))
    }

    /// The fit functions of the map matching the overdispersion flag
    pub fn fit_functions(&self) -> &std::collections::BTreeMap<FitFunctionType, FitFunction> {
        self.fit_functions.functions(self.config.overdispersion_selected)
    }

    pub fn registry(&self) -> &FitFunctionRegistry {
        &self.fit_functions
    }

    pub fn contains_fit_function(&self, fit_type: FitFunctionType) -> bool {
        self.fit_functions.contains(fit_type)
    }

    pub fn does_fit_function_type_have_od(&self, fit_type: FitFunctionType) -> bool {
        self.fit_functions.has_overdispersion(fit_type)
    }

    pub fn xi_for_fit_function(&self, fit_type: FitFunctionType) -> f64 {
        self.fit_functions.xi(fit_type)
    }

    /// On-peak acquisition times in units of the sampling period
    pub fn normalized_on_peak_times(&self) -> Vec<f64> {
        self.on_peak
            .acquire_times()
            .iter()
            .map(|t| t / self.period_ms)
            .collect()
    }

    pub fn on_peak_times_in_seconds(&self) -> Vec<f64> {
        self.on_peak
            .acquire_times()
            .iter()
            .map(|t| t / 1000.0)
            .collect()
    }

    /// Background acquisition times in units of the sampling period, shifted so
    /// the last background sample falls one period before on-peak time zero
    pub fn normalized_background_times(&self) -> Vec<f64> {
        let times = self.background.acquire_times();
        let Some(last) = times.last() else {
            return Vec::new();
        };
        let shift = last / self.period_ms + 1.0;
        times.iter().map(|t| t / self.period_ms - shift).collect()
    }

    /// The active corrected on-peak intensities
    pub fn column_vector_of_corrected_on_peak(&self) -> DVector<f64> {
        let values: Vec<f64> = self
            .on_peak
            .corrected()
            .iter()
            .zip(self.on_peak.active())
            .filter_map(|(c, a)| a.then_some(*c))
            .collect();
        DVector::from_vec(values)
    }

    pub fn background_counts_per_second_as_raw(&self) -> Vec<f64> {
        self.collector
            .from_counts_per_second(self.background.intensities())
    }

    pub fn on_peak_counts_per_second_as_raw(&self) -> Vec<f64> {
        self.collector.from_counts_per_second(self.on_peak.intensities())
    }

    pub fn fitted_on_peak_counts_per_second_as_raw(&self) -> Vec<f64> {
        self.collector
            .from_counts_per_second(self.on_peak.fitted_background())
    }

    pub fn corrected_on_peak_counts_per_second_as_raw(&self) -> Vec<f64> {
        self.collector.from_counts_per_second(self.on_peak.corrected())
    }

    /// Replace the raw readings of both series by counts per second
    pub fn convert_raw_intensities_to_counts_per_second(&mut self) -> Result<(), ModelError> {
        let background = self
            .collector
            .to_counts_per_second(self.background.intensities())
            .map_err(VarianceError::from)?;
        let on_peak = self
            .collector
            .to_counts_per_second(self.on_peak.intensities())
            .map_err(VarianceError::from)?;
        self.background.replace_intensities(background)?;
        self.on_peak.replace_intensities(on_peak)?;
        Ok(())
    }

    /// Apply the collector's resistor gain to the raw readings of both series
    pub fn correct_intensities_for_resistor(&mut self) -> Result<(), ModelError> {
        let background = self.collector.correct_for_resistor(self.background.intensities());
        let on_peak = self.collector.correct_for_resistor(self.on_peak.intensities());
        self.background.replace_intensities(background)?;
        self.on_peak.replace_intensities(on_peak)?;
        Ok(())
    }

    /// Use instrument supplied variances instead of the collector noise model
    pub fn override_variance_diagonal(&mut self, diagonal: Vec<f64>) -> Result<(), ModelError> {
        let expected = self.background.len() + self.on_peak.len();
        if diagonal.len() != expected {
            return Err(VarianceError::DimensionMismatch {
                expected,
                observed: diagonal.len(),
            }
            .into());
        }
        self.variance_diagonal = Some(diagonal);
        Ok(())
    }

    /// A covariance term, e.g. for an interfering isotope, to add to this
    /// channel's measurement covariance on the next [`RawIntensityModel::generate`] only
    pub fn set_interference_correction(&mut self, correction: VarianceModel) {
        self.interference_correction = Some(correction);
    }

    /// Withdraw a pending interference correction that has not been consumed yet
    pub fn take_interference_correction(&mut self) -> Option<VarianceModel> {
        self.interference_correction.take()
    }

    fn integration_time(&self) -> f64 {
        self.config
            .integration_time
            .unwrap_or(self.period_ms / 1000.0)
    }

    fn builder(&self) -> VarianceModelBuilder<'_> {
        VarianceModelBuilder::new(
            &self.collector,
            self.config.propagation_mode(),
            self.integration_time(),
        )
    }

    /// The measurement covariance of this channel without any correction
    /// folded in, for use as another channel's interference correction
    pub fn build_exportable_covariance(&self) -> Result<VarianceModel, ModelError> {
        let diagonal = match &self.variance_diagonal {
            Some(d) => d.clone(),
            None => self.builder().build_diagonal(&self.background, &self.on_peak)?,
        };
        let mut all = self.background.intensities().to_vec();
        all.extend_from_slice(self.on_peak.intensities());
        let model = self
            .collector
            .build_variance_model(&diagonal, &all, self.config.propagation_mode())
            .map_err(VarianceError::from)?;
        Ok(model)
    }

    /// AND `mask` into the on-peak active mask, then [`RawIntensityModel::generate`]
    pub fn generate_with_masking(&mut self, mask: &[bool]) -> Result<GenerateReport, ModelError> {
        self.on_peak.apply_mask(mask)?;
        self.generate()
    }

    /// Prepare the variance, fit the requested baseline function and evaluate it
    /// over both series
    pub fn generate(&mut self) -> Result<GenerateReport, ModelError> {
        let mode = self.config.propagation_mode();
        debug!("Calculating fit functions for {} using {mode}", self.channel);
        self.state = FitState::Raw;
        self.sopbclr = None;
        self.variance = None;
        self.fit_functions.clear();
        self.background.clear_fitted_background();
        self.on_peak.clear_fitted_background();

        let builder = VarianceModelBuilder::new(&self.collector, mode, self.integration_time());
        let prepared = builder.prepare(
            &self.background,
            &self.on_peak,
            self.variance_diagonal.as_deref(),
            &mut self.interference_correction,
        )?;
        self.state = FitState::VariancePrepared;

        let requested = if prepared.degenerate {
            FitFunctionType::Constant
        } else {
            self.config.fit_function_type
        };

        let background_times = self.normalized_background_times();
        let args = BaselineFitArgs::new(
            &background_times,
            self.background.intensities(),
            self.background.active(),
            &prepared.background,
        );
        let fitter = BaselineFitter::new(args, &self.config.solver);
        let outcome = match requested {
            FitFunctionType::None => FitOutcome::ok(FitFunctionType::None),
            FitFunctionType::Constant => fitter
                .fit_constant(&mut self.fit_functions, self.config.constant_value)
                .unwrap_or_else(|err| {
                    warn!("Constant fit for {} failed: {err}", self.channel);
                    FitOutcome {
                        selected: FitFunctionType::Constant,
                        degraded: Some(err),
                    }
                }),
            FitFunctionType::Mean | FitFunctionType::Line => {
                if self.config.force_mean_for_common_lead_ratios {
                    fitter.force_mean(&mut self.fit_functions, self.config.forced_mean_value)
                } else {
                    fitter.fit_nonlinear(
                        requested,
                        &mut self.fit_functions,
                        self.config.forced_mean_value,
                    )
                }
            }
        };
        self.selected_fit_function_type = outcome.selected;
        self.state = FitState::FitSelected;

        self.evaluate_selected_fit_function(&background_times)?;
        self.state = FitState::FitEvaluated;

        self.variance = Some(prepared.full);
        self.state = FitState::Ready;
        debug!(
            "{} ready with {} baseline{}",
            self.channel,
            outcome.selected,
            if outcome.is_degraded() { " (degraded)" } else { "" }
        );

        Ok(GenerateReport {
            channel: self.channel.clone(),
            mode,
            selected: outcome.selected,
            degenerate_background: prepared.degenerate,
            degraded: outcome.degraded,
        })
    }

    fn evaluate_selected_fit_function(&mut self, background_times: &[f64]) -> Result<(), ModelError> {
        let on_peak_times = self.normalized_on_peak_times();
        let Some((background_fit, on_peak_fit)) = self
            .selected_fit_function()
            .map(|func| (func.predict(background_times), func.predict(&on_peak_times)))
        else {
            self.background.clear_fitted_background();
            self.on_peak.clear_fitted_background();
            return Ok(());
        };
        self.background.set_fitted_background(background_fit)?;
        self.on_peak.set_fitted_background(on_peak_fit)?;
        Ok(())
    }

    /// Build the Jacobian chain for the selected fit function against the retained variance model
    pub fn jacobian_chain(&self) -> Result<JacobianChain, PropagationError> {
        if self.state != FitState::Ready {
            return Err(PropagationError::NotReady(self.state));
        }
        let function = self
            .selected_fit_function()
            .ok_or(PropagationError::NoFitFunction)?;
        let variance = self
            .variance
            .as_ref()
            .ok_or(PropagationError::MissingVarianceModel)?;
        let normalized_on_peak_times = self.normalized_on_peak_times();
        let inputs = PropagationInputs {
            function,
            variance,
            background_len: self.background.len(),
            on_peak_active: self.on_peak.active(),
            normalized_on_peak_times: &normalized_on_peak_times,
            on_peak_intensities: self.on_peak.intensities(),
            on_peak_corrected: self.on_peak.corrected(),
        };
        propagate(&inputs)
    }

    /// Derive and store the covariance of the logs of the active corrected
    /// on-peak intensities. Failures are logged and leave no covariance.
    pub fn propagate_uncertainties(&mut self) -> Option<&DMatrix<f64>> {
        self.sopbclr = None;
        if self.selected_fit_function_type == FitFunctionType::None {
            return None;
        }
        match self.jacobian_chain() {
            Ok(chain) => self.sopbclr = Some(chain.sopbclr),
            Err(err) => warn!("Uncertainty propagation for {} failed: {err}", self.channel),
        }
        self.sopbclr.as_ref()
    }

    /// The covariance of the logs of the active corrected on-peak intensities,
    /// when the last propagation succeeded
    pub fn sopbclr(&self) -> Option<&DMatrix<f64>> {
        self.sopbclr.as_ref()
    }

    /// The retained measurement covariance over background ⧺ on-peak
    pub fn variance_model(&self) -> Option<&VarianceModel> {
        self.variance.as_ref()
    }

    /// Release the retained covariance matrices
    pub fn cleanup(&mut self) {
        self.variance = None;
        self.sopbclr = None;
    }
}

impl Display for RawIntensityModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} ({}), {} background and {} on-peak samples",
            self.channel,
            self.collector.collector_type(),
            self.background.len(),
            self.on_peak.len()
        )?;
        writeln!(f, "background: {:?}", self.background.intensities())?;
        writeln!(f, "on-peak: {:?}", self.on_peak.intensities())?;
        match self.selected_fit_function() {
            Some(func) => write!(f, "fit: {func}"),
            None => write!(f, "fit: {}", self.selected_fit_function_type),
        }
    }
}
