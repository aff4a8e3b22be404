//! Detector models converting raw readings into counts per second and
//! describing the measurement noise of each sample.
//!
//! Two kinds of collector are supported:
//! - [`CollectorKind::Faraday`] cups read a voltage across a high-ohm resistor
//! - [`CollectorKind::IonCounter`] detectors count ions directly but lose some
//!   to dead time at high count rates
//!
//! All transforms are elementwise and return a new sequence.
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::variance::{PropagationMode, VarianceModel};

/// The elementary charge in coulombs
pub const ELEMENTARY_CHARGE: f64 = 1.602176634e-19;
/// The Boltzmann constant in joules per kelvin
pub const BOLTZMANN_CONSTANT: f64 = 1.380649e-23;

/// All the ways building a measurement variance can fail
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollectorError {
    #[error("Invalid variance model: {0}")]
    InvalidVarianceModel(String),
    #[error("Sample {index} reads {rate} counts/s, at or beyond the dead time limit of {limit} counts/s")]
    DeadTimeSaturation { index: usize, rate: f64, limit: f64 },
}

/// The physical detector a channel was read on
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CollectorKind {
    Faraday {
        resistance_ohms: f64,
        /// The relative gain of the amplifier resistor against the reference
        resistor_gain: f64,
        temperature_kelvin: f64,
    },
    IonCounter {
        dead_time_seconds: f64,
    },
}

/// A detector together with the relative uncertainty of its gain calibration
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CollectorModel {
    pub kind: CollectorKind,
    /// The relative standard uncertainty of the gain calibration, shared by
    /// every sample read on this collector
    pub relative_gain_uncertainty: f64,
}

impl CollectorModel {
    pub fn new(kind: CollectorKind, relative_gain_uncertainty: f64) -> Self {
        Self {
            kind,
            relative_gain_uncertainty,
        }
    }

    /// A Faraday cup at room temperature with a unit resistor gain
    pub fn faraday(resistance_ohms: f64) -> Self {
        Self::new(
            CollectorKind::Faraday {
                resistance_ohms,
                resistor_gain: 1.0,
                temperature_kelvin: 290.0,
            },
            0.0,
        )
    }

    pub fn ion_counter(dead_time_seconds: f64) -> Self {
        Self::new(CollectorKind::IonCounter { dead_time_seconds }, 0.0)
    }

    pub fn relative_gain_uncertainty(mut self, value: f64) -> Self {
        self.relative_gain_uncertainty = value;
        self
    }

    /// A short tag for log messages
    pub fn collector_type(&self) -> &'static str {
        match self.kind {
            CollectorKind::Faraday { .. } => "FARADAY",
            CollectorKind::IonCounter { .. } => "ION_COUNTER",
        }
    }

    /// Convert raw readings into counts per second.
    ///
    /// Faraday readings are volts, `v / (R e)`. Ion counter readings are
    /// observed counts per second, corrected for dead time as `c / (1 - c τ)`,
    /// which only holds below the saturation rate `1 / τ`.
    pub fn to_counts_per_second(&self, raw: &[f64]) -> Result<Vec<f64>, CollectorError> {
        match self.kind {
            CollectorKind::Faraday {
                resistance_ohms, ..
            } => {
                let scale = resistance_ohms * ELEMENTARY_CHARGE;
                Ok(raw.iter().map(|v| v / scale).collect())
            }
            CollectorKind::IonCounter { dead_time_seconds } => raw
                .iter()
                .enumerate()
                .map(|(index, c)| {
                    let live = 1.0 - c * dead_time_seconds;
                    if live > 0.0 {
                        Ok(c / live)
                    } else {
                        Err(CollectorError::DeadTimeSaturation {
                            index,
                            rate: *c,
                            limit: 1.0 / dead_time_seconds,
                        })
                    }
                })
                .collect(),
        }
    }

    /// The inverse of [`CollectorModel::to_counts_per_second`]
    pub fn from_counts_per_second(&self, cps: &[f64]) -> Vec<f64> {
        match self.kind {
            CollectorKind::Faraday {
                resistance_ohms, ..
            } => {
                let scale = resistance_ohms * ELEMENTARY_CHARGE;
                cps.iter().map(|c| c * scale).collect()
            }
            CollectorKind::IonCounter { dead_time_seconds } => cps
                .iter()
                .map(|c| c / (1.0 + c * dead_time_seconds))
                .collect(),
        }
    }

    /// Apply the amplifier resistor gain. Ion counters are returned unchanged.
    pub fn correct_for_resistor(&self, raw: &[f64]) -> Vec<f64> {
        match self.kind {
            CollectorKind::Faraday { resistor_gain, .. } => {
                raw.iter().map(|v| v * resistor_gain).collect()
            }
            CollectorKind::IonCounter { .. } => raw.to_vec(),
        }
    }

    /// The variance of the Johnson-Nyquist noise of the resistor, in (counts/s)^2,
    /// for one integration of `integration_time` seconds
    pub fn johnson_noise_variance(&self, integration_time: f64) -> f64 {
        match self.kind {
            CollectorKind::Faraday {
                resistance_ohms,
                temperature_kelvin,
                ..
            } => {
                4.0 * BOLTZMANN_CONSTANT * temperature_kelvin
                    / (resistance_ohms * ELEMENTARY_CHARGE * ELEMENTARY_CHARGE * integration_time)
            }
            CollectorKind::IonCounter { .. } => 0.0,
        }
    }

    /// Build one variance per sample of `all_intensities` (background followed by
    /// on-peak, in counts per second).
    ///
    /// The counting term `max(I, 0) * acf / t` is combined with the collector's
    /// own noise. Negative intensities contribute no counting variance.
    pub fn build_variance_diagonal(
        &self,
        background_len: usize,
        analog_correction_factors: &[f64],
        all_intensities: &[f64],
        integration_time: f64,
    ) -> Result<Vec<f64>, CollectorError> {
        if background_len > all_intensities.len() {
            return Err(CollectorError::InvalidVarianceModel(format!(
                "background length {background_len} exceeds sample count {}",
                all_intensities.len()
            )));
        }
        if analog_correction_factors.len() != all_intensities.len() {
            return Err(CollectorError::InvalidVarianceModel(format!(
                "{} analog correction factors for {} samples",
                analog_correction_factors.len(),
                all_intensities.len()
            )));
        }
        if !(integration_time.is_finite() && integration_time > 0.0) {
            return Err(CollectorError::InvalidVarianceModel(format!(
                "integration time must be positive, got {integration_time}"
            )));
        }
        let floor = self.johnson_noise_variance(integration_time);
        all_intensities
            .iter()
            .zip(analog_correction_factors.iter())
            .enumerate()
            .map(|(i, (intensity, acf))| {
                if !intensity.is_finite() || !acf.is_finite() || *acf < 0.0 {
                    return Err(CollectorError::InvalidVarianceModel(format!(
                        "sample {i} has intensity {intensity} and analog correction factor {acf}"
                    )));
                }
                Ok(intensity.max(0.0) * acf / integration_time + floor)
            })
            .collect()
    }

    /// Expand a variance diagonal into a full covariance matrix
    /// `diag(d) + g^2 I I^T` sharing the gain calibration uncertainty across samples
    pub fn build_covariance_matrix(
        &self,
        diagonal: &[f64],
        all_intensities: &[f64],
    ) -> Result<DMatrix<f64>, CollectorError> {
        self.check_expansion(diagonal, all_intensities)?;
        let g2 = self.relative_gain_uncertainty.powi(2);
        let intensities = DVector::from_column_slice(all_intensities);
        let mut cov = (&intensities * intensities.transpose()) * g2;
        for (i, d) in diagonal.iter().enumerate() {
            cov[(i, i)] += d;
        }
        Ok(cov)
    }

    /// The diagonal of [`CollectorModel::build_covariance_matrix`], `d + g^2 I^2`
    pub fn build_variance_vector(
        &self,
        diagonal: &[f64],
        all_intensities: &[f64],
    ) -> Result<DVector<f64>, CollectorError> {
        self.check_expansion(diagonal, all_intensities)?;
        let g2 = self.relative_gain_uncertainty.powi(2);
        Ok(DVector::from_iterator(
            diagonal.len(),
            diagonal
                .iter()
                .zip(all_intensities.iter())
                .map(|(d, i)| d + g2 * i * i),
        ))
    }

    /// Build the variance model matching `mode`
    pub fn build_variance_model(
        &self,
        diagonal: &[f64],
        all_intensities: &[f64],
        mode: PropagationMode,
    ) -> Result<VarianceModel, CollectorError> {
        match mode {
            PropagationMode::Full => self
                .build_covariance_matrix(diagonal, all_intensities)
                .map(VarianceModel::Full),
            PropagationMode::Fast => self
                .build_variance_vector(diagonal, all_intensities)
                .map(VarianceModel::Diagonal),
        }
    }

    fn check_expansion(&self, diagonal: &[f64], all_intensities: &[f64]) -> Result<(), CollectorError> {
        if diagonal.len() != all_intensities.len() {
            return Err(CollectorError::InvalidVarianceModel(format!(
                "variance diagonal has {} entries for {} samples",
                diagonal.len(),
                all_intensities.len()
            )));
        }
        if let Some(d) = diagonal.iter().find(|d| !(d.is_finite() && **d >= 0.0)) {
            return Err(CollectorError::InvalidVarianceModel(format!(
                "variance diagonal contains {d}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::numeric::relative_close;

    #[rstest::fixture]
    fn raw_readings() -> Vec<f64> {
        vec![0.0, 1e-6, 0.0125, 0.5, 3.0, 17.25, 1e3, 2.5e5]
    }

    #[rstest::rstest]
    #[case::faraday(CollectorModel::faraday(1e11))]
    #[case::faraday_1e13(CollectorModel::faraday(1e13))]
    #[case::ion_counter(CollectorModel::ion_counter(20e-9))]
    #[case::ion_counter_no_dead_time(CollectorModel::ion_counter(0.0))]
    fn test_round_trip(raw_readings: Vec<f64>, #[case] collector: CollectorModel) {
        let cps = collector.to_counts_per_second(&raw_readings).unwrap();
        let back = collector.from_counts_per_second(&cps);
        for (a, b) in raw_readings.iter().zip(back.iter()) {
            assert!(relative_close(*a, *b, 1e-9), "{a} != {b}");
        }
    }

    #[test]
    fn test_faraday_scaling() {
        let collector = CollectorModel::faraday(1e11);
        let cps = collector.to_counts_per_second(&[1.0]).unwrap();
        assert!(relative_close(cps[0], 1.0 / (1e11 * ELEMENTARY_CHARGE), 1e-12));
        let ion = CollectorModel::ion_counter(0.0);
        assert_eq!(ion.to_counts_per_second(&[42.0]).unwrap(), vec![42.0]);
    }

    #[test]
    fn test_dead_time_saturation() {
        let collector = CollectorModel::ion_counter(1e-6);
        assert!(collector.to_counts_per_second(&[5e5]).unwrap()[0] > 5e5);
        match collector.to_counts_per_second(&[10.0, 2e6]) {
            Err(CollectorError::DeadTimeSaturation { index, rate, limit }) => {
                assert_eq!(index, 1);
                assert_eq!(rate, 2e6);
                assert!((limit - 1e6).abs() < 1e-3);
            }
            other => panic!("Expected dead time saturation, got {other:?}"),
        }
        assert!(collector.to_counts_per_second(&[5e6]).is_err());
    }

    #[test]
    fn test_resistor_correction() {
        let collector = CollectorModel::new(
            CollectorKind::Faraday {
                resistance_ohms: 1e11,
                resistor_gain: 1.5,
                temperature_kelvin: 290.0,
            },
            0.0,
        );
        let raw = vec![1.0, 2.0];
        assert_eq!(collector.correct_for_resistor(&raw), vec![1.5, 3.0]);
        assert_eq!(raw, vec![1.0, 2.0]);
        assert_eq!(
            CollectorModel::ion_counter(0.0).correct_for_resistor(&raw),
            raw
        );
    }

    #[test]
    fn test_variance_diagonal() {
        let collector = CollectorModel::ion_counter(0.0);
        let diag = collector
            .build_variance_diagonal(2, &[1.0, 2.0, 1.0], &[10.0, -4.0, 30.0], 0.5)
            .unwrap();
        assert_eq!(diag, vec![20.0, 0.0, 60.0]);

        let faraday = CollectorModel::faraday(1e11);
        let diag = faraday
            .build_variance_diagonal(1, &[1.0, 1.0], &[-5.0, 0.0], 1.0)
            .unwrap();
        assert!(diag.iter().all(|d| *d > 0.0));
        assert_eq!(diag[0], diag[1]);
        assert_eq!(diag[0], faraday.johnson_noise_variance(1.0));
    }

    #[test]
    fn test_variance_diagonal_rejects() {
        let collector = CollectorModel::ion_counter(0.0);
        assert!(collector
            .build_variance_diagonal(1, &[1.0], &[1.0, 2.0], 1.0)
            .is_err());
        assert!(collector
            .build_variance_diagonal(1, &[1.0], &[1.0], 0.0)
            .is_err());
        assert!(collector
            .build_variance_diagonal(1, &[1.0], &[f64::NAN], 1.0)
            .is_err());
        assert!(collector
            .build_variance_diagonal(3, &[1.0], &[1.0], 1.0)
            .is_err());
    }

    #[test]
    fn test_covariance_expansion() {
        let collector = CollectorModel::ion_counter(0.0).relative_gain_uncertainty(0.1);
        let intensities = [10.0, 20.0];
        let diag = [1.0, 2.0];
        let cov = collector.build_covariance_matrix(&diag, &intensities).unwrap();
        assert!((cov[(0, 0)] - 2.0).abs() < 1e-12);
        assert!((cov[(1, 1)] - 6.0).abs() < 1e-12);
        assert!((cov[(0, 1)] - 2.0).abs() < 1e-12);
        assert_eq!(cov[(0, 1)], cov[(1, 0)]);

        let vector = collector.build_variance_vector(&diag, &intensities).unwrap();
        assert_eq!(vector.len(), 2);
        assert!((vector[0] - cov[(0, 0)]).abs() < 1e-12);
        assert!((vector[1] - cov[(1, 1)]).abs() < 1e-12);

        assert!(collector.build_covariance_matrix(&[1.0], &intensities).is_err());
        assert!(collector
            .build_variance_vector(&[-1.0, 1.0], &intensities)
            .is_err());
    }
}
