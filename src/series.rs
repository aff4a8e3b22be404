//! Parallel sample sequences acquired for one channel, either while the beam
//! is off-peak ("background") or on the measured mass ("on-peak").
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// All the ways an [`AcquisitionSeries`] can be built or updated incorrectly
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SeriesError {
    #[error("Series sequence {name} has length {observed}, expected {expected}")]
    LengthMismatch {
        name: &'static str,
        expected: usize,
        observed: usize,
    },
    #[error("Sample index {0} is out of bounds")]
    IndexOutOfBounds(usize),
}

fn check_len(name: &'static str, expected: usize, observed: usize) -> Result<(), SeriesError> {
    if expected != observed {
        Err(SeriesError::LengthMismatch {
            name,
            expected,
            observed,
        })
    } else {
        Ok(())
    }
}

/// One ordered run of intensity samples with their acquisition times, active
/// mask and everything derived from fitting a baseline to them.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AcquisitionSeries {
    intensities: Vec<f64>,
    acquire_times: Vec<f64>,
    active: Vec<bool>,
    analog_correction_factors: Vec<f64>,
    fitted_background: Vec<f64>,
    corrected: Vec<f64>,
    log_corrected: Vec<f64>,
}

impl AcquisitionSeries {
    /// Create a series with every sample active and unit analog correction factors.
    ///
    /// `acquire_times` are in milliseconds.
    pub fn new(intensities: Vec<f64>, acquire_times: Vec<f64>) -> Result<Self, SeriesError> {
        check_len("acquire_times", intensities.len(), acquire_times.len())?;
        let n = intensities.len();
        Ok(Self {
            intensities,
            acquire_times,
            active: vec![true; n],
            analog_correction_factors: vec![1.0; n],
            fitted_background: vec![0.0; n],
            corrected: vec![0.0; n],
            log_corrected: vec![0.0; n],
        })
    }

    /// Create a series with evenly spaced acquisition times starting at `start` milliseconds
    pub fn evenly_spaced(intensities: Vec<f64>, start: f64, period: f64) -> Self {
        let times = (0..intensities.len())
            .map(|i| start + i as f64 * period)
            .collect();
        Self::new(intensities, times).unwrap_or_default()
    }

    pub fn with_active(mut self, active: Vec<bool>) -> Result<Self, SeriesError> {
        check_len("active", self.len(), active.len())?;
        self.active = active;
        Ok(self)
    }

    pub fn with_analog_correction_factors(mut self, factors: Vec<f64>) -> Result<Self, SeriesError> {
        check_len("analog_correction_factors", self.len(), factors.len())?;
        self.analog_correction_factors = factors;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }

    pub fn intensities(&self) -> &[f64] {
        &self.intensities
    }

    pub fn acquire_times(&self) -> &[f64] {
        &self.acquire_times
    }

    pub fn active(&self) -> &[bool] {
        &self.active
    }

    pub fn analog_correction_factors(&self) -> &[f64] {
        &self.analog_correction_factors
    }

    pub fn fitted_background(&self) -> &[f64] {
        &self.fitted_background
    }

    pub fn corrected(&self) -> &[f64] {
        &self.corrected
    }

    pub fn log_corrected(&self) -> &[f64] {
        &self.log_corrected
    }

    /// The number of samples currently included
    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|a| **a).count()
    }

    /// The positions of the included samples, in order
    pub fn active_positions(&self) -> Vec<usize> {
        self.active
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.then_some(i))
            .collect()
    }

    /// Include or exclude a single sample
    pub fn toggle(&mut self, index: usize, included: bool) -> Result<(), SeriesError> {
        match self.active.get_mut(index) {
            Some(slot) => {
                *slot = included;
                Ok(())
            }
            None => Err(SeriesError::IndexOutOfBounds(index)),
        }
    }

    /// Logical AND the active mask with `mask`
    pub fn apply_mask(&mut self, mask: &[bool]) -> Result<(), SeriesError> {
        check_len("mask", self.len(), mask.len())?;
        self.active
            .iter_mut()
            .zip(mask.iter())
            .for_each(|(a, m)| *a = *a && *m);
        Ok(())
    }

    /// Replace the raw intensities, keeping every other sequence.
    pub fn replace_intensities(&mut self, intensities: Vec<f64>) -> Result<(), SeriesError> {
        check_len("intensities", self.len(), intensities.len())?;
        self.intensities = intensities;
        Ok(())
    }

    /// Store the evaluated baseline and derive the corrected and log-corrected sequences.
    ///
    /// Log-corrected values are `NaN` where the corrected intensity is not positive.
    pub fn set_fitted_background(&mut self, fitted: Vec<f64>) -> Result<(), SeriesError> {
        check_len("fitted_background", self.len(), fitted.len())?;
        self.corrected = self
            .intensities
            .iter()
            .zip(fitted.iter())
            .map(|(i, f)| i - f)
            .collect();
        self.log_corrected = log_or_nan(&self.corrected);
        self.fitted_background = fitted;
        Ok(())
    }

    /// Reset fitted values so that corrected equals raw
    pub fn clear_fitted_background(&mut self) {
        self.fitted_background = vec![0.0; self.len()];
        self.corrected = self.intensities.clone();
        self.log_corrected = log_or_nan(&self.corrected);
    }
}

fn log_or_nan(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .map(|c| if *c > 0.0 { c.ln() } else { f64::NAN })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_construction_lengths() {
        let err = AcquisitionSeries::new(vec![1.0, 2.0], vec![0.0]).unwrap_err();
        assert_eq!(
            err,
            SeriesError::LengthMismatch {
                name: "acquire_times",
                expected: 2,
                observed: 1
            }
        );
        let s = AcquisitionSeries::evenly_spaced(vec![1.0, 2.0, 3.0], 0.0, 1000.0);
        assert_eq!(s.acquire_times(), &[0.0, 1000.0, 2000.0]);
        assert_eq!(s.analog_correction_factors(), &[1.0, 1.0, 1.0]);
        assert!(s.clone().with_active(vec![true]).is_err());
    }

    #[test]
    fn test_masking() {
        let mut s = AcquisitionSeries::evenly_spaced(vec![1.0, 2.0, 3.0, 4.0], 0.0, 1.0);
        s.toggle(1, false).unwrap();
        assert_eq!(s.active_positions(), vec![0, 2, 3]);
        s.apply_mask(&[true, true, true, false]).unwrap();
        assert_eq!(s.active(), &[true, false, true, false]);
        assert_eq!(s.active_count(), 2);
        assert_eq!(s.len(), 4);
        s.toggle(1, true).unwrap();
        assert_eq!(s.active_count(), 3);
        assert!(s.toggle(4, true).is_err());
        assert!(s.apply_mask(&[true]).is_err());
    }

    #[test]
    fn test_fitted_background() {
        let mut s = AcquisitionSeries::evenly_spaced(vec![110.0, 5.0], 0.0, 1.0);
        s.set_fitted_background(vec![10.0, 10.0]).unwrap();
        assert_eq!(s.corrected(), &[100.0, -5.0]);
        assert!((s.log_corrected()[0] - 100f64.ln()).abs() < 1e-12);
        assert!(s.log_corrected()[1].is_nan());
        s.clear_fitted_background();
        assert_eq!(s.corrected(), s.intensities());
        assert_eq!(s.fitted_background(), &[0.0, 0.0]);
        assert!((s.log_corrected()[1] - 5f64.ln()).abs() < 1e-12);
    }
}
