//! Reduce many independent channels at once.
//!
//! Each channel is generated and propagated on its own; one channel failing
//! never stops the others. With the `parallelism` feature the channels are
//! spread over the `rayon` thread pool.
use std::collections::BTreeMap;

use cfg_if::cfg_if;
use log::{info, warn};
use nalgebra::DMatrix;

#[cfg(feature = "parallelism")]
use rayon::prelude::*;

use crate::channel::Channel;
use crate::model::{GenerateReport, ModelError, RawIntensityModel};
use crate::variance::VarianceModel;

/// The outcome of reducing one channel
#[derive(Debug, Clone)]
pub struct ChannelReport {
    pub channel: Channel,
    pub generated: Result<GenerateReport, ModelError>,
    /// The covariance of the logs of the corrected on-peak intensities, when propagation succeeded
    pub sopbclr: Option<DMatrix<f64>>,
}

impl ChannelReport {
    pub fn is_ok(&self) -> bool {
        self.generated.is_ok()
    }

    pub fn is_degraded(&self) -> bool {
        matches!(&self.generated, Ok(report) if report.is_degraded())
    }
}

/// Generate the fit functions of `model` and, when `propagate` is set,
/// propagate its uncertainties
pub fn reduce_channel(model: &mut RawIntensityModel, propagate: bool) -> ChannelReport {
    let generated = model.generate();
    let sopbclr = match &generated {
        Ok(_) if propagate => model.propagate_uncertainties().cloned(),
        Ok(_) => None,
        Err(err) => {
            warn!("Failed to generate fit functions for {}: {err}", model.channel());
            None
        }
    };
    ChannelReport {
        channel: model.channel().clone(),
        generated,
        sopbclr,
    }
}

cfg_if! {
    if #[cfg(feature = "parallelism")] {
        fn reduce_all_inner(models: &mut [RawIntensityModel], propagate: bool) -> Vec<ChannelReport> {
            models
                .par_iter_mut()
                .map(|model| reduce_channel(model, propagate))
                .collect()
        }
    } else {
        fn reduce_all_inner(models: &mut [RawIntensityModel], propagate: bool) -> Vec<ChannelReport> {
            models
                .iter_mut()
                .map(|model| reduce_channel(model, propagate))
                .collect()
        }
    }
}

/// Reduce every channel in `models`, returning one report per channel in the same order
pub fn reduce_all(models: &mut [RawIntensityModel], propagate: bool) -> Vec<ChannelReport> {
    let reports = reduce_all_inner(models, propagate);
    let failed = reports.iter().filter(|r| !r.is_ok()).count();
    let degraded = reports.iter().filter(|r| r.is_degraded()).count();
    info!(
        "Reduced {} channels, {failed} failed, {degraded} degraded",
        reports.len()
    );
    reports
}

/// Sort channels with the intuitive alphanumeric channel order
pub fn sort_by_channel(models: &mut [RawIntensityModel]) {
    models.sort_by(|a, b| a.channel().cmp(b.channel()));
}

/// Covariance terms exported by one channel and waiting to be folded into another
#[derive(Debug, Clone, Default)]
pub struct InterferenceCorrections {
    pending: BTreeMap<Channel, VarianceModel>,
}

impl InterferenceCorrections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn insert(&mut self, target: Channel, correction: VarianceModel) {
        self.pending.insert(target, correction);
    }

    /// Export the measurement covariance of `source` as the correction for `target`
    pub fn export_from(&mut self, source: &RawIntensityModel, target: Channel) -> Result<(), ModelError> {
        let correction = source.build_exportable_covariance()?;
        self.insert(target, correction);
        Ok(())
    }

    /// Hand the pending correction for `model`'s channel to it, if any.
    /// Each correction is handed out once.
    pub fn apply_to(&mut self, model: &mut RawIntensityModel) -> bool {
        match self.pending.remove(model.channel()) {
            Some(correction) => {
                model.set_interference_correction(correction);
                true
            }
            None => false,
        }
    }

    /// Hand out every pending correction whose channel is in `models`
    pub fn apply_all(&mut self, models: &mut [RawIntensityModel]) -> usize {
        models
            .iter_mut()
            .map(|m| self.apply_to(m))
            .filter(|applied| *applied)
            .count()
    }
}
