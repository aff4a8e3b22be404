use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{BaselineFunction, FitFunction, FitFunctionType};

/// The fitted baseline functions of one channel, kept twice: once as fit with
/// an overdispersion term and once without
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitFunctionRegistry {
    with_od: BTreeMap<FitFunctionType, FitFunction>,
    no_od: BTreeMap<FitFunctionType, FitFunction>,
}

impl FitFunctionRegistry {
    /// The map read when overdispersion is or is not selected
    pub fn functions(&self, overdispersion_selected: bool) -> &BTreeMap<FitFunctionType, FitFunction> {
        if overdispersion_selected {
            &self.with_od
        } else {
            &self.no_od
        }
    }

    pub fn get(&self, fit_type: FitFunctionType, overdispersion_selected: bool) -> Option<&FitFunction> {
        self.functions(overdispersion_selected).get(&fit_type)
    }

    /// Store the same function in both maps
    pub fn insert_both(&mut self, fit_type: FitFunctionType, func: FitFunction) {
        self.with_od.insert(fit_type, func.clone());
        self.no_od.insert(fit_type, func);
    }

    pub fn insert_pair(&mut self, fit_type: FitFunctionType, with_od: FitFunction, no_od: FitFunction) {
        self.with_od.insert(fit_type, with_od);
        self.no_od.insert(fit_type, no_od);
    }

    /// Whether a function of `fit_type` has been fit, in either map
    pub fn contains(&self, fit_type: FitFunctionType) -> bool {
        self.with_od.contains_key(&fit_type) || self.no_od.contains_key(&fit_type)
    }

    /// Whether the overdispersed function of `fit_type` actually carries an overdispersion term
    pub fn has_overdispersion(&self, fit_type: FitFunctionType) -> bool {
        self.with_od
            .get(&fit_type)
            .is_some_and(|f| f.is_overdispersion_variant())
    }

    /// The square root of the overdispersion of `fit_type`, `0` when none was estimated
    pub fn xi(&self, fit_type: FitFunctionType) -> f64 {
        self.with_od
            .get(&fit_type)
            .and_then(|f| f.overdispersion())
            .map(|od| od.max(0.0).sqrt())
            .unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.with_od.is_empty() && self.no_od.is_empty()
    }

    pub fn clear(&mut self) {
        self.with_od.clear();
        self.no_od.clear();
    }
}

#[cfg(test)]
mod test {
    use nalgebra::{DMatrix, DVector};

    use super::*;
    use crate::fit_functions::{FittedParameters, MeanFunction};

    fn mean(value: f64, od: Option<f64>) -> FitFunction {
        MeanFunction::from_fitted(FittedParameters::new(
            DVector::from_element(1, value),
            DMatrix::from_element(1, 1, 1.0),
            None,
            od,
        ))
        .into()
    }

    #[test]
    fn test_selection_by_flag() {
        let mut registry = FitFunctionRegistry::default();
        assert!(registry.is_empty());
        registry.insert_pair(FitFunctionType::Mean, mean(2.0, Some(4.0)), mean(1.0, None));
        assert_eq!(registry.get(FitFunctionType::Mean, true).unwrap().parameters(), &[2.0]);
        assert_eq!(registry.get(FitFunctionType::Mean, false).unwrap().parameters(), &[1.0]);
        assert!(registry.has_overdispersion(FitFunctionType::Mean));
        assert_eq!(registry.xi(FitFunctionType::Mean), 2.0);
        assert!(registry.get(FitFunctionType::Line, true).is_none());

        registry.insert_both(FitFunctionType::Constant, mean(3.0, None));
        assert!(registry.contains(FitFunctionType::Constant));
        assert!(!registry.has_overdispersion(FitFunctionType::Constant));
        assert_eq!(registry.xi(FitFunctionType::Constant), 0.0);
        assert_eq!(registry.functions(false).len(), 2);

        registry.clear();
        assert!(!registry.contains(FitFunctionType::Mean));
    }
}
