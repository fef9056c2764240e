//! This module provides the `Operator` trait and the global registry of analysis operators.
//! Operators turn a spectrum image plus an immutable `AnalysisRequest` into an `AnalysisOutput`
//! (a subtracted cube, a signal map or a principal component decomposition).

use crate::calibration::Calibration;
use crate::data_container::SpectrumImage;
use crate::error::AnalysisError;
use crate::fit::FitResult;
use crate::pca::PcaResult;
use crate::request::AnalysisRequest;
#[allow(unused_imports)] // this dependency is required by the `register_operator` macro
use ctor::ctor;
use ndarray::Array2;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, RwLock};

/// Receives the fractional progress of a running operator.
///
/// `Some(fraction)` with a fraction in `0.0..=1.0` while the operator runs, `None` once it is done.
pub trait ProgressSink: Sync {
    fn report_progress(&self, fraction: Option<f32>);
}

/// The progress lock shared with the thread that displays progress.
impl ProgressSink for RwLock<Option<f32>> {
    fn report_progress(&self, fraction: Option<f32>) {
        if let Ok(mut progress) = self.write() {
            *progress = fraction;
        }
    }
}

/// Discards progress.
impl ProgressSink for () {
    fn report_progress(&self, _fraction: Option<f32>) {}
}

/// The kind of analysis an operator performs; decides the session state it leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    /// Background subtraction of the whole cube.
    Subtract,
    /// Trapezoidal integration of the background-subtracted signal.
    Integrate,
    /// Chi-squared style integration of the background-subtracted signal.
    HcmIntegrate,
    /// (Weighted) principal component analysis over the PCA window.
    PrincipalComponents,
}

impl Display for OperatorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatorKind::Subtract => write!(f, "subtract"),
            OperatorKind::Integrate => write!(f, "integrate"),
            OperatorKind::HcmIntegrate => write!(f, "hcm"),
            OperatorKind::PrincipalComponents => write!(f, "pca"),
        }
    }
}

/// Metadata of an operator.
///
/// # Fields
/// - `name`: human-readable name, also the registry key.
/// - `description`: what the operator computes.
/// - `hyperlink`: optional reference `(label, url)`.
/// - `kind`: the analysis performed.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub name: String,
    pub description: String,
    pub hyperlink: Option<(Option<String>, String)>,
    pub kind: OperatorKind,
}

/// What an operator produces.
#[derive(Debug, Clone)]
pub enum AnalysisOutput {
    /// Background-subtracted cube and the fit that was removed.
    Subtracted {
        cube: SpectrumImage,
        fit: FitResult,
    },
    /// Net signal map `(width, height)`; `scale` is set when the oversampled fit was rescaled.
    Integrated {
        map: Array2<f64>,
        scale: Option<Array2<f64>>,
    },
    /// Chi-squared style map `(width, height)` and the number of non-finite pixels in it.
    HcmIntegrated { map: Array2<f64>, non_finite: usize },
    /// Principal component decomposition.
    Components(PcaResult),
    /// Cube rebuilt from the first `components` principal components.
    Reconstructed {
        cube: SpectrumImage,
        components: usize,
    },
}

/// An analysis step over a spectrum image.
///
/// Implementors derive `Clone` and `Debug` and are registered with `#[register_operator]`; the
/// module also has to be listed in `src/operators/mod.rs`.
///
/// **Example**:
/// ```ignore
/// #[register_operator]
/// #[derive(Clone, Debug)]
/// pub struct ExampleOperator;
///
/// impl Operator for ExampleOperator {
///     fn new() -> Self { ExampleOperator }
///
///     fn config(&self) -> OperatorConfig {
///         OperatorConfig {
///             name: "Example".to_string(),
///             description: "Does nothing useful.".to_string(),
///             hyperlink: None,
///             kind: OperatorKind::Integrate,
///         }
///     }
///
///     fn apply(
///         &self,
///         input: &SpectrumImage,
///         calibration: &Calibration,
///         request: &AnalysisRequest,
///         progress: &dyn ProgressSink,
///         abort_flag: &AtomicBool,
///     ) -> Result<AnalysisOutput, AnalysisError> {
///         todo!()
///     }
/// }
/// ```
pub trait Operator: Send + Sync + Debug + CloneBoxedOperator {
    /// Creates a new instance of the operator.
    fn new() -> Self
    where
        Self: Sized;

    /// Returns the operator metadata.
    fn config(&self) -> OperatorConfig;

    /// Applies the operator.
    ///
    /// # Arguments
    /// - `input`: The spectrum image; it is not modified.
    /// - `calibration`: Energy calibration providing the x-axis of every fit.
    /// - `request`: Windows, model and flags of this call.
    /// - `progress`: Receives fractional progress.
    /// - `abort_flag`: Aborts the calculation; the operator then returns `AnalysisError::Cancelled`.
    fn apply(
        &self,
        input: &SpectrumImage,
        calibration: &Calibration,
        request: &AnalysisRequest,
        progress: &dyn ProgressSink,
        abort_flag: &AtomicBool,
    ) -> Result<AnalysisOutput, AnalysisError>;
}

/// Allows cloning boxed operators so they can be taken out of the locked registry.
pub trait CloneBoxedOperator {
    fn clone_box(&self) -> Box<dyn Operator>;
}

impl<T> CloneBoxedOperator for T
where
    T: 'static + Operator + Clone,
{
    fn clone_box(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn Operator> {
    fn clone(&self) -> Box<dyn Operator> {
        self.as_ref().clone_box()
    }
}

/// Registered operators, keyed by name.
#[derive(Debug)]
pub struct OperatorRegistry {
    pub operators: HashMap<String, Box<dyn Operator>>,
}

impl OperatorRegistry {
    /// Registers an operator of type `O` in the global [`OPERATOR_REGISTRY`].
    pub fn register_operator<O: Operator + 'static>() {
        let operator = O::new();
        let name = operator.config().name;
        match OPERATOR_REGISTRY.lock() {
            Ok(mut registry) => {
                registry.operators.insert(name, Box::new(operator));
            }
            Err(err) => {
                log::error!("failed to register operator {name}: {err}");
            }
        }
    }

    /// Retrieves the operator performing `kind`.
    pub fn get_by_kind(&self, kind: OperatorKind) -> Option<&Box<dyn Operator>> {
        self.operators
            .values()
            .find(|operator| operator.config().kind == kind)
    }
}

impl<'a> IntoIterator for &'a OperatorRegistry {
    type Item = &'a Box<dyn Operator>;
    type IntoIter = std::collections::hash_map::Values<'a, String, Box<dyn Operator>>;

    fn into_iter(self) -> Self::IntoIter {
        self.operators.values()
    }
}

/// A global, thread-safe operator registry, filled at program start by `#[register_operator]`.
pub static OPERATOR_REGISTRY: Lazy<Mutex<OperatorRegistry>> = Lazy::new(|| {
    Mutex::new(OperatorRegistry {
        operators: HashMap::new(),
    })
});

/// Clones the operator performing `kind` out of the global registry.
pub fn operator_for(kind: OperatorKind) -> Result<Box<dyn Operator>, AnalysisError> {
    let registry = OPERATOR_REGISTRY
        .lock()
        .map_err(|_| AnalysisError::UnknownOperator(kind.to_string()))?;
    registry
        .get_by_kind(kind)
        .cloned()
        .ok_or_else(|| AnalysisError::UnknownOperator(kind.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_is_registered() {
        for kind in [
            OperatorKind::Subtract,
            OperatorKind::Integrate,
            OperatorKind::HcmIntegrate,
            OperatorKind::PrincipalComponents,
        ] {
            let operator = operator_for(kind).unwrap();
            assert_eq!(operator.config().kind, kind);
        }
    }

    #[test]
    fn test_registry_lookup_by_name() {
        let registry = OPERATOR_REGISTRY.lock().unwrap();
        assert!(registry.operators.contains_key("Background Subtraction"));
        assert!(!registry.operators.contains_key("Deconvolution"));
        assert_eq!(registry.into_iter().count(), 4);
    }

    #[test]
    fn test_progress_lock_receives_fraction() {
        let lock = RwLock::new(None);
        lock.report_progress(Some(0.5));
        assert_eq!(*lock.read().unwrap(), Some(0.5));
        lock.report_progress(None);
        assert_eq!(*lock.read().unwrap(), None);
    }
}
