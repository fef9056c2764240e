//! Analysis operators over spectrum images.
//!
//! Every operator implements the `Operator` trait defined in the `operator` module and is
//! registered at program start, so the worker thread can look operators up by their kind.
//!
//! # Operators
//!
//! * **Background subtraction**: removes the fitted background from every channel at or after
//!   the fit start.
//! * **Integration**: net signal of the integration window, optionally fitted on a spatially
//!   oversampled copy of the cube.
//! * **HCM integration**: chi-squared style significance of the integration window.
//! * **Principal components**: (weighted) PCA of the background-removed PCA window.

/// Core operator interfaces, the registry and the progress sink.
pub mod operator;

/// Removes the per-pixel background from the cube.
mod subtract;

/// Window integration and its chi-squared style variant.
mod integrate;

/// Principal component decomposition of the PCA window.
mod principal_components;
