#[cfg(feature = "residency-base")]
pub use residency_base as base;

#[cfg(feature = "residency-loader")]
pub use residency_loader as loader;
