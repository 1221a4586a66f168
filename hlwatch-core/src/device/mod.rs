//! Device abstraction layer
//!
//! Provides a unified hardware monitoring interface over the vendor library,
//! a static canned device set and the synthetic fleet.

mod canned;
mod interface;
mod lifecycle;
mod real;
pub mod sysfs;
mod verbose;

pub use canned::StaticMonitor;
pub use interface::*;
pub(crate) use lifecycle::Lifecycle;
pub use real::{resolve_bus_id, RealMonitor};
pub use verbose::VerboseMonitor;

use std::sync::Arc;

use thiserror::Error;

use crate::synthetic::{SyntheticError, SyntheticMonitor};

/// Errors raised while selecting a provider
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("hlml provider unavailable: {0}")]
    Hlml(#[from] HlmlError),

    #[error("synthetic provider unavailable: {0}")]
    Synthetic(#[from] SyntheticError),
}

/// Create a hardware monitor for the requested provider
///
/// With `verbose` set the provider is wrapped so that every call is logged.
pub fn create_monitor(
    kind: ProviderKind,
    verbose: bool,
) -> Result<Arc<dyn HardwareMonitor>, ProviderError> {
    let monitor: Arc<dyn HardwareMonitor> = match kind {
        ProviderKind::Auto => match RealMonitor::new() {
            Ok(monitor) => {
                tracing::info!("Using hlml provider");
                Arc::new(monitor)
            }
            Err(e) => {
                tracing::warn!(error = %e, "hlml not available, using static device set");
                Arc::new(StaticMonitor::new())
            }
        },
        ProviderKind::Real => Arc::new(RealMonitor::new()?),
        ProviderKind::Static => Arc::new(StaticMonitor::new()),
        ProviderKind::Synthetic => Arc::new(SyntheticMonitor::from_env()?),
    };

    if verbose {
        Ok(Arc::new(VerboseMonitor::new(monitor)))
    } else {
        Ok(monitor)
    }
}
