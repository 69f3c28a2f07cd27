//! Optional model-health oracle.
//!
//! A process-wide health checker may know which models are currently
//! reachable. The router consults it through this narrow trait when
//! present; when absent the null-object default (empty report) applies and
//! nothing errors.

use serde::Serialize;

/// What the external health checker currently knows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelHealthReport {
    /// Models empirically confirmed working, most recent first.
    pub working: Vec<String>,
    /// Models that failed their last health probe.
    pub failed: Vec<String>,
}

/// Narrow view of the shared health-check singleton.
pub trait ModelHealthOracle: Send + Sync {
    fn results(&self) -> ModelHealthReport;
}

/// Introspection snapshot combining configured and tested models.
#[derive(Debug, Clone, Serialize)]
pub struct ModelsInfo {
    pub primary: String,
    pub fallbacks: Vec<String>,
    pub tested_working: Vec<String>,
    pub tested_failed: Vec<String>,
    pub total_tested: usize,
    pub all_configured: Vec<String>,
}
