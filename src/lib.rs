use controllers::hub::HubError;
use registration::RegistrationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Config fetch error: {0}")]
    ConfigFetch(#[source] kube::Error),

    #[error("Registration error: {0}")]
    RegistrationError(#[from] RegistrationError),

    #[error("Hub error: {0}")]
    HubError(#[from] HubError),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Self::KubeError(_) => "kube",
            Self::ConfigFetch(_) => "config_fetch",
            Self::RegistrationError(_) => "registration",
            Self::HubError(_) => "hub",
            Self::MetricsError(_) => "metrics",
            Self::FinalizerError(_) => "finalizer",
        }
        .to_string()
    }
}

/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod api;
pub mod controllers;
pub mod registration;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;
