use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static CONFIG_NAME: &str = "addon-registration-config";

const MAX_POLL_INTERVAL_SECONDS: u64 = 3600;
const MAX_APPROVAL_TIMEOUT_SECONDS: u64 = 30 * 86400;

/// This provides a config for addon registration functionality
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[kube(
    kind = "AddonRegistrationConfig",
    group = "addon.open-cluster-management.io",
    version = "v1alpha1"
)]
#[serde(rename_all = "camelCase")]
pub struct AddonRegistrationConfigSpec {
    /// Hub API server rendered into KubeClient kubeconfigs
    pub server: Option<Server>,

    /// Seconds an undecided CSR may wait before it is considered expired and re-created
    pub approval_timeout_seconds: Option<u64>,

    /// Seconds between checks of requested or approved CSRs
    pub poll_interval_seconds: Option<u64>,

    /// Consecutive transient failures tolerated before the addon is reported Degraded
    pub transient_failure_threshold: Option<u32>,

    /// Fraction of certificate lifetime after which a new certificate is requested
    pub rotation_threshold: Option<f64>,

    /// Requested certificate lifetime, passed to the signer
    pub certificate_expiration_seconds: Option<i32>,
}

impl Default for AddonRegistrationConfig {
    fn default() -> Self {
        Self {
            metadata: Default::default(),
            spec: AddonRegistrationConfigSpec {
                server: Some(Server::InferLocal(true)),
                ..Default::default()
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Server {
    /// Use the in-cluster `kubernetes` endpoint and `kube-root-ca.crt`
    InferLocal(bool),
    Custom(HubServerOptions),
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubServerOptions {
    #[serde(rename = "apiServerURL")]
    pub api_server_url: Option<String>,

    /// ConfigMap holding `ca.crt` for the hub API server
    #[serde(rename = "apiServerCAConfigRef")]
    pub api_server_ca_config_ref: Option<ObjectReference>,
}

/// Effective settings with defaults applied
#[derive(Clone, Debug, PartialEq)]
pub struct RegistrationSettings {
    pub server: Server,
    pub approval_timeout: Duration,
    pub poll_interval: Duration,
    pub transient_failure_threshold: u32,
    pub rotation_threshold: f64,
    pub certificate_expiration_seconds: Option<i32>,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        AddonRegistrationConfig::default().settings()
    }
}

impl AddonRegistrationConfig {
    pub fn settings(&self) -> RegistrationSettings {
        let spec = &self.spec;
        RegistrationSettings {
            server: spec.server.clone().unwrap_or(Server::InferLocal(true)),
            approval_timeout: Duration::from_secs(
                spec.approval_timeout_seconds
                    .unwrap_or(86400)
                    .min(MAX_APPROVAL_TIMEOUT_SECONDS),
            ),
            poll_interval: Duration::from_secs(
                spec.poll_interval_seconds
                    .unwrap_or(10)
                    .clamp(1, MAX_POLL_INTERVAL_SECONDS),
            ),
            transient_failure_threshold: spec.transient_failure_threshold.unwrap_or(5).max(1),
            rotation_threshold: spec
                .rotation_threshold
                .filter(|t| *t > 0.0 && *t <= 1.0)
                .unwrap_or(0.8),
            certificate_expiration_seconds: spec.certificate_expiration_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_config_absent() {
        let settings = RegistrationSettings::default();
        assert_eq!(settings.server, Server::InferLocal(true));
        assert_eq!(settings.approval_timeout, Duration::from_secs(86400));
        assert_eq!(settings.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.transient_failure_threshold, 5);
        assert_eq!(settings.rotation_threshold, 0.8);
        assert_eq!(settings.certificate_expiration_seconds, None);
    }

    #[test]
    fn out_of_range_values_fall_back() {
        let config = AddonRegistrationConfig::new(
            CONFIG_NAME,
            AddonRegistrationConfigSpec {
                poll_interval_seconds: Some(0),
                transient_failure_threshold: Some(0),
                rotation_threshold: Some(1.5),
                ..Default::default()
            },
        );
        let settings = config.settings();
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.transient_failure_threshold, 1);
        assert_eq!(settings.rotation_threshold, 0.8);
        assert_eq!(settings.server, Server::InferLocal(true));
    }

    #[test]
    fn oversized_intervals_are_capped() {
        let config = AddonRegistrationConfig::new(
            CONFIG_NAME,
            AddonRegistrationConfigSpec {
                poll_interval_seconds: Some(u64::MAX / 2),
                approval_timeout_seconds: Some(u64::MAX),
                ..Default::default()
            },
        );
        let settings = config.settings();
        assert_eq!(settings.poll_interval, Duration::from_secs(3600));
        assert_eq!(settings.approval_timeout, Duration::from_secs(30 * 86400));
        assert_eq!(settings.poll_interval.saturating_mul(3), Duration::from_secs(3 * 3600));
    }

    #[test]
    fn custom_server_decodes() {
        let spec: AddonRegistrationConfigSpec = serde_json::from_value(serde_json::json!({
            "server": {"custom": {"apiServerURL": "https://hub:6443",
                                  "apiServerCAConfigRef": {"name": "hub-ca", "namespace": "default"}}}
        }))
        .unwrap();

        match spec.server {
            Some(Server::Custom(options)) => {
                assert_eq!(options.api_server_url.as_deref(), Some("https://hub:6443"));
                assert_eq!(
                    options.api_server_ca_config_ref.and_then(|r| r.name),
                    Some("hub-ca".to_string())
                );
            }
            other => panic!("unexpected server {other:?}"),
        }
    }
}
