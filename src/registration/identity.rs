use tracing::debug;

use crate::api::addon_template::{ApproveStrategy, RegistrationSpec, RegistrationType};

use super::secret::{secret_name, validate_secret_name};
use super::{
    addon_group, IdentityRequest, Registration, RegistrationError, RegistrationKey,
    RegistrationResult, Subject,
};

pub const SIGNER_NAME_MIN_LEN: usize = 5;
pub const SIGNER_NAME_MAX_LEN: usize = 571;

/// Decide which identity must exist for a registration. Pure and deterministic.
///
/// When both config blocks are set only the one selected by `type` is used.
pub fn describe(
    spec: &RegistrationSpec,
    cluster: &str,
    addon: &str,
    index: usize,
) -> RegistrationResult<IdentityRequest> {
    let registration_type: RegistrationType = spec
        .type_
        .parse()
        .map_err(|e| RegistrationError::InvalidConfig(format!("{e}")))?;
    let approve_strategy: ApproveStrategy = spec
        .approve_strategy
        .parse()
        .map_err(|e| RegistrationError::InvalidConfig(format!("{e}")))?;

    let registration = match registration_type {
        RegistrationType::KubeClient => {
            if spec.custom_signer.is_some() {
                debug!(index, "ignoring customSigner block on KubeClient registration");
            }
            Registration::KubeClient {
                permission: spec
                    .kube_client
                    .as_ref()
                    .and_then(|c| c.permission.clone()),
            }
        }
        RegistrationType::CustomSigner => {
            let config = spec.custom_signer.as_ref().ok_or_else(|| {
                RegistrationError::InvalidConfig(
                    "customSigner is required when type is CustomSigner".into(),
                )
            })?;
            let len = config.name.chars().count();
            if !(SIGNER_NAME_MIN_LEN..=SIGNER_NAME_MAX_LEN).contains(&len) {
                return Err(RegistrationError::InvalidConfig(format!(
                    "customSigner.name must be {SIGNER_NAME_MIN_LEN}-{SIGNER_NAME_MAX_LEN} characters, got {len}"
                )));
            }
            if config.signing_ca.namespace.is_empty() || config.signing_ca.name.is_empty() {
                return Err(RegistrationError::InvalidConfig(
                    "customSigner.signingCA requires namespace and name".into(),
                ));
            }
            if spec.kube_client.is_some() {
                debug!(index, "ignoring kubeClient block on CustomSigner registration");
            }
            Registration::CustomSigner {
                signer_name: config.name.clone(),
                signing_ca: config.signing_ca.clone(),
            }
        }
    };

    validate_secret_name(&secret_name(addon, &registration))?;

    Ok(IdentityRequest {
        key: RegistrationKey::new(cluster, addon, index),
        registration,
        subject: Subject {
            common_name: format!("{}:agent:registration-{index}", addon_group(cluster, addon)),
            organization: addon_group(cluster, addon),
        },
        approve_strategy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::addon_template::{
        CustomSignerRegistrationConfig, HubPermissionConfig, KubeClientRegistrationConfig,
        SigningCaRef,
    };
    use crate::registration::KUBE_APISERVER_CLIENT_SIGNER;

    fn custom_signer(name: &str) -> RegistrationSpec {
        RegistrationSpec {
            type_: "CustomSigner".into(),
            approve_strategy: "None".into(),
            custom_signer: Some(CustomSignerRegistrationConfig {
                name: name.into(),
                signing_ca: SigningCaRef {
                    namespace: "open-cluster-management-hub".into(),
                    name: "signer-ca".into(),
                },
            }),
            ..Default::default()
        }
    }

    fn assert_invalid(result: RegistrationResult<IdentityRequest>) {
        match result {
            Err(RegistrationError::InvalidConfig(_)) => {}
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn kube_client_uses_fixed_signer() {
        let spec = RegistrationSpec {
            type_: "KubeClient".into(),
            approve_strategy: "Auto".into(),
            kube_client: Some(KubeClientRegistrationConfig {
                permission: Some(HubPermissionConfig {
                    cluster_role_name: "addon-reader".into(),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        };

        let identity = describe(&spec, "cluster1", "addon-foo", 0).unwrap();
        assert_eq!(identity.signer_name(), KUBE_APISERVER_CLIENT_SIGNER);
        assert_eq!(identity.approve_strategy, ApproveStrategy::Auto);
        assert_eq!(
            identity.subject.organization,
            "system:open-cluster-management:cluster:cluster1:addon:addon-foo"
        );
        assert_eq!(
            identity.subject.common_name,
            "system:open-cluster-management:cluster:cluster1:addon:addon-foo:agent:registration-0"
        );
        assert_eq!(
            identity.registration.permission().map(|p| p.cluster_role_name.as_str()),
            Some("addon-reader")
        );
    }

    #[test]
    fn kube_client_without_block_is_valid() {
        let spec = RegistrationSpec {
            type_: "KubeClient".into(),
            approve_strategy: "None".into(),
            ..Default::default()
        };
        let identity = describe(&spec, "c", "a", 2).unwrap();
        assert_eq!(identity.registration, Registration::KubeClient { permission: None });
        assert_eq!(identity.key, RegistrationKey::new("c", "a", 2));
    }

    #[test]
    fn custom_signer_uses_configured_signer() {
        let identity = describe(&custom_signer("my-signer"), "cluster1", "addon-bar", 1).unwrap();
        assert_eq!(identity.signer_name(), "my-signer");
        assert_eq!(identity.approve_strategy, ApproveStrategy::None);
        assert!(identity.subject.common_name.ends_with(":agent:registration-1"));
    }

    #[test]
    fn custom_signer_without_block_is_rejected() {
        let spec = RegistrationSpec {
            type_: "CustomSigner".into(),
            approve_strategy: "Auto".into(),
            custom_signer: None,
            ..Default::default()
        };
        assert_invalid(describe(&spec, "c", "a", 0));
    }

    #[test]
    fn signer_name_length_bounds() {
        assert_invalid(describe(&custom_signer("abcd"), "c", "a", 0));
        assert!(describe(&custom_signer("abcde"), "c", "a", 0).is_ok());
        assert_invalid(describe(&custom_signer(&"x".repeat(572)), "c", "a", 0));
    }

    #[test]
    fn signer_must_yield_a_valid_secret_name() {
        // Within the signer length bounds, but the secret name would not be accepted
        let too_long = describe(&custom_signer(&"x".repeat(571)), "c", "a", 0);
        match too_long {
            Err(RegistrationError::InvalidConfig(message)) => {
                assert!(message.contains("exceeds"), "{message}")
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
        assert_invalid(describe(&custom_signer("Example.com/Signer"), "c", "a", 0));
        assert!(describe(&custom_signer("example.com/signer"), "c", "a", 0).is_ok());
        assert!(describe(&custom_signer(&"x".repeat(230)), "c", "a", 0).is_ok());
    }

    #[test]
    fn signing_ca_reference_must_be_complete() {
        let mut spec = custom_signer("my-signer");
        spec.custom_signer.as_mut().unwrap().signing_ca.namespace.clear();
        assert_invalid(describe(&spec, "c", "a", 0));

        let mut spec = custom_signer("my-signer");
        spec.custom_signer.as_mut().unwrap().signing_ca.name.clear();
        assert_invalid(describe(&spec, "c", "a", 0));
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        let mut spec = custom_signer("my-signer");
        spec.approve_strategy = "Manual".into();
        assert_invalid(describe(&spec, "c", "a", 0));

        let mut spec = custom_signer("my-signer");
        spec.type_ = "Token".into();
        assert_invalid(describe(&spec, "c", "a", 0));
    }

    #[test]
    fn inactive_block_is_ignored() {
        let mut spec = custom_signer("my-signer");
        spec.kube_client = Some(KubeClientRegistrationConfig {
            permission: Some(HubPermissionConfig {
                role_name: "ignored".into(),
                ..Default::default()
            }),
        });
        let identity = describe(&spec, "c", "a", 0).unwrap();
        assert_eq!(identity.registration.permission(), None);

        let mut spec = custom_signer("my-signer");
        spec.type_ = "KubeClient".into();
        let identity = describe(&spec, "c", "a", 0).unwrap();
        assert_eq!(identity.signer_name(), KUBE_APISERVER_CLIENT_SIGNER);
    }

    #[test]
    fn fingerprint_is_deterministic_and_ignores_permission() {
        let a = describe(&custom_signer("my-signer"), "c", "a", 0).unwrap();
        let b = describe(&custom_signer("my-signer"), "c", "a", 0).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let other = describe(&custom_signer("other-signer"), "c", "a", 0).unwrap();
        assert_ne!(a.fingerprint(), other.fingerprint());

        let kube = |role: &str| RegistrationSpec {
            type_: "KubeClient".into(),
            approve_strategy: "Auto".into(),
            kube_client: Some(KubeClientRegistrationConfig {
                permission: Some(HubPermissionConfig {
                    role_name: role.into(),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        };
        assert_eq!(
            describe(&kube("one"), "c", "a", 0).unwrap().fingerprint(),
            describe(&kube("two"), "c", "a", 0).unwrap().fingerprint()
        );
    }
}
