//! Agent credential secrets.
//!
//! A registration's signed certificate and private key end up in one secret in
//! the install namespace of the managed cluster. KubeClient registrations also
//! get a kubeconfig pointing at the hub.

use base64::prelude::*;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::json;

use crate::controllers::hub::HubEndpoint;

use super::{
    IdentityRequest, Registration, RegistrationError, RegistrationResult,
    IDENTITY_HASH_ANNOTATION, SECRET_ROLE_LABEL,
};

pub static AGENT_CREDENTIAL_ROLE: &str = "agent-credential";

pub static TLS_KEY: &str = "tls.key";
pub static TLS_CERT: &str = "tls.crt";
pub static KUBECONFIG: &str = "kubeconfig";

/// Name of the secret holding the credential of a registration
pub fn secret_name(addon: &str, registration: &Registration) -> String {
    match registration {
        Registration::KubeClient { .. } => format!("{addon}-hub-kubeconfig"),
        Registration::CustomSigner { signer_name, .. } => {
            format!("{addon}-{}-client-cert", signer_name.replace('/', "-"))
        }
    }
}

const SECRET_NAME_MAX_LEN: usize = 253;

/// Reject secret names the API server would refuse (RFC 1123 subdomain)
pub fn validate_secret_name(name: &str) -> RegistrationResult<()> {
    let valid_chars = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.');
    let alnum_edges = name
        .bytes()
        .next()
        .zip(name.bytes().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());

    if name.len() > SECRET_NAME_MAX_LEN {
        return Err(RegistrationError::InvalidConfig(format!(
            "secret name {name} exceeds {SECRET_NAME_MAX_LEN} characters"
        )));
    }
    if !valid_chars || !alnum_edges {
        return Err(RegistrationError::InvalidConfig(format!(
            "secret name {name} is not a lowercase RFC 1123 subdomain"
        )));
    }
    Ok(())
}

/// Signed certificate together with the key it was requested with
pub struct IssuedCredential<'a> {
    pub key_pem: &'a str,
    pub cert_pem: &'a [u8],
}

/// Build the credential secret for a registration. Writing it is left to the caller,
/// the name is stable so a renewal overwrites the previous credential in place.
pub fn materialize(
    identity: &IdentityRequest,
    credential: &IssuedCredential,
    install_namespace: &str,
    hub: Option<&HubEndpoint>,
) -> RegistrationResult<Secret> {
    let mut data = std::collections::BTreeMap::from([
        (
            TLS_KEY.to_string(),
            ByteString(credential.key_pem.as_bytes().to_vec()),
        ),
        (
            TLS_CERT.to_string(),
            ByteString(credential.cert_pem.to_vec()),
        ),
    ]);

    if let Registration::KubeClient { .. } = identity.registration {
        let hub = hub.ok_or_else(|| {
            RegistrationError::HubEndpoint("hub API server address is not known yet".into())
        })?;
        data.insert(
            KUBECONFIG.to_string(),
            ByteString(kubeconfig(hub, credential).into_bytes()),
        );
    }

    let mut labels = identity.key.labels();
    labels.insert(
        SECRET_ROLE_LABEL.to_string(),
        AGENT_CREDENTIAL_ROLE.to_string(),
    );

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(&identity.key.addon, &identity.registration)),
            namespace: Some(install_namespace.to_string()),
            labels: Some(labels),
            annotations: Some(
                [(IDENTITY_HASH_ANNOTATION.to_string(), identity.fingerprint())].into(),
            ),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Default::default()
    })
}

fn kubeconfig(hub: &HubEndpoint, credential: &IssuedCredential) -> String {
    let mut cluster = json!({ "server": hub.server });
    if let Some(ca) = &hub.ca_pem {
        cluster["certificate-authority-data"] = json!(BASE64_STANDARD.encode(ca));
    }

    json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "hub", "cluster": cluster }],
        "users": [{
            "name": "addon-agent",
            "user": {
                "client-certificate-data": BASE64_STANDARD.encode(credential.cert_pem),
                "client-key-data": BASE64_STANDARD.encode(credential.key_pem),
            }
        }],
        "contexts": [{
            "name": "hub",
            "context": { "cluster": "hub", "user": "addon-agent" }
        }],
        "current-context": "hub",
    })
    .to_string()
}

/// Whether the secret was materialized for this very identity
pub fn is_current(secret: &Secret, identity: &IdentityRequest) -> bool {
    secret.annotations().get(IDENTITY_HASH_ANNOTATION) == Some(&identity.fingerprint())
}

pub fn certificate(secret: &Secret) -> Option<&[u8]> {
    secret
        .data
        .as_ref()?
        .get(TLS_CERT)
        .map(|cert| cert.0.as_slice())
        .filter(|cert| !cert.is_empty())
}
