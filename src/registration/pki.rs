//! Key material for registration CSRs.
//!
//! The controller only generates a key pair and a PKCS#10 request per CSR.
//! Signing is done by whichever signer the CSR names.

use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use thiserror::Error;
use x509_parser::prelude::*;

use super::Subject;

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate request generation failed: {0}")]
    Request(String),

    #[error("certificate parsing error: {0}")]
    Parse(String),
}

pub type PkiResult<T> = std::result::Result<T, PkiError>;

/// Fresh key pair and the request to have it certified
pub struct CertRequest {
    key_pem: String,
    csr_pem: String,
}

impl CertRequest {
    pub fn generate(subject: &Subject) -> PkiResult<Self> {
        let key_pair = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(subject.common_name.clone()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(subject.organization.clone()),
        );
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| PkiError::Request(e.to_string()))?;
        let csr_pem = csr.pem().map_err(|e| PkiError::Request(e.to_string()))?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            csr_pem,
        })
    }

    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

/// Validity window of an issued certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Unix timestamp
    pub not_before: i64,
    /// Unix timestamp
    pub not_after: i64,
    pub common_name: String,
}

impl CertificateInfo {
    /// Parse the first certificate of a PEM bundle
    pub fn from_pem(pem_data: &[u8]) -> PkiResult<Self> {
        let block = ::pem::parse(pem_data).map_err(|e| PkiError::Parse(e.to_string()))?;
        let (_, cert) = X509Certificate::from_der(block.contents())
            .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
        })
    }

    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Seconds until rotation is due at `now`; zero or negative means due
    pub fn rotation_due_in(&self, now: i64, threshold: f64) -> i64 {
        let rotate_at = self.not_before + (self.lifetime_secs() as f64 * threshold) as i64;
        rotate_at - now
    }

    pub fn needs_rotation(&self, now: i64, threshold: f64) -> bool {
        self.lifetime_secs() <= 0 || self.rotation_due_in(now, threshold) <= 0
    }
}
