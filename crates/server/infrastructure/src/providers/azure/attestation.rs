//! Attested-data document verification.
//!
//! A booting VM fetches a PKCS#7 SignedData blob from the Azure Instance
//! Metadata Service and presents it at registration. We verify the
//! signature against the certificate embedded in the blob, verify that
//! certificate against a pinned store of Microsoft intermediate CAs loaded
//! at startup, and only then trust the signed JSON payload.
//!
//! Callers map every failure here to one opaque answer; the variants exist
//! so the log line can say what actually went wrong.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use openssl::error::ErrorStack;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509StoreContext, X509};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    #[error("Failed to decode document as base64")]
    BadBase64(#[source] base64::DecodeError),

    #[error("Failed to parse PKCS#7 message")]
    BadPkcs7(#[source] ErrorStack),

    #[error("Expected exactly one signer certificate, found {count}")]
    SignerCount { count: usize },

    #[error("Signature verification failed")]
    BadSignature(#[source] ErrorStack),

    #[error("Certificate chain rejected: {reason}")]
    UntrustedChain { reason: String },

    #[error("Failed to parse signed payload as JSON")]
    BadPayload(#[source] serde_json::Error),

    #[error("Malformed timestamp in payload: {value}")]
    BadTimestamp { value: String },

    #[error("No CA certificates found in {dir}")]
    EmptyCaDir { dir: PathBuf },

    #[error("Failed to read CA directory {dir}")]
    CaDirUnreadable {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load CA certificate from {path}")]
    BadCaFile {
        path: PathBuf,
        #[source]
        source: ErrorStack,
    },

    #[error("Unexpected OpenSSL failure")]
    Unexpected(#[from] ErrorStack),
}

/// The JSON payload inside a verified document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestedPayload {
    /// Identity of the VM the metadata service attested
    pub vm_id: String,

    pub time_stamp: AttestedTimeStamp,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestedTimeStamp {
    #[serde(default)]
    pub created_on: Option<String>,

    pub expires_on: String,
}

impl AttestedPayload {
    /// Parse the document's expiry.
    ///
    /// The metadata service historically used "MM/DD/YY HH:MM:SS -0000";
    /// newer documents are RFC 3339. Accept both.
    pub fn expires_on(&self) -> Result<DateTime<Utc>, AttestationError> {
        let value = self.time_stamp.expires_on.as_str();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
            return Ok(parsed.with_timezone(&Utc));
        }
        if let Ok(parsed) = DateTime::parse_from_str(value, "%m/%d/%y %H:%M:%S %z") {
            return Ok(parsed.with_timezone(&Utc));
        }
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%m/%d/%y %H:%M:%S") {
            return Ok(parsed.and_utc());
        }
        Err(AttestationError::BadTimestamp {
            value: value.to_string(),
        })
    }
}

/// Pinned-CA document verifier, built once at provider setup.
pub struct AttestationVerifier {
    store: X509Store,
}

impl AttestationVerifier {
    /// Load every PEM file in `dir` into the trust store. The pinned
    /// certificates are Microsoft *intermediates*, so partial chains are
    /// accepted.
    pub fn load_from_dir(dir: &Path) -> Result<Self, AttestationError> {
        let entries = std::fs::read_dir(dir).map_err(|source| AttestationError::CaDirUnreadable {
            dir: dir.to_path_buf(),
            source,
        })?;

        let mut certificates = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(source) => {
                    return Err(AttestationError::CaDirUnreadable {
                        dir: dir.to_path_buf(),
                        source,
                    })
                }
            };
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            let bytes =
                std::fs::read(&path).map_err(|source| AttestationError::CaDirUnreadable {
                    dir: dir.to_path_buf(),
                    source,
                })?;
            let mut parsed = X509::stack_from_pem(&bytes)
                .map_err(|source| AttestationError::BadCaFile { path, source })?;
            certificates.append(&mut parsed);
        }

        if certificates.is_empty() {
            return Err(AttestationError::EmptyCaDir {
                dir: dir.to_path_buf(),
            });
        }

        Self::from_certificates(certificates)
    }

    /// Build a verifier from already-parsed CA certificates.
    pub fn from_certificates(certificates: Vec<X509>) -> Result<Self, AttestationError> {
        let mut builder = X509StoreBuilder::new()?;
        for certificate in certificates {
            builder.add_cert(certificate)?;
        }
        builder.set_flags(X509VerifyFlags::PARTIAL_CHAIN)?;
        Ok(Self {
            store: builder.build(),
        })
    }

    /// Verify `document` (base64 DER PKCS#7) and return its payload.
    pub fn verify_document(&self, document: &str) -> Result<AttestedPayload, AttestationError> {
        let der = BASE64
            .decode(document.trim())
            .map_err(AttestationError::BadBase64)?;
        let pkcs7 = Pkcs7::from_der(&der).map_err(AttestationError::BadPkcs7)?;

        let extra_certs = Stack::new()?;
        let signers = pkcs7
            .signers(&extra_certs, Pkcs7Flags::empty())
            .map_err(AttestationError::BadPkcs7)?;
        if signers.len() != 1 {
            return Err(AttestationError::SignerCount {
                count: signers.len(),
            });
        }

        // Signature first, against the embedded certificate only.
        let mut content = Vec::new();
        pkcs7
            .verify(
                &extra_certs,
                &self.store,
                None,
                Some(&mut content),
                Pkcs7Flags::NOVERIFY,
            )
            .map_err(AttestationError::BadSignature)?;

        // Then the certificate itself, against the pinned store.
        let signer = match signers.iter().next() {
            Some(signer) => signer,
            None => return Err(AttestationError::SignerCount { count: 0 }),
        };
        let untrusted = Stack::new()?;
        let mut context = X509StoreContext::new()?;
        let verdict = context.init(&self.store, signer, &untrusted, |ctx| {
            let passed = ctx.verify_cert()?;
            Ok((passed, ctx.error()))
        })?;
        match verdict {
            (true, _) => {}
            (false, error) => {
                return Err(AttestationError::UntrustedChain {
                    reason: error.error_string().to_string(),
                })
            }
        }

        serde_json::from_slice(&content).map_err(AttestationError::BadPayload)
    }
}
