//! Service identity: signing key, X.509 certificate and fingerprints.
//!
//! Announcements carry the announcer's PEM certificate and a base64
//! signature over the body made with the certificate's key: RSA PKCS#1 v1.5
//! with SHA-256, or Ed25519. The fingerprint is the SHA-1 of the certificate
//! DER, printed as uppercase colon-separated hex.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use rustls_pemfile::Item;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use x509_cert::der::pem::LineEnding;
use x509_cert::der::{Decode, Encode, EncodePem};
use x509_cert::Certificate;

use crate::{Error, Result};

/// First PEM item in `text`, if any.
fn read_pem(text: &str) -> Option<Item> {
    rustls_pemfile::read_one(&mut text.as_bytes()).ok().flatten()
}

/// DER bytes of the first certificate in `pem`.
pub fn certificate_der(pem: &str) -> Option<Vec<u8>> {
    match read_pem(pem)? {
        Item::X509Certificate(der) => Some(der.to_vec()),
        _ => None,
    }
}

/// `AA:BB:...` SHA-1 fingerprint of DER bytes.
pub fn fingerprint(der: &[u8]) -> String {
    Sha1::digest(der)
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Fingerprint of a PEM certificate, if it decodes.
pub fn fingerprint_pem(pem: &str) -> Option<String> {
    certificate_der(pem).map(|der| fingerprint(&der))
}

fn with_trailing_newline(mut pem: String) -> String {
    if !pem.ends_with('\n') {
        pem.push('\n');
    }
    pem
}

/// Break `text` into newline-terminated lines of at most `width` chars.
fn fold(text: &str, width: usize) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / width.max(1) + 1);
    for chunk in text.as_bytes().chunks(width.max(1)) {
        // base64 text is ascii
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out
}

enum PublicKey {
    Rsa(pkcs1v15::VerifyingKey<Sha256>),
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl PublicKey {
    fn from_certificate(der: &[u8]) -> Option<Self> {
        let cert = Certificate::from_der(der).ok()?;
        let spki = cert.tbs_certificate.subject_public_key_info.to_der().ok()?;
        if let Ok(key) = RsaPublicKey::from_public_key_der(&spki) {
            return Some(Self::Rsa(pkcs1v15::VerifyingKey::new(key)));
        }
        ed25519_dalek::VerifyingKey::from_public_key_der(&spki)
            .ok()
            .map(Self::Ed25519)
    }

    fn verify(&self, body: &[u8], signature: &[u8]) -> bool {
        match self {
            Self::Rsa(key) => pkcs1v15::Signature::try_from(signature)
                .is_ok_and(|sig| key.verify(body, &sig).is_ok()),
            Self::Ed25519(key) => ed25519_dalek::Signature::from_slice(signature)
                .is_ok_and(|sig| key.verify(body, &sig).is_ok()),
        }
    }
}

/// Check a base64 signature over `body` against the certificate's key.
/// Any malformed input yields `false`.
pub fn verify(cert_pem: &str, body: &[u8], signature_b64: &str) -> bool {
    let Some(key) = certificate_der(cert_pem).and_then(|der| PublicKey::from_certificate(&der)) else {
        return false;
    };
    let compact: String = signature_b64.split_whitespace().collect();
    let Ok(raw) = STANDARD.decode(compact) else {
        return false;
    };
    key.verify(body, &raw)
}

#[derive(Clone)]
enum SigningKey {
    Rsa(pkcs1v15::SigningKey<Sha256>),
    Ed25519(ed25519_dalek::SigningKey),
}

impl SigningKey {
    fn from_pem(key_pem: &str) -> Result<Self> {
        let bad_key = |e: &dyn std::fmt::Display| Error::Identity(format!("bad private key: {e}"));
        match read_pem(key_pem) {
            Some(Item::Pkcs1Key(der)) => RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der())
                .map(|key| Self::Rsa(pkcs1v15::SigningKey::new(key)))
                .map_err(|e| bad_key(&e)),
            Some(Item::Pkcs8Key(der)) => {
                let der = der.secret_pkcs8_der();
                if let Ok(key) = ed25519_dalek::SigningKey::from_pkcs8_der(der) {
                    return Ok(Self::Ed25519(key));
                }
                RsaPrivateKey::from_pkcs8_der(der)
                    .map(|key| Self::Rsa(pkcs1v15::SigningKey::new(key)))
                    .map_err(|e| bad_key(&e))
            }
            _ => Err(bad_key(&"no RSA or PKCS#8 key block")),
        }
    }

    fn sign(&self, body: &[u8]) -> Vec<u8> {
        match self {
            Self::Rsa(key) => key.sign(body).to_vec(),
            Self::Ed25519(key) => key.sign(body).to_vec(),
        }
    }
}

/// The key and certificate a service announces itself with.
#[derive(Clone)]
pub struct ServiceIdentity {
    signing_key: SigningKey,
    cert_pem: String,
    fingerprint: String,
}

impl std::fmt::Debug for ServiceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl ServiceIdentity {
    /// Fresh Ed25519 key with a self-signed certificate.
    pub fn generate() -> Result<Self> {
        let failed = |e: rcgen::Error| Error::Identity(format!("certificate generation failed: {e}"));
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519).map_err(failed)?;
        let cert = rcgen::CertificateParams::new(vec!["scamp-service".to_string()])
            .map_err(failed)?
            .self_signed(&key_pair)
            .map_err(failed)?;
        let signing_key = ed25519_dalek::SigningKey::from_pkcs8_der(key_pair.serialized_der())
            .map_err(|e| Error::Identity(format!("bad generated key: {e}")))?;
        Ok(Self {
            signing_key: SigningKey::Ed25519(signing_key),
            fingerprint: fingerprint(cert.der()),
            cert_pem: with_trailing_newline(cert.pem()),
        })
    }

    /// Identity from a private key (PKCS#1 RSA or PKCS#8 RSA/Ed25519) and the
    /// matching PEM certificate.
    pub fn from_pem(key_pem: &str, cert_pem: &str) -> Result<Self> {
        let signing_key = SigningKey::from_pem(key_pem)?;
        let der = certificate_der(cert_pem)
            .ok_or_else(|| Error::Identity("no certificate block".to_string()))?;
        let public_key = PublicKey::from_certificate(&der)
            .ok_or_else(|| Error::Identity("unsupported certificate key".to_string()))?;

        let check = b"scamp identity check";
        if !public_key.verify(check, &signing_key.sign(check)) {
            return Err(Error::Identity(
                "private key does not match certificate".to_string(),
            ));
        }

        let cert_pem = Certificate::from_der(&der)
            .and_then(|cert| cert.to_pem(LineEnding::LF))
            .map_err(|e| Error::Identity(format!("bad certificate: {e}")))?;
        Ok(Self {
            signing_key,
            fingerprint: fingerprint(&der),
            cert_pem: with_trailing_newline(cert_pem),
        })
    }

    /// PEM certificate distributed with every announcement.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Fingerprint of [`Self::cert_pem`].
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Raw signature over `body`.
    pub fn sign(&self, body: &[u8]) -> Vec<u8> {
        self.signing_key.sign(body)
    }

    /// Signature over `body` as base64 folded at 76 columns.
    pub fn sign_folded(&self, body: &[u8]) -> String {
        fold(&STANDARD.encode(self.sign(body)), 76)
    }
}
