//! TLS client material loading.
//!
//! Certificate material is loaded through a strategy registry: the PEM
//! loader handles `cert_path` + `key_path` pairs, the PFX loader handles
//! PKCS#12 archives. The first loader that claims a spec wins.

use std::fs;

use reqwest::{Certificate, Identity};

use crate::suite::TlsSpec;
use crate::{Error, Result};

/// Loaded identity, tagged with the TLS backend it requires.
#[derive(Debug)]
pub enum LoadedIdentity {
    /// PEM material (rustls backend)
    Pem(Identity),
    /// PKCS#12 archive (native-tls backend)
    #[cfg(feature = "pfx")]
    Pkcs12(Identity),
}

/// One way of loading client certificate material.
pub trait CertificateLoader: Send + Sync {
    /// Loader name, used in diagnostics.
    fn name(&self) -> &'static str;

    /// Whether this loader claims the spec.
    fn can_handle(&self, tls: &TlsSpec) -> bool;

    /// Load the identity.
    fn load(&self, tls: &TlsSpec) -> Result<LoadedIdentity>;
}

/// PEM certificate + key pair.
struct PemLoader;

impl CertificateLoader for PemLoader {
    fn name(&self) -> &'static str {
        "pem"
    }

    fn can_handle(&self, tls: &TlsSpec) -> bool {
        tls.cert_path.is_some() || tls.key_path.is_some()
    }

    fn load(&self, tls: &TlsSpec) -> Result<LoadedIdentity> {
        let cert_path = tls
            .cert_path
            .as_deref()
            .ok_or_else(|| Error::TlsFailure("PEM loader requires cert_path".to_string()))?;
        let key_path = tls
            .key_path
            .as_deref()
            .ok_or_else(|| Error::TlsFailure("PEM loader requires key_path".to_string()))?;
        if tls.passphrase.is_some() {
            return Err(Error::TlsFailure(
                "passphrase-protected PEM keys are not supported; use a PFX archive".to_string(),
            ));
        }

        let mut material = fs::read(cert_path)
            .map_err(|e| Error::TlsFailure(format!("failed to read {cert_path}: {e}")))?;
        material.push(b'\n');
        material.extend(
            fs::read(key_path)
                .map_err(|e| Error::TlsFailure(format!("failed to read {key_path}: {e}")))?,
        );

        Identity::from_pem(&material)
            .map(LoadedIdentity::Pem)
            .map_err(|e| Error::TlsFailure(format!("invalid PEM material: {e}")))
    }
}

/// PKCS#12 archive. Requires the `pfx` feature (platform TLS stack);
/// the default rustls build handles PEM material only.
struct PfxLoader;

impl CertificateLoader for PfxLoader {
    fn name(&self) -> &'static str {
        "pfx"
    }

    fn can_handle(&self, tls: &TlsSpec) -> bool {
        tls.pfx_path.is_some()
    }

    #[cfg(feature = "pfx")]
    fn load(&self, tls: &TlsSpec) -> Result<LoadedIdentity> {
        let pfx_path = tls
            .pfx_path
            .as_deref()
            .ok_or_else(|| Error::TlsFailure("PFX loader requires pfx_path".to_string()))?;
        let der = fs::read(pfx_path)
            .map_err(|e| Error::TlsFailure(format!("failed to read {pfx_path}: {e}")))?;
        Identity::from_pkcs12_der(&der, tls.passphrase.as_deref().unwrap_or(""))
            .map(LoadedIdentity::Pkcs12)
            .map_err(|e| Error::TlsFailure(format!("invalid PKCS#12 archive: {e}")))
    }

    #[cfg(not(feature = "pfx"))]
    fn load(&self, tls: &TlsSpec) -> Result<LoadedIdentity> {
        let pfx_path = tls.pfx_path.as_deref().unwrap_or_default();
        Err(Error::TlsFailure(format!(
            "cannot load {pfx_path}: PKCS#12 support requires the 'pfx' build feature; \
             convert the archive to PEM or rebuild with --features pfx"
        )))
    }
}

/// First-match registry over certificate loaders.
pub struct CertificateRegistry {
    loaders: Vec<Box<dyn CertificateLoader>>,
}

impl Default for CertificateRegistry {
    fn default() -> Self {
        Self::with_default_loaders()
    }
}

impl CertificateRegistry {
    /// Registry seeded with the PFX and PEM loaders.
    #[must_use]
    pub fn with_default_loaders() -> Self {
        Self {
            loaders: vec![Box::new(PfxLoader), Box::new(PemLoader)],
        }
    }

    /// Register an additional loader (consulted before defaults would be
    /// unusual; appended last).
    pub fn register(&mut self, loader: Box<dyn CertificateLoader>) {
        self.loaders.push(loader);
    }

    /// Load client material for a spec. `Ok(None)` when the spec carries
    /// no client certificate configuration.
    pub fn load(&self, tls: &TlsSpec) -> Result<Option<LoadedIdentity>> {
        for loader in &self.loaders {
            if loader.can_handle(tls) {
                return loader.load(tls).map(Some);
            }
        }
        Ok(None)
    }
}

/// Parse a protocol version name (`TLSv1` .. `TLSv1.3`).
pub fn protocol_version(name: &str) -> Result<reqwest::tls::Version> {
    match name {
        "TLSv1" | "TLSv1.0" => Ok(reqwest::tls::Version::TLS_1_0),
        "TLSv1.1" => Ok(reqwest::tls::Version::TLS_1_1),
        "TLSv1.2" => Ok(reqwest::tls::Version::TLS_1_2),
        "TLSv1.3" => Ok(reqwest::tls::Version::TLS_1_3),
        other => Err(Error::TlsFailure(format!("unknown TLS version: {other}"))),
    }
}

/// Load an extra CA bundle.
pub fn load_ca_bundle(path: &str) -> Result<Certificate> {
    let pem = fs::read(path)
        .map_err(|e| Error::TlsFailure(format!("failed to read CA bundle {path}: {e}")))?;
    Certificate::from_pem(&pem)
        .map_err(|e| Error::TlsFailure(format!("invalid CA bundle {path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_names_parse() {
        assert!(protocol_version("TLSv1.2").is_ok());
        assert!(protocol_version("TLSv1.3").is_ok());
        assert!(protocol_version("SSLv3").is_err());
    }

    #[test]
    fn pem_loader_requires_both_paths() {
        let registry = CertificateRegistry::with_default_loaders();
        let spec = TlsSpec {
            cert_path: Some("/tmp/missing-cert.pem".to_string()),
            ..TlsSpec::default()
        };
        let err = registry.load(&spec).unwrap_err();
        assert!(matches!(err, Error::TlsFailure(msg) if msg.contains("key_path")));
    }

    #[test]
    fn specs_without_material_load_nothing() {
        let registry = CertificateRegistry::with_default_loaders();
        let spec = TlsSpec {
            min_version: Some("TLSv1.2".to_string()),
            ..TlsSpec::default()
        };
        assert!(registry.load(&spec).unwrap().is_none());
    }

    #[test]
    fn pfx_loader_wins_when_both_forms_are_present() {
        let registry = CertificateRegistry::with_default_loaders();
        let spec = TlsSpec {
            pfx_path: Some("/tmp/definitely-missing.pfx".to_string()),
            cert_path: Some("/tmp/also-missing.pem".to_string()),
            key_path: Some("/tmp/also-missing.key".to_string()),
            ..TlsSpec::default()
        };
        let err = registry.load(&spec).unwrap_err();
        assert!(matches!(err, Error::TlsFailure(msg) if msg.contains("missing.pfx")));
    }
}
