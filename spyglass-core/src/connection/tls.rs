//! TLS connectors for the two TLS security profiles.
use super::{ConnectError, SecurityProfile};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;

/// Builds an HTTPS connector speaking HTTP/2 (negotiated through ALPN) for `profile`.
pub(crate) fn https_connector(
    profile: SecurityProfile,
) -> Result<HttpsConnector<HttpConnector>, ConnectError> {
    let config = client_config(profile)?;

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);

    Ok(HttpsConnectorBuilder::new()
        .with_tls_config(config)
        .https_only()
        .enable_http2()
        .wrap_connector(http))
}

fn client_config(profile: SecurityProfile) -> Result<ClientConfig, ConnectError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectError::Tls(e.to_string()))?;

    match profile {
        SecurityProfile::Tls => {
            let native = rustls_native_certs::load_native_certs();
            for err in &native.errors {
                tracing::warn!(error = %err, "Failed to load a native root certificate");
            }

            let mut roots = RootCertStore::empty();
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            tracing::debug!(added, ignored, "Loaded native root certificates");

            if roots.is_empty() {
                return Err(ConnectError::Tls(
                    "no usable root certificates found in the system trust store".to_string(),
                ));
            }

            Ok(builder.with_root_certificates(roots).with_no_client_auth())
        }
        SecurityProfile::TlsSkipVerify => Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth()),
        SecurityProfile::Plaintext => Err(ConnectError::Tls(
            "plaintext endpoints do not use TLS".to_string(),
        )),
    }
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_verify_config_builds() {
        let config = client_config(SecurityProfile::TlsSkipVerify).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn plaintext_has_no_tls_config() {
        assert!(matches!(
            client_config(SecurityProfile::Plaintext),
            Err(ConnectError::Tls(_))
        ));
    }
}
