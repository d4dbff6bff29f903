// SPDX-License-Identifier: Apache-2.0

//! TLS plumbing: the server-side acceptor from PEM files and the client
//! connector with an optional no-verify mode for test rigs.

use anyhow::{
    anyhow,
    Context,
};
use std::{
    fs::File,
    io::BufReader,
    sync::Arc,
};
use tokio_rustls::{
    rustls,
    rustls::{
        client::danger::{
            HandshakeSignatureValid,
            ServerCertVerified,
            ServerCertVerifier,
        },
        pki_types::{
            CertificateDer,
            ServerName,
            UnixTime,
        },
        DigitallySignedStruct,
        SignatureScheme,
    },
    TlsAcceptor,
    TlsConnector,
};

/// Build the server acceptor from a PEM certificate chain and key.
pub(crate) fn server_acceptor(certificate_path: &str, private_key_path: &str) -> anyhow::Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(
        File::open(certificate_path).with_context(|| format!("cannot open certificate {}", certificate_path))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    let mut key_reader = BufReader::new(
        File::open(private_key_path).with_context(|| format!("cannot open private key {}", private_key_path))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("no private key found in {}", private_key_path))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the client connector. `skip_validation` installs a verifier that
/// accepts any certificate; test environments only.
pub(crate) fn client_connector(skip_validation: bool) -> anyhow::Result<TlsConnector> {
    let config = if skip_validation {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts every certificate and signature.
#[derive(Debug)]
struct NoVerification;

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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
