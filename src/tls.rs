//! TLS stream upgrade driven by the account's SSL bundle. Compiled only
//! with the `tls` feature; without it a configured bundle fails the
//! connect with CR 2026.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use bufstream::BufStream;
use log::warn;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};

use crate::account::SslOpts;
use crate::error::{cr, Error, Result, ServerError};
use crate::stream::Stream;

fn ssl_err(message: impl Into<String>) -> Error {
    Error::Connection(ServerError::client(cr::CR_SSL_CONNECTION_ERROR, message))
}

/// Wraps the plain TCP stream in TLS after the SSL request packet went out.
pub fn upgrade(stream: Stream, host: &str, opts: &SslOpts) -> Result<Stream> {
    let tcp = stream.into_tcp()?;
    let config = build_config(opts)?;
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| ssl_err(format!("invalid TLS server name '{host}': {e}")))?;
    let conn = ClientConnection::new(Arc::new(config), name).map_err(|e| ssl_err(e.to_string()))?;
    Ok(Stream::Tls(Box::new(BufStream::new(StreamOwned::new(
        conn, tcp,
    )))))
}

fn build_config(opts: &SslOpts) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    if let Some(cipher) = opts.cipher() {
        warn!("TLS cipher preference '{cipher}' is advisory under rustls and was not applied");
    }
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ssl_err(e.to_string()))?;
    // No CA material means encrypt-without-verify, the classic client's
    // default SSL mode.
    let builder = match load_roots(opts)? {
        Some(roots) => builder.with_root_certificates(roots),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier { provider })),
    };
    match load_identity(opts)? {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ssl_err(e.to_string())),
        None => Ok(builder.with_no_client_auth()),
    }
}

fn load_roots(opts: &SslOpts) -> Result<Option<RootCertStore>> {
    let mut roots = RootCertStore::empty();
    let mut configured = false;
    if let Some(ca) = opts.ca_file() {
        add_pem_certs(&mut roots, Path::new(ca))?;
        configured = true;
    }
    if let Some(dir) = opts.ca_path() {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| ssl_err(format!("cannot read CA directory '{dir}': {e}")))?;
        for entry in entries {
            let path = entry.map_err(|e| ssl_err(e.to_string()))?.path();
            let is_pem = path
                .extension()
                .map_or(false, |x| x == "pem" || x == "crt");
            if is_pem {
                add_pem_certs(&mut roots, &path)?;
            }
        }
        configured = true;
    }
    Ok(if configured { Some(roots) } else { None })
}

fn add_pem_certs(roots: &mut RootCertStore, path: &Path) -> Result<()> {
    let file = File::open(path)
        .map_err(|e| ssl_err(format!("cannot open CA file '{}': {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert
            .map_err(|e| ssl_err(format!("bad certificate in '{}': {e}", path.display())))?;
        roots.add(cert).map_err(|e| ssl_err(e.to_string()))?;
    }
    Ok(())
}

type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn load_identity(opts: &SslOpts) -> Result<Option<Identity>> {
    let (Some(key), Some(cert)) = (opts.key_file(), opts.cert_file()) else {
        return Ok(None);
    };
    let file = File::open(cert)
        .map_err(|e| ssl_err(format!("cannot open client certificate '{cert}': {e}")))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<_>>()
        .map_err(|e| ssl_err(format!("bad client certificate '{cert}': {e}")))?;
    let file = File::open(key)
        .map_err(|e| ssl_err(format!("cannot open client key '{key}': {e}")))?;
    let key_der = rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ssl_err(format!("bad client key '{key}': {e}")))?
        .ok_or_else(|| ssl_err(format!("no private key found in '{key}'")))?;
    Ok(Some((certs, key_der)))
}

#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
