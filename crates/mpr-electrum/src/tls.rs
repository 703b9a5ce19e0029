//! TLS wrapping for the `s` transport.

use std::sync::Arc;

use mpr_reconcile::VerifyError;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Client config trusting the bundled web PKI roots.
fn client_config() -> Result<ClientConfig, VerifyError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| VerifyError::Handshake(format!("tls config: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();
    Ok(config)
}

pub(crate) async fn wrap(tcp: TcpStream, host: &str) -> Result<TlsStream<TcpStream>, VerifyError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| VerifyError::Handshake(format!("invalid tls server name '{host}'")))?;
    let connector = TlsConnector::from(Arc::new(client_config()?));
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| VerifyError::Handshake(format!("tls handshake with {host}: {e}")))
}
