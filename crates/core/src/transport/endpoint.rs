use super::tls::{self, SkipServerVerification};
use super::TransportError;
use quicmux_common::{protocol, EndpointConfig};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Endpoint, IdleTimeout, TransportConfig, VarInt};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::debug;

/// Transport parameters shared by both roles
pub fn transport_config(config: &EndpointConfig) -> Result<TransportConfig, TransportError> {
    let mut transport = TransportConfig::default();

    let idle = IdleTimeout::try_from(config.idle_timeout())
        .map_err(|e| TransportError::ConfigCreation(format!("idle timeout: {}", e)))?;
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(Some(config.keep_alive_interval()));

    // Requests only ever use bidirectional streams
    transport.max_concurrent_bidi_streams(VarInt::from_u32(config.max_concurrent_streams));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));

    Ok(transport)
}

/// Server configuration from the configured PEM certificate and key
pub fn server_config(config: &EndpointConfig) -> Result<quinn::ServerConfig, TransportError> {
    let cert_path = config
        .cert_path
        .as_deref()
        .ok_or_else(|| TransportError::Certificate("no certificate configured".to_string()))?;
    let key_path = config
        .key_path
        .as_deref()
        .ok_or_else(|| TransportError::Certificate("no private key configured".to_string()))?;

    let cert_chain = tls::load_certs(cert_path)?;
    let key = tls::load_private_key(key_path)?;

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(tls::crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::ConfigCreation(format!("protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| TransportError::Certificate(e.to_string()))?;
    server_crypto.alpn_protocols = vec![protocol::ALPN.to_vec()];

    let quic_crypto = QuicServerConfig::try_from(server_crypto)
        .map_err(|e| TransportError::ConfigCreation(format!("QUIC server config: {}", e)))?;

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    server_config.transport_config(Arc::new(transport_config(config)?));

    Ok(server_config)
}

/// Client configuration, verifying against the CA bundle unless insecure
pub fn client_config(config: &EndpointConfig) -> Result<quinn::ClientConfig, TransportError> {
    let provider = tls::crypto_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::ConfigCreation(format!("protocol versions: {}", e)))?;

    let mut client_crypto = if config.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new(provider))
            .with_no_client_auth()
    } else {
        let ca_path = config
            .ca_path
            .as_deref()
            .ok_or_else(|| TransportError::Certificate("no CA bundle configured".to_string()))?;
        builder
            .with_root_certificates(tls::load_roots(ca_path)?)
            .with_no_client_auth()
    };
    client_crypto.alpn_protocols = vec![protocol::ALPN.to_vec()];

    let quic_crypto = QuicClientConfig::try_from(client_crypto)
        .map_err(|e| TransportError::ConfigCreation(format!("QUIC client config: {}", e)))?;

    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
    client_config.transport_config(Arc::new(transport_config(config)?));

    Ok(client_config)
}

/// Resolve `host:port` to the first matching socket address
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Resolve(format!("{}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| TransportError::Resolve(format!("{}:{}: no addresses", host, port)))
}

/// Bind a server endpoint on the configured host and port
///
/// Must run inside a tokio runtime.
pub fn bind_server(config: &EndpointConfig, addr: SocketAddr) -> Result<Endpoint, TransportError> {
    let endpoint = Endpoint::server(server_config(config)?, addr)
        .map_err(|e| TransportError::BindFailed(format!("{}: {}", addr, e)))?;
    debug!("Server endpoint bound to {}", endpoint.local_addr()?);
    Ok(endpoint)
}

/// Bind an ephemeral client endpoint able to reach `remote`
///
/// Must run inside a tokio runtime.
pub fn bind_client(config: &EndpointConfig, remote: SocketAddr) -> Result<Endpoint, TransportError> {
    let local: SocketAddr = if remote.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };

    let mut endpoint =
        Endpoint::client(local).map_err(|e| TransportError::BindFailed(format!("{}: {}", local, e)))?;
    endpoint.set_default_client_config(client_config(config)?);

    Ok(endpoint)
}
