//! Extender relays
//!
//! An extender terminates a fake TLS handshake under an innocuous
//! fronting name, reads a signed header naming the true destination,
//! and splices bytes onward. From the wire's point of view the client
//! talked to the fronting host.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::Rng;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use trellis_wire::ExtenderHeader;

use crate::settings::ClientStrategySettings;
use crate::{ConnectError, Result};

/// How an extender expects to be reached
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtenderProfile {
    /// TLS port the extender listens on
    pub port: u16,
    /// Innocuous SNI presented during the fake handshake
    pub fronting_host: String,
}

/// One reachable extender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtenderConfig {
    /// Relay address
    pub ip: IpAddr,
    /// Connection profile
    pub profile: ExtenderProfile,
    /// Shared secret; empty-string signature when absent
    pub secret: Option<String>,
}

#[cfg(test)]
impl ExtenderConfig {
    pub(crate) fn test_config() -> Self {
        Self {
            ip: IpAddr::from([192, 0, 2, 1]),
            profile: ExtenderProfile {
                port: 443,
                fronting_host: "cdn.example.com".to_string(),
            },
            secret: None,
        }
    }
}

const PROFILE_PORTS: [u16; 3] = [443, 8443, 993];
const FRONTING_TLDS: [&str; 4] = ["com", "net", "org", "io"];

/// Enumerate fresh profiles for expansion
///
/// Fronting names are synthesized per call so repeated expansions do
/// not present a stable fingerprint.
pub fn enumerate_profiles<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Vec<ExtenderProfile> {
    (0..count)
        .map(|i| {
            let label_len = rng.gen_range(6..=12);
            let label: String = (0..label_len)
                .map(|_| (b'a' + rng.gen_range(0..26)) as char)
                .collect();
            let tld = FRONTING_TLDS[rng.gen_range(0..FRONTING_TLDS.len())];
            ExtenderProfile {
                port: PROFILE_PORTS[i % PROFILE_PORTS.len()],
                fronting_host: format!("{label}.{tld}"),
            }
        })
        .collect()
}

/// Certificate verifier for the fake handshake
///
/// The extender presents a self-signed certificate for the fronting
/// name; authenticity comes from the HMAC header, not the chain.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ED25519,
        ]
    }
}

/// Dial through an extender toward the true destination
///
/// Completes the fake handshake, then prepends the signed header; the
/// returned stream carries the destination's bytes from here on.
pub async fn dial_extender(
    config: &ExtenderConfig,
    destination_host: &str,
    destination_port: u16,
    settings: &ClientStrategySettings,
) -> Result<TlsStream<TcpStream>> {
    let address = (config.ip, config.profile.port);
    let tcp = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| ConnectError::Timeout)?
        .map_err(|err| ConnectError::Connect(err.to_string()))?;

    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(config.profile.fronting_host.clone())
        .map_err(|err| ConnectError::Tls(err.to_string()))?;

    let mut stream = tokio::time::timeout(settings.tls_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ConnectError::Timeout)?
        .map_err(|err| ConnectError::Tls(err.to_string()))?;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill(&mut nonce);
    let secret = config.secret.as_deref().unwrap_or("");
    let header = ExtenderHeader::sign(
        destination_host,
        destination_port,
        timestamp,
        Bytes::copy_from_slice(&nonce),
        secret.as_bytes(),
    );

    stream
        .write_all(&header.encode_with_length())
        .await
        .map_err(|err| ConnectError::Extender(err.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|err| ConnectError::Extender(err.to_string()))?;

    debug!(ip = %config.ip, port = config.profile.port, destination = destination_host, "extender path open");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_enumerate_profiles_distinct() {
        let mut rng = StdRng::seed_from_u64(5);
        let profiles = enumerate_profiles(8, &mut rng);
        assert_eq!(profiles.len(), 8);

        // Ports cycle through the known set; hosts are all fresh.
        for profile in &profiles {
            assert!(PROFILE_PORTS.contains(&profile.port));
            assert!(profile.fronting_host.contains('.'));
        }
        let hosts: std::collections::HashSet<&str> = profiles
            .iter()
            .map(|profile| profile.fronting_host.as_str())
            .collect();
        assert_eq!(hosts.len(), profiles.len());
    }
}
