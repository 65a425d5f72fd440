//! Client TLS configuration. Handshake and certificate verification
//! internals are delegated entirely to `rustls`; this module only builds
//! the `ClientConfig` the Upstream-Dialer hands to `tokio_rustls`.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12, &rustls::version::TLS13];

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("failed to load native root certificates: {0}")]
	Roots(std::io::Error),
	#[error("invalid server name: {0}")]
	ServerName(#[from] rustls_pki_types::InvalidDnsNameError),
	#[error("{0}")]
	Rustls(#[from] rustls::Error),
}

/// Builds a `ClientConfig` trusting the platform's native root store, with
/// `alpn` advertised in preference order (e.g. `["h2", "http/1.1"]`).
pub fn client_config(alpn: &[&str]) -> Result<Arc<ClientConfig>, Error> {
	let mut roots = RootCertStore::empty();
	for cert in rustls_native_certs::load_native_certs().certs {
		// Skip certs the platform store failed to parse rather than failing
		// the whole connector; a handful of malformed entries is common.
		let _ = roots.add(cert);
	}
	let mut cfg = ClientConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)?
		.with_root_certificates(roots)
		.with_no_client_auth();
	cfg.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
	Ok(Arc::new(cfg))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, Error> {
	Ok(ServerName::try_from(host.to_string())?)
}

/// Chromium's `VerifyNameMatch`: true iff `host` is covered by one of the
/// leaf certificate's DNS subject-alternative-names, exact or single-label
/// wildcard. Used by the Session Pool to decide whether a session dialed for
/// one host may be aliased to a request for another.
pub fn verify_name_match(leaf_der: &[u8], host: &str) -> bool {
	let Ok((_, cert)) = x509_parser::parse_x509_certificate(leaf_der) else {
		return false;
	};
	let Some(san) = cert.subject_alternative_name().ok().flatten() else {
		return false;
	};
	san.value
		.general_names
		.iter()
		.any(|name| matches!(name, x509_parser::extensions::GeneralName::DNSName(dns) if dns_name_matches(dns, host)))
}

fn dns_name_matches(pattern: &str, host: &str) -> bool {
	if pattern.eq_ignore_ascii_case(host) {
		return true;
	}
	match (pattern.strip_prefix("*."), host.split_once('.')) {
		(Some(rest), Some((_, host_rest))) => rest.eq_ignore_ascii_case(host_rest),
		_ => false,
	}
}

pub mod insecure {
	use std::sync::Arc;

	use rustls::DigitallySignedStruct;
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

	/// Accepts any certificate. Only ever wired up behind an explicit
	/// operator opt-in (`--insecure-skip-verify`), never by default.
	#[derive(Debug)]
	pub struct NoVerifier(pub Arc<rustls::crypto::CryptoProvider>);

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer,
			_intermediates: &[CertificateDer],
			_server_name: &ServerName,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
		}

		fn verify_tls13_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			self.0.signature_verification_algorithms.supported_schemes()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn server_name_rejects_garbage() {
		assert!(server_name("not a hostname!").is_err());
	}

	#[test]
	fn server_name_accepts_dns_names() {
		assert!(server_name("example.com").is_ok());
	}

	#[test]
	fn dns_name_matches_exact_and_wildcard() {
		assert!(dns_name_matches("example.com", "example.com"));
		assert!(dns_name_matches("*.example.com", "api.example.com"));
		assert!(!dns_name_matches("*.example.com", "api.other.com"));
		assert!(!dns_name_matches("*.example.com", "example.com"));
	}

	#[test]
	fn verify_name_match_rejects_malformed_der() {
		assert!(!verify_name_match(b"not a certificate", "example.com"));
	}
}
