#![forbid(unsafe_code)]

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;

/// Build the acceptor used for the opportunistic TCP upgrade and HTTPS.
/// TLS 1.3 only.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
	let cert_chain = load_cert_chain(cert_path)?;
	let key = load_private_key(key_path)?;

	let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
		.with_no_client_auth()
		.with_single_cert(cert_chain, key)
		.context("build rustls server config")?;

	Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
	let pem = fs::read(path).with_context(|| format!("read tls cert: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let certs = certs(&mut reader).collect::<Result<Vec<_>, _>>().context("parse tls certs")?;

	if certs.is_empty() {
		return Err(anyhow!("no certificates found in {}", path.display()));
	}

	Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<rustls::pki_types::PrivateKeyDer<'static>> {
	let pem = fs::read(path).with_context(|| format!("read tls key: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let Some(key) = private_key(&mut reader).context("parse tls key")? else {
		return Err(anyhow!("no private key found in {}", path.display()));
	};
	Ok(key)
}
