use anyhow::Result;
use std::path::Path;

use super::config::expand_path;
use crate::tls;

/// Generate self-signed TLS certificate
///
/// IP 形式的名称会写成 IP SAN，其余写成 DNS SAN
pub fn generate_certificate(
    cert_out: &str,
    key_out: &str,
    common_name: &str,
    alt_names: &[String],
) -> Result<()> {
    let cert_out = expand_path(cert_out)?;
    let key_out = expand_path(key_out)?;

    tls::generate_self_signed_cert(
        common_name,
        alt_names,
        Path::new(&cert_out),
        Path::new(&key_out),
    )?;

    println!("Generated self-signed certificate: {}", cert_out);
    println!("Generated private key: {}", key_out);

    Ok(())
}
