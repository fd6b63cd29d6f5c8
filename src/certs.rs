use anyhow::{Context, Result};
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SanType,
};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use time::{Duration, OffsetDateTime};

/// How long a freshly generated self-signed certificate stays valid.
const VALIDITY: Duration = Duration::days(365);

/// Checks whether both certificate and key files exist
pub fn certs_exist(cert_path: &Path, key_path: &Path) -> bool {
    cert_path.exists() && key_path.exists()
}

/// Makes sure a self-signed certificate/key pair is present at the given paths.
///
/// Existing files are reused byte-for-byte unless `force` is set.
pub fn ensure_self_signed(cert_path: &Path, key_path: &Path, force: bool) -> Result<()> {
    if !force && certs_exist(cert_path, key_path) {
        tracing::debug!(cert = %cert_path.display(), key = %key_path.display(), "Reusing existing certificate");
        return Ok(());
    }
    generate_self_signed(cert_path, key_path)
}

/// Generates a self-signed certificate and key, saving them to the specified paths.
///
/// The certificate is valid for `localhost` and `127.0.0.1` for 365 days from
/// generation time. Parent directories are created as needed and the key file
/// is restricted to owner-only read/write.
pub fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    for path in [cert_path, key_path] {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .context(format!("Failed to create directory: {:?}", dir))?;
            }
        }
    }

    let cert = build_certificate().context("Failed to generate self-signed certificate")?;

    let cert_pem = cert
        .serialize_pem()
        .context("Failed to serialize certificate")?;
    fs::write(cert_path, cert_pem)
        .context(format!("Failed to write certificate: {:?}", cert_path))?;

    write_key_pem(key_path, &cert.serialize_private_key_pem())
        .context(format!("Failed to write private key: {:?}", key_path))?;

    tracing::info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "Generated self-signed certificate"
    );
    Ok(())
}

fn build_certificate() -> Result<Certificate, rcgen::RcgenError> {
    let mut params = CertificateParams::default();
    params.alg = &PKCS_ECDSA_P256_SHA256;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "localhost");
    dn.push(DnType::OrganizationName, "AZenv Self-Signed Certificate");
    params.distinguished_name = dn;

    params.subject_alt_names = vec![
        SanType::DnsName("localhost".to_string()),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ];

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + VALIDITY;

    Certificate::from_params(params)
}

/// Writes a PEM private key with owner-only permissions.
#[cfg(unix)]
pub(crate) fn write_key_pem(path: &Path, pem: &str) -> std::io::Result<()> {
    use std::io::Write as _;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pem.as_bytes())
}

#[cfg(not(unix))]
pub(crate) fn write_key_pem(path: &Path, pem: &str) -> std::io::Result<()> {
    fs::write(path, pem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use x509_parser::prelude::*;

    fn temp_paths(tag: &str) -> (PathBuf, PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("azenv-certs-{}-{}", tag, std::process::id()));
        (dir.join("server.crt"), dir.join("server.key"), dir)
    }

    fn parse_cert(pem: &[u8]) -> Vec<u8> {
        let ders = rustls_pemfile::certs(&mut &pem[..]).expect("invalid PEM");
        assert_eq!(ders.len(), 1);
        ders.into_iter().next().unwrap()
    }

    #[test]
    fn test_generate_creates_both_files() {
        let (cert_path, key_path, dir) = temp_paths("create");
        let _ = fs::remove_dir_all(&dir);

        assert!(!certs_exist(&cert_path, &key_path));
        ensure_self_signed(&cert_path, &key_path, false).unwrap();
        assert!(certs_exist(&cert_path, &key_path));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (cert_path, key_path, dir) = temp_paths("perms");
        let _ = fs::remove_dir_all(&dir);

        generate_self_signed(&cert_path, &key_path).unwrap();
        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_reuse_leaves_files_untouched() {
        let (cert_path, key_path, dir) = temp_paths("reuse");
        let _ = fs::remove_dir_all(&dir);

        ensure_self_signed(&cert_path, &key_path, false).unwrap();
        let first_cert = fs::read(&cert_path).unwrap();
        let first_key = fs::read(&key_path).unwrap();

        ensure_self_signed(&cert_path, &key_path, false).unwrap();
        assert_eq!(fs::read(&cert_path).unwrap(), first_cert);
        assert_eq!(fs::read(&key_path).unwrap(), first_key);

        // Forced regeneration replaces the key material.
        ensure_self_signed(&cert_path, &key_path, true).unwrap();
        assert_ne!(fs::read(&key_path).unwrap(), first_key);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_certificate_names_and_validity() {
        let (cert_path, key_path, dir) = temp_paths("names");
        let _ = fs::remove_dir_all(&dir);

        generate_self_signed(&cert_path, &key_path).unwrap();

        let pem = fs::read(&cert_path).unwrap();
        let der = parse_cert(&pem);
        let (_, cert) = X509Certificate::from_der(&der).expect("invalid certificate");

        let san = cert
            .subject_alternative_name()
            .unwrap()
            .expect("certificate has no SAN extension");
        let has_localhost = san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName(dns) if *dns == "localhost"));
        let has_loopback = san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(ip) if **ip == [127, 0, 0, 1]));
        assert!(has_localhost, "missing localhost SAN");
        assert!(has_loopback, "missing 127.0.0.1 SAN");

        let validity = cert.validity();
        let window = validity.not_after.to_datetime() - validity.not_before.to_datetime();
        assert_eq!(window.whole_days(), 365);

        fs::remove_dir_all(&dir).unwrap();
    }
}
