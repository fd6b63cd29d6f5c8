use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔐 Generating self-signed certificate...\n");

    let cert_path = Path::new("cert/server.crt");
    let key_path = Path::new("cert/server.key");
    azenv::certs::generate_self_signed(cert_path, key_path)?;

    println!("   ✓ Saved {}", cert_path.display());
    println!("   ✓ Saved {}\n", key_path.display());
    println!("✅ Certificate valid for localhost / 127.0.0.1 for 365 days");

    Ok(())
}
