//! Machine fingerprint used as the service license.
//!
//! The upstream activates a daemon by presenting the same fingerprint the
//! daemon derives for itself; `--stop` authenticates the same way.  Derived
//! from the machine id, so it is stable across restarts and distinct across
//! hosts.

use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
#[error("cannot derive machine fingerprint: {0}")]
pub struct LicenseError(String);

/// SHA-256 of the machine identity, hex-encoded.
pub fn fingerprint() -> Result<String, LicenseError> {
    let id = machine_id()?;
    let mut hasher = Sha256::new();
    hasher.update(id.trim().as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn machine_id() -> Result<String, LicenseError> {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = std::fs::read_to_string(path) {
            if !id.trim().is_empty() {
                return Ok(id);
            }
        }
    }
    // Containers may lack a machine id; fall back to the kernel hostname.
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map_err(|e| LicenseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_hex() {
        let a = fingerprint().unwrap();
        let b = fingerprint().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
