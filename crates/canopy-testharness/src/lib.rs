//! ---
//! canopy_section: "05-testing"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Test harness exports."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
//! In-process stand-in for the greenhouse backend. Integration tests drive the
//! bridge against it over real sockets.

pub mod backend;

pub use backend::{MockBackend, MockBackendBuilder};

use canopy_msg::SettingsFields;
use sha2::{Digest, Sha256};

/// Checksum the mock backend returns for a saved section: the first eight hex
/// digits of the SHA-256 of the JSON-encoded fields, upper-cased.
pub fn settings_checksum(fields: &SettingsFields) -> String {
    let encoded = serde_json::to_vec(fields).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    hex::encode_upper(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checksum_is_eight_uppercase_hex_digits_and_order_sensitive() {
        let mut a = SettingsFields::new();
        a.insert("target_ph".into(), json!(6.0));
        a.insert("dose_ml".into(), json!(12));
        let mut b = SettingsFields::new();
        b.insert("dose_ml".into(), json!(12));
        b.insert("target_ph".into(), json!(6.0));

        let sum = settings_checksum(&a);
        assert_eq!(sum.len(), 8);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_eq!(sum, settings_checksum(&a.clone()));
        assert_ne!(sum, settings_checksum(&b));
    }
}
