use sha2::{Digest, Sha256};

use crate::config::TransferSettings;
use crate::protocol::DeviceInfo;

const DEVICE_ID_HEX_LEN: usize = 32;

/// Derive the device id from the platform build fingerprint.
///
/// Deterministic, so the same device reports the same id across app
/// reinstalls. Devices sharing an identical firmware build fingerprint get
/// the same id, and a factory reset that changes the fingerprint changes it.
pub fn derive_device_id(fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(DEVICE_ID_HEX_LEN);
    id
}

/// Build the descriptor sent with a transfer request.
pub fn describe_device(fingerprint: &str, settings: &TransferSettings) -> DeviceInfo {
    DeviceInfo {
        device_id: derive_device_id(fingerprint),
        model: settings.device_model.clone(),
        os_version: settings.os_version.clone(),
        location: settings.location.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FINGERPRINT: &str = "google/husky/husky:15/AP4A.250105.002/12701944:user/release-keys";

    #[test]
    fn test_device_id_is_deterministic() {
        assert_eq!(derive_device_id(FINGERPRINT), derive_device_id(FINGERPRINT));
        assert_eq!(derive_device_id(FINGERPRINT).len(), DEVICE_ID_HEX_LEN);
    }

    #[test]
    fn test_different_fingerprints_produce_different_ids() {
        let other = "samsung/dm3q/dm3q:14/UP1A.231005.007/S918BXXS3BXA1:user/release-keys";
        assert_ne!(derive_device_id(FINGERPRINT), derive_device_id(other));
    }

    #[test]
    fn test_describe_device_uses_settings() {
        let settings = TransferSettings {
            device_model: "Pixel 8 Pro".into(),
            os_version: "15".into(),
            location: Some("Berlin".into()),
            ..TransferSettings::default()
        };

        let info = describe_device(FINGERPRINT, &settings);
        assert_eq!(info.model, "Pixel 8 Pro");
        assert_eq!(info.location.as_deref(), Some("Berlin"));
        assert_eq!(info.device_id, derive_device_id(FINGERPRINT));
    }
}
