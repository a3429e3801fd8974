use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{AttributeValue, ConditionType};
use crate::token::WeddingContext;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Offline,
    Unknown,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Wifi => "wifi",
            ConnectionType::Cellular => "cellular",
            ConnectionType::Ethernet => "ethernet",
            ConnectionType::Offline => "offline",
            ConnectionType::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub os_version: String,
    pub encrypted: bool,
    #[serde(default)]
    pub biometric_available: bool,
    #[serde(default)]
    pub screen_lock_enabled: bool,
    #[serde(default)]
    pub jailbroken: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInfo {
    pub connection_type: ConnectionType,
    pub secure: bool,
    #[serde(default)]
    pub vpn_active: bool,
    pub certificate_valid: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppInfo {
    pub version: String,
    #[serde(default)]
    pub build: String,
    #[serde(default = "default_integrity")]
    pub integrity_verified: bool,
}

fn default_integrity() -> bool {
    true
}

/// Snapshot supplied by the caller for one access decision.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluationContext {
    pub user_id: String,
    pub role: String,
    pub device: DeviceInfo,
    pub network: NetworkInfo,
    pub app: AppInfo,
    #[serde(default)]
    pub wedding: Option<WeddingContext>,
}

impl EvaluationContext {
    /// SHA-256 over the canonical JSON encoding, hex encoded.
    ///
    /// Field order is fixed by the struct definitions, so equal contexts hash
    /// equally.
    pub fn fingerprint(&self) -> Result<String> {
        let encoded = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }

    pub(crate) fn attribute(&self, condition: ConditionType) -> AttributeValue {
        match condition {
            ConditionType::DeviceEncryption => AttributeValue::Bool(self.device.encrypted),
            ConditionType::CertificateValidation => {
                AttributeValue::Bool(self.network.certificate_valid)
            }
            ConditionType::BiometricAvailable => {
                AttributeValue::Bool(self.device.biometric_available)
            }
            ConditionType::ScreenLock => AttributeValue::Bool(self.device.screen_lock_enabled),
            ConditionType::JailbreakDetection => AttributeValue::Bool(self.device.jailbroken),
            ConditionType::NetworkSecurity => AttributeValue::Bool(self.network.secure),
            ConditionType::VpnActive => AttributeValue::Bool(self.network.vpn_active),
            ConditionType::ConnectionType => {
                AttributeValue::Text(self.network.connection_type.as_str().to_string())
            }
            ConditionType::AppVersion => AttributeValue::Version(self.app.version.clone()),
            ConditionType::AppIntegrity => AttributeValue::Bool(self.app.integrity_verified),
            ConditionType::OsVersion => AttributeValue::Version(self.device.os_version.clone()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_context() -> EvaluationContext {
        EvaluationContext {
            user_id: "user-1".to_string(),
            role: "planner".to_string(),
            device: DeviceInfo {
                device_id: "device-1".to_string(),
                platform: "ios".to_string(),
                os_version: "17.2".to_string(),
                encrypted: true,
                biometric_available: true,
                screen_lock_enabled: true,
                jailbroken: false,
            },
            network: NetworkInfo {
                connection_type: ConnectionType::Wifi,
                secure: true,
                vpn_active: false,
                certificate_valid: true,
            },
            app: AppInfo {
                version: "2.4.1".to_string(),
                build: "241".to_string(),
                integrity_verified: true,
            },
            wedding: None,
        }
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let ctx = sample_context();
        let a = ctx.fingerprint().unwrap();
        assert_eq!(a, ctx.clone().fingerprint().unwrap());
        assert_eq!(a.len(), 64);

        let mut changed = ctx;
        changed.device.encrypted = false;
        assert_ne!(a, changed.fingerprint().unwrap());
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{
            "user_id": "u",
            "role": "vendor",
            "device": {"device_id": "d", "encrypted": true},
            "network": {"connection_type": "cellular", "secure": true, "certificate_valid": true},
            "app": {"version": "1.0.0"}
        }"#;
        let ctx: EvaluationContext = serde_json::from_str(json).unwrap();
        assert!(!ctx.device.jailbroken);
        assert!(ctx.app.integrity_verified);
        assert!(ctx.wedding.is_none());
        assert_eq!(
            ctx.attribute(ConditionType::ConnectionType),
            AttributeValue::Text("cellular".to_string())
        );
    }
}
