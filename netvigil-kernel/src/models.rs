/*!
 * MODÈLES - Lectures de télémétrie et événements du pipeline
 *
 * Toutes les structures publiées sur les canaux pub/sub sont sérialisées en
 * camelCase (format attendu par les observateurs WebSocket) ; les lignes
 * persistées sont construites explicitement par l'ingestion en snake_case.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Statut d'un équipement dérivé d'une mesure ping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Up,
    Degraded,
    Down,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Up => "up",
            DeviceStatus::Degraded => "degraded",
            DeviceStatus::Down => "down",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Palier de seuils : plafond de latence (ms) et de perte de paquets (%)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub latency_ms: f64,
    pub packet_loss: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub good: Tier,
    pub degraded: Tier,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            good: Tier { latency_ms: 50.0, packet_loss: 1.0 },
            degraded: Tier { latency_ms: 150.0, packet_loss: 5.0 },
        }
    }
}

/// Surcharge partielle d'un palier (champ absent = valeur globale)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TierOverride {
    pub latency_ms: Option<f64>,
    pub packet_loss: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOverrides {
    pub good: Option<TierOverride>,
    pub degraded: Option<TierOverride>,
}

impl Tier {
    fn merged(self, over: Option<TierOverride>) -> Tier {
        let Some(over) = over else { return self };
        Tier {
            latency_ms: over.latency_ms.unwrap_or(self.latency_ms),
            packet_loss: over.packet_loss.unwrap_or(self.packet_loss),
        }
    }
}

impl Thresholds {
    /// Applique les surcharges d'un équipement champ par champ
    pub fn with_overrides(&self, overrides: &ThresholdOverrides) -> Thresholds {
        Thresholds {
            good: self.good.merged(overrides.good),
            degraded: self.degraded.merged(overrides.degraded),
        }
    }
}

/// Équipement configuré (lecture seule pour le pipeline)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub ip: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
    #[serde(default)]
    pub thresholds: Option<ThresholdOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReading {
    pub device_id: String,
    pub status: DeviceStatus,
    pub latency: Option<f64>,
    pub packet_loss: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// ifOperStatus / ifAdminStatus (IF-MIB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterfaceStatus {
    Up,
    Down,
    Testing,
    Unknown,
    Dormant,
    NotPresent,
    LowerLayerDown,
}

impl InterfaceStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Up),
            2 => Some(Self::Down),
            3 => Some(Self::Testing),
            4 => Some(Self::Unknown),
            5 => Some(Self::Dormant),
            6 => Some(Self::NotPresent),
            7 => Some(Self::LowerLayerDown),
            _ => None,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Ok(code) = text.parse::<i64>() {
            return Self::from_code(code);
        }
        match text.to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "testing" => Some(Self::Testing),
            "unknown" => Some(Self::Unknown),
            "dormant" => Some(Self::Dormant),
            "notpresent" | "not_present" => Some(Self::NotPresent),
            "lowerlayerdown" | "lower_layer_down" => Some(Self::LowerLayerDown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Testing => "testing",
            Self::Unknown => "unknown",
            Self::Dormant => "dormant",
            Self::NotPresent => "notPresent",
            Self::LowerLayerDown => "lowerLayerDown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceReading {
    pub device_id: String,
    pub if_index: u32,
    pub if_name: String,
    pub oper_status: InterfaceStatus,
    pub admin_status: Option<InterfaceStatus>,
    pub speed_mbps: Option<f64>,
    pub in_octets: Option<u64>,
    pub out_octets: Option<u64>,
    pub in_errors: Option<u64>,
    pub out_errors: Option<u64>,
    pub in_discards: Option<u64>,
    pub out_discards: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirelessReading {
    pub device_id: String,
    pub interface: Option<String>,
    pub signal: Option<f64>,
    pub noise_floor: Option<f64>,
    pub tx_rate: Option<f64>,
    pub rx_rate: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// État d'un lien tel que vu par le détecteur de flapping
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkState {
    pub status: InterfaceStatus,
    pub speed_mbps: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlappingEvent {
    pub device_id: String,
    pub if_index: u32,
    pub if_name: String,
    pub from: LinkState,
    pub to: LinkState,
    pub transitions: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Dernier état connu d'un équipement, publié sur `device:update`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub name: Option<String>,
    pub area_id: Option<String>,
    pub status: DeviceStatus,
    pub previous_status: Option<DeviceStatus>,
    pub changed: bool,
    pub latency: Option<f64>,
    pub packet_loss: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Format RFC3339 pour les lignes persistées
pub fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}
