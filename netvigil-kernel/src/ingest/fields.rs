/*!
 * EXTRACTION DES CHAMPS - Enregistrements bruts du collecteur → lectures typées
 *
 * Format d'entrée (un élément du tableau posté) :
 * `{ "name": "...", "tags": {...}, "fields": {...}, "timestamp": ... }`
 *
 * Le collecteur n'est pas homogène : plusieurs alias par métrique, nombres
 * parfois encodés en chaînes, timestamps en s / ms / µs / ns ou RFC3339.
 */

use crate::ingest::classify::classify;
use crate::models::{InterfaceReading, InterfaceStatus, PingReading, Thresholds, WirelessReading};
use serde::Deserialize;
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("record is not a metric object: {0}")]
    InvalidRecord(#[from] serde_json::Error),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("malformed field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error("unexpected metric {0:?}")]
    UnexpectedMetric(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMetric {
    pub name: String,
    #[serde(default)]
    pub tags: Map<String, Value>,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl RawMetric {
    pub fn from_value(value: &Value) -> Result<Self, IngestError> {
        Ok(RawMetric::deserialize(value)?)
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).or_else(|| self.tags.get(key)).filter(|v| !v.is_null())
    }

    pub fn tag(&self, key: &str) -> Option<String> {
        match self.tags.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Premier alias présent, nombre JSON ou chaîne numérique
    pub fn number(&self, aliases: &[&str]) -> Option<f64> {
        aliases.iter().find_map(|key| as_f64(self.lookup(key)?))
    }

    /// Compteur SNMP entier, sans passer par f64 (les compteurs 64 bits dépassent 2^53)
    fn counter(&self, aliases: &[&str]) -> Option<u64> {
        aliases.iter().find_map(|key| as_u64(self.lookup(key)?))
    }

    /// Horodatage de l'enregistrement, heure de réception à défaut
    pub fn observed_at(&self) -> OffsetDateTime {
        self.timestamp.as_ref().and_then(parse_timestamp).unwrap_or_else(OffsetDateTime::now_utc)
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|v| v.is_finite() && *v >= 0.0).map(|v| v as u64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>().ok().or_else(|| s.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0).map(|v| v as u64))
        }
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<OffsetDateTime> {
    if let Value::String(s) = value {
        if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
            return Some(ts);
        }
    }
    let raw = as_f64(value)?;
    if raw <= 0.0 {
        return None;
    }
    let nanos: i128 = match raw {
        r if r < 1e11 => (r * 1e9) as i128,
        r if r < 1e14 => (r * 1e6) as i128,
        r if r < 1e17 => (r * 1e3) as i128,
        r => r as i128,
    };
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

pub fn ping_reading(metric: &RawMetric, device_id: &str, thresholds: &Thresholds) -> Result<PingReading, IngestError> {
    if metric.name != "ping" {
        return Err(IngestError::UnexpectedMetric(metric.name.clone()));
    }
    let mut latency = metric.number(&["average_response_ms", "avg"]).filter(|l| *l >= 0.0);
    let mut packet_loss = metric.number(&["percent_packet_loss", "packet_loss"]);

    // result_code != 0 : hôte injoignable ou erreur de résolution
    if metric.number(&["result_code"]).is_some_and(|code| code != 0.0) {
        latency = None;
        packet_loss = Some(100.0);
    }
    let packet_loss = packet_loss
        .unwrap_or(if latency.is_some() { 0.0 } else { 100.0 })
        .clamp(0.0, 100.0);

    Ok(PingReading {
        device_id: device_id.to_string(),
        status: classify(latency, packet_loss, thresholds),
        latency,
        packet_loss,
        timestamp: metric.observed_at(),
    })
}

/// Vitesse en Mbps : `ifHighSpeed` (déjà en Mbps) prioritaire, `ifSpeed` en bps s'il atteint 1 000 000
pub fn normalize_speed(metric: &RawMetric) -> Option<f64> {
    if let Some(high) = metric.number(&["ifHighSpeed"]).filter(|v| *v > 0.0) {
        return Some(high);
    }
    let speed = metric.number(&["ifSpeed", "speed"])?;
    if speed >= 1_000_000.0 {
        Some(speed / 1_000_000.0)
    } else {
        Some(speed)
    }
}

fn interface_status(metric: &RawMetric, key: &'static str) -> Result<Option<InterfaceStatus>, IngestError> {
    let Some(value) = metric.lookup(key) else { return Ok(None) };
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(InterfaceStatus::from_code),
        Value::String(s) => InterfaceStatus::parse(s),
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| IngestError::Malformed { field: key, reason: format!("unknown status {value}") })
}

pub fn interface_reading(metric: &RawMetric, device_id: &str) -> Result<InterfaceReading, IngestError> {
    let if_index = metric.number(&["ifIndex"]).ok_or(IngestError::MissingField("ifIndex"))?;
    if if_index < 0.0 || if_index > u32::MAX as f64 || if_index.fract() != 0.0 {
        return Err(IngestError::Malformed { field: "ifIndex", reason: format!("{if_index} is not an interface index") });
    }
    let if_index = if_index as u32;
    let if_name = metric
        .tag("ifName")
        .or_else(|| metric.tag("ifDescr"))
        .or_else(|| metric.fields.get("ifName").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("if{if_index}"));
    let oper_status = interface_status(metric, "ifOperStatus")?.ok_or(IngestError::MissingField("ifOperStatus"))?;

    Ok(InterfaceReading {
        device_id: device_id.to_string(),
        if_index,
        if_name,
        oper_status,
        admin_status: interface_status(metric, "ifAdminStatus")?,
        speed_mbps: normalize_speed(metric),
        in_octets: metric.counter(&["ifHCInOctets", "ifInOctets"]),
        out_octets: metric.counter(&["ifHCOutOctets", "ifOutOctets"]),
        in_errors: metric.counter(&["ifInErrors"]),
        out_errors: metric.counter(&["ifOutErrors"]),
        in_discards: metric.counter(&["ifInDiscards"]),
        out_discards: metric.counter(&["ifOutDiscards"]),
        timestamp: metric.observed_at(),
    })
}

pub fn wireless_reading(metric: &RawMetric, device_id: &str) -> Result<WirelessReading, IngestError> {
    let reading = WirelessReading {
        device_id: device_id.to_string(),
        interface: metric.tag("interface").or_else(|| metric.tag("ifName")).or_else(|| metric.tag("radio")),
        signal: metric.number(&["signal", "signal_strength", "rssi"]),
        noise_floor: metric.number(&["noise_floor", "noiseFloor", "noise"]),
        tx_rate: metric.number(&["tx_rate", "txRate"]),
        rx_rate: metric.number(&["rx_rate", "rxRate"]),
        timestamp: metric.observed_at(),
    };
    if reading.signal.is_none() && reading.noise_floor.is_none() && reading.tx_rate.is_none() && reading.rx_rate.is_none()
    {
        return Err(IngestError::MissingField("signal"));
    }
    Ok(reading)
}
