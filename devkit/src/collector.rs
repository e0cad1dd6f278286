/*!
Builders de payloads au format du collecteur

Produit les enregistrements `{name, tags, fields, timestamp}` tels que postés
sur `/ping` et `/snmp`, pour écrire des tests sans collecteur réel.
*/

use chrono::Utc;
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub struct MetricBuilder {
    name: String,
    tags: Map<String, Value>,
    fields: Map<String, Value>,
    timestamp: Option<i64>,
}

impl MetricBuilder {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), tags: Map::new(), fields: Map::new(), timestamp: None }
    }

    pub fn tag(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Timestamp en secondes Unix (comme le collecteur par défaut)
    pub fn timestamp(mut self, secs: i64) -> Self {
        self.timestamp = Some(secs);
        self
    }

    pub fn now(self) -> Self {
        let secs = Utc::now().timestamp();
        self.timestamp(secs)
    }

    pub fn build(self) -> Value {
        let mut record = Map::new();
        record.insert("name".into(), Value::String(self.name));
        record.insert("tags".into(), Value::Object(self.tags));
        record.insert("fields".into(), Value::Object(self.fields));
        if let Some(ts) = self.timestamp {
            record.insert("timestamp".into(), Value::from(ts));
        }
        Value::Object(record)
    }
}

/// Mesure ping ; `avg = None` simule l'absence de réponse
pub fn ping_metric(url: &str, avg: Option<f64>, packet_loss: f64) -> Value {
    let mut builder = MetricBuilder::new("ping")
        .tag("url", url)
        .field("percent_packet_loss", packet_loss)
        .field("result_code", 0)
        .now();
    if let Some(avg) = avg {
        builder = builder.field("average_response_ms", avg);
    }
    builder.build()
}

/// Échantillon SNMP IF-MIB ; `high_speed` en Mbps
pub fn interface_metric(agent_host: &str, if_index: u32, if_name: &str, oper_status: &str, high_speed: Option<f64>) -> Value {
    let mut builder = MetricBuilder::new("interface")
        .tag("agent_host", agent_host)
        .tag("ifIndex", if_index.to_string())
        .tag("ifName", if_name)
        .field("ifOperStatus", oper_status)
        .field("ifAdminStatus", "up")
        .now();
    if let Some(speed) = high_speed {
        builder = builder.field("ifHighSpeed", speed);
    }
    builder.build()
}

/// Échantillon radio `ubiquiti_wireless` (dBm)
pub fn wireless_metric(agent_host: &str, signal: f64, noise_floor: f64) -> Value {
    MetricBuilder::new("ubiquiti_wireless")
        .tag("agent_host", agent_host)
        .tag("interface", "wlan0")
        .field("signal", signal)
        .field("noise_floor", noise_floor)
        .now()
        .build()
}
