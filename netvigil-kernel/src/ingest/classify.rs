use crate::models::{DeviceStatus, Thresholds, Tier};

fn within(tier: &Tier, latency: f64, packet_loss: f64) -> bool {
    latency <= tier.latency_ms && packet_loss <= tier.packet_loss
}

/// `up` si les deux métriques tiennent dans le palier good, `degraded` si elles
/// tiennent dans le palier degraded, `down` sinon. Sans latence (aucun écho) : `down`.
pub fn classify(latency: Option<f64>, packet_loss: f64, thresholds: &Thresholds) -> DeviceStatus {
    let Some(latency) = latency.filter(|l| l.is_finite()) else {
        return DeviceStatus::Down;
    };
    if within(&thresholds.good, latency, packet_loss) {
        DeviceStatus::Up
    } else if within(&thresholds.degraded, latency, packet_loss) {
        DeviceStatus::Degraded
    } else {
        DeviceStatus::Down
    }
}
