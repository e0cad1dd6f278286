/*!
 * ANNUAIRE DES ÉQUIPEMENTS - Résolution adresse → équipement configuré
 *
 * Le collecteur rapporte des adresses sous des formes variées
 * (`10.0.0.1`, `10.0.0.1:161`, `udp://10.0.0.1:161`, `[fe80::1]:161`).
 * L'annuaire normalise l'adresse puis cherche l'équipement ; il fournit aussi
 * les seuils effectifs (défauts globaux + surcharges de l'équipement).
 */

use crate::config::KernelConfig;
use crate::models::{Device, Thresholds};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::warn;

pub struct DeviceDirectory {
    devices: HashMap<String, Device>,
    defaults: Thresholds,
}

impl DeviceDirectory {
    pub fn new(devices: Vec<Device>, defaults: Thresholds) -> Self {
        let mut map = HashMap::with_capacity(devices.len());
        for device in devices {
            let key = normalize_address(&device.ip);
            if let Some(previous) = map.insert(key.clone(), device) {
                warn!("[directory] address {key} declared twice, {} replaced", previous.id);
            }
        }
        Self { devices: map, defaults }
    }

    pub fn from_config(cfg: &KernelConfig) -> Self {
        Self::new(cfg.devices.clone(), cfg.thresholds)
    }

    pub fn resolve(&self, address: &str) -> Option<&Device> {
        self.devices.get(&normalize_address(address))
    }

    pub fn thresholds_for(&self, device: &Device) -> Thresholds {
        match &device.thresholds {
            Some(overrides) => self.defaults.with_overrides(overrides),
            None => self.defaults,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Retire schéma, chemin et suffixe de port d'une adresse rapportée
pub fn strip_port(address: &str) -> &str {
    let trimmed = address.trim();
    let without_scheme = trimmed.split_once("://").map(|(_, rest)| rest).unwrap_or(trimmed);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);

    if let Some(bracketed) = host.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    // un seul ':' => hôte:port ; plusieurs => IPv6 nue
    match host.matches(':').count() {
        1 => host.split(':').next().unwrap_or(host),
        _ => host,
    }
}

fn normalize_address(address: &str) -> String {
    let host = strip_port(address);
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}
