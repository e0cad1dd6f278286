/*!
 * FLAPPING DETECTOR - Liens instables (statut / vitesse qui oscillent)
 *
 * FONCTIONNEMENT :
 * - Un historique borné par (device_id, if_index) : fenêtre glissante
 *   relative à l'échantillon le plus récent + capacité maximale
 * - Transition = deux échantillons consécutifs qui diffèrent par le statut
 *   ou par la vitesse
 * - États : stable → flapping quand transitions > seuil (un seul événement
 *   par franchissement) ; flapping → stable quand transitions ≤ seuil
 */

use crate::config::FlappingConf;
use crate::models::{FlappingEvent, InterfaceStatus, LinkState};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSample {
    pub status: InterfaceStatus,
    pub speed_mbps: Option<f64>,
    pub observed_at: OffsetDateTime,
}

impl LinkSample {
    fn link_state(&self) -> LinkState {
        LinkState { status: self.status, speed_mbps: self.speed_mbps }
    }

    fn differs_from(&self, other: &LinkSample) -> bool {
        self.status != other.status || self.speed_mbps != other.speed_mbps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStability {
    Stable,
    Flapping,
}

struct History {
    samples: VecDeque<LinkSample>,
    state: LinkStability,
    last_touched: Instant,
}

pub struct FlappingDetector {
    config: FlappingConf,
    histories: Mutex<HashMap<(String, u32), History>>,
}

impl FlappingDetector {
    pub fn new(config: FlappingConf) -> Self {
        Self { config, histories: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &FlappingConf {
        &self.config
    }

    /// Ajoute un échantillon ; renvoie un événement uniquement au franchissement du seuil
    pub fn check(&self, device_id: &str, if_index: u32, if_name: &str, sample: LinkSample) -> Option<FlappingEvent> {
        let window = time::Duration::seconds(self.config.window_secs as i64);
        let capacity = self.config.capacity.max(2);

        let mut histories = self.histories.lock();
        let history = histories.entry((device_id.to_string(), if_index)).or_insert_with(|| History {
            samples: VecDeque::with_capacity(capacity),
            state: LinkStability::Stable,
            last_touched: Instant::now(),
        });
        history.last_touched = Instant::now();
        history.samples.push_back(sample);

        let newest = history.samples.iter().map(|s| s.observed_at).max().unwrap_or(sample.observed_at);
        let horizon = newest - window;
        while history.samples.front().is_some_and(|s| s.observed_at < horizon) {
            history.samples.pop_front();
        }
        while history.samples.len() > capacity {
            history.samples.pop_front();
        }

        let transitions = count_transitions(&history.samples);
        match history.state {
            LinkStability::Stable if transitions > self.config.threshold => {
                history.state = LinkStability::Flapping;
                let len = history.samples.len();
                let from = history.samples[len - 2].link_state();
                let to = history.samples[len - 1].link_state();
                info!("[flapping] {device_id}/{if_name} (ifIndex {if_index}): {transitions} transitions in window");
                Some(FlappingEvent {
                    device_id: device_id.to_string(),
                    if_index,
                    if_name: if_name.to_string(),
                    from,
                    to,
                    transitions,
                    timestamp: sample.observed_at,
                })
            }
            LinkStability::Flapping if transitions <= self.config.threshold => {
                history.state = LinkStability::Stable;
                debug!("[flapping] {device_id}/{if_name} settled ({transitions} transitions)");
                None
            }
            _ => None,
        }
    }

    pub fn is_flapping(&self, device_id: &str, if_index: u32) -> bool {
        self.histories
            .lock()
            .get(&(device_id.to_string(), if_index))
            .is_some_and(|h| h.state == LinkStability::Flapping)
    }

    /// Oublie les interfaces sans échantillon depuis plus d'une fenêtre
    pub fn sweep(&self, now: Instant) -> usize {
        let window = self.config.window();
        let mut histories = self.histories.lock();
        let before = histories.len();
        histories.retain(|_, h| now.saturating_duration_since(h.last_touched) <= window);
        let removed = before - histories.len();
        if removed > 0 {
            debug!("[flapping] swept {removed} idle interface histories");
        }
        removed
    }

    pub fn tracked(&self) -> usize {
        self.histories.lock().len()
    }
}

fn count_transitions(samples: &VecDeque<LinkSample>) -> usize {
    samples.iter().zip(samples.iter().skip(1)).filter(|(a, b)| b.differs_from(a)).count()
}
