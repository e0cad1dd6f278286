/*!
 * DISSEMINATION HUB - Observateurs WebSocket groupés en rooms
 *
 * RÔLE :
 * Registre des observateurs connectés ; chacun peut rejoindre des rooms
 * `device:{id}` et `area:{id}`. Chaque émission part dans sa room (si
 * applicable) ET en broadcast global.
 *
 * FONCTIONNEMENT :
 * - Un canal sortant borné par client (`CLIENT_QUEUE`) ; un client qui ne
 *   lit plus perd les messages en excès (comptés dans `dropped_messages`)
 * - Relais pub/sub : les canaux du cache sont consommés et convertis en
 *   émissions, pour que chaque instance voie les mises à jour de toutes
 * - Livraison best-effort, au plus une fois ; un client dont le canal est
 *   fermé est retiré du registre
 *
 * PROTOCOLE :
 * client → serveur : `{"type":"subscribe","deviceId":..,"areaId":..}`,
 *                    `{"type":"unsubscribe",..}`, `{"type":"ping"}`
 * serveur → client : `{"event":..,"room":..|null,"data":..}`
 */

use crate::cache::{CacheManager, ChannelMessage};
use crate::state::{new_state, Shared};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CHANNEL_DEVICE_UPDATE: &str = "device:update";
pub const CHANNEL_INTERFACE_UPDATE: &str = "interface:update";
pub const CHANNEL_WIRELESS_UPDATE: &str = "wireless:update";
pub const CHANNEL_ALERT_FLAPPING: &str = "alert:flapping";

const RELAY_CHANNELS: &[&str] =
    &[CHANNEL_DEVICE_UPDATE, CHANNEL_INTERFACE_UPDATE, CHANNEL_WIRELESS_UPDATE, CHANNEL_ALERT_FLAPPING];
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);
/// Messages en attente par observateur avant abandon
pub const CLIENT_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMessage {
    pub event: String,
    pub room: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSelection {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
}

impl RoomSelection {
    fn rooms(&self) -> Vec<String> {
        let device = self.device_id.iter().map(|id| device_room(id));
        let area = self.area_id.iter().map(|id| area_room(id));
        device.chain(area).collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe(RoomSelection),
    Unsubscribe(RoomSelection),
    Ping,
}

pub fn device_room(device_id: &str) -> String {
    format!("device:{device_id}")
}

pub fn area_room(area_id: &str) -> String {
    format!("area:{area_id}")
}

struct Client {
    tx: mpsc::Sender<ServerMessage>,
    rooms: HashSet<String>,
}

#[derive(Clone)]
pub struct Hub {
    clients: Shared<HashMap<String, Client>>,
    dropped: Arc<AtomicU64>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self { clients: new_state(HashMap::new()), dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Enregistre un observateur et lui envoie `connected`
    pub fn register(&self) -> (String, mpsc::Receiver<ServerMessage>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let hello = ServerMessage { event: "connected".into(), room: None, data: json!({ "clientId": id }) };
        let _ = tx.try_send(hello);
        self.clients.lock().insert(id.clone(), Client { tx, rooms: HashSet::new() });
        debug!("[hub] observer {id} connected");
        (id, rx)
    }

    pub fn unregister(&self, client_id: &str) {
        if self.clients.lock().remove(client_id).is_some() {
            debug!("[hub] observer {client_id} disconnected");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Messages abandonnés faute de place dans la file d'un observateur
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn rooms_of(&self, client_id: &str) -> Vec<String> {
        let clients = self.clients.lock();
        let mut rooms: Vec<String> =
            clients.get(client_id).map(|c| c.rooms.iter().cloned().collect()).unwrap_or_default();
        rooms.sort();
        rooms
    }

    fn reply(&self, client_id: &str, event: &str, data: Value) {
        let clients = self.clients.lock();
        if let Some(client) = clients.get(client_id) {
            if client.tx.try_send(ServerMessage { event: event.into(), room: None, data }).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Traite une trame texte reçue d'un observateur
    pub fn handle_client_message(&self, client_id: &str, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                self.reply(client_id, "error", json!({ "message": format!("invalid message: {e}") }));
                return;
            }
        };
        match message {
            ClientMessage::Ping => self.reply(client_id, "pong", json!({})),
            ClientMessage::Subscribe(selection) | ClientMessage::Unsubscribe(selection)
                if selection.rooms().is_empty() =>
            {
                self.reply(client_id, "error", json!({ "message": "deviceId or areaId required" }));
            }
            ClientMessage::Subscribe(selection) => {
                let mut clients = self.clients.lock();
                if let Some(client) = clients.get_mut(client_id) {
                    client.rooms.extend(selection.rooms());
                }
            }
            ClientMessage::Unsubscribe(selection) => {
                let mut clients = self.clients.lock();
                if let Some(client) = clients.get_mut(client_id) {
                    for room in selection.rooms() {
                        client.rooms.remove(&room);
                    }
                }
            }
        }
    }

    /// Envoie aux clients retenus par `filter` ; file pleine = message perdu, canal fermé = client purgé
    fn deliver(&self, message: ServerMessage, filter: impl Fn(&Client) -> bool) -> usize {
        let mut clients = self.clients.lock();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, client) in clients.iter() {
            if !filter(client) {
                continue;
            }
            match client.tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped.is_power_of_two() {
                        warn!("[hub] observer {id} is not keeping up ({dropped} messages dropped so far)");
                    }
                }
                Err(TrySendError::Closed(_)) => dead.push(id.clone()),
            }
        }
        for id in dead {
            clients.remove(&id);
            debug!("[hub] pruned closed observer {id}");
        }
        delivered
    }

    pub fn emit_to_room(&self, room: &str, event: &str, data: &Value) -> usize {
        let message = ServerMessage { event: event.into(), room: Some(room.to_string()), data: data.clone() };
        self.deliver(message, |client| client.rooms.contains(room))
    }

    pub fn broadcast(&self, event: &str, data: &Value) -> usize {
        let message = ServerMessage { event: event.into(), room: None, data: data.clone() };
        self.deliver(message, |_| true)
    }

    fn emit_scoped(&self, room: Option<String>, event: &str, data: &Value) {
        if let Some(room) = room {
            self.emit_to_room(&room, event, data);
        }
        self.broadcast(event, data);
    }

    /// Nouveau statut d'un équipement (payload `device:update`)
    pub fn emit_status_update(&self, data: &Value) {
        let room = data.get("deviceId").and_then(Value::as_str).map(device_room);
        self.emit_scoped(room, "status:update", data);
    }

    /// Mise à jour de détail d'un équipement (interface, radio)
    pub fn emit_device_update(&self, device_id: &str, data: &Value) {
        self.emit_scoped(Some(device_room(device_id)), "device:update", data);
    }

    pub fn emit_area_update(&self, area_id: &str, data: &Value) {
        self.emit_scoped(Some(area_room(area_id)), "area:update", data);
    }

    pub fn emit_alert(&self, data: &Value) {
        let room = data.get("deviceId").and_then(Value::as_str).map(device_room);
        self.emit_scoped(room, "alert:new", data);
    }

    /// Convertit un message de canal pub/sub en émissions
    pub fn dispatch(&self, channel: &str, payload: &Value) {
        match channel {
            CHANNEL_DEVICE_UPDATE => {
                self.emit_status_update(payload);
                if let Some(area) = payload.get("areaId").and_then(Value::as_str) {
                    self.emit_area_update(area, payload);
                }
            }
            CHANNEL_INTERFACE_UPDATE | CHANNEL_WIRELESS_UPDATE => {
                match payload.get("deviceId").and_then(Value::as_str) {
                    Some(device_id) => self.emit_device_update(device_id, payload),
                    None => debug!("[hub] {channel} payload without deviceId ignored"),
                }
            }
            CHANNEL_ALERT_FLAPPING => {
                let mut alert = payload.clone();
                if let Some(fields) = alert.as_object_mut() {
                    fields.insert("alertType".into(), Value::String("flapping".into()));
                }
                self.emit_alert(&alert);
            }
            other => debug!("[hub] no route for channel {other}"),
        }
    }

    fn relay(&self, message: ChannelMessage) {
        match serde_json::from_str::<Value>(&message.payload) {
            Ok(payload) => self.dispatch(&message.channel, &payload),
            Err(e) => warn!("[hub] undecodable payload on {}: {e}", message.channel),
        }
    }
}

/// Consomme les canaux du cache tant que le process vit ; se réabonne à chaque retour en `ready`
pub fn spawn_channel_relay(hub: Hub, cache: CacheManager) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut states = cache.subscribe_state();
        loop {
            if cache.is_available() {
                match cache.subscribe(RELAY_CHANNELS).await {
                    Some(mut rx) => {
                        info!("[hub] relaying {} cache channels", RELAY_CHANNELS.len());
                        while let Some(message) = rx.recv().await {
                            hub.relay(message);
                        }
                        warn!("[hub] cache subscription interrupted");
                    }
                    None => debug!("[hub] cache subscription refused"),
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                continue;
            }
            if states.changed().await.is_err() {
                break;
            }
        }
    })
}

/// Pompe une connexion WebSocket jusqu'à sa fermeture
pub async fn serve_socket(socket: WebSocket, hub: Hub) {
    let (client_id, mut outbound) = hub.register();
    let (mut sink, mut inbound) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("[hub] cannot encode {}: {e}", message.event);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Text(text)) => hub.handle_client_message(&client_id, text.as_str()),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    hub.unregister(&client_id);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryBackend, ReconnectPolicy};
    use netvigil_devkit::expect_within;
    use std::sync::Arc;

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn subscribe(hub: &Hub, id: &str, device: &str) {
        hub.handle_client_message(id, &json!({"type": "subscribe", "deviceId": device}).to_string());
    }

    #[test]
    fn test_register_sends_connected() {
        let hub = Hub::new();
        let (id, mut rx) = hub.register();
        let hello = rx.try_recv().unwrap();
        assert_eq!(hello.event, "connected");
        assert_eq!(hello.data["clientId"], id.as_str());
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn test_room_scoping_and_unsubscribe() {
        let hub = Hub::new();
        let (x_client, mut rx) = hub.register();
        subscribe(&hub, &x_client, "X");
        drain(&mut rx);

        hub.emit_status_update(&json!({"deviceId": "X", "status": "down"}));
        hub.emit_status_update(&json!({"deviceId": "Y", "status": "up"}));
        let got = drain(&mut rx);

        let rooms: Vec<Option<&str>> = got.iter().map(|m| m.room.as_deref()).collect();
        assert!(rooms.contains(&Some("device:X")));
        assert!(!rooms.contains(&Some("device:Y")));
        // 1 message de room + 2 broadcasts
        assert_eq!(got.len(), 3);
        assert_eq!(got.iter().filter(|m| m.room.is_none()).count(), 2);

        hub.handle_client_message(&x_client, r#"{"type":"unsubscribe","deviceId":"X"}"#);
        hub.emit_status_update(&json!({"deviceId": "X", "status": "up"}));
        let after = drain(&mut rx);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].room, None);
    }

    #[test]
    fn test_area_rooms() {
        let hub = Hub::new();
        let (id, mut rx) = hub.register();
        hub.handle_client_message(&id, r#"{"type":"subscribe","areaId":"dc1"}"#);
        assert_eq!(hub.rooms_of(&id), vec!["area:dc1".to_string()]);
        drain(&mut rx);

        hub.dispatch(CHANNEL_DEVICE_UPDATE, &json!({"deviceId": "core-1", "areaId": "dc1", "status": "up"}));
        let events: Vec<(String, Option<String>)> = drain(&mut rx).into_iter().map(|m| (m.event, m.room)).collect();
        assert!(events.contains(&("area:update".to_string(), Some("area:dc1".to_string()))));
        assert!(events.contains(&("status:update".to_string(), None)));
    }

    #[test]
    fn test_ping_and_malformed_frames() {
        let hub = Hub::new();
        let (id, mut rx) = hub.register();
        drain(&mut rx);

        hub.handle_client_message(&id, r#"{"type":"ping"}"#);
        hub.handle_client_message(&id, "not json");
        hub.handle_client_message(&id, r#"{"type":"subscribe"}"#);
        let events: Vec<String> = drain(&mut rx).into_iter().map(|m| m.event).collect();
        assert_eq!(events, vec!["pong", "error", "error"]);
    }

    #[test]
    fn test_closed_clients_are_pruned() {
        let hub = Hub::new();
        let (_gone, rx) = hub.register();
        let (_alive, _rx) = hub.register();
        drop(rx);

        assert_eq!(hub.broadcast("status:update", &json!({})), 1);
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn test_stalled_client_queue_is_bounded() {
        let hub = Hub::new();
        let (_stalled, mut rx) = hub.register();
        let (_reader, mut reader_rx) = hub.register();

        for i in 0..(CLIENT_QUEUE * 4) {
            hub.broadcast("status:update", &json!({ "seq": i }));
            drain(&mut reader_rx);
        }

        // `connected` occupe une place de la file
        assert_eq!(drain(&mut rx).len(), CLIENT_QUEUE);
        assert_eq!(hub.dropped_messages(), (CLIENT_QUEUE * 3 + 1) as u64);
        // un client lent reste inscrit
        assert_eq!(hub.client_count(), 2);
    }

    #[test]
    fn test_flapping_alert_goes_to_device_room() {
        let hub = Hub::new();
        let (id, mut rx) = hub.register();
        subscribe(&hub, &id, "sw1");
        drain(&mut rx);

        hub.dispatch(CHANNEL_ALERT_FLAPPING, &json!({"deviceId": "sw1", "ifIndex": 3, "transitions": 4}));
        let got = drain(&mut rx);
        assert!(got.iter().all(|m| m.event == "alert:new"));
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data["alertType"], "flapping");
    }

    #[tokio::test]
    async fn test_relay_delivers_and_resubscribes_after_outage() {
        let backend = Arc::new(MemoryBackend::new());
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            max_attempts: 1000,
        };
        let cache = CacheManager::new(backend.clone(), policy, Duration::from_millis(200));
        cache.connect().await;

        let hub = Hub::new();
        let (id, mut rx) = hub.register();
        subscribe(&hub, &id, "core-1");
        drain(&mut rx);
        let relay = spawn_channel_relay(hub.clone(), cache.clone());

        // la souscription est asynchrone : republier jusqu'à réception
        let payload = json!({"deviceId": "core-1", "status": "down"});
        let mut received = None;
        for _ in 0..100 {
            cache.publish(CHANNEL_DEVICE_UPDATE, &payload).await;
            if let Ok(Some(message)) = expect_within(Duration::from_millis(20), rx.recv()).await {
                received = Some(message);
                break;
            }
        }
        assert_eq!(received.map(|m| m.event), Some("status:update".to_string()));

        backend.set_online(false);
        assert!(!cache.publish(CHANNEL_DEVICE_UPDATE, &payload).await);
        backend.set_online(true);
        assert!(netvigil_devkit::wait_until(Duration::from_secs(3), || cache.is_available()).await);
        drain(&mut rx);

        let mut recovered = false;
        for _ in 0..200 {
            cache.publish(CHANNEL_DEVICE_UPDATE, &payload).await;
            if let Ok(Some(_)) = expect_within(Duration::from_millis(20), rx.recv()).await {
                recovered = true;
                break;
            }
        }
        assert!(recovered);
        relay.abort();
        cache.shutdown();
    }
}
