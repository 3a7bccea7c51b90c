//! Event fan-out to WebSocket clients.
//!
//! Every client owns a bounded outbound queue of serialized envelopes and a
//! set of download ids it subscribed to. Download events reach a client when
//! it has no subscriptions or has subscribed to that download; library
//! events reach everyone.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use mangashelf_download::{AppEvent, EventSink};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_SUBSCRIPTION_ACK: &str = "subscription:ack";
pub const SUBSCRIBE_DOWNLOAD: &str = "subscribe:download";
pub const UNSUBSCRIBE_DOWNLOAD: &str = "unsubscribe:download";

/// Outbound messages buffered per client before new ones are dropped.
const CLIENT_QUEUE: usize = 256;

pub type ClientId = u64;

/// Wire format of every server → client message.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<'a> {
    pub event: &'a str,
    pub data: &'a Value,
    /// Unix millis.
    pub timestamp: i64,
}

impl<'a> Envelope<'a> {
    pub fn new(event: &'a str, data: &'a Value) -> Self {
        Self {
            event,
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn to_text(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::error!(event = self.event, "failed to serialize envelope: {e}");
                None
            }
        }
    }
}

struct Client {
    tx: mpsc::Sender<String>,
    subscriptions: HashSet<String>,
}

impl Client {
    fn wants(&self, download_id: Option<&str>) -> bool {
        match download_id {
            None => true,
            Some(_) if self.subscriptions.is_empty() => true,
            Some(id) => self.subscriptions.contains(id),
        }
    }

    fn send(&self, id: ClientId, text: String) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(text) {
            tracing::warn!(client = id, "client queue full, dropping message");
        }
    }
}

#[derive(Default)]
pub struct BroadcastHub {
    clients: Mutex<HashMap<ClientId, Client>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("clients", &self.client_count())
            .finish()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client and queue its `connect` envelope.
    pub fn connect(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let client = Client {
            tx,
            subscriptions: HashSet::new(),
        };

        let data = json!({ "message": "Connected to manga reader server" });
        if let Some(text) = Envelope::new(EVENT_CONNECT, &data).to_text() {
            client.send(id, text);
        }

        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(id, client);
        }
        tracing::info!(client = id, "websocket client connected");
        (id, rx)
    }

    pub fn disconnect(&self, id: ClientId) {
        let removed = self
            .clients
            .lock()
            .map(|mut clients| clients.remove(&id).is_some())
            .unwrap_or(false);
        if removed {
            tracing::info!(client = id, "websocket client disconnected");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Download ids a client is subscribed to, sorted.
    pub fn subscriptions(&self, id: ClientId) -> Vec<String> {
        let mut subs: Vec<String> = self
            .clients
            .lock()
            .ok()
            .and_then(|clients| {
                clients
                    .get(&id)
                    .map(|c| c.subscriptions.iter().cloned().collect())
            })
            .unwrap_or_default();
        subs.sort();
        subs
    }

    /// Handle one text frame from a client. Replies (ack or error) go to the
    /// client's own queue; the connection is never closed here.
    pub fn handle_message(&self, id: ClientId, raw: &str) {
        let (event, data) = match self.apply(id, raw) {
            Ok(ack) => (EVENT_SUBSCRIPTION_ACK, ack),
            Err(message) => {
                tracing::warn!(client = id, "rejected websocket message: {message}");
                (EVENT_ERROR, json!({ "message": message }))
            }
        };
        self.send_to(id, event, &data);
    }

    fn apply(&self, id: ClientId, raw: &str) -> Result<Value, String> {
        let message: Value =
            serde_json::from_str(raw).map_err(|e| format!("Invalid JSON message: {e}"))?;
        let event = message
            .get("event")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| "Client message missing event field".to_string())?;

        let (subscribe, action) = match event {
            SUBSCRIBE_DOWNLOAD => (true, "subscribed"),
            UNSUBSCRIBE_DOWNLOAD => (false, "unsubscribed"),
            other => return Err(format!("Unknown client event: {other}")),
        };
        let download_id = extract_download_id(message.get("data"))?;

        let mut clients = self
            .clients
            .lock()
            .map_err(|_| "Failed to process message".to_string())?;
        let client = clients
            .get_mut(&id)
            .ok_or_else(|| "Client is not connected".to_string())?;
        if subscribe {
            client.subscriptions.insert(download_id.clone());
        } else {
            client.subscriptions.remove(&download_id);
        }

        Ok(json!({
            "action": action,
            "type": "download",
            "downloadId": download_id,
        }))
    }

    fn send_to(&self, id: ClientId, event: &str, data: &Value) {
        let Some(text) = Envelope::new(event, data).to_text() else {
            return;
        };
        if let Ok(clients) = self.clients.lock() {
            if let Some(client) = clients.get(&id) {
                client.send(id, text);
            }
        }
    }
}

impl EventSink for BroadcastHub {
    fn emit(&self, event: AppEvent) {
        let Some(text) = Envelope::new(event.name, &event.payload).to_text() else {
            return;
        };
        let scope = event.download_id.map(|id| id.to_string());

        let Ok(clients) = self.clients.lock() else {
            return;
        };
        for (id, client) in clients.iter() {
            if client.wants(scope.as_deref()) {
                client.send(*id, text.clone());
            }
        }
    }
}

/// `downloadId` from `data`, also accepted nested as `data.payload.downloadId`.
fn extract_download_id(data: Option<&Value>) -> Result<String, String> {
    let Some(data) = data.filter(|d| d.is_object()) else {
        return Err("Message payload must be an object".into());
    };
    data.get("downloadId")
        .or_else(|| data.get("payload").and_then(|p| p.get("downloadId")))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| "downloadId is required for this action".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangashelf_download::events::{DownloadProgressPayload, LibraryItemRemovedPayload};
    use uuid::Uuid;

    fn next(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().expect("message queued")).unwrap()
    }

    fn progress(id: Uuid) -> AppEvent {
        AppEvent::download_progress(DownloadProgressPayload {
            download_id: id,
            chapter_id: "ch-1".into(),
            current_page: 1,
            total_pages: 2,
            percentage: 50,
        })
    }

    #[test]
    fn test_connect_sends_connect_envelope() {
        let hub = BroadcastHub::new();
        let (_, mut rx) = hub.connect();
        let msg = next(&mut rx);
        assert_eq!(msg["event"], "connect");
        assert_eq!(msg["data"]["message"], "Connected to manga reader server");
        assert!(msg["timestamp"].as_i64().unwrap() > 1_600_000_000_000);
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn test_unsubscribed_client_receives_everything() {
        let hub = BroadcastHub::new();
        let (_, mut rx) = hub.connect();
        next(&mut rx);

        let id = Uuid::new_v4();
        hub.emit(progress(id));
        let msg = next(&mut rx);
        assert_eq!(msg["event"], "download:progress");
        assert_eq!(msg["data"]["downloadId"], id.to_string());
        assert_eq!(msg["data"]["percentage"], 50);
    }

    #[test]
    fn test_subscription_scopes_download_events() {
        let hub = BroadcastHub::new();
        let (client, mut rx) = hub.connect();
        next(&mut rx);

        let watched = Uuid::new_v4();
        let other = Uuid::new_v4();
        hub.handle_message(
            client,
            &json!({"event": "subscribe:download", "data": {"downloadId": watched.to_string()}})
                .to_string(),
        );
        let ack = next(&mut rx);
        assert_eq!(ack["event"], "subscription:ack");
        assert_eq!(ack["data"]["action"], "subscribed");
        assert_eq!(ack["data"]["type"], "download");
        assert_eq!(ack["data"]["downloadId"], watched.to_string());

        hub.emit(progress(other));
        assert!(rx.try_recv().is_err());

        hub.emit(progress(watched));
        assert_eq!(next(&mut rx)["data"]["downloadId"], watched.to_string());

        // library events are unscoped
        hub.emit(AppEvent::library_item_removed(LibraryItemRemovedPayload {
            id: Uuid::new_v4(),
            manga_id: "m-1".into(),
        }));
        assert_eq!(next(&mut rx)["event"], "library:item:removed");
    }

    #[test]
    fn test_unsubscribe_restores_firehose() {
        let hub = BroadcastHub::new();
        let (client, mut rx) = hub.connect();
        next(&mut rx);

        hub.handle_message(
            client,
            r#"{"event":"subscribe:download","data":{"payload":{"downloadId":"abc"}}}"#,
        );
        assert_eq!(next(&mut rx)["data"]["downloadId"], "abc");
        assert_eq!(hub.subscriptions(client), vec!["abc".to_string()]);

        hub.handle_message(
            client,
            r#"{"event":"unsubscribe:download","data":{"downloadId":"abc"}}"#,
        );
        assert_eq!(next(&mut rx)["data"]["action"], "unsubscribed");
        assert!(hub.subscriptions(client).is_empty());

        hub.emit(progress(Uuid::new_v4()));
        assert_eq!(next(&mut rx)["event"], "download:progress");
    }

    #[test]
    fn test_bad_messages_get_error_envelopes() {
        let hub = BroadcastHub::new();
        let (client, mut rx) = hub.connect();
        next(&mut rx);

        let cases = [
            ("not json", "Invalid JSON message"),
            (r#"{"data":{}}"#, "Client message missing event field"),
            (r#"{"event":"subscribe:download","data":"x"}"#, "Message payload must be an object"),
            (r#"{"event":"subscribe:download","data":{}}"#, "downloadId is required for this action"),
            (r#"{"event":"subscribe:download","data":{"downloadId":""}}"#, "downloadId is required for this action"),
            (r#"{"event":"reader:open","data":{}}"#, "Unknown client event: reader:open"),
        ];
        for (raw, expected) in cases {
            hub.handle_message(client, raw);
            let msg = next(&mut rx);
            assert_eq!(msg["event"], "error", "for {raw}");
            let text = msg["data"]["message"].as_str().unwrap();
            assert!(text.starts_with(expected), "for {raw}: {text}");
        }
        assert_eq!(hub.client_count(), 1);
        assert!(hub.subscriptions(client).is_empty());
    }

    #[test]
    fn test_disconnect_removes_client() {
        let hub = BroadcastHub::new();
        let (client, rx) = hub.connect();
        hub.disconnect(client);
        drop(rx);
        assert_eq!(hub.client_count(), 0);
        // emitting with no clients is fine
        hub.emit(progress(Uuid::new_v4()));
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let hub = BroadcastHub::new();
        let (_, mut rx) = hub.connect();
        for _ in 0..CLIENT_QUEUE + 10 {
            hub.emit(progress(Uuid::new_v4()));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, CLIENT_QUEUE);
    }
}
