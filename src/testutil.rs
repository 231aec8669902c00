// src/testutil.rs
// In-memory key server used by the engine tests: stateful accounts map
// and per-room append-only logs behind a wiremock responder

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::identity::LocalWallet;
use crate::messenger::{Messenger, MessengerConfig};
use crate::storage::MemoryStore;

#[derive(Default)]
pub struct KeyServerState {
    pub accounts: Mutex<HashMap<String, Value>>,
    pub logs: Mutex<HashMap<String, Vec<Value>>>,
}

impl KeyServerState {
    /// Append an entry the way the real server would, assigning the
    /// next index. Returns the index used.
    pub fn append_entry(&self, room: &str, content: Value, signature: Option<String>) -> u64 {
        let mut logs = self.logs.lock().unwrap();
        let log = logs.entry(room.to_string()).or_default();
        let index = log.len() as u64;
        let mut entry = json!({
            "conversationId": room,
            "conversationIndex": index,
            "content": content,
        });
        if let Some(signature) = signature {
            entry["signature"] = Value::String(signature);
        }
        log.push(entry);
        index
    }

    pub fn log_len(&self, room: &str) -> usize {
        self.logs.lock().unwrap().get(room).map_or(0, Vec::len)
    }

    pub fn entry(&self, room: &str, index: usize) -> Option<Value> {
        self.logs.lock().unwrap().get(room)?.get(index).cloned()
    }

    pub fn account(&self, wallet: &str) -> Option<Value> {
        self.accounts.lock().unwrap().get(wallet).cloned()
    }
}

pub struct FakeKeyServer {
    pub state: Arc<KeyServerState>,
    pub server: MockServer,
}

impl FakeKeyServer {
    pub fn url(&self) -> String {
        self.server.uri()
    }
}

pub async fn spawn_fake_key_server() -> FakeKeyServer {
    let _ = env_logger::builder().is_test(true).try_init();
    let state = Arc::new(KeyServerState::default());
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(Responder(state.clone()))
        .mount(&server)
        .await;
    FakeKeyServer { state, server }
}

struct Responder(Arc<KeyServerState>);

impl Respond for Responder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let path = request.url.path().trim_start_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').collect();
        let method = request.method.to_string();

        match (method.as_str(), segments.as_slice()) {
            ("GET", ["accounts", wallet]) => match self.0.accounts.lock().unwrap().get(*wallet) {
                Some(record) => ResponseTemplate::new(200).set_body_json(record.clone()),
                None => ResponseTemplate::new(404),
            },
            ("POST", ["accounts", wallet]) => {
                let Ok(record) = serde_json::from_slice::<Value>(&request.body) else {
                    return ResponseTemplate::new(400);
                };
                self.0
                    .accounts
                    .lock()
                    .unwrap()
                    .insert(wallet.to_string(), record);
                ResponseTemplate::new(200).set_body_json(json!({}))
            }
            ("GET", ["messages", room]) => {
                let logs = self.0.logs.lock().unwrap();
                ResponseTemplate::new(200)
                    .set_body_json(logs.get(*room).cloned().unwrap_or_default())
            }
            ("POST", ["messages", room, index]) => {
                let Ok(index) = index.parse::<usize>() else {
                    return ResponseTemplate::new(400);
                };
                let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
                    return ResponseTemplate::new(400);
                };
                let mut logs = self.0.logs.lock().unwrap();
                let log = logs.entry(room.to_string()).or_default();
                if index != log.len() {
                    return ResponseTemplate::new(409);
                }
                let mut entry = json!({
                    "conversationId": room,
                    "conversationIndex": index,
                    "content": body.get("content").cloned().unwrap_or(Value::Null),
                });
                if let Some(signature) = body.get("signature").and_then(Value::as_str) {
                    entry["signature"] = Value::String(signature.to_string());
                }
                log.push(entry);
                ResponseTemplate::new(200).set_body_json(json!({}))
            }
            ("GET", ["conversations", wallet]) => {
                let logs = self.0.logs.lock().unwrap();
                let rooms: Vec<&String> = logs
                    .keys()
                    .filter(|room| room.split('-').any(|p| p == *wallet))
                    .collect();
                ResponseTemplate::new(200).set_body_json(rooms)
            }
            _ => ResponseTemplate::new(404),
        }
    }
}

/// An engine run through the whole ceremony against the fake server:
/// bound, enrolled, published and ready.
pub async fn ready_engine(url: &str, wallet: &LocalWallet) -> Messenger {
    let mut config = MessengerConfig::new(url);
    config.reconnect_delay = Duration::from_millis(100);
    let engine = Messenger::new(
        config,
        Arc::new(wallet.clone()),
        vec![Arc::new(MemoryStore::new())],
        Arc::new(MemoryStore::new()),
    )
    .unwrap();
    engine.set_account(&wallet.address).await.unwrap();
    engine.enable().await.unwrap();
    engine.init_messaging().await.unwrap();
    engine.load_rooms().await.unwrap();
    engine
}
