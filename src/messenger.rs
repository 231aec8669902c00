// src/messenger.rs
// The conversation engine: identity ceremony, ordered log ingestion,
// room establishment and sends

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use futures_util::future::join_all;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;

use crate::address::{checksum, is_room_id, room_counterparty, room_id};
use crate::codec::{
    decode_keys_envelope, decode_msg_envelope, encode_keys_envelope, encode_msg_envelope,
    ContentEnvelope, Message, MessageDraft, MsgDecodeOutcome,
};
use crate::error::{Error, Result};
use crate::identity::{AccountBinding, Enrollment, SignStyle, WalletSigner, ENROLLMENT_PHRASE};
use crate::registry::{RegistryClient, RegistryEntry};
use crate::room::{message_hash, DecryptedMessage, Room};
use crate::server::{entry_digest, verify_entry, KeyServerClient, LogEntry};
use crate::status::{MessageStatus, StatusStore};
use crate::storage::{
    enrollment_phrase_key, messaging_key_key, publication_message_key,
    publication_signature_key, subscription_start_key, KeyValueStore,
};
use crate::stream::{run_stream, StreamEvent};

/// Delay before re-subscribing after an abnormal stream closure.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// Cap on concurrent bulk log fetches across all rooms.
pub const DEFAULT_FETCH_LIMIT: usize = 25;

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub key_server_url: String,
    /// How the external wallet hashes messages before signing.
    pub sign_style: SignStyle,
    pub reconnect_delay: Duration,
    pub fetch_limit: usize,
}

impl MessengerConfig {
    pub fn new(key_server_url: impl Into<String>) -> Self {
        MessengerConfig {
            key_server_url: key_server_url.into(),
            sign_style: SignStyle::Personal,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            fetch_limit: DEFAULT_FETCH_LIMIT,
        }
    }
}

/// Where the engine stands with respect to its messaging identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IdentityStatus {
    /// No wallet address set.
    Unbound,
    /// Wallet address set; no messaging key available.
    Bound,
    /// Messaging key derived and cached locally.
    Enrolled,
    /// Enrollment plus publication present locally and on the registry.
    Published,
    /// Published, rooms loaded, live stream subscribed.
    Ready,
}

/// A still-encrypted message surfaced so the UI can show a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedMessage {
    pub room_id: String,
    pub index: u64,
    pub sender_address: String,
    pub hash: String,
    pub iv: String,
    pub ciphertext: String,
}

/// Lifecycle and message events, delivered to every subscriber.
#[derive(Debug, Clone)]
pub enum MessengerEvent {
    /// A wallet account was bound to the engine.
    New { wallet_address: String },
    /// The enrollment signature was obtained from the wallet.
    SignedSig,
    /// Local identity reconciled with the registry.
    Initialized,
    /// Rooms loaded and live stream subscribed.
    Ready,
    /// A message was decrypted and validated.
    Message(DecryptedMessage),
    /// A message could not be decrypted with any known room key.
    EncryptedMessage(EncryptedMessage),
}

#[derive(Default)]
struct EngineState {
    wallet_address: Option<String>,
    binding: Option<AccountBinding>,
    status: Option<IdentityStatus>,
    rooms: HashMap<String, Room>,
    // Hashes already emitted as `msg`; reloads may revisit entries but
    // must never double-emit.
    emitted: HashSet<String>,
    // Hashes already surfaced as `emsg`; cleared once decrypted.
    emitted_encrypted: HashSet<String>,
}

impl EngineState {
    fn status(&self) -> IdentityStatus {
        self.status.unwrap_or(IdentityStatus::Unbound)
    }

    fn wallet(&self) -> Result<String> {
        self.wallet_address
            .clone()
            .ok_or(Error::IdentityState("no account bound"))
    }

    fn binding(&self) -> Result<AccountBinding> {
        self.binding
            .clone()
            .ok_or(Error::IdentityState("messaging key not derived yet"))
    }
}

// Releases the single-send slot on every exit path.
struct SendGuard<'a>(&'a AtomicBool);

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct MessengerInner {
    config: MessengerConfig,
    server: KeyServerClient,
    registry: RegistryClient,
    signer: Arc<dyn WalletSigner>,
    secret_stores: Vec<Arc<dyn KeyValueStore>>,
    data_store: Arc<dyn KeyValueStore>,
    state: RwLock<EngineState>,
    observers: std::sync::Mutex<Vec<Sender<MessengerEvent>>>,
    send_busy: AtomicBool,
    fetch_slots: Arc<Semaphore>,
    // Bumped by set_account; results computed under an older epoch are
    // discarded instead of applied.
    epoch: AtomicU64,
    stream_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    ingest_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MessengerInner {
    fn abort_subscription(&self) {
        for slot in [&self.stream_task, &self.ingest_task] {
            if let Ok(mut task) = slot.lock() {
                if let Some(handle) = task.take() {
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for MessengerInner {
    fn drop(&mut self) {
        self.abort_subscription();
    }
}

/// The conversation engine. Cheap to clone (all clones share one
/// engine); state mutations are serialized behind a single lock.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<MessengerInner>,
}

impl Deref for Messenger {
    type Target = MessengerInner;

    fn deref(&self) -> &MessengerInner {
        &self.inner
    }
}

impl Messenger {
    /// Fails fast on configuration problems (bad key server URL).
    pub fn new(
        config: MessengerConfig,
        signer: Arc<dyn WalletSigner>,
        secret_stores: Vec<Arc<dyn KeyValueStore>>,
        data_store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        if secret_stores.is_empty() {
            return Err(Error::Configuration(
                "at least one secret store required".into(),
            ));
        }
        let server = KeyServerClient::new(&config.key_server_url)?;
        let fetch_slots = Arc::new(Semaphore::new(config.fetch_limit.max(1)));
        Ok(Messenger {
            inner: Arc::new(MessengerInner {
                registry: RegistryClient::new(server.clone()),
                server,
                signer,
                secret_stores,
                data_store,
                state: RwLock::new(EngineState::default()),
                observers: std::sync::Mutex::new(Vec::new()),
                send_busy: AtomicBool::new(false),
                fetch_slots,
                epoch: AtomicU64::new(0),
                stream_task: std::sync::Mutex::new(None),
                ingest_task: std::sync::Mutex::new(None),
                config,
            }),
        })
    }

    // ============ EVENTS ============

    /// Register an observer. Events are fanned out to every subscriber.
    pub fn subscribe(&self) -> Receiver<MessengerEvent> {
        let (tx, rx) = unbounded();
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(tx);
        }
        rx
    }

    fn emit(&self, event: MessengerEvent) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    // ============ IDENTITY CEREMONY ============

    pub async fn identity_status(&self) -> IdentityStatus {
        self.state.read().await.status()
    }

    pub async fn wallet_address(&self) -> Option<String> {
        self.state.read().await.wallet_address.clone()
    }

    /// Bind a wallet account. This is the cancellation point: it closes
    /// the live stream, clears room state and invalidates in-flight
    /// operations launched under the previous account.
    pub async fn set_account(&self, wallet_address: &str) -> Result<()> {
        let wallet = checksum(wallet_address)?;

        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.abort_subscription();

        {
            let mut state = self.state.write().await;
            *state = EngineState {
                wallet_address: Some(wallet.clone()),
                status: Some(IdentityStatus::Bound),
                ..EngineState::default()
            };
        }

        info!("[Messenger] account set to {}", wallet);
        self.emit(MessengerEvent::New {
            wallet_address: wallet,
        });
        Ok(())
    }

    /// First store that already holds this wallet's messaging key, or
    /// the default (first) store for writes.
    fn secret_store_for(&self, wallet: &str) -> Arc<dyn KeyValueStore> {
        let key = messaging_key_key(wallet);
        for store in &self.secret_stores {
            if matches!(store.get(&key), Ok(Some(_))) {
                return store.clone();
            }
        }
        self.secret_stores[0].clone()
    }

    fn persist_binding_secrets(&self, binding: &AccountBinding) -> Result<()> {
        let store = self.secret_store_for(&binding.wallet_address);
        store.set(
            &messaging_key_key(&binding.wallet_address),
            &hex::encode(binding.keypair.secret_bytes()),
        )?;
        store.set(
            &enrollment_phrase_key(&binding.wallet_address),
            &binding.enrollment_phrase,
        )?;
        if let Some(message) = &binding.publication_message {
            store.set(&publication_message_key(&binding.wallet_address), message)?;
        }
        if let Some(signature) = &binding.publication_signature {
            store.set(
                &publication_signature_key(&binding.wallet_address),
                signature,
            )?;
        }
        Ok(())
    }

    fn cached_binding(&self, wallet: &str) -> Result<Option<AccountBinding>> {
        let store = self.secret_store_for(wallet);
        let Some(secret_hex) = store.get(&messaging_key_key(wallet))? else {
            return Ok(None);
        };
        let secret = hex::decode(&secret_hex).map_err(|e| Error::Crypto(e.to_string()))?;
        let keypair = crate::crypto::MessagingKeypair::from_secret_bytes(&secret)?;
        let enrollment_phrase = store
            .get(&enrollment_phrase_key(wallet))?
            .unwrap_or_else(|| ENROLLMENT_PHRASE.to_string());
        Ok(Some(AccountBinding {
            wallet_address: wallet.to_string(),
            keypair,
            enrollment_phrase,
            publication_message: store.get(&publication_message_key(wallet))?,
            publication_signature: store.get(&publication_signature_key(wallet))?,
        }))
    }

    /// Bound -> Enrolled: derive the messaging key, prompting the wallet
    /// for the enrollment signature unless a cached key exists.
    pub async fn enable(&self) -> Result<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let wallet = self.state.read().await.wallet()?;

        let (binding, freshly_signed) = match self.cached_binding(&wallet)? {
            Some(binding) => (binding, false),
            None => {
                let signature = self.signer.sign(ENROLLMENT_PHRASE, &wallet).await?;
                let binding = AccountBinding::from_enrollment_signature(&wallet, &signature)?;
                self.persist_binding_secrets(&binding)?;
                (binding, true)
            }
        };

        {
            let mut state = self.state.write().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Err(Error::IdentityState("account changed during enable"));
            }
            debug!(
                "[Messenger] messaging address for {} is {}",
                wallet,
                binding.messaging_address()
            );
            state.binding = Some(binding);
            if state.status() < IdentityStatus::Enrolled {
                state.status = Some(IdentityStatus::Enrolled);
            }
        }

        if freshly_signed {
            self.emit(MessengerEvent::SignedSig);
        }
        Ok(())
    }

    /// Enrolled -> Published: obtain (or reuse) the publication
    /// signature, then POST the registry entry. A registry failure keeps
    /// the engine Enrolled; messages can still be read.
    pub async fn publish(&self) -> Result<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let mut binding = self.state.read().await.binding()?;
        let wallet = binding.wallet_address.clone();

        if binding.publication_signature.is_none() {
            let message = binding.expected_publication_message();
            let signature = self.signer.sign(&message, &wallet).await?;
            binding.publication_message = Some(message);
            binding.publication_signature = Some(hex::encode(signature));
            self.persist_binding_secrets(&binding)?;
        }

        let entry = RegistryEntry::from_binding(&binding)?;
        let publish_result = self.registry.publish(&entry).await;

        let mut state = self.state.write().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(Error::IdentityState("account changed during publish"));
        }
        state.binding = Some(binding);
        match publish_result {
            Ok(()) => {
                state.status = Some(state.status().max(IdentityStatus::Published));
                Ok(())
            }
            Err(e) => {
                warn!("[Messenger] publish failed, staying Enrolled: {}", e);
                Err(e)
            }
        }
    }

    /// Reconcile local and server identity state: adopt the server's
    /// publication record when it matches the locally derived messaging
    /// address, re-publish otherwise.
    pub async fn init_messaging(&self) -> Result<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let mut binding = self.state.read().await.binding()?;
        let wallet = binding.wallet_address.clone();

        let server_entry = self.registry.lookup(&wallet).await;
        match server_entry {
            Some(entry) if entry.messaging_address == binding.messaging_address() => {
                binding.publication_message = Some(entry.publication_message.clone());
                binding.publication_signature = Some(entry.publication_signature.clone());
                self.persist_binding_secrets(&binding)?;

                let mut state = self.state.write().await;
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    return Err(Error::IdentityState("account changed during init"));
                }
                state.binding = Some(binding);
                state.status = Some(state.status().max(IdentityStatus::Published));
            }
            other => {
                if other.is_some() {
                    info!(
                        "[Messenger] registry entry is stale for {}, re-publishing",
                        wallet
                    );
                }
                self.publish().await?;
            }
        }

        self.emit(MessengerEvent::Initialized);
        Ok(())
    }

    /// Inject a pre-computed ceremony (signatures gathered externally);
    /// takes the same path as enable + publish.
    pub async fn inject_enrollment(&self, enrollment: Enrollment) -> Result<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let wallet = self.state.read().await.wallet()?;

        let binding = enrollment.into_binding(&wallet, self.config.sign_style)?;
        self.persist_binding_secrets(&binding)?;

        {
            let mut state = self.state.write().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Err(Error::IdentityState("account changed during enrollment"));
            }
            state.binding = Some(binding);
            if state.status() < IdentityStatus::Enrolled {
                state.status = Some(IdentityStatus::Enrolled);
            }
        }

        self.emit(MessengerEvent::SignedSig);
        self.publish().await
    }

    // ============ ROOM LOADING & INGESTION ============

    /// Published -> Ready: load every conversation (bulk fetches capped
    /// by the semaphore) and subscribe to live updates.
    pub async fn load_rooms(&self) -> Result<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let wallet = {
            let state = self.state.read().await;
            if state.status() < IdentityStatus::Published {
                return Err(Error::IdentityState("identity not published yet"));
            }
            state.wallet()?
        };

        let start_key = subscription_start_key(&wallet);
        if self.data_store.get(&start_key)?.is_none() {
            self.data_store
                .set(&start_key, &Utc::now().timestamp_millis().to_string())?;
        }

        let conversations = self.server.get_conversations(&wallet).await?;
        join_all(
            conversations
                .iter()
                .map(|room| self.load_room(room, epoch)),
        )
        .await;

        self.start_subscription(&wallet, epoch)?;

        {
            let mut state = self.state.write().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Err(Error::IdentityState("account changed during load"));
            }
            state.status = Some(IdentityStatus::Ready);
        }
        self.emit(MessengerEvent::Ready);
        Ok(())
    }

    fn start_subscription(&self, wallet: &str, epoch: u64) -> Result<()> {
        let events_url = self.server.events_url(wallet)?;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let stream_handle =
            tokio::spawn(run_stream(events_url, self.config.reconnect_delay, tx));

        // Weak handle only: the ingest task must not keep the engine
        // alive after the last caller drops it.
        let weak = Arc::downgrade(&self.inner);
        let ingest_handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let engine = Messenger { inner };
                if engine.epoch.load(Ordering::SeqCst) != epoch {
                    break;
                }
                match event {
                    StreamEvent::Entry(entry) => engine.handle_live_entry(entry, epoch).await,
                    StreamEvent::Reconnected => engine.resync(epoch).await,
                    StreamEvent::Closed => break,
                }
            }
        });

        if let Ok(mut slot) = self.stream_task.lock() {
            if let Some(old) = slot.replace(stream_handle) {
                old.abort();
            }
        }
        if let Ok(mut slot) = self.ingest_task.lock() {
            if let Some(old) = slot.replace(ingest_handle) {
                old.abort();
            }
        }
        Ok(())
    }

    /// Bulk load one room: fetch the full log and rebuild the decrypted
    /// window from it.
    async fn load_room(&self, room_id: &str, epoch: u64) {
        let permit = self.fetch_slots.clone().acquire_owned().await;
        if permit.is_err() {
            return;
        }
        let entries = match self.server.get_messages(room_id).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[Messenger] bulk load of {} failed: {}", room_id, e);
                return;
            }
        };

        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            let Ok(binding) = state.binding() else {
                return;
            };
            state
                .rooms
                .entry(room_id.to_string())
                .or_default()
                .clear_messages();
            for entry in &entries {
                self.apply_entry(&mut state, &binding, entry, &mut events)
                    .await;
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    /// A single live entry. Known room and exactly the next index:
    /// process and advance. Unknown room, gap or duplicate: discard the
    /// entry and resynchronize with a bulk load.
    async fn handle_live_entry(&self, entry: LogEntry, epoch: u64) {
        let room = entry.conversation_id.clone();

        let in_sequence = {
            let state = self.state.read().await;
            match state.rooms.get(&room) {
                None => false,
                Some(r) if entry.conversation_index == r.next_index() => true,
                Some(r) => {
                    debug!(
                        "[Messenger] {} index {} does not follow {:?}, reloading",
                        room, entry.conversation_index, r.last_index
                    );
                    false
                }
            }
        };

        if !in_sequence {
            self.load_room(&room, epoch).await;
            return;
        }

        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            let Ok(binding) = state.binding() else {
                return;
            };
            // Re-check under the write lock; another task may have
            // advanced the room meanwhile.
            let current = state.rooms.get(&room).map(|r| r.next_index()).unwrap_or(0);
            if entry.conversation_index != current {
                drop(state);
                self.load_room(&room, epoch).await;
                return;
            }
            self.apply_entry(&mut state, &binding, &entry, &mut events)
                .await;
        }
        for event in events {
            self.emit(event);
        }
    }

    /// After a reconnect: refetch the conversation list and bulk-reload
    /// every room to close the gap accrued during the outage.
    async fn resync(&self, epoch: u64) {
        let Some(wallet) = self.state.read().await.wallet_address.clone() else {
            return;
        };
        let mut rooms: Vec<String> = match self.server.get_conversations(&wallet).await {
            Ok(list) => list,
            Err(e) => {
                warn!("[Messenger] conversation refetch failed: {}", e);
                Vec::new()
            }
        };
        for known in self.state.read().await.rooms.keys() {
            if !rooms.contains(known) {
                rooms.push(known.clone());
            }
        }
        info!("[Messenger] resyncing {} rooms after reconnect", rooms.len());
        join_all(rooms.iter().map(|room| self.load_room(room, epoch))).await;
    }

    /// Decode one log entry into room state, collecting events to emit
    /// after the lock is released. Emission is deduplicated by hash for
    /// the engine lifetime.
    async fn apply_entry(
        &self,
        state: &mut EngineState,
        binding: &AccountBinding,
        entry: &LogEntry,
        events: &mut Vec<MessengerEvent>,
    ) {
        let room_id = &entry.conversation_id;
        let Some(envelope) = ContentEnvelope::from_value(&entry.content) else {
            // Unknown envelope types are ignored forward-compatibly,
            // but they still occupy their log index.
            state
                .rooms
                .entry(room_id.clone())
                .or_default()
                .note_index(entry.conversation_index);
            return;
        };

        if !self.verify_sender(binding, entry, envelope.sender()).await {
            warn!(
                "[Messenger] dropping entry {}.{}: signature does not match sender",
                room_id, entry.conversation_index
            );
            return;
        }

        match envelope {
            ContentEnvelope::Keys { keys, .. } => {
                let recovered = decode_keys_envelope(binding, &keys);
                let room = state.rooms.entry(room_id.clone()).or_default();
                room.note_index(entry.conversation_index);
                for key in recovered {
                    if room.add_key(key) {
                        debug!("[Messenger] key added to {}", room_id);
                    }
                }
            }
            ContentEnvelope::Msg {
                address,
                iv,
                ciphertext,
            } => {
                let hash = message_hash(room_id, entry.conversation_index);
                let room = state.rooms.entry(room_id.clone()).or_default();
                room.note_index(entry.conversation_index);

                match decode_msg_envelope(room.all_keys(), &iv, &ciphertext) {
                    MsgDecodeOutcome::Content(msg) => {
                        let message = DecryptedMessage {
                            msg,
                            room_id: room_id.clone(),
                            index: entry.conversation_index,
                            sender_address: address,
                            hash: hash.clone(),
                        };
                        room.record_message(message.clone());
                        state.emitted_encrypted.remove(&hash);
                        if state.emitted.insert(hash) {
                            events.push(MessengerEvent::Message(message));
                        }
                    }
                    MsgDecodeOutcome::Invalid => {
                        // Decrypted but schema-invalid: dropped.
                        debug!("[Messenger] invalid message at {}", hash);
                    }
                    MsgDecodeOutcome::NotDecryptable => {
                        if state.emitted_encrypted.insert(hash.clone()) {
                            events.push(MessengerEvent::EncryptedMessage(EncryptedMessage {
                                room_id: room_id.clone(),
                                index: entry.conversation_index,
                                sender_address: address,
                                hash,
                                iv,
                                ciphertext,
                            }));
                        }
                    }
                }
            }
        }
    }

    /// Signed entries must recover to the sender's published messaging
    /// address; our own entries verify against the local binding.
    /// Unsigned entries and unknown senders pass through.
    async fn verify_sender(
        &self,
        binding: &AccountBinding,
        entry: &LogEntry,
        sender_wallet: &str,
    ) -> bool {
        if entry.signature.is_none() {
            return true;
        }
        let expected = if sender_wallet == binding.wallet_address {
            Some(binding.messaging_address().to_string())
        } else {
            self.registry
                .lookup(sender_wallet)
                .await
                .map(|e| e.messaging_address)
        };
        match expected {
            Some(messaging_address) => verify_entry(entry, &messaging_address),
            None => {
                debug!(
                    "[Messenger] no registry entry for {}, accepting unverified",
                    sender_wallet
                );
                true
            }
        }
    }

    // ============ CONVERSATION API ============

    async fn resolve_room(&self, wallet_or_room: &str) -> Result<String> {
        if is_room_id(wallet_or_room) {
            return Ok(wallet_or_room.to_string());
        }
        let wallet = self.state.read().await.wallet()?;
        room_id(&[&wallet, wallet_or_room])
    }

    /// Establish (or confirm) the pairwise room with a remote wallet.
    /// Seeds a fresh symmetric key via a `keys` envelope when the room
    /// has none yet. Returns the room id.
    pub async fn start_conversation(&self, remote_wallet: &str) -> Result<String> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let remote = checksum(remote_wallet)?;
        let binding = self.state.read().await.binding()?;
        let room = room_id(&[&binding.wallet_address, &remote])?;

        {
            let state = self.state.read().await;
            if state.rooms.get(&room).is_some_and(|r| r.has_keys()) {
                return Ok(room);
            }
        }

        let Some(remote_entry) = self.registry.lookup(&remote).await else {
            return Err(Error::PeerNotEnrolled(remote));
        };
        let my_entry = RegistryEntry::from_binding(&binding)?;

        let (content, key) =
            encode_keys_envelope(&binding.wallet_address, &[my_entry, remote_entry])?;
        let index = {
            let state = self.state.read().await;
            state.rooms.get(&room).map(|r| r.next_index()).unwrap_or(0)
        };
        let signature = binding.sign_digest(&entry_digest(&room, index, &content)?)?;
        self.server
            .post_message(&room, index, &content, &signature)
            .await?;

        let mut state = self.state.write().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(Error::IdentityState("account changed during start"));
        }
        let room_state = state.rooms.entry(room.clone()).or_default();
        room_state.add_key(key);
        room_state.note_index(index);
        info!("[Messenger] conversation {} started", room);
        Ok(room)
    }

    /// Encrypt and post one message. At most one send is in flight per
    /// engine instance; concurrent attempts fail fast. A 409 surfaces as
    /// the recoverable [`Error::IndexConflict`].
    pub async fn send_message(
        &self,
        wallet_or_room: &str,
        draft: MessageDraft,
    ) -> Result<DecryptedMessage> {
        if self
            .send_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::SendInFlight);
        }
        let _guard = SendGuard(&self.send_busy);

        let epoch = self.epoch.load(Ordering::SeqCst);
        let binding = self.state.read().await.binding()?;
        let room = self.resolve_room(wallet_or_room).await?;

        // Ensure the room is seeded; blocks until the keys envelope is
        // published for a brand-new conversation.
        let has_keys = {
            let state = self.state.read().await;
            state.rooms.get(&room).is_some_and(|r| r.has_keys())
        };
        if !has_keys {
            let remote = room_counterparty(&room, &binding.wallet_address)
                .ok_or_else(|| Error::InvalidAddress(room.clone()))?;
            self.start_conversation(&remote).await?;
        }

        let (primary, index) = {
            let state = self.state.read().await;
            let room_state = state
                .rooms
                .get(&room)
                .ok_or(Error::IdentityState("conversation not started"))?;
            let primary = room_state
                .primary_key()
                .copied()
                .ok_or(Error::IdentityState("room has no keys"))?;
            (primary, room_state.next_index())
        };

        let (content, message) = encode_msg_envelope(&binding.wallet_address, &primary, draft)?;
        let signature = binding.sign_digest(&entry_digest(&room, index, &content)?)?;
        self.server
            .post_message(&room, index, &content, &signature)
            .await?;

        let sent = DecryptedMessage {
            msg: message,
            room_id: room.clone(),
            index,
            sender_address: binding.wallet_address.clone(),
            hash: message_hash(&room, index),
        };

        {
            let mut state = self.state.write().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Err(Error::IdentityState("account changed during send"));
            }
            let room_state = state.rooms.entry(room).or_default();
            room_state.record_message(sent.clone());
            state.emitted.insert(sent.hash.clone());
        }
        self.emit(MessengerEvent::Message(sent.clone()));
        Ok(sent)
    }

    /// Like send, but returns the encrypted envelope (with a `to` field
    /// naming the recipient) instead of posting it.
    pub async fn create_out_of_band_envelope(
        &self,
        remote_wallet: &str,
        draft: MessageDraft,
    ) -> Result<Value> {
        let remote = checksum(remote_wallet)?;
        let binding = self.state.read().await.binding()?;
        let room = self.start_conversation(&remote).await?;

        let primary = {
            let state = self.state.read().await;
            state
                .rooms
                .get(&room)
                .and_then(|r| r.primary_key().copied())
                .ok_or(Error::IdentityState("room has no keys"))?
        };

        let (mut content, _) = encode_msg_envelope(&binding.wallet_address, &primary, draft)?;
        if let Some(object) = content.as_object_mut() {
            object.insert("to".to_string(), Value::String(remote));
        }
        Ok(content)
    }

    /// Counterpart of [`Messenger::create_out_of_band_envelope`]: infer
    /// the remote participant, make sure their room (and its keys) is
    /// loaded, then decode.
    pub async fn decrypt_out_of_band_envelope(&self, envelope: &Value) -> Result<Message> {
        let binding = self.state.read().await.binding()?;

        let Some(ContentEnvelope::Msg {
            address,
            iv,
            ciphertext,
        }) = ContentEnvelope::from_value(envelope)
        else {
            return Err(Error::InvalidMessage);
        };
        let to = envelope
            .get("to")
            .and_then(Value::as_str)
            .unwrap_or(&address)
            .to_string();

        // The remote is whichever of the two parties is not us.
        let remote = if address == binding.wallet_address {
            to
        } else {
            address
        };
        let room = room_id(&[&binding.wallet_address, &remote])?;

        let known = self.state.read().await.rooms.contains_key(&room);
        if !known {
            let epoch = self.epoch.load(Ordering::SeqCst);
            self.load_room(&room, epoch).await;
        }

        let keys = {
            let state = self.state.read().await;
            state
                .rooms
                .get(&room)
                .map(|r| r.all_keys().to_vec())
                .unwrap_or_default()
        };
        match decode_msg_envelope(&keys, &iv, &ciphertext) {
            MsgDecodeOutcome::Content(message) => Ok(message),
            MsgDecodeOutcome::Invalid => Err(Error::InvalidMessage),
            MsgDecodeOutcome::NotDecryptable => Err(Error::Crypto(
                "envelope not decryptable with known keys".into(),
            )),
        }
    }

    // ============ READ-ONLY VIEWS ============

    /// Decrypted messages of a conversation, ascending by log index.
    pub async fn get_messages(&self, wallet_or_room: &str) -> Result<Vec<DecryptedMessage>> {
        let room = self.resolve_room(wallet_or_room).await?;
        let state = self.state.read().await;
        Ok(state
            .rooms
            .get(&room)
            .map(|r| r.messages_in_order())
            .unwrap_or_default())
    }

    /// One past the highest known log index of a conversation.
    pub async fn get_message_count(&self, wallet_or_room: &str) -> Result<u64> {
        let room = self.resolve_room(wallet_or_room).await?;
        let state = self.state.read().await;
        Ok(state.rooms.get(&room).map(|r| r.message_count).unwrap_or(0))
    }

    /// Room ids of every conversation known to this engine.
    pub async fn enumerate_conversations(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut rooms: Vec<String> = state.rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    // ============ STATUS ============

    fn status_store(&self, wallet: &str) -> StatusStore {
        StatusStore::new(wallet, self.data_store.clone())
    }

    pub async fn message_status(&self, message_hash: &str) -> Result<MessageStatus> {
        let wallet = self.state.read().await.wallet()?;
        Ok(self.status_store(&wallet).status(message_hash))
    }

    pub async fn mark_read(&self, message_hash: &str) -> Result<()> {
        let wallet = self.state.read().await.wallet()?;
        self.status_store(&wallet).mark_read(message_hash)
    }

    /// Millisecond timestamp of this wallet's first subscription, set on
    /// the first `load_rooms`.
    pub async fn subscription_start(&self) -> Result<Option<i64>> {
        let wallet = self.state.read().await.wallet()?;
        Ok(self
            .data_store
            .get(&subscription_start_key(&wallet))?
            .and_then(|raw| raw.parse().ok()))
    }
}
