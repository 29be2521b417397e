//! Messenger: owns the message store and filter registry, bridges the
//! inbound notice source into storage, and exposes the client-facing
//! message operations.

use crate::error::{RelayError, Result};
use crate::filter::{ClauseSpec, Filter, FilterId};
use crate::store::{self, MessageStore};
use crate::subscriptions::SubscriptionManager;
use crate::transport::{NoticeSink, NoticeSource, Preferences};
use crate::types::{
    ClassCounts, InstanceCounts, MarkStatus, Message, MessageId, NewMessage, Notice, SenderCounts,
    Timestamp, DEFAULT_CLASS, DEFAULT_INSTANCE,
};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Default bound on the filter registry. Filters are tiny and compilation
/// is idempotent, so eviction only costs a client one re-registration.
pub const DEFAULT_FILTER_CAPACITY: usize = 4096;

/// Messenger configuration.
#[derive(Clone, Debug)]
pub struct MessengerConfig {
    /// Local username; outgoing messages are sent (and stored) as this
    /// sender.
    pub username: String,

    /// Database path; `None` keeps the store in memory.
    pub db_path: Option<PathBuf>,

    /// Max registered filters before least-recently-used eviction.
    pub filter_capacity: usize,
}

impl MessengerConfig {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            db_path: None,
            filter_capacity: DEFAULT_FILTER_CAPACITY,
        }
    }
}

/// One page of filter results, shaped for the RPC layer.
#[derive(Clone, Debug, Serialize)]
pub struct FilterPage {
    /// The fid the page was produced from.
    pub filter: String,
    pub offset: i64,
    pub perpage: i64,
    pub messages: Vec<Message>,
}

/// The message relay core.
///
/// Safe under parallel invocation: every store access is serialized by
/// the store's re-entrant mutex, and the receiver loop runs as one
/// long-lived thread alongside the RPC-facing callers.
pub struct Messenger {
    store: MessageStore,
    filters: Mutex<LruCache<FilterId, Filter>>,
    subscriptions: Arc<SubscriptionManager>,
    source: Arc<dyn NoticeSource>,
    sink: Arc<dyn NoticeSink>,
    preferences: Arc<dyn Preferences>,
    username: String,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Messenger {
    pub fn new(
        config: MessengerConfig,
        subscriptions: Arc<SubscriptionManager>,
        source: Arc<dyn NoticeSource>,
        sink: Arc<dyn NoticeSink>,
        preferences: Arc<dyn Preferences>,
    ) -> Result<Self> {
        let store = match &config.db_path {
            Some(path) => MessageStore::open_or_create(path)?,
            None => MessageStore::in_memory()?,
        };
        let capacity = NonZeroUsize::new(config.filter_capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_FILTER_CAPACITY).unwrap());

        Ok(Self {
            store,
            filters: Mutex::new(LruCache::new(capacity)),
            subscriptions,
            source,
            sink,
            preferences,
            username: config.username,
            receiver: Mutex::new(None),
        })
    }

    /// The underlying store (for embedding and tests).
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// The subscription manager governing outbound delivery.
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    // --- Receiver Lifecycle ---

    /// Launch the receiver loop. A no-op when already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.receiver.lock();
        if slot.is_some() {
            return Ok(());
        }
        let messenger = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("courier-receiver".into())
            .spawn(move || messenger.receive_loop())?;
        *slot = Some(handle);
        Ok(())
    }

    /// Interrupt the source and wait for the receiver loop to exit.
    /// Idempotent; safe to call when never started.
    pub fn stop(&self) {
        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            self.source.interrupt();
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.receiver.lock().is_some()
    }

    fn receive_loop(&self) {
        debug!("receiver loop started");
        loop {
            match self.source.receive(true) {
                Some(notice) => {
                    if let Err(e) = self.store_incoming(notice) {
                        warn!(error = %e, "failed to store incoming notice");
                    }
                }
                None => {
                    debug!("receiver loop interrupted");
                    return;
                }
            }
        }
    }

    // --- Intake / Outbound ---

    /// Store a notice delivered by the inbound source. Control frames
    /// (non-empty opcode, e.g. pings) are discarded, not errors.
    pub fn store_incoming(&self, notice: Notice) -> Result<Option<MessageId>> {
        if !notice.is_message() {
            debug!(opcode = %notice.opcode, "discarding control notice");
            return Ok(None);
        }

        let (signature, body) = notice.signature_and_body();
        let message = NewMessage {
            sender: notice.sender.clone(),
            authenticated: notice.authenticated,
            signature: signature.to_string(),
            body: body.to_string(),
            read: false,
            class: notice.class.clone(),
            instance: notice.instance.clone(),
            recipient: if notice.recipient.is_empty() {
                None
            } else {
                Some(notice.recipient.clone())
            },
            timestamp: notice.time,
        };
        self.store.insert(&message).map(Some)
    }

    /// Send a message through the outbound sink. A personal send (specific
    /// user) is also stored locally, already read, so outgoing personals
    /// appear in one's own history.
    ///
    /// Never raises: failures are logged and reported as `false`.
    pub fn send(&self, body: &str, class: &str, instance: &str, user: Option<&str>) -> bool {
        match self.try_send(body, class, instance, user) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, class, instance, "send failed");
                false
            }
        }
    }

    fn try_send(&self, body: &str, class: &str, instance: &str, user: Option<&str>) -> Result<()> {
        let class = if class.is_empty() { DEFAULT_CLASS } else { class };
        let instance = if instance.is_empty() {
            DEFAULT_INSTANCE
        } else {
            instance
        };
        let signature = self.preferences.signature();
        let timestamp = Timestamp::now();

        self.sink.send(Notice {
            sender: self.username.clone(),
            authenticated: true,
            opcode: String::new(),
            class: class.to_string(),
            instance: instance.to_string(),
            recipient: user.unwrap_or("").to_string(),
            time: Some(timestamp),
            fields: vec![signature.clone(), body.to_string()],
        })?;

        if let Some(user) = user {
            self.store.insert(&NewMessage {
                sender: self.username.clone(),
                authenticated: true,
                signature,
                body: body.to_string(),
                read: true,
                class: class.to_string(),
                instance: instance.to_string(),
                recipient: Some(user.to_string()),
                timestamp: Some(timestamp),
            })?;
        }
        Ok(())
    }

    // --- Filters ---

    /// Compile and register a filter; returns its stable fid. Redundant
    /// registration of an equal definition is idempotent and cheap.
    pub fn filter_messages(&self, clauses: &[ClauseSpec]) -> Result<FilterId> {
        let filter = Filter::compile(clauses)?;
        let fid = filter.fid();
        self.filters.lock().put(fid, filter);
        Ok(fid)
    }

    fn lookup(&self, fid: FilterId) -> Result<Filter> {
        self.filters
            .lock()
            .get(&fid)
            .cloned()
            .ok_or_else(|| RelayError::FilterNotFound(fid.to_string()))
    }

    /// Get one page of messages matching a registered filter.
    pub fn get(&self, fid: FilterId, offset: i64, perpage: i64) -> Result<FilterPage> {
        let filter = self.lookup(fid)?;
        let messages = self.store.with_conn(|conn| filter.get(conn, offset, perpage))?;
        Ok(FilterPage {
            filter: fid.to_string(),
            offset,
            perpage,
            messages,
        })
    }

    /// Ids of messages matching a registered filter, in timestamp order.
    pub fn get_ids(&self, fid: FilterId, offset: i64, perpage: i64) -> Result<Vec<MessageId>> {
        let filter = self.lookup(fid)?;
        self.store.with_conn(|conn| filter.get_ids(conn, offset, perpage))
    }

    /// True iff a message newer than `last` exists (optionally matching a
    /// filter).
    pub fn has_new(&self, last: MessageId, fid: Option<FilterId>) -> Result<bool> {
        match fid {
            Some(fid) => {
                let filter = self.lookup(fid)?;
                self.store.has_newer(last, Some(&filter))
            }
            None => self.store.has_newer(last, None),
        }
    }

    /// Total message count, or the count matching a filter.
    pub fn get_count(&self, fid: Option<FilterId>) -> Result<i64> {
        match fid {
            Some(fid) => {
                let filter = self.lookup(fid)?;
                self.store.with_conn(|conn| filter.count(conn, 0, -1))
            }
            None => self.store.count(),
        }
    }

    /// Position of the oldest unread message within the filter's
    /// timestamp-ordered results, and the total match count. The offset is
    /// -1 when nothing matching is unread.
    pub fn get_oldest_unread_offset(&self, fid: FilterId) -> Result<(i64, i64)> {
        let filter = self.lookup(fid)?;
        self.store.with_conn(|conn| filter.oldest_unread_offset(conn))
    }

    // --- Mutation ---

    /// Delete by explicit id list; empty list is a no-op returning 0.
    pub fn delete(&self, ids: &[MessageId]) -> Result<usize> {
        self.store.delete_ids(ids)
    }

    /// Delete everything matching a filter, or only one page of it.
    ///
    /// A page cannot be expressed as a single bounded predicate delete, so
    /// its ids are resolved first and deleted individually, inside one
    /// transaction so resolution and deletion see the same snapshot.
    pub fn delete_filter(&self, fid: FilterId, offset: i64, perpage: i64) -> Result<usize> {
        let filter = self.lookup(fid)?;
        if offset != 0 || perpage >= 0 {
            self.store.with_txn(|conn| {
                let ids = filter.get_ids(conn, offset, perpage)?;
                store::delete_ids_on(conn, &ids)
            })
        } else {
            self.store.with_txn(|conn| filter.delete(conn))
        }
    }

    /// Mark by explicit id list. `status` must be exactly `"read"` or
    /// `"unread"`.
    pub fn mark(&self, status: &str, ids: &[MessageId]) -> Result<usize> {
        let status = MarkStatus::parse(status)?;
        self.store.mark_ids(status, ids)
    }

    /// Mark everything matching a filter, or only one page of it (same
    /// paged resolution rule as [`Messenger::delete_filter`]).
    pub fn mark_filter(
        &self,
        status: &str,
        fid: FilterId,
        offset: i64,
        perpage: i64,
    ) -> Result<usize> {
        let status = MarkStatus::parse(status)?;
        let filter = self.lookup(fid)?;
        if offset != 0 || perpage >= 0 {
            self.store.with_txn(|conn| {
                let ids = filter.get_ids(conn, offset, perpage)?;
                store::mark_ids_on(conn, status, &ids)
            })
        } else {
            self.store.with_txn(|conn| filter.mark(conn, status))
        }
    }

    // --- Grouped Views ---

    /// Instances with messages in a class, most recent activity first.
    pub fn get_instances(
        &self,
        class: &str,
        offset: i64,
        perpage: i64,
    ) -> Result<Vec<InstanceCounts>> {
        self.store.instance_counts(class, false, offset, perpage)
    }

    /// Instances with unread messages in a class.
    pub fn get_unread_instances(
        &self,
        class: &str,
        offset: i64,
        perpage: i64,
    ) -> Result<Vec<InstanceCounts>> {
        self.store.instance_counts(class, true, offset, perpage)
    }

    /// Classes with messages, starred classes first, then most recent
    /// activity.
    pub fn get_classes(&self, offset: i64, perpage: i64) -> Result<Vec<ClassCounts>> {
        let classes = self.store.class_counts(false, offset, perpage)?;
        Ok(self.annotate_starred(classes))
    }

    /// Classes with unread messages, starred first.
    pub fn get_unread_classes(&self, offset: i64, perpage: i64) -> Result<Vec<ClassCounts>> {
        let classes = self.store.class_counts(true, offset, perpage)?;
        Ok(self.annotate_starred(classes))
    }

    fn annotate_starred(&self, mut classes: Vec<ClassCounts>) -> Vec<ClassCounts> {
        let starred = self.preferences.starred_classes();
        for class in &mut classes {
            class.starred = starred.contains(&class.class);
        }
        // Stable: starred groups first, activity order preserved within.
        classes.sort_by_key(|c| !c.starred);
        classes
    }

    /// Users that have exchanged personal messages, most recent first.
    pub fn get_personals(&self, offset: i64, perpage: i64) -> Result<Vec<SenderCounts>> {
        self.store.sender_counts(offset, perpage)
    }
}
