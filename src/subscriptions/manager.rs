//! Subscription manager: the subscription set, its wildcard-matching
//! index, and the backing subscription file.

use crate::error::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use super::types::{parse_line, Triplet, WILDCARD};

/// Delay before the single retry of a failed subscription-file write.
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Subscription set plus the derived matching index.
///
/// The index maps `class -> instance -> user set` and mirrors the set
/// exactly: entries are removed (cascading) rather than left empty.
#[derive(Default)]
struct SubState {
    subs: HashSet<Triplet>,
    index: HashMap<String, HashMap<String, HashSet<String>>>,
}

impl SubState {
    fn insert(&mut self, triplet: Triplet) -> bool {
        if !self.subs.insert(triplet.clone()) {
            return false;
        }
        self.index
            .entry(triplet.class)
            .or_default()
            .entry(triplet.instance)
            .or_default()
            .insert(triplet.user);
        true
    }

    fn remove(&mut self, triplet: &Triplet) -> bool {
        if !self.subs.remove(triplet) {
            return false;
        }
        if let Some(instances) = self.index.get_mut(&triplet.class) {
            if let Some(users) = instances.get_mut(&triplet.instance) {
                users.remove(&triplet.user);
                if users.is_empty() {
                    instances.remove(&triplet.instance);
                }
            }
            if instances.is_empty() {
                self.index.remove(&triplet.class);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.subs.clear();
        self.index.clear();
    }
}

/// Manages the `(class, instance, user)` subscription set and answers
/// whether a notice addressed to a triplet would be delivered.
pub struct SubscriptionManager {
    state: RwLock<SubState>,
    /// Backing subscription file; `None` disables persistence.
    path: Option<PathBuf>,
    username: String,
}

impl SubscriptionManager {
    /// Open the manager against a subscription file, loading the persisted
    /// set. A missing file yields the default set for `username`:
    /// `(username, *, *)` and `(message, *, username)`, written back out.
    pub fn open(username: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let manager = Self {
            state: RwLock::new(SubState::default()),
            path: Some(path.into()),
            username: username.into(),
        };
        manager.load_or_create()?;
        Ok(manager)
    }

    /// An in-memory manager with the default set and no backing file.
    pub fn ephemeral(username: impl Into<String>) -> Self {
        let manager = Self {
            state: RwLock::new(SubState::default()),
            path: None,
            username: username.into(),
        };
        {
            let mut state = manager.state.write();
            for sub in manager.default_subs() {
                state.insert(sub);
            }
        }
        manager
    }

    fn default_subs(&self) -> Vec<Triplet> {
        vec![
            Triplet::new(self.username.clone(), WILDCARD, WILDCARD),
            Triplet::new("message", WILDCARD, self.username.clone()),
        ]
    }

    fn load_or_create(&self) -> Result<()> {
        let path = self.path.as_ref().expect("open() always sets a path");
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return self.set(self.default_subs());
            }
            Err(e) => return Err(e.into()),
        };

        let mut state = self.state.write();
        for (lineno, line) in contents.lines().enumerate() {
            match parse_line(line) {
                // Unsubscribe markers are parsed but not yet honored.
                Some(parsed) => {
                    state.insert(parsed.triplet);
                }
                None if line.trim().is_empty() || line.trim_start().starts_with('#') => {}
                None => {
                    warn!(path = %path.display(), lineno = lineno + 1, "skipping malformed subscription line");
                }
            }
        }
        Ok(())
    }

    /// Rewrite the backing file from the current set, retrying once after
    /// a short delay before the error propagates.
    fn persist(&self, state: &SubState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        match write_subs(path, &state.subs) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "subscription write failed, retrying");
                std::thread::sleep(PERSIST_RETRY_DELAY);
                write_subs(path, &state.subs).map_err(Into::into)
            }
        }
    }

    /// Snapshot of the current subscriptions.
    pub fn get(&self) -> Vec<Triplet> {
        self.state.read().subs.iter().cloned().collect()
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.state.read().subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().subs.is_empty()
    }

    /// Replace the subscription set.
    pub fn set(&self, subscriptions: impl IntoIterator<Item = Triplet>) -> Result<()> {
        let mut state = self.state.write();
        state.clear();
        for sub in subscriptions {
            state.insert(sub);
        }
        self.persist(&state)
    }

    /// Add one subscription. Returns false (no change) if already present.
    pub fn add(&self, subscription: Triplet) -> Result<bool> {
        let mut state = self.state.write();
        if !state.insert(subscription) {
            return Ok(false);
        }
        self.persist(&state)?;
        Ok(true)
    }

    /// Remove one subscription. Returns false (not found) if absent,
    /// never an error.
    pub fn remove(&self, subscription: &Triplet) -> Result<bool> {
        let mut state = self.state.write();
        if !state.remove(subscription) {
            return Ok(false);
        }
        self.persist(&state)?;
        Ok(true)
    }

    /// Add every given subscription; returns how many were new.
    pub fn add_all(&self, subscriptions: impl IntoIterator<Item = Triplet>) -> Result<usize> {
        let mut state = self.state.write();
        let mut added = 0;
        for sub in subscriptions {
            if state.insert(sub) {
                added += 1;
            }
        }
        if added > 0 {
            self.persist(&state)?;
        }
        Ok(added)
    }

    /// Remove every given subscription; returns how many were present.
    /// Missing triplets are counted as no-change, never an error.
    pub fn remove_all(&self, subscriptions: &[Triplet]) -> Result<usize> {
        let mut state = self.state.write();
        let mut removed = 0;
        for sub in subscriptions {
            if state.remove(sub) {
                removed += 1;
            }
        }
        if removed > 0 {
            self.persist(&state)?;
        }
        Ok(removed)
    }

    /// Drop every subscription and truncate the backing file.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        state.clear();
        self.persist(&state)
    }

    /// Would a notice addressed to this triplet be delivered?
    ///
    /// Missing (or empty) components take the historical defaults
    /// `class="personal"`, `instance="message"`, `user="*"` (inverted
    /// relative to the message schema's own defaults; the substitution
    /// is preserved as-is).
    pub fn match_triplet(
        &self,
        class: Option<&str>,
        instance: Option<&str>,
        user: Option<&str>,
    ) -> bool {
        let class = class.filter(|s| !s.is_empty()).unwrap_or("personal");
        let instance = instance.filter(|s| !s.is_empty()).unwrap_or("message");
        let user = user.filter(|s| !s.is_empty()).unwrap_or(WILDCARD);

        let state = self.state.read();
        let Some(instances) = state.index.get(class) else {
            return false;
        };
        let users = match instances.get(instance) {
            Some(users) => users,
            None => match instances.get(WILDCARD) {
                Some(users) => users,
                None => return false,
            },
        };
        users.contains(WILDCARD) || users.contains(user)
    }

    /// Exact-membership test against the subscription set; no wildcard
    /// expansion.
    pub fn is_subscribed(&self, subscription: &Triplet) -> bool {
        self.state.read().subs.contains(subscription)
    }
}

fn write_subs(path: &std::path::Path, subs: &HashSet<Triplet>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = fs::File::create(path)?;
    for sub in subs {
        writeln!(file, "{}", sub.to_line())?;
    }
    file.sync_all()
}
