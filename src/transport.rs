//! Transport collaborators: the inbound notice source, the outbound
//! notice sink, and the user preference lookup.
//!
//! The relay core never talks to the wire itself; it consumes these
//! traits. Channel-backed implementations are provided for embedding the
//! core behind an arbitrary protocol client (and for tests).

use crate::error::Result;
use crate::types::Notice;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;

/// Inbound notice source.
pub trait NoticeSource: Send + Sync {
    /// Receive the next notice. With `block` set, waits until a notice
    /// arrives or the source is interrupted; `None` is the interrupt
    /// sentinel (not an error) and tells the receiver loop to exit.
    fn receive(&self, block: bool) -> Option<Notice>;

    /// Cause one pending or future blocking receive to return the
    /// sentinel.
    fn interrupt(&self);
}

/// Outbound notice sink.
pub trait NoticeSink: Send + Sync {
    fn send(&self, notice: Notice) -> Result<()>;
}

/// External user-preference lookup (simple key-value collaborator).
pub trait Preferences: Send + Sync {
    /// Signature text prefixed to outgoing messages.
    fn signature(&self) -> String;

    /// Classes the user has starred.
    fn starred_classes(&self) -> HashSet<String>;
}

enum SourceEvent {
    Notice(Box<Notice>),
    Interrupt,
}

/// A cancellable blocking notice source over a channel.
///
/// The protocol client pushes decoded notices through a
/// [`NoticeInjector`]; `interrupt` enqueues a sentinel that one receive
/// will observe.
pub struct ChannelSource {
    sender: Sender<SourceEvent>,
    receiver: Receiver<SourceEvent>,
}

impl ChannelSource {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Producer handle for the transport side.
    pub fn injector(&self) -> NoticeInjector {
        NoticeInjector {
            sender: self.sender.clone(),
        }
    }
}

impl Default for ChannelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeSource for ChannelSource {
    fn receive(&self, block: bool) -> Option<Notice> {
        let event = if block {
            self.receiver.recv().ok()?
        } else {
            self.receiver.try_recv().ok()?
        };
        match event {
            SourceEvent::Notice(notice) => Some(*notice),
            SourceEvent::Interrupt => None,
        }
    }

    fn interrupt(&self) {
        let _ = self.sender.send(SourceEvent::Interrupt);
    }
}

/// Producer half of a [`ChannelSource`].
#[derive(Clone)]
pub struct NoticeInjector {
    sender: Sender<SourceEvent>,
}

impl NoticeInjector {
    /// Queue a notice for the receiver loop. Returns false if the source
    /// has been dropped.
    pub fn push(&self, notice: Notice) -> bool {
        self.sender.send(SourceEvent::Notice(Box::new(notice))).is_ok()
    }
}

/// A sink that records sent notices in memory.
#[derive(Default)]
pub struct MemorySink {
    sent: Mutex<Vec<Notice>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything sent so far.
    pub fn sent(&self) -> Vec<Notice> {
        self.sent.lock().clone()
    }
}

impl NoticeSink for MemorySink {
    fn send(&self, notice: Notice) -> Result<()> {
        self.sent.lock().push(notice);
        Ok(())
    }
}

/// Fixed preference values.
#[derive(Clone, Debug, Default)]
pub struct StaticPreferences {
    pub signature: String,
    pub starred: HashSet<String>,
}

impl Preferences for StaticPreferences {
    fn signature(&self) -> String {
        self.signature.clone()
    }

    fn starred_classes(&self) -> HashSet<String> {
        self.starred.clone()
    }
}
