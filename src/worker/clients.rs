//! Window clients the worker can see and message.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use url::Url;

use super::messages::WorkerMessage;

pub type ClientId = u64;

/// Snapshot of one open window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
  pub id: ClientId,
  pub url: Url,
  /// Whether the active worker governs this window's requests
  pub controlled: bool,
  pub focused: bool,
}

/// Page-side end of a client connection.
#[derive(Debug)]
pub struct ClientHandle {
  pub id: ClientId,
  pub messages: mpsc::UnboundedReceiver<WorkerMessage>,
}

struct ClientEntry {
  info: ClientInfo,
  sender: mpsc::UnboundedSender<WorkerMessage>,
}

/// Registry of open windows.
///
/// Windows that opened before the first `claim` stay uncontrolled until
/// claimed; later windows are controlled from the start.
#[derive(Default)]
pub struct ClientHub {
  clients: Mutex<BTreeMap<ClientId, ClientEntry>>,
  next_id: AtomicU64,
  claimed: AtomicBool,
}

impl ClientHub {
  pub fn new() -> Self {
    Self::default()
  }

  fn entries(&self) -> MutexGuard<'_, BTreeMap<ClientId, ClientEntry>> {
    self.clients.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Register a window showing `url`.
  pub fn connect(&self, url: Url) -> ClientHandle {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let (sender, messages) = mpsc::unbounded_channel();
    let info = ClientInfo {
      id,
      url,
      controlled: self.claimed.load(Ordering::SeqCst),
      focused: false,
    };

    tracing::debug!(client = id, url = %info.url, "client connected");
    self.entries().insert(id, ClientEntry { info, sender });
    ClientHandle { id, messages }
  }

  pub fn disconnect(&self, id: ClientId) {
    if self.entries().remove(&id).is_some() {
      tracing::debug!(client = id, "client disconnected");
    }
  }

  pub fn get(&self, id: ClientId) -> Option<ClientInfo> {
    self.entries().get(&id).map(|e| e.info.clone())
  }

  /// Open windows in connection order.
  pub fn match_all(&self, include_uncontrolled: bool) -> Vec<ClientInfo> {
    self
      .entries()
      .values()
      .filter(|e| include_uncontrolled || e.info.controlled)
      .map(|e| e.info.clone())
      .collect()
  }

  /// Deliver to one client; `false` if it is gone.
  pub fn post_message(&self, id: ClientId, message: WorkerMessage) -> bool {
    let mut entries = self.entries();
    let Some(entry) = entries.get(&id) else {
      return false;
    };

    if entry.sender.send(message).is_err() {
      // Receiver dropped without a disconnect
      entries.remove(&id);
      return false;
    }
    true
  }

  /// Deliver to every open window, controlled or not, except `except`.
  /// Returns how many clients received it.
  pub fn broadcast(&self, message: &WorkerMessage, except: Option<ClientId>) -> usize {
    let mut entries = self.entries();
    let mut closed = Vec::new();
    let mut delivered = 0;

    for (id, entry) in entries.iter() {
      if Some(*id) == except {
        continue;
      }
      if entry.sender.send(message.clone()).is_ok() {
        delivered += 1;
      } else {
        closed.push(*id);
      }
    }

    for id in closed {
      entries.remove(&id);
    }
    delivered
  }

  /// Bring one window to the front.
  pub fn focus(&self, id: ClientId) -> bool {
    let mut entries = self.entries();
    if !entries.contains_key(&id) {
      return false;
    }
    for (other, entry) in entries.iter_mut() {
      entry.info.focused = *other == id;
    }
    true
  }

  /// Open and focus a new window at `url`.
  pub fn open_window(&self, url: Url) -> ClientHandle {
    let handle = self.connect(url);
    self.focus(handle.id);
    handle
  }

  /// Take control of every open window. Returns how many were newly claimed.
  pub fn claim(&self) -> usize {
    self.claimed.store(true, Ordering::SeqCst);
    let mut claimed = 0;
    for entry in self.entries().values_mut() {
      if !entry.info.controlled {
        entry.info.controlled = true;
        claimed += 1;
      }
    }
    claimed
  }

  /// Whether windows are governed by an active worker.
  pub fn has_controller(&self) -> bool {
    self.claimed.load(Ordering::SeqCst)
  }
}
