//! Messages exchanged between pages and the worker.

use serde::{Deserialize, Serialize};

/// Page → worker messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Drain the queue now and reply to the sender
  SyncNow,
  /// Promote the waiting worker without waiting for tabs to close
  SkipWaiting,
}

impl ClientMessage {
  /// Parse an arbitrary posted value; anything unrecognized is `None`.
  pub fn parse(value: &serde_json::Value) -> Option<Self> {
    serde_json::from_value(value.clone()).ok()
  }
}

/// Outcome of one sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
  /// Ops confirmed and removed during the run
  pub count: usize,
  pub success: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl SyncSummary {
  pub fn succeeded(count: usize) -> Self {
    Self {
      count,
      success: true,
      error: None,
    }
  }

  pub fn failed(error: impl ToString) -> Self {
    Self {
      count: 0,
      success: false,
      error: Some(error.to_string()),
    }
  }
}

/// Worker → page messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  SyncComplete(SyncSummary),
}

impl WorkerMessage {
  pub fn parse(value: &serde_json::Value) -> Option<Self> {
    serde_json::from_value(value.clone()).ok()
  }
}
