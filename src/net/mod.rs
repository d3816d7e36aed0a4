//! Request/response snapshots and the network seam used by the worker.
//!
//! Requests and responses are plain owned values so they can be cloned into a
//! cache partition, replayed from it, or handed to a fake network in tests.

mod client;

pub use client::HttpNetwork;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(eyre!("Unsupported HTTP method: {}", other)),
    }
  }
}

/// How the request was initiated by the page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level document load
  Navigate,
  /// Subresource or script-initiated fetch
  #[default]
  Cors,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  /// Header names are stored lowercase
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      mode: RequestMode::Cors,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  /// A top-level page load.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// A POST carrying `value` serialized as JSON.
  pub fn post_json<T: Serialize>(url: Url, value: &T) -> Result<Self> {
    let body =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize request body: {}", e))?;

    Ok(
      Self {
        method: Method::Post,
        body: Some(body),
        ..Self::get(url)
      }
      .with_header("content-type", "application/json"),
    )
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  /// Header names are stored lowercase
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status, value.to_string()).with_header("content-type", "application/json")
  }

  pub fn html(status: u16, markup: &str) -> Self {
    Self::new(status, markup).with_header("content-type", "text/html")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// True for 2xx statuses.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn body_json(&self) -> Result<serde_json::Value> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Response body is not JSON: {}", e))
  }
}

/// The network as seen by the worker.
///
/// `Ok` means a response arrived, whatever its status. `Err` is a transport
/// failure (unreachable host, reset connection, timeout).
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Fetch with an upper bound; hitting the bound counts as a network failure.
pub async fn fetch_with_timeout(
  network: &dyn Network,
  request: &Request,
  timeout: Duration,
) -> Result<Response> {
  match tokio::time::timeout(timeout, network.fetch(request)).await {
    Ok(result) => result,
    Err(_) => Err(eyre!(
      "{} {} timed out after {}ms",
      request.method,
      request.url,
      timeout.as_millis()
    )),
  }
}
