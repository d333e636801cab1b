//! Rule-triggered webhook notifications.
//!
//! The dispatcher subscribes to the journal bus. Matching events are
//! serialized once (that exact byte sequence is what gets signed) and
//! queued to a worker; delivery uses exponential backoff with a bounded
//! retry count and per-endpoint rate limiting. A webhook that is down can
//! never block or fail the mutation that triggered it.

use std::{
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::journal::{Event, EventBus, Subscriber};

type HmacSha256 = Hmac<Sha256>;

/// Signature header attached to every delivery.
pub const SIGNATURE_HEADER: &str = "X-Wgfleet-Signature";

fn default_min_interval() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WebhookEndpoint {
    pub url: String,
    /// HMAC-SHA256 key for the signature header.
    pub secret: String,
    /// Event kinds this endpoint wants; empty means all.
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// An alert rule gates which events reach the webhooks at all.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AlertRule {
    /// Event kind to match, or `*` for everything.
    pub event: String,
}

impl AlertRule {
    fn matches(&self, kind: &str) -> bool {
        self.event == "*" || self.event == kind
    }
}

/// hex(hmac-sha256(secret, payload)), the value of [`SIGNATURE_HEADER`].
pub fn sign_payload(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(payload.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

struct Delivery {
    endpoint_index: usize,
    kind: String,
    payload: String,
}

pub struct AlertDispatcher {
    tx: mpsc::Sender<Delivery>,
    endpoints: Vec<WebhookEndpoint>,
    rules: Vec<AlertRule>,
    handle: Option<thread::JoinHandle<()>>,
}

impl AlertDispatcher {
    pub fn spawn(endpoints: Vec<WebhookEndpoint>, rules: Vec<AlertRule>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Delivery>();
        let worker_endpoints = endpoints.clone();
        let handle = thread::Builder::new()
            .name("webhook-dispatch".to_string())
            .spawn(move || {
                let client = reqwest::blocking::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build();
                let client = match client {
                    Ok(client) => client,
                    Err(e) => {
                        log::error!("webhook client construction failed: {e}");
                        return;
                    },
                };
                let mut last_sent: Vec<Option<Instant>> = vec![None; worker_endpoints.len()];
                while let Ok(delivery) = rx.recv() {
                    let endpoint = &worker_endpoints[delivery.endpoint_index];
                    if let Some(last) = last_sent[delivery.endpoint_index] {
                        if last.elapsed() < Duration::from_secs(endpoint.min_interval_secs) {
                            log::debug!(
                                "rate limit: dropping {} for {}",
                                delivery.kind,
                                endpoint.url
                            );
                            continue;
                        }
                    }
                    last_sent[delivery.endpoint_index] = Some(Instant::now());
                    deliver(&client, endpoint, &delivery);
                }
            })
            .expect("failed to spawn webhook dispatcher");

        Arc::new(AlertDispatcher {
            tx,
            endpoints,
            rules,
            handle: Some(handle),
        })
    }

    /// The bus subscriber: filter, serialize, enqueue. Never blocks.
    pub fn subscriber(self: &Arc<Self>) -> Subscriber {
        let dispatcher = Arc::clone(self);
        Arc::new(move |event: &Event| dispatcher.handle_event(event))
    }

    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        bus.subscribe(self.subscriber());
    }

    fn handle_event(&self, event: &Event) {
        let kind = event.kind();
        if !self.rules.is_empty() && !self.rules.iter().any(|r| r.matches(kind)) {
            return;
        }
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("unserializable event {kind}: {e}");
                return;
            },
        };
        for (endpoint_index, endpoint) in self.endpoints.iter().enumerate() {
            if !endpoint.events.is_empty() && !endpoint.events.iter().any(|e| e == kind) {
                continue;
            }
            let _ = self.tx.send(Delivery {
                endpoint_index,
                kind: kind.to_string(),
                payload: payload.clone(),
            });
        }
    }
}

impl Drop for AlertDispatcher {
    fn drop(&mut self) {
        // Closing the channel ends the worker once the queue drains.
        let (replacement, _) = mpsc::channel();
        drop(std::mem::replace(&mut self.tx, replacement));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn deliver(client: &reqwest::blocking::Client, endpoint: &WebhookEndpoint, delivery: &Delivery) {
    let signature = sign_payload(&endpoint.secret, &delivery.payload);
    let mut backoff = Duration::from_secs(1);
    for attempt in 1..=endpoint.max_retries.max(1) {
        let result = client
            .post(&endpoint.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, &signature)
            .body(delivery.payload.clone())
            .send();
        match result {
            Ok(response) if response.status().is_success() => {
                log::debug!("delivered {} to {}", delivery.kind, endpoint.url);
                return;
            },
            Ok(response) => {
                log::warn!(
                    "webhook {} answered {} (attempt {attempt})",
                    endpoint.url,
                    response.status()
                );
            },
            Err(e) => {
                log::warn!("webhook {} unreachable (attempt {attempt}): {e}", endpoint.url);
            },
        }
        if attempt < endpoint.max_retries.max(1) {
            thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_secs(60));
        }
    }
    log::error!(
        "webhook {} failed permanently for {}; giving up",
        endpoint.url,
        delivery.kind
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_are_stable_and_keyed() {
        let payload = r#"{"event":"peer_added","kind":"remote","name":"alice"}"#;
        let a = sign_payload("secret-1", payload);
        let b = sign_payload("secret-1", payload);
        let c = sign_payload("secret-2", payload);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("sha256="));
        assert_eq!(a.len(), "sha256=".len() + 64);
    }

    #[test]
    fn rules_gate_event_kinds() {
        let rule = AlertRule {
            event: "failover_occurred".to_string(),
        };
        assert!(rule.matches("failover_occurred"));
        assert!(!rule.matches("peer_added"));
        let wildcard = AlertRule {
            event: "*".to_string(),
        };
        assert!(wildcard.matches("anything"));
    }
}
