//! HTTP forwarder for the backend persistence API
//!
//! ## Overview
//!
//! The relay POSTs every decoded event as JSON to a single endpoint. The
//! backend is the system of record and answers `201 Created` when it stored
//! the event; that is the only success.
//!
//! ## Error Classification
//!
//! | Outcome                        | Result                                |
//! |--------------------------------|---------------------------------------|
//! | `201`                          | `Ok(ForwardReceipt)`                  |
//! | any other status               | [`ForwardError::UnexpectedStatus`]    |
//! | no answer within the timeout   | [`ForwardError::Timeout`]             |
//! | DNS failure, refused connect   | [`ForwardError::Connection`]          |
//! | anything else on the wire      | [`ForwardError::Transport`]           |
//!
//! There are no retries. A failed forward drops the event.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use ripeline_connectors::http::HttpForwarder;
//! use std::time::Duration;
//!
//! let forwarder = HttpForwarder::new("http://backend.local:8000/api/tomatoes", Duration::from_secs(10))?;
//! # let event: ripeline_core::ClassificationEvent = unimplemented!();
//! let receipt = forwarder.post_event(&event)?;
//! println!("stored: {:?}", receipt.message);
//! # Ok::<(), ripeline_connectors::http::ForwardError>(())
//! ```

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ripeline_core::config::RelayConfig;
use ripeline_core::ClassificationEvent;
use thiserror::Error;

use crate::{ConnectionStats, Forwarder};

/// Backend forwarding failures
#[derive(Debug, Error)]
pub enum ForwardError {
    /// No response within the request timeout
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Backend unreachable
    #[error("connection failed: {0}")]
    Connection(String),

    /// Backend answered with something other than 201
    #[error("API error {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other network or request error
    #[error("request failed: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// A backend acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardReceipt {
    pub status: u16,
    /// The `message` field of a JSON response body, if present
    pub message: Option<String>,
}

/// HTTP forwarder using the ureq client
#[derive(Clone)]
pub struct HttpForwarder {
    endpoint: String,
    agent: ureq::Agent,
    stats: Arc<Mutex<ConnectionStats>>,
}

impl HttpForwarder {
    /// Create a forwarder for one endpoint with a whole-request timeout
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ForwardError> {
        let endpoint = endpoint.into();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ForwardError::Config("endpoint must start with http:// or https://".into()));
        }

        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(&format!("ripeline-relay/{}", env!("CARGO_PKG_VERSION")))
            .build();

        Ok(Self {
            endpoint,
            agent,
            stats: Arc::new(Mutex::new(ConnectionStats::default())),
        })
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self, ForwardError> {
        Self::new(&config.api_endpoint, config.request_timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST one event and wait for the backend (blocking)
    pub fn post_event(&self, event: &ClassificationEvent) -> Result<ForwardReceipt, ForwardError> {
        let result = event
            .to_json()
            .map_err(ForwardError::from)
            .and_then(|body| self.send(&body).map(|receipt| (receipt, body.len())));

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok((receipt, bytes)) => {
                stats.record_success(bytes);
                Ok(receipt)
            }
            Err(e) => {
                stats.record_failure(&e);
                Err(e)
            }
        }
    }

    fn send(&self, body: &[u8]) -> Result<ForwardReceipt, ForwardError> {
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json")
            .send_bytes(body);

        match response {
            Ok(resp) if resp.status() == 201 => {
                let text = resp.into_string().unwrap_or_default();
                Ok(ForwardReceipt {
                    status: 201,
                    message: response_message(&text),
                })
            }
            Ok(resp) => Err(ForwardError::UnexpectedStatus {
                status: resp.status(),
                body: resp.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Status(code, resp)) => Err(ForwardError::UnexpectedStatus {
                status: code,
                body: resp.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(t)) => Err(classify_transport(&t)),
        }
    }
}

fn response_message(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("message")?.as_str().map(str::to_owned)
}

fn classify_transport(t: &ureq::Transport) -> ForwardError {
    let timed_out = std::error::Error::source(t)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .map_or(false, |e| matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock));

    if timed_out {
        return ForwardError::Timeout(t.to_string());
    }
    match t.kind() {
        ureq::ErrorKind::Dns | ureq::ErrorKind::ConnectionFailed => ForwardError::Connection(t.to_string()),
        _ => ForwardError::Transport(t.to_string()),
    }
}

#[async_trait::async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, event: &ClassificationEvent) -> Result<ForwardReceipt, ForwardError> {
        let this = self.clone();
        let event = event.clone();
        tokio::task::spawn_blocking(move || this.post_event(&event))
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?
    }

    fn stats(&self) -> ConnectionStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripeline_core::time::FixedTime;
    use ripeline_core::{ClassTable, EventFactory};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn event() -> ClassificationEvent {
        EventFactory::new("raspberrypi_01", ClassTable::default(), FixedTime::at_unix(1_735_732_800)).create(7, 1, 0.87)
    }

    /// Read one request, return (request head, body)
    fn read_request(stream: &TcpStream) -> (String, Vec<u8>) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut head = String::new();
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = v.trim().parse().unwrap();
            }
            if line == "\r\n" || line.is_empty() {
                break;
            }
            head.push_str(&line);
        }
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body).unwrap();
        (head, body)
    }

    /// Answer `count` requests with the same canned response, reporting each request
    fn stub(status_line: &'static str, body: &'static str, count: usize) -> (String, mpsc::Receiver<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/tomatoes", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for _ in 0..count {
                let (mut stream, _) = listener.accept().unwrap();
                let request = read_request(&stream);
                write!(
                    stream,
                    "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
                .unwrap();
                let _ = tx.send(request);
            }
        });
        (url, rx)
    }

    #[test]
    fn endpoint_validation() {
        assert!(matches!(
            HttpForwarder::new("backend.local/api", Duration::from_secs(10)),
            Err(ForwardError::Config(_))
        ));
        assert!(HttpForwarder::new("https://backend.local/api", Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn created_is_success() {
        let (url, requests) = stub("HTTP/1.1 201 Created", r#"{"message":"Tomato stored"}"#, 1);
        let forwarder = HttpForwarder::new(url, Duration::from_secs(10)).unwrap();

        let receipt = forwarder.post_event(&event()).unwrap();
        assert_eq!(receipt.status, 201);
        assert_eq!(receipt.message.as_deref(), Some("Tomato stored"));

        let (head, body) = requests.recv().unwrap();
        assert!(head.starts_with("POST /api/tomatoes"));
        assert!(head.to_ascii_lowercase().contains("content-type: application/json"));
        assert_eq!(ClassificationEvent::from_json(&body).unwrap(), event());

        let stats = Forwarder::stats(&forwarder);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.bytes_sent, body.len() as u64);
    }

    #[test]
    fn ok_without_created_is_an_api_error() {
        let (url, _requests) = stub("HTTP/1.1 200 OK", "{}", 1);
        let forwarder = HttpForwarder::new(url, Duration::from_secs(10)).unwrap();

        match forwarder.post_event(&event()) {
            Err(ForwardError::UnexpectedStatus { status, .. }) => assert_eq!(status, 200),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn server_error_is_reported_with_body() {
        let (url, _requests) = stub("HTTP/1.1 500 Internal Server Error", r#"{"error":"db down"}"#, 1);
        let forwarder = HttpForwarder::new(url, Duration::from_secs(10)).unwrap();

        match forwarder.post_event(&event()) {
            Err(ForwardError::UnexpectedStatus { status, body }) => {
                assert_eq!(status, 500);
                assert!(body.contains("db down"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(Forwarder::stats(&forwarder).messages_failed, 1);
    }

    #[test]
    fn refused_connection_is_classified() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let forwarder = HttpForwarder::new(format!("http://127.0.0.1:{port}/api"), Duration::from_secs(2)).unwrap();

        assert!(matches!(forwarder.post_event(&event()), Err(ForwardError::Connection(_))));
    }

    #[test]
    fn silent_backend_is_bounded_by_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api", listener.local_addr().unwrap());
        let _server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(3));
            drop(stream);
        });
        let forwarder = HttpForwarder::new(url, Duration::from_millis(300)).unwrap();

        let started = Instant::now();
        let err = forwarder.post_event(&event()).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, ForwardError::Timeout(_)), "unexpected {err:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_forward_runs_off_the_runtime() {
        let (url, requests) = stub("HTTP/1.1 201 Created", "{}", 1);
        let forwarder = HttpForwarder::new(url, Duration::from_secs(10)).unwrap();

        let receipt = forwarder.forward(&event()).await.unwrap();
        assert_eq!(receipt, ForwardReceipt { status: 201, message: None });
        assert!(requests.recv().is_ok());
    }
}
