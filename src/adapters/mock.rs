//! Scripted transport for tests and simulation
//!
//! `MockTransport` stands in for a serial port. It provides:
//! - A responder closure that plays the device (decodes the command it is
//!   given and returns the reply a real device would send)
//! - Queued one-off replies with their own latency, taking precedence over
//!   the responder
//! - Failure injection and a log of every command written

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use super::Transport;
use crate::error::{AppResult, DaqError};

/// Device model behind a mock transport: command text in, reply out.
pub type Responder = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

struct Scripted {
    reply: Option<String>,
    delay: Duration,
}

/// Mock transport
///
/// # Example
///
/// ```rust,ignore
/// use rig_daq::adapters::MockTransport;
///
/// let transport = MockTransport::new("ozone")
///     .with_responder(|cmd| (cmd == "<gp>").then(|| "<gp:12.5>".to_string()));
/// transport.open().await?;
/// ```
pub struct MockTransport {
    name: String,
    opened: AtomicBool,
    fail_next: AtomicBool,
    latency: Mutex<Duration>,
    responder: Option<Responder>,
    queue: Mutex<VecDeque<Scripted>>,
    call_log: Mutex<Vec<String>>,
}

impl MockTransport {
    /// A transport that never replies.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            opened: AtomicBool::new(false),
            fail_next: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            responder: None,
            queue: Mutex::new(VecDeque::new()),
            call_log: Mutex::new(Vec::new()),
        }
    }

    /// Answer commands with `responder`.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Delay applied to responder replies.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Queue one reply for the next exchange that expects a response.
    /// `None` makes that exchange time out.
    pub fn push_reply(&self, reply: Option<&str>, delay: Duration) {
        self.queue.lock().push_back(Scripted {
            reply: reply.map(str::to_string),
            delay,
        });
    }

    /// Fail the next send with a transport error.
    pub fn inject_next_failure(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Every command written so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.call_log.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> AppResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DaqError::Transport("injected open failure".to_string()));
        }
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(
        &self,
        command: &[u8],
        expect_response: bool,
        timeout: Duration,
    ) -> AppResult<Vec<String>> {
        if !self.opened.load(Ordering::SeqCst) {
            return Err(DaqError::Transport(format!("{} is not open", self.name)));
        }
        let text = String::from_utf8_lossy(command).into_owned();
        self.call_log.lock().push(text.clone());

        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DaqError::Transport("injected failure".to_string()));
        }

        let scripted = if expect_response {
            self.queue.lock().pop_front()
        } else {
            None
        };
        let answered = self.responder.as_ref().and_then(|respond| respond(&text));
        if !expect_response {
            return Ok(Vec::new());
        }

        let (reply, delay) = match scripted {
            Some(s) => (s.reply, s.delay),
            None => (answered, *self.latency.lock()),
        };
        match reply {
            Some(line) if delay < timeout => {
                tokio::time::sleep(delay).await;
                debug!("[{}] {:?} -> {:?}", self.name, text, line);
                Ok(vec![line])
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Err(DaqError::TransportTimeout { timeout })
            }
        }
    }
}
