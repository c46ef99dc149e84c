//! Scripted transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::fetch::{BodyReader, Connection, NetworkRequest, Origin, Transport, TransportError, TransportResponse};

const CHUNK: usize = 1024;

/// What the fake answers for one send.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ok { status: u16, body: Bytes, content_type: &'static str, with_length: bool },
    Fail(TransportError),
    /// Never answers.
    Hang,
}

impl Reply {
    pub fn ok(status: u16, body: impl Into<String>) -> Self {
        Reply::Ok { status, body: Bytes::from(body.into()), content_type: "text/css", with_length: true }
    }

    pub fn html(body: impl Into<String>) -> Self {
        Reply::Ok { status: 200, body: Bytes::from(body.into()), content_type: "text/html", with_length: true }
    }

    /// Omit `Content-Length`, as a chunked response would.
    pub fn without_length(self) -> Self {
        match self {
            Reply::Ok { status, body, content_type, .. } => Reply::Ok { status, body, content_type, with_length: false },
            other => other,
        }
    }
}

#[derive(Default)]
struct State {
    /// Replies per canonical URL, consumed in order; the last one repeats.
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    sends_by_url: Mutex<HashMap<String, usize>>,
    connects: AtomicUsize,
    sends: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<State>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, url: &str, reply: Reply) {
        let mut replies = self.state.replies.lock().unwrap();
        replies.entry(url.to_string()).or_default().push_back(reply);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.state.sends.load(Ordering::SeqCst)
    }

    pub fn sends_to(&self, url: &str) -> usize {
        self.state.sends_by_url.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut replies = self.state.replies.lock().unwrap();
        match replies.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => Reply::ok(404, ""),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, _origin: &Origin) -> Result<Box<dyn Connection>, TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection { transport: self.clone() }))
    }
}

struct FakeConnection {
    transport: FakeTransport,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(&mut self, _request: &NetworkRequest, url: &Url) -> Result<TransportResponse, TransportError> {
        let state = &self.transport.state;
        state.sends.fetch_add(1, Ordering::SeqCst);
        *state.sends_by_url.lock().unwrap().entry(url.to_string()).or_default() += 1;

        match self.transport.next_reply(url.as_str()) {
            Reply::Ok { status, body, content_type, with_length } => Ok(TransportResponse {
                status,
                content_length: with_length.then_some(body.len() as u64),
                content_type: Some(content_type.to_string()),
                body: Box::new(FakeBody(body)),
            }),
            Reply::Fail(err) => Err(err),
            Reply::Hang => std::future::pending().await,
        }
    }
}

struct FakeBody(Bytes);

#[async_trait]
impl BodyReader for FakeBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        if self.0.is_empty() {
            return Ok(None);
        }
        let n = self.0.len().min(CHUNK);
        Ok(Some(self.0.split_to(n)))
    }
}
