//! In-memory [`Transport`] that replays scripted responses.

use crate::error::RequestError;
use crate::transport::{Transport, WireRequest, WireResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

enum Scripted {
    Respond {
        status: u16,
        chunks: Vec<Result<Vec<u8>, RequestError>>,
    },
    Fail(RequestError),
}

impl Scripted {
    fn play(&self) -> Result<WireResponse, RequestError> {
        match self {
            Scripted::Respond { status, chunks } => Ok(WireResponse::from_chunks(*status, chunks.clone())),
            Scripted::Fail(e) => Err(e.clone()),
        }
    }
}

/// Replays POST outcomes in order. Once the queue is empty, the `always_fail`
/// error (if any) is returned forever.
#[derive(Default)]
pub struct ScriptedTransport {
    posts: Mutex<VecDeque<Scripted>>,
    exhausted: Mutex<Option<RequestError>>,
    models: Mutex<Option<Scripted>>,
    seen: Mutex<Vec<WireRequest>>,
    gets: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_respond(self, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.then_chunks(status, vec![Ok(body.into())])
    }

    pub fn then_chunks(self, status: u16, chunks: Vec<Result<Vec<u8>, RequestError>>) -> Self {
        self.posts.lock().push_back(Scripted::Respond { status, chunks });
        self
    }

    pub fn then_fail(self, error: RequestError) -> Self {
        self.posts.lock().push_back(Scripted::Fail(error));
        self
    }

    pub fn always_fail(self, error: RequestError) -> Self {
        *self.exhausted.lock() = Some(error);
        self
    }

    /// Response for every GET (the model listing probe).
    pub fn with_models(self, status: u16, body: impl Into<Vec<u8>>) -> Self {
        *self.models.lock() = Some(Scripted::Respond {
            status,
            chunks: vec![Ok(body.into())],
        });
        self
    }

    pub fn with_models_failure(self, error: RequestError) -> Self {
        *self.models.lock() = Some(Scripted::Fail(error));
        self
    }

    pub fn post_count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn requests(&self) -> Vec<WireRequest> {
        self.seen.lock().clone()
    }

    pub fn get_count(&self) -> usize {
        self.gets.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, request: &WireRequest) -> Result<WireResponse, RequestError> {
        self.seen.lock().push(request.clone());
        let next = self.posts.lock().pop_front();
        match next {
            Some(scripted) => scripted.play(),
            None => Err(self
                .exhausted
                .lock()
                .clone()
                .unwrap_or_else(|| RequestError::Unknown("no scripted response left".into()))),
        }
    }

    async fn get(&self, url: &str, _timeout: Duration) -> Result<WireResponse, RequestError> {
        self.gets.lock().push(url.to_string());
        match self.models.lock().as_ref() {
            Some(scripted) => scripted.play(),
            None => Err(RequestError::Connection("no models endpoint scripted".into())),
        }
    }
}

/// Local HTTP address whose server accepts up to `connections` connections
/// and closes each one without answering. Returns the base URL and a count
/// of accepted connections.
pub fn hang_up_listener(connections: usize) -> (String, Arc<AtomicUsize>) {
    let listener = match TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => listener,
        Err(e) => panic!("failed to bind test listener: {}", e),
    };
    let base = match listener.local_addr() {
        Ok(addr) => format!("http://{}", addr),
        Err(e) => panic!("test listener has no address: {}", e),
    };
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    std::thread::spawn(move || {
        for _ in 0..connections {
            let Ok((socket, _)) = listener.accept() else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });
    (base, accepted)
}
