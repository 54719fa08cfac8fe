//! In-process stand-in for the remote message service.
//!
//! [`LoopbackService`] keeps a server-side message log, assigns ids,
//! serves paged history through the real JSON decoder, and records every
//! side-channel call so tests can assert on them. Failures and latency
//! can be injected per call.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

use colloquy_proto::event::EventName;
use colloquy_proto::message::{MediaRef, MediaUpload, Message, MessageType, RemoteId, SendStatus};
use colloquy_proto::wire::{
    self, ApiVersion, ErrorEnvelope, MessageCollection, Notification, Paging, WireAgent,
    WireCollection, WireMessage,
};

use super::{BackendError, FetchRequest, PageMode, Transport, TransportError};

/// Default number of messages per page.
const DEFAULT_PAGE_SIZE: usize = 20;

/// A failure to inject into the next call.
#[derive(Debug, Clone)]
pub enum InjectedFailure {
    /// Fail as if the network were unreachable.
    Connection,
    /// Fail with a structured backend error.
    Backend {
        /// HTTP status code.
        status_code: u16,
        /// Notification text.
        message: String,
    },
}

impl InjectedFailure {
    fn into_error(self) -> TransportError {
        match self {
            Self::Connection => TransportError::Connection("injected failure".into()),
            Self::Backend {
                status_code,
                message,
            } => backend_error(status_code, message),
        }
    }
}

fn backend_error(status_code: u16, message: impl Into<String>) -> TransportError {
    TransportError::Backend(BackendError {
        status_code,
        envelope: ErrorEnvelope {
            status: "ERROR".into(),
            notifications: vec![Notification {
                kind: "error".into(),
                message: message.into(),
            }],
            metadata: None,
        },
    })
}

#[derive(Default)]
struct ServerState {
    /// Messages ascending by id.
    log: Vec<WireMessage>,
    next_id: i64,
    page_size: usize,
    agent: Option<WireAgent>,
    welcome: Option<String>,
    sticky: Option<String>,
    media: HashMap<String, Vec<u8>>,
    offline: bool,
    latency: Option<Duration>,
    failures: VecDeque<InjectedFailure>,
    sent: Vec<Message>,
    fetches: Vec<FetchRequest>,
    events: Vec<EventName>,
    read_batches: Vec<BTreeSet<RemoteId>>,
}

/// In-process implementation of [`Transport`].
pub struct LoopbackService {
    version: ApiVersion,
    state: Mutex<ServerState>,
}

impl LoopbackService {
    /// Create an empty service speaking `version`.
    #[must_use]
    pub fn new(version: ApiVersion) -> Self {
        Self {
            version,
            state: Mutex::new(ServerState {
                next_id: 1,
                page_size: DEFAULT_PAGE_SIZE,
                ..ServerState::default()
            }),
        }
    }

    /// Set how many messages one page holds.
    #[must_use]
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state.lock().page_size = page_size.max(1);
        self
    }

    /// Append a server-side message written by the agent at `time_secs`.
    pub fn push_agent_message(&self, text: impl Into<String>, time_secs: u64) -> RemoteId {
        self.push_wire(WireMessage {
            time: Some(time_secs),
            type_id: MessageType::Agent.type_id(),
            message: Some(text.into()),
            ..WireMessage::default()
        })
    }

    /// Append an arbitrary wire message, assigning it the next id.
    pub fn push_wire(&self, mut message: WireMessage) -> RemoteId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        message.id = Some(id);
        state.log.push(message);
        RemoteId::new(id)
    }

    /// Look up a stored message as a client would decode it (push path).
    #[must_use]
    pub fn pushed(&self, id: RemoteId) -> Option<Message> {
        let wire = {
            let state = self.state.lock();
            state.log.iter().find(|m| m.id == Some(id.get())).cloned()
        }?;
        let body = serde_json::to_string(&wire).ok()?;
        wire::decode_pushed(&body, self.version).ok()
    }

    /// Set the agent reported with every page.
    pub fn set_agent(&self, id: i64, name: impl Into<String>) {
        self.state.lock().agent = Some(WireAgent {
            id,
            name: Some(name.into()),
            avatar: None,
        });
    }

    /// Set the welcome text reported with every page.
    pub fn set_welcome(&self, text: Option<String>) {
        self.state.lock().welcome = text;
    }

    /// Set the sticky banner reported with every page.
    pub fn set_sticky(&self, text: Option<String>) {
        self.state.lock().sticky = text;
    }

    /// Make every call fail with a connection error while `true`.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Queue a failure for the next call.
    pub fn fail_next(&self, failure: InjectedFailure) {
        self.state.lock().failures.push_back(failure);
    }

    /// Messages accepted through `send_message`, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        self.state.lock().sent.clone()
    }

    /// Fetch requests received, in order.
    #[must_use]
    pub fn fetches(&self) -> Vec<FetchRequest> {
        self.state.lock().fetches.clone()
    }

    /// Events fired, in order.
    #[must_use]
    pub fn events(&self) -> Vec<EventName> {
        self.state.lock().events.clone()
    }

    /// Read-acknowledgement batches received, in order.
    #[must_use]
    pub fn read_batches(&self) -> Vec<BTreeSet<RemoteId>> {
        self.state.lock().read_batches.clone()
    }

    /// Number of messages in the server log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Whether the server log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> Result<(), TransportError> {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        if state.offline {
            return Err(TransportError::Connection("network unreachable".into()));
        }
        match state.failures.pop_front() {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }

    fn page(&self, request: &FetchRequest) -> Result<String, TransportError> {
        let state = self.state.lock();
        let anchor = match &request.cursor {
            None => None,
            Some(c) if c.is_empty() => None,
            Some(c) => Some(
                c.parse::<i64>()
                    .map_err(|_| backend_error(400, format!("invalid cursor {c:?}")))?,
            ),
        };

        let id_of = |m: &WireMessage| m.id.unwrap_or_default();
        let selected: Vec<&WireMessage> = match (request.mode, anchor) {
            (PageMode::All, _) | (PageMode::Before | PageMode::After, None) => {
                let start = state.log.len().saturating_sub(state.page_size);
                state.log[start..].iter().collect()
            }
            (PageMode::Before, Some(anchor)) => {
                let older: Vec<&WireMessage> =
                    state.log.iter().filter(|m| id_of(m) < anchor).collect();
                let start = older.len().saturating_sub(state.page_size);
                older[start..].to_vec()
            }
            (PageMode::After, Some(anchor)) => state
                .log
                .iter()
                .filter(|m| id_of(m) > anchor)
                .take(state.page_size)
                .collect(),
        };

        let oldest = selected.first().map(|m| id_of(m));
        let newest = selected.last().map(|m| id_of(m));
        let has_older = oldest.is_some_and(|o| state.log.iter().any(|m| id_of(m) < o));

        let collection = WireCollection {
            data: selected.into_iter().rev().cloned().collect(),
            agent: state.agent.clone(),
            paging: Some(Paging {
                before: if has_older {
                    oldest.map(|o| o.to_string()).unwrap_or_default()
                } else {
                    String::new()
                },
                after: newest.map(|n| n.to_string()).unwrap_or_default(),
            }),
            sticky_message: state.sticky.clone(),
            welcome_message: state.welcome.clone(),
        };
        serde_json::to_string(&collection).map_err(|e| TransportError::Connection(e.to_string()))
    }
}

impl Transport for LoopbackService {
    async fn send_message(&self, message: &Message) -> Result<RemoteId, TransportError> {
        self.enter().await?;
        let mut wire = wire::encode_message(message);
        wire.status = Some(SendStatus::Success.code());
        let id = self.push_wire(wire);
        self.state.lock().sent.push(message.clone());
        tracing::debug!(remote_id = %id, "loopback stored message");
        Ok(id)
    }

    async fn fetch(&self, request: FetchRequest) -> Result<MessageCollection, TransportError> {
        self.state.lock().fetches.push(request.clone());
        self.enter().await?;
        let body = self.page(&request)?;
        Ok(wire::decode_collection(&body, self.version)?)
    }

    async fn upload_media(&self, upload: &MediaUpload) -> Result<MediaRef, TransportError> {
        self.enter().await?;
        let mut state = self.state.lock();
        let id = format!("media-{}", state.media.len() + 1);
        state.media.insert(id.clone(), upload.data.clone());
        Ok(MediaRef {
            id,
            mime_type: Some(upload.mime_type.clone()),
        })
    }

    async fn fetch_media(&self, media: &MediaRef) -> Result<Vec<u8>, TransportError> {
        self.enter().await?;
        self.state
            .lock()
            .media
            .get(&media.id)
            .cloned()
            .ok_or_else(|| backend_error(404, format!("media {} not found", media.id)))
    }

    async fn fire_event(&self, event: EventName) -> Result<(), TransportError> {
        self.enter().await?;
        self.state.lock().events.push(event);
        Ok(())
    }

    async fn mark_read(&self, ids: &BTreeSet<RemoteId>) -> Result<(), TransportError> {
        self.enter().await?;
        self.state.lock().read_batches.push(ids.clone());
        Ok(())
    }
}
