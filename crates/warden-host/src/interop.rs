//! Callback listener for the bridge/interop channel.
//!
//! The hosted server calls back over loopback using the same Topic
//! frame format. Every callback must echo the per-launch comms key;
//! anything else is rejected before dispatch. Oversized logical
//! messages arrive as chunk sets and are reassembled here. Protocol
//! errors fail the request and reset reassembly state; they never take
//! the listener down.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{Instrument, info_span};

use warden_topic::query::{self, FIELD_COMMAND, FIELD_COMMS_KEY, callback_verbs};
use warden_topic::{Chunk, ChunkAssembler, wire};
use warden_types::NotifyCategory;

use crate::notify::ChatNotifier;

/// Interop version this host speaks; exchanged in the handshake.
pub const HOST_INTEROP_VERSION: &str = "2.1.0";

pub const DEFAULT_REQUEST_CAP: usize = wire::MAX_COMMAND_BYTES;
pub const DEFAULT_RESPONSE_CAP: usize = u16::MAX as usize;

const FIELD_CHUNK_ID: &str = "chunkId";
const FIELD_CHUNK_SEQ: &str = "chunkSeq";
const FIELD_CHUNK_TOTAL: &str = "chunkTotal";
const FIELD_CHUNK_PAYLOAD: &str = "chunkPayload";

/// Per-launch protocol state published by the supervisor loop and read
/// by the dispatcher and the world-command path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteropSession {
    pub comms_key: Option<String>,
    pub interop_version: Option<String>,
    pub request_cap: usize,
    pub response_cap: usize,
}

impl Default for InteropSession {
    fn default() -> Self {
        Self {
            comms_key: None,
            interop_version: None,
            request_cap: DEFAULT_REQUEST_CAP,
            response_cap: DEFAULT_RESPONSE_CAP,
        }
    }
}

/// Decoded callback intents forwarded to the supervisor loop. Chat
/// relays are handled here directly and never reach the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteropEvent {
    /// The world asked to be terminated and relaunched.
    KillRequest,
    /// The world reported a natural reboot boundary.
    WorldRebooted,
    /// Version handshake announcement from the build.
    ApiVersion {
        version: String,
        request_cap: Option<usize>,
        response_cap: Option<usize>,
    },
}

pub struct InteropDispatcher {
    session: watch::Receiver<InteropSession>,
    events: mpsc::UnboundedSender<InteropEvent>,
    notifier: Arc<dyn ChatNotifier>,
    assembler: Mutex<ChunkAssembler>,
}

impl InteropDispatcher {
    pub fn new(
        session: watch::Receiver<InteropSession>,
        events: mpsc::UnboundedSender<InteropEvent>,
        notifier: Arc<dyn ChatNotifier>,
    ) -> Self {
        Self {
            session,
            events,
            notifier,
            assembler: Mutex::new(ChunkAssembler::default()),
        }
    }

    /// Accept loop. One short-lived task per callback connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let span = info_span!("interop", addr = %local);
        async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "interop accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.handle_conn(stream).await {
                        tracing::debug!(%peer, error = %e, "interop connection failed");
                    }
                });
            }
        }
        .instrument(span)
        .await;
    }

    async fn handle_conn(&self, mut stream: TcpStream) -> Result<(), warden_topic::TopicError> {
        let request_cap = self.session.borrow().request_cap;
        let reply = match wire::read_command(&mut stream, request_cap).await {
            Ok(raw) => self.handle_command(&raw).await,
            Err(e) => format!("error: {e}"),
        };
        stream.write_all(&wire::build_reply(&reply)).await?;
        stream.flush().await?;
        Ok(())
    }

    fn authorized(&self, fields: &BTreeMap<String, String>) -> bool {
        let session = self.session.borrow();
        match (&session.comms_key, fields.get(FIELD_COMMS_KEY)) {
            (Some(expected), Some(got)) => expected == got,
            _ => false,
        }
    }

    pub async fn handle_command(&self, raw: &str) -> String {
        let fields = match query::parse_query(raw) {
            Ok(f) => f,
            Err(e) => return format!("error: {e}"),
        };
        if !self.authorized(&fields) {
            tracing::warn!("interop callback with missing or wrong comms key");
            return "error: unauthorized".to_string();
        }

        if fields.contains_key(FIELD_CHUNK_ID) {
            return match self.feed_chunk(&fields).await {
                Ok(None) => "ack".to_string(),
                Ok(Some(inner)) => {
                    let inner_fields = match query::parse_query(&inner) {
                        Ok(f) => f,
                        Err(e) => return format!("error: {e}"),
                    };
                    // The reassembled command carries its own key.
                    if !self.authorized(&inner_fields) {
                        return "error: unauthorized".to_string();
                    }
                    self.dispatch(&inner_fields)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "chunk reassembly aborted");
                    format!("error: {e}")
                }
            };
        }

        self.dispatch(&fields)
    }

    async fn feed_chunk(
        &self,
        fields: &BTreeMap<String, String>,
    ) -> Result<Option<String>, String> {
        let payload_id = fields
            .get(FIELD_CHUNK_ID)
            .and_then(|v| uuid::Uuid::parse_str(v).ok())
            .ok_or("bad chunk id")?;
        let sequence: u32 = fields
            .get(FIELD_CHUNK_SEQ)
            .and_then(|v| v.parse().ok())
            .ok_or("bad chunk sequence")?;
        let total: u32 = fields
            .get(FIELD_CHUNK_TOTAL)
            .and_then(|v| v.parse().ok())
            .ok_or("bad chunk total")?;
        let payload = fields
            .get(FIELD_CHUNK_PAYLOAD)
            .cloned()
            .ok_or("missing chunk payload")?;

        self.assembler
            .lock()
            .await
            .feed(Chunk {
                payload_id,
                sequence,
                total,
                payload,
            })
            .map_err(|e| e.to_string())
    }

    fn dispatch(&self, fields: &BTreeMap<String, String>) -> String {
        let verb = fields.get(FIELD_COMMAND).map(String::as_str).unwrap_or("");
        match verb {
            callback_verbs::KILL_ME => {
                let _ = self.events.send(InteropEvent::KillRequest);
                "ack".to_string()
            }
            callback_verbs::WORLD_REBOOTED => {
                let _ = self.events.send(InteropEvent::WorldRebooted);
                "ack".to_string()
            }
            callback_verbs::IRC_BROADCAST => {
                let message = fields.get("message").map(String::as_str).unwrap_or("");
                self.notifier.notify(message, NotifyCategory::Chat);
                "ack".to_string()
            }
            callback_verbs::ADMIN_RELAY => {
                let message = fields.get("message").map(String::as_str).unwrap_or("");
                self.notifier.notify(message, NotifyCategory::Admin);
                "ack".to_string()
            }
            callback_verbs::API_VERSION => {
                let Some(version) = fields.get("version").cloned() else {
                    return "error: missing version".to_string();
                };
                let request_cap = fields.get("max_request").and_then(|v| v.parse().ok());
                let response_cap = fields.get("max_response").and_then(|v| v.parse().ok());
                let _ = self.events.send(InteropEvent::ApiVersion {
                    version,
                    request_cap,
                    response_cap,
                });
                format!(
                    "api_compat&version={HOST_INTEROP_VERSION}&max_request={DEFAULT_REQUEST_CAP}&max_response={DEFAULT_RESPONSE_CAP}"
                )
            }
            other => {
                tracing::debug!(verb = other, "unknown interop verb");
                "error: unknown command".to_string()
            }
        }
    }
}

/// Render one chunk as an interop command, authenticated like any
/// other callback. Used by tests and by the bridge sender side.
pub fn chunk_command(chunk: &Chunk, comms_key: &str) -> String {
    warden_topic::TopicQuery::new("chunk")
        .push(FIELD_CHUNK_ID, &chunk.payload_id.to_string())
        .push(FIELD_CHUNK_SEQ, &chunk.sequence.to_string())
        .push(FIELD_CHUNK_TOTAL, &chunk.total.to_string())
        .push(FIELD_CHUNK_PAYLOAD, &chunk.payload)
        .comms_key(comms_key)
        .encode()
}
