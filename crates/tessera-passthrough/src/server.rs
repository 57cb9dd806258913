//! Server actor: one Tokio task owning a [`ServerState`] and the sessions
//! connected to it.
//!
//! Each session gets its own task pumping bytes between a
//! [`MemoryConnection`] and the actor. The actor decodes frames, feeds
//! requests to the state, and routes the resulting replies back to the
//! right session. Sessions can be killed from the outside to simulate a
//! dropped connection.

use std::collections::HashMap;

use tessera_protocol::{
    ClientFrame, Codec, EntityError, EntityKey, EntityType, JsonCodec, Outcome, PROTOCOL_VERSION,
    ServerFrame, SessionId, Version,
};
use tessera_transport::{Connection, Connector, MemoryConnection, memory_pair};
use tokio::sync::{mpsc, oneshot};

use crate::state::{EXTERNAL_SESSION, ProcessedRequest, Reply, ServerState};
use crate::PassthroughError;

const COMMAND_CHANNEL_SIZE: usize = 256;

/// Commands sent to the server actor by its handles.
enum ServerCommand {
    Open {
        reply: oneshot::Sender<Result<MemoryConnection, PassthroughError>>,
    },
    RegisterType {
        entity_type: EntityType,
        version: Version,
    },
    SetAccepting {
        accepting: bool,
    },
    Kill {
        session: Option<SessionId>,
        reply: oneshot::Sender<usize>,
    },
    LockExternally {
        key: EntityKey,
        reply: oneshot::Sender<bool>,
    },
    UnlockExternally {
        key: EntityKey,
        reply: oneshot::Sender<bool>,
    },
    History {
        reply: oneshot::Sender<Vec<ProcessedRequest>>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionId>>,
    },
    Contains {
        key: EntityKey,
        reply: oneshot::Sender<bool>,
    },
    LockHolder {
        key: EntityKey,
        reply: oneshot::Sender<Option<SessionId>>,
    },
}

/// Traffic from session tasks to the actor.
enum SessionEvent {
    Frame { session: SessionId, bytes: Vec<u8> },
    Closed { session: SessionId },
}

/// Handle to a running passthrough server.
///
/// Cheap to clone. The actor stops once every handle (and every
/// [`PassthroughConnector`]) is dropped.
#[derive(Clone)]
pub struct PassthroughServer {
    sender: mpsc::Sender<ServerCommand>,
}

impl PassthroughServer {
    /// Spawns the server actor on the current Tokio runtime.
    pub fn start() -> Self {
        let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let actor = ServerActor {
            state: ServerState::new(),
            sessions: HashMap::new(),
            next_session: 1,
            accepting: true,
            receiver,
            events_tx,
            events_rx,
        };
        tokio::spawn(actor.run());

        Self { sender }
    }

    /// A [`Connector`] that opens sessions on this server.
    pub fn connector(&self) -> PassthroughConnector {
        PassthroughConnector {
            server: self.clone(),
        }
    }

    /// Opens a new session and returns the client half of its channel.
    pub async fn open(&self) -> Result<MemoryConnection, PassthroughError> {
        self.request(|reply| ServerCommand::Open { reply }).await?
    }

    /// Declares that this server provides `entity_type` at `version`.
    pub async fn register_entity_type(
        &self,
        entity_type: impl Into<EntityType>,
        version: Version,
    ) -> Result<(), PassthroughError> {
        self.send(ServerCommand::RegisterType {
            entity_type: entity_type.into(),
            version,
        })
        .await
    }

    /// Starts or stops accepting new sessions. Existing sessions are
    /// unaffected.
    pub async fn set_accepting(&self, accepting: bool) -> Result<(), PassthroughError> {
        self.send(ServerCommand::SetAccepting { accepting }).await
    }

    /// Drops one session as if its connection had failed. Returns whether
    /// the session existed.
    pub async fn kill_session(&self, session: SessionId) -> Result<bool, PassthroughError> {
        let killed = self
            .request(|reply| ServerCommand::Kill {
                session: Some(session),
                reply,
            })
            .await?;
        Ok(killed > 0)
    }

    /// Drops every session. Returns how many were dropped.
    pub async fn kill_all_sessions(&self) -> Result<usize, PassthroughError> {
        self.request(|reply| ServerCommand::Kill {
            session: None,
            reply,
        })
        .await
    }

    /// Takes `key`'s write lock on behalf of a party outside any session.
    /// Returns `false` if the lock was already held.
    pub async fn lock_externally(&self, key: EntityKey) -> Result<bool, PassthroughError> {
        self.request(|reply| ServerCommand::LockExternally { key, reply })
            .await
    }

    /// Releases a lock taken with [`lock_externally`](Self::lock_externally).
    pub async fn unlock_externally(&self, key: EntityKey) -> Result<bool, PassthroughError> {
        self.request(|reply| ServerCommand::UnlockExternally { key, reply })
            .await
    }

    /// Every request processed so far, oldest first.
    pub async fn history(&self) -> Result<Vec<ProcessedRequest>, PassthroughError> {
        self.request(|reply| ServerCommand::History { reply }).await
    }

    /// The sessions currently connected, in ascending order.
    pub async fn sessions(&self) -> Result<Vec<SessionId>, PassthroughError> {
        self.request(|reply| ServerCommand::Sessions { reply }).await
    }

    /// Whether an entity exists under `key`.
    pub async fn contains_entity(&self, key: EntityKey) -> Result<bool, PassthroughError> {
        self.request(|reply| ServerCommand::Contains { key, reply })
            .await
    }

    /// The session holding `key`'s write lock, if any.
    pub async fn lock_holder(&self, key: EntityKey) -> Result<Option<SessionId>, PassthroughError> {
        self.request(|reply| ServerCommand::LockHolder { key, reply })
            .await
    }

    async fn send(&self, command: ServerCommand) -> Result<(), PassthroughError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| PassthroughError::Unavailable)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ServerCommand,
    ) -> Result<T, PassthroughError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(command(reply_tx)).await?;
        reply_rx.await.map_err(|_| PassthroughError::Unavailable)
    }
}

/// Dials a [`PassthroughServer`]: every `connect` opens a fresh session.
#[derive(Clone)]
pub struct PassthroughConnector {
    server: PassthroughServer,
}

impl Connector for PassthroughConnector {
    type Connection = MemoryConnection;
    type Error = PassthroughError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.server.open().await
    }
}

/// The actor's view of one connected session.
struct SessionLink {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    kill: oneshot::Sender<()>,
    greeted: bool,
}

struct ServerActor {
    state: ServerState,
    sessions: HashMap<SessionId, SessionLink>,
    next_session: u64,
    accepting: bool,
    receiver: mpsc::Receiver<ServerCommand>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl ServerActor {
    async fn run(mut self) {
        tracing::info!("passthrough server started");

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(event) = self.events_rx.recv() => match event {
                    SessionEvent::Frame { session, bytes } => self.handle_frame(session, &bytes),
                    SessionEvent::Closed { session } => self.forget(session),
                },
            }
        }

        for (_, link) in self.sessions.drain() {
            let _ = link.kill.send(());
        }
        tracing::info!("passthrough server stopped");
    }

    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Open { reply } => {
                let _ = reply.send(self.open_session());
            }
            ServerCommand::RegisterType {
                entity_type,
                version,
            } => {
                tracing::debug!(%entity_type, %version, "entity type registered");
                self.state.register_type(entity_type, version);
            }
            ServerCommand::SetAccepting { accepting } => {
                self.accepting = accepting;
            }
            ServerCommand::Kill { session, reply } => {
                let targets: Vec<SessionId> = match session {
                    Some(session) => vec![session],
                    None => self.sessions.keys().copied().collect(),
                };
                let killed = targets
                    .into_iter()
                    .filter(|session| self.kill(*session))
                    .count();
                let _ = reply.send(killed);
            }
            ServerCommand::LockExternally { key, reply } => {
                let _ = reply.send(self.state.lock_externally(&key));
            }
            ServerCommand::UnlockExternally { key, reply } => {
                let replies = self.state.unlock_externally(&key);
                let released = replies.is_some();
                self.deliver(replies.unwrap_or_default());
                let _ = reply.send(released);
            }
            ServerCommand::History { reply } => {
                let _ = reply.send(self.state.history().to_vec());
            }
            ServerCommand::Sessions { reply } => {
                let mut sessions: Vec<SessionId> = self.sessions.keys().copied().collect();
                sessions.sort();
                let _ = reply.send(sessions);
            }
            ServerCommand::Contains { key, reply } => {
                let _ = reply.send(self.state.contains(&key));
            }
            ServerCommand::LockHolder { key, reply } => {
                let _ = reply.send(self.state.lock_holder(&key));
            }
        }
    }

    fn open_session(&mut self) -> Result<MemoryConnection, PassthroughError> {
        if !self.accepting {
            tracing::debug!("connection refused: not accepting");
            return Err(PassthroughError::Refused);
        }

        let session = SessionId(self.next_session);
        self.next_session += 1;

        let (client, server) = memory_pair();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(run_session(
            server,
            session,
            self.events_tx.clone(),
            outbound_rx,
            kill_rx,
        ));
        self.sessions.insert(
            session,
            SessionLink {
                outbound: outbound_tx,
                kill: kill_tx,
                greeted: false,
            },
        );

        tracing::info!(%session, "session opened");
        Ok(client)
    }

    fn handle_frame(&mut self, session: SessionId, bytes: &[u8]) {
        let greeted = match self.sessions.get(&session) {
            Some(link) => link.greeted,
            // Frames still in flight from a killed session.
            None => return,
        };

        let frame: ClientFrame = match JsonCodec.decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(%session, error = %e, "dropping undecodable frame");
                return;
            }
        };

        match frame {
            ClientFrame::Hello { protocol_version } => {
                if protocol_version != PROTOCOL_VERSION {
                    tracing::warn!(%session, protocol_version, "rejecting client");
                    self.send_to(
                        session,
                        &ServerFrame::Rejected {
                            reason: format!(
                                "protocol version {protocol_version} not supported, \
                                 server speaks {PROTOCOL_VERSION}"
                            ),
                        },
                    );
                    self.kill(session);
                    return;
                }
                if let Some(link) = self.sessions.get_mut(&session) {
                    link.greeted = true;
                }
                self.send_to(session, &ServerFrame::Welcome { session });
            }
            ClientFrame::Request {
                transaction,
                message,
            } => {
                if !greeted {
                    tracing::warn!(%session, %transaction, "request before handshake");
                    let error = EntityError::other(&message.identity.key, "handshake required");
                    self.send_to(session, &ServerFrame::Ack { transaction });
                    self.send_to(
                        session,
                        &ServerFrame::Complete {
                            transaction,
                            outcome: Outcome::Failure { error },
                        },
                    );
                    return;
                }
                tracing::trace!(
                    %session,
                    %transaction,
                    kind = ?message.kind,
                    identity = %message.identity,
                    "request"
                );
                let replies = self.state.handle(session, transaction, message);
                self.deliver(replies);
            }
        }
    }

    /// Ends a session from the server side and releases its locks.
    fn kill(&mut self, session: SessionId) -> bool {
        let Some(link) = self.sessions.remove(&session) else {
            return false;
        };
        let _ = link.kill.send(());
        tracing::info!(%session, "session killed");
        let replies = self.state.drop_session(session);
        self.deliver(replies);
        true
    }

    /// Cleans up after a session whose client went away.
    fn forget(&mut self, session: SessionId) {
        if self.sessions.remove(&session).is_some() {
            tracing::info!(%session, "session closed by client");
            let replies = self.state.drop_session(session);
            self.deliver(replies);
        }
    }

    fn deliver(&self, replies: Vec<Reply>) {
        for reply in replies {
            if reply.session != EXTERNAL_SESSION {
                self.send_to(reply.session, &reply.frame);
            }
        }
    }

    fn send_to(&self, session: SessionId, frame: &ServerFrame) {
        let Some(link) = self.sessions.get(&session) else {
            return;
        };
        match JsonCodec.encode(frame) {
            Ok(bytes) => {
                let _ = link.outbound.send(bytes);
            }
            Err(e) => tracing::error!(%session, error = %e, "failed to encode server frame"),
        }
    }
}

/// Pumps bytes between one session's connection and the actor until
/// either side goes away or the session is killed.
async fn run_session(
    conn: MemoryConnection,
    session: SessionId,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut kill: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut kill => break,
            out = outbound.recv() => match out {
                Some(bytes) => {
                    if conn.send(&bytes).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = conn.recv() => match incoming {
                Ok(Some(bytes)) => {
                    if events.send(SessionEvent::Frame { session, bytes }).is_err() {
                        break;
                    }
                }
                _ => break,
            },
        }
    }

    // Flush whatever the actor queued before the kill (e.g. a Rejected).
    while let Ok(bytes) = outbound.try_recv() {
        let _ = conn.send(&bytes).await;
    }
    let _ = conn.close().await;
    let _ = events.send(SessionEvent::Closed { session });
    tracing::debug!(%session, "session task finished");
}
