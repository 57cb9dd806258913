//! Connection driver: the one task that owns the transport channel.
//!
//! The driver:
//!   1. Drains the outbound queue in FIFO order, numbering each request
//!      with a `TransactionId` and remembering its completion.
//!   2. Routes `Ack` / `Complete` frames back to those completions, and
//!      drops a lock from the ownership set when its release completes.
//!   3. On channel loss, fails everything in flight with
//!      `ConnectionLost`, re-dials with backoff, handshakes, and replays
//!      every held write lock before it touches the queue again. Releases
//!      that were in flight are not replayed: the lost session took those
//!      locks with it.
//!
//! If the replay cannot get a lock back, the driver gives up: the state
//! becomes `Failed`, the ownership set is cleared and the queue is
//! dropped, so every queued and future request resolves to `Closed`.

use std::collections::HashMap;
use std::sync::Arc;

use tessera_protocol::{
    ClientFrame, Codec, EntityError, EntityIdentity, JsonCodec, Message, MessageKind, Outcome,
    PROTOCOL_VERSION, ServerFrame, SessionId, TransactionId, decode_try_lock_reply,
};
use tessera_transport::{Connection as Channel, Connector};
use tokio::sync::{mpsc, watch};

use crate::connection::{ConnectionState, Shared};
use crate::wait::Completion;
use crate::{ClientError, ConnectionConfig, RequestError};

/// What handles put on the driver's queue.
pub(crate) enum Outbound {
    Request {
        message: Message,
        completion: Completion,
    },
    Shutdown,
}

/// A request written to the channel and not yet completed.
struct InFlight {
    completion: Completion,
    /// Set for `LockRelease`: the lock to forget once it completes.
    releases: Option<EntityIdentity>,
}

/// Why the serve loop stopped.
enum Exit {
    ChannelLost,
    Shutdown,
}

/// Why reconnection gave up.
#[derive(Debug, thiserror::Error)]
enum ReconnectError {
    #[error("gave up after {attempts} reconnection attempts")]
    Exhausted { attempts: u32 },

    #[error("server rejected reconnection: {reason}")]
    Rejected { reason: String },

    #[error("write lock on {identity} could not be reacquired: {reason}")]
    LockLost {
        identity: EntityIdentity,
        reason: String,
    },
}

enum ReplayError {
    /// The fresh channel dropped mid-replay; worth another attempt.
    ChannelLost,
    Fatal(ReconnectError),
}

/// Dials `connector` and performs the handshake.
pub(crate) async fn establish<K: Connector>(
    connector: &K,
    config: &ConnectionConfig,
) -> Result<(K::Connection, SessionId), ClientError> {
    let channel = connector.connect().await.map_err(|e| ClientError::Connect {
        reason: e.to_string(),
    })?;

    let hello = JsonCodec.encode(&ClientFrame::Hello {
        protocol_version: PROTOCOL_VERSION,
    })?;
    channel.send(&hello).await.map_err(|e| ClientError::Connect {
        reason: e.to_string(),
    })?;

    let reply = match tokio::time::timeout(config.handshake_timeout, channel.recv()).await {
        Ok(Ok(Some(bytes))) => bytes,
        Ok(Ok(None)) => {
            return Err(ClientError::Connect {
                reason: "connection closed during handshake".into(),
            });
        }
        Ok(Err(e)) => {
            return Err(ClientError::Connect {
                reason: e.to_string(),
            });
        }
        Err(_) => {
            return Err(ClientError::Connect {
                reason: "handshake timed out".into(),
            });
        }
    };

    match JsonCodec.decode::<ServerFrame>(&reply)? {
        ServerFrame::Welcome { session } => Ok((channel, session)),
        ServerFrame::Rejected { reason } => Err(ClientError::Rejected { reason }),
        other => Err(ClientError::Connect {
            reason: format!("unexpected handshake reply: {other:?}"),
        }),
    }
}

pub(crate) struct Driver<K: Connector> {
    connector: K,
    channel: K::Connection,
    session: SessionId,
    shared: Arc<Shared>,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    pending: HashMap<TransactionId, InFlight>,
    next_transaction: u64,
}

impl<K: Connector> Driver<K> {
    pub(crate) fn new(
        connector: K,
        channel: K::Connection,
        session: SessionId,
        shared: Arc<Shared>,
        state: watch::Sender<ConnectionState>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    ) -> Self {
        Self {
            connector,
            channel,
            session,
            shared,
            state,
            outbound,
            pending: HashMap::new(),
            next_transaction: 0,
        }
    }

    /// Runs until shutdown or an unrecoverable connection loss.
    pub(crate) async fn run(mut self) {
        loop {
            match self.serve().await {
                Exit::Shutdown => {
                    self.shutdown().await;
                    return;
                }
                Exit::ChannelLost => {
                    self.fail_pending(RequestError::ConnectionLost);
                    if let Err(e) = self.reconnect().await {
                        tracing::error!(session = %self.session, error = %e, "connection failed");
                        self.shared.locks.clear();
                        self.state.send_replace(ConnectionState::Failed {
                            reason: e.to_string(),
                        });
                        // Dropping `self` drops the queue: queued requests
                        // and later sends resolve to `Closed`.
                        return;
                    }
                }
            }
        }
    }

    async fn serve(&mut self) -> Exit {
        loop {
            tokio::select! {
                incoming = self.channel.recv() => match incoming {
                    Ok(Some(bytes)) => self.on_frame(&bytes),
                    Ok(None) => {
                        tracing::info!(session = %self.session, "channel closed by server");
                        return Exit::ChannelLost;
                    }
                    Err(e) => {
                        tracing::warn!(
                            session = %self.session,
                            error = %e,
                            "channel receive failed"
                        );
                        return Exit::ChannelLost;
                    }
                },
                command = self.outbound.recv() => match command {
                    Some(Outbound::Request { message, completion }) => {
                        if !self.transmit(message, completion).await {
                            return Exit::ChannelLost;
                        }
                    }
                    Some(Outbound::Shutdown) | None => return Exit::Shutdown,
                },
            }
        }
    }

    fn next_transaction_id(&mut self) -> TransactionId {
        self.next_transaction += 1;
        TransactionId(self.next_transaction)
    }

    /// Writes one request. Returns `false` if the channel is gone.
    async fn transmit(&mut self, message: Message, completion: Completion) -> bool {
        let transaction = self.next_transaction_id();
        let kind = message.kind;
        let identity = message.identity.clone();

        let bytes = match JsonCodec.encode(&ClientFrame::Request {
            transaction,
            message,
        }) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(%transaction, %identity, error = %e, "failed to encode request");
                let error = EntityError::other(&identity.key, e.to_string());
                completion.retire(Err(RequestError::Entity(error)));
                return true;
            }
        };

        let releases = (kind == MessageKind::LockRelease).then(|| identity.clone());
        self.pending.insert(
            transaction,
            InFlight {
                completion,
                releases,
            },
        );
        if let Err(e) = self.channel.send(&bytes).await {
            tracing::warn!(%transaction, error = %e, "channel send failed");
            return false;
        }
        tracing::debug!(%transaction, ?kind, %identity, "request sent");
        true
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        let frame: ServerFrame = match JsonCodec.decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session = %self.session, error = %e, "dropping undecodable frame");
                return;
            }
        };

        match frame {
            ServerFrame::Ack { transaction } => match self.pending.get_mut(&transaction) {
                Some(in_flight) => in_flight.completion.acknowledge(),
                None => tracing::debug!(%transaction, "ack for unknown transaction"),
            },
            ServerFrame::Complete {
                transaction,
                outcome,
            } => match self.pending.remove(&transaction) {
                Some(in_flight) => {
                    tracing::debug!(%transaction, "request retired");
                    let result = outcome.into_result();
                    if let (Some(identity), Ok(_)) = (&in_flight.releases, &result) {
                        self.shared.locks.forget(identity);
                    }
                    in_flight
                        .completion
                        .retire(result.map_err(RequestError::Entity));
                }
                None => tracing::debug!(%transaction, "completion for unknown transaction"),
            },
            other => {
                tracing::warn!(session = %self.session, frame = ?other, "unexpected frame");
            }
        }
    }

    fn fail_pending(&mut self, error: RequestError) {
        if !self.pending.is_empty() {
            tracing::debug!(count = self.pending.len(), %error, "failing in-flight requests");
        }
        let pending: Vec<InFlight> = self.pending.drain().map(|(_, f)| f).collect();
        for in_flight in pending {
            // The session is gone, and the server dropped its locks with it.
            if let Some(identity) = &in_flight.releases {
                self.shared.locks.forget(identity);
            }
            in_flight.completion.retire(Err(error.clone()));
        }
    }

    async fn shutdown(&mut self) {
        self.fail_pending(RequestError::Closed);
        self.shared.locks.clear();
        let _ = self.channel.close().await;
        self.state.send_replace(ConnectionState::Closed);
        tracing::info!(session = %self.session, "connection closed");
    }

    // -- Recovery ---------------------------------------------------------

    async fn reconnect(&mut self) -> Result<(), ReconnectError> {
        let _ = self.channel.close().await;
        let policy = self.shared.config.reconnect.clone();

        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > policy.max_attempts {
                return Err(ReconnectError::Exhausted {
                    attempts: policy.max_attempts,
                });
            }
            self.state
                .send_replace(ConnectionState::Reconnecting { attempt });

            let delay = policy.backoff_for(attempt);
            tracing::warn!(attempt, ?delay, "connection lost, reconnecting");
            tokio::time::sleep(delay).await;

            let (channel, session) = match establish(&self.connector, &self.shared.config).await {
                Ok(established) => established,
                Err(ClientError::Rejected { reason }) => {
                    return Err(ReconnectError::Rejected { reason });
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    continue;
                }
            };
            self.channel = channel;
            self.session = session;

            match self.replay_locks().await {
                Ok(()) => {
                    self.state
                        .send_replace(ConnectionState::Connected { session });
                    tracing::info!(%session, attempt, "reconnected");
                    return Ok(());
                }
                Err(ReplayError::ChannelLost) => {
                    tracing::warn!(attempt, %session, "channel lost during lock replay");
                    let _ = self.channel.close().await;
                }
                Err(ReplayError::Fatal(e)) => return Err(e),
            }
        }
    }

    /// Takes back every held write lock on the fresh channel.
    ///
    /// Uses the try-lock: the lock was released server-side when the old
    /// session ended, so anyone else holding it now means it is lost.
    async fn replay_locks(&mut self) -> Result<(), ReplayError> {
        let held = self.shared.locks.snapshot();
        if !held.is_empty() {
            tracing::info!(count = held.len(), session = %self.session, "reacquiring write locks");
        }

        for identity in held {
            let lost = |reason: String| {
                ReplayError::Fatal(ReconnectError::LockLost {
                    identity: identity.clone(),
                    reason,
                })
            };

            let message = Message::lock_try_acquire(&identity).map_err(|e| lost(e.to_string()))?;
            let transaction = self.next_transaction_id();
            let bytes = JsonCodec
                .encode(&ClientFrame::Request {
                    transaction,
                    message,
                })
                .map_err(|e| lost(e.to_string()))?;
            self.channel
                .send(&bytes)
                .await
                .map_err(|_| ReplayError::ChannelLost)?;

            let reply = self
                .await_completion(transaction)
                .await?
                .into_result()
                .map_err(|e| lost(e.to_string()))?;
            let granted = decode_try_lock_reply(&reply).map_err(|e| lost(e.to_string()))?;
            if !granted {
                return Err(lost("held by another client".into()));
            }
            tracing::debug!(%identity, "write lock reacquired");
        }
        Ok(())
    }

    /// Reads frames until `transaction` completes. Nothing else is in
    /// flight during replay, so other frames are skipped.
    async fn await_completion(&self, transaction: TransactionId) -> Result<Outcome, ReplayError> {
        let timeout = self.shared.config.handshake_timeout;
        loop {
            let bytes = match tokio::time::timeout(timeout, self.channel.recv()).await {
                Ok(Ok(Some(bytes))) => bytes,
                _ => return Err(ReplayError::ChannelLost),
            };
            match JsonCodec.decode::<ServerFrame>(&bytes) {
                Ok(ServerFrame::Complete {
                    transaction: completed,
                    outcome,
                }) if completed == transaction => return Ok(outcome),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "dropping undecodable frame during replay"),
            }
        }
    }
}
