//! Two-phase request completion.
//!
//! Every request handed to the connection produces a [`Wait`] for the
//! caller and a [`Completion`] for the driver. The driver fires the
//! completion twice: once when the server acknowledges (orders) the
//! request, and once when it retires with a result.
//!
//! ```text
//! UNRESOLVED ──ack──→ ACKNOWLEDGED ──complete──→ RETIRED
//!      └──────────────── complete / fail ────────────┘
//! ```

use tokio::sync::oneshot;

use crate::RequestError;

type Outcome = Result<Vec<u8>, RequestError>;

/// The caller's side of one in-flight request.
///
/// `Wait` is owned by exactly one task. Nothing cancels the request:
/// dropping the `Wait` only discards its outcome.
#[derive(Debug)]
#[must_use = "a Wait does nothing unless awaited"]
pub struct Wait {
    ack: Option<oneshot::Receiver<()>>,
    retire: Option<oneshot::Receiver<Outcome>>,
    outcome: Option<Outcome>,
}

impl Wait {
    /// Creates a linked `Wait` / [`Completion`] pair.
    pub(crate) fn new() -> (Self, Completion) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (retire_tx, retire_rx) = oneshot::channel();
        let wait = Self {
            ack: Some(ack_rx),
            retire: Some(retire_rx),
            outcome: None,
        };
        let completion = Completion {
            ack: Some(ack_tx),
            retire: retire_tx,
        };
        (wait, completion)
    }

    /// Suspends until the server has ordered the request.
    ///
    /// Also returns once the request has retired or the connection has
    /// given up on it; failures only surface through
    /// [`result`](Self::result).
    pub async fn await_acknowledged(&mut self) {
        if let Some(ack) = &mut self.ack {
            let _ = ack.await;
            self.ack = None;
        }
    }

    /// Suspends until the request has retired, without consuming the
    /// outcome.
    pub async fn await_retired(&mut self) {
        if let Some(retire) = &mut self.retire {
            let outcome = retire.await.unwrap_or(Err(RequestError::Closed));
            self.outcome = Some(outcome);
            self.retire = None;
            self.ack = None;
        }
    }

    /// Suspends until the request has retired and returns its outcome.
    ///
    /// Calling it again returns the same outcome immediately.
    pub async fn result(&mut self) -> Result<Vec<u8>, RequestError> {
        self.await_retired().await;
        self.outcome.clone().unwrap_or(Err(RequestError::Closed))
    }

    /// Whether the outcome is already known.
    pub fn is_retired(&self) -> bool {
        self.outcome.is_some()
    }
}

/// The driver's side of one in-flight request.
#[derive(Debug)]
pub(crate) struct Completion {
    ack: Option<oneshot::Sender<()>>,
    retire: oneshot::Sender<Outcome>,
}

impl Completion {
    /// Marks the request as ordered by the server. Idempotent.
    pub(crate) fn acknowledge(&mut self) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
    }

    /// Delivers the terminal outcome. Acknowledges first if the server
    /// never did.
    pub(crate) fn retire(mut self, outcome: Outcome) {
        self.acknowledge();
        let _ = self.retire.send(outcome);
    }
}
