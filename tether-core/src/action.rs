//! Asynchronous control-plane actions and completion waiting.
//!
//! Mutating calls return an [`Action`] handle. The producer side drives an
//! [`ActionReporter`], pushing progress updates until a terminal one and
//! then closing the channel; a channel that closes without a terminal
//! update means the producer died and is reported as its own error.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::resource::ParentRef;

/// Buffered progress updates per action.
const PROGRESS_BUFFER: usize = 16;

/// One progress message from the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionUpdate {
    /// Still running; percent complete.
    Running(u8),
    /// Finished successfully.
    Success,
    /// Finished with an error message.
    Error(String),
}

/// Handle to one in-flight asynchronous mutation.
#[derive(Debug)]
pub struct Action {
    id: Uuid,
    command: String,
    parent: ParentRef,
    progress: mpsc::Receiver<ActionUpdate>,
}

impl Action {
    /// Create an action handle plus the producer side reporting into it.
    pub fn new(command: impl Into<String>, parent: ParentRef) -> (Self, ActionReporter) {
        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let action = Self {
            id: Uuid::new_v4(),
            command: command.into(),
            parent,
            progress: rx,
        };
        (action, ActionReporter { tx })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn parent(&self) -> ParentRef {
        self.parent
    }
}

/// Producer side of an action's progress channel.
///
/// Dropping the reporter closes the channel, so consumers can tell a
/// finished producer from one that died mid-flight.
#[derive(Debug)]
pub struct ActionReporter {
    tx: mpsc::Sender<ActionUpdate>,
}

impl ActionReporter {
    /// Report intermediate progress. Send errors are ignored: a consumer
    /// that stopped listening has no use for progress.
    pub async fn running(&self, percent: u8) {
        let _ = self.tx.send(ActionUpdate::Running(percent)).await;
    }

    /// Report successful completion and close the channel.
    pub async fn success(self) {
        let _ = self.tx.send(ActionUpdate::Success).await;
    }

    /// Report failure and close the channel.
    pub async fn fail(self, message: impl Into<String>) {
        let _ = self.tx.send(ActionUpdate::Error(message.into())).await;
    }
}

/// Failure while waiting for actions to finish.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The control plane reported the action failed.
    #[error("{command} on {parent} failed: {message}")]
    Failed {
        id: Uuid,
        command: String,
        parent: ParentRef,
        message: String,
    },

    /// The progress channel closed before a terminal update.
    #[error("{command} on {parent} ended without a terminal status")]
    Interrupted {
        id: Uuid,
        command: String,
        parent: ParentRef,
    },

    /// The wait was cancelled before every action finished.
    #[error("cancelled while waiting for {pending} action(s)")]
    Cancelled { pending: usize },
}

/// Wait for a single action to reach a terminal status.
pub async fn wait_for(cancel: &CancellationToken, action: Action) -> Result<(), ActionError> {
    wait_for_all(cancel, vec![action]).await
}

/// Wait for every action to reach a terminal status.
///
/// All progress channels are drained to completion even after a failure
/// has been seen, so no producer is left blocked on a half-read channel.
/// The first failure observed wins and is returned with the failing
/// action's identity; later failures are logged. Cancellation returns
/// immediately; producers close their channels on their own.
pub async fn wait_for_all(
    cancel: &CancellationToken,
    actions: Vec<Action>,
) -> Result<(), ActionError> {
    if actions.is_empty() {
        return Ok(());
    }

    struct Pending {
        id: Uuid,
        command: String,
        parent: ParentRef,
        terminal: bool,
    }

    let mut pending: HashMap<usize, Pending> = HashMap::new();
    let mut streams = StreamMap::new();
    for (key, action) in actions.into_iter().enumerate() {
        pending.insert(
            key,
            Pending {
                id: action.id,
                command: action.command,
                parent: action.parent,
                terminal: false,
            },
        );
        streams.insert(key, ReceiverStream::new(action.progress));
    }

    let mut first_failure: Option<ActionError> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let remaining = pending.values().filter(|p| !p.terminal).count();
                return Err(ActionError::Cancelled { pending: remaining });
            }
            next = streams.next() => {
                let Some((key, update)) = next else { break };
                let Some(entry) = pending.get_mut(&key) else { continue };
                match update {
                    ActionUpdate::Running(percent) => {
                        debug!("{} on {}: {}%", entry.command, entry.parent, percent);
                    }
                    ActionUpdate::Success => {
                        entry.terminal = true;
                        debug!("{} on {} succeeded", entry.command, entry.parent);
                    }
                    ActionUpdate::Error(message) => {
                        entry.terminal = true;
                        if first_failure.is_none() {
                            first_failure = Some(ActionError::Failed {
                                id: entry.id,
                                command: entry.command.clone(),
                                parent: entry.parent,
                                message,
                            });
                        } else {
                            warn!("{} on {} also failed: {}", entry.command, entry.parent, message);
                        }
                    }
                }
            }
        }
    }

    if let Some(failure) = first_failure {
        return Err(failure);
    }

    // Every stream is drained; an action without a terminal update lost
    // its producer.
    for entry in pending.values() {
        if !entry.terminal {
            return Err(ActionError::Interrupted {
                id: entry.id,
                command: entry.command.clone(),
                parent: entry.parent,
            });
        }
    }

    Ok(())
}
