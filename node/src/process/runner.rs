//! Single-threaded driver for the broadcast engine. All traffic, local
//! broadcast requests and inbound network messages alike, is funnelled
//! through one mailbox so session state is mutated from exactly one place.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::broadcast::{Message, Payload};
use crate::process::DbrbProcess;
use crate::view::ViewData;

const MAILBOX_SIZE: usize = 1000;
const RETIRE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub enum DbrbCommand {
    Broadcast { payload: Payload, recipients: ViewData },
    Message(Message),
}

/// Cloneable handle for feeding the engine from other tasks.
#[derive(Clone)]
pub struct DbrbHandle {
    commands: mpsc::Sender<DbrbCommand>,
}

impl DbrbHandle {
    pub async fn broadcast(&self, payload: Payload, recipients: ViewData) {
        if let Err(e) = self
            .commands
            .send(DbrbCommand::Broadcast { payload, recipients })
            .await
        {
            log::error!("Failed to submit broadcast, engine stopped: {e}");
        }
    }

    pub async fn message(&self, message: Message) {
        if let Err(e) = self.commands.send(DbrbCommand::Message(message)).await {
            log::error!("Failed to submit message, engine stopped: {e}");
        }
    }

    /// Non-blocking variant for transport callbacks. A full mailbox drops the
    /// message; the protocol tolerates loss through relaying.
    pub fn try_message(&self, message: Message) {
        if let Err(e) = self.commands.try_send(DbrbCommand::Message(message)) {
            log::warn!("Dropping inbound message, mailbox unavailable: {e}");
        }
    }
}

pub fn mailbox() -> (DbrbHandle, mpsc::Receiver<DbrbCommand>) {
    let (commands, receiver) = mpsc::channel(MAILBOX_SIZE);
    (DbrbHandle { commands }, receiver)
}

impl DbrbProcess {
    /// Run the engine until the command channel closes, sweeping expired
    /// sessions in between.
    pub async fn run(mut self, mut commands: mpsc::Receiver<DbrbCommand>) {
        log::info!("Starting DBRB process {}", self.id());
        let mut retire_interval = tokio::time::interval(RETIRE_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(DbrbCommand::Broadcast { payload, recipients }) => {
                        self.broadcast(payload, recipients);
                    }
                    Some(DbrbCommand::Message(message)) => {
                        self.process_message(message);
                    }
                    None => {
                        log::info!("DBRB command channel closed, shutting down");
                        break;
                    }
                },
                _ = retire_interval.tick() => {
                    self.retire_expired(Instant::now());
                }
            }
        }
    }
}
