#![allow(clippy::redundant_pub_crate)]

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::command::EngineCommand;
use crate::session::EngineSession;

pub(crate) fn spawn(
    mut commands: mpsc::Receiver<EngineCommand>,
    session: Box<dyn EngineSession>,
    tick: Duration,
) {
    tokio::spawn(async move {
        let mut worker = Worker { session };
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => worker.handle(command).await,
                        None => break,
                    }
                }
                now = ticker.tick() => {
                    let elapsed = now.saturating_duration_since(last_tick);
                    last_tick = now;
                    if let Err(err) = worker.session.advance(elapsed).await {
                        warn!(error = %err, detail = ?err, "engine session tick failed");
                    }
                }
            }
        }
        debug!("engine worker stopped; all adapters dropped");
    });
}

struct Worker {
    session: Box<dyn EngineSession>,
}

impl Worker {
    async fn handle(&mut self, command: EngineCommand) {
        let operation = command.operation();
        let delivered = match command {
            EngineCommand::Add {
                handle,
                source,
                save_path,
                respond_to,
            } => respond_to
                .send(self.session.add(handle, &source, &save_path).await)
                .is_ok(),
            EngineCommand::Remove {
                handle,
                options,
                respond_to,
            } => respond_to
                .send(self.session.remove(handle, options).await)
                .is_ok(),
            EngineCommand::Pause { handle, respond_to } => {
                respond_to.send(self.session.pause(handle).await).is_ok()
            }
            EngineCommand::Resume { handle, respond_to } => {
                respond_to.send(self.session.resume(handle).await).is_ok()
            }
            EngineCommand::Status { handle, respond_to } => {
                respond_to.send(self.session.status(handle).await).is_ok()
            }
            EngineCommand::Files { handle, respond_to } => {
                respond_to.send(self.session.files(handle).await).is_ok()
            }
        };
        if !delivered {
            debug!(operation, "engine reply dropped; caller went away");
        }
    }
}
