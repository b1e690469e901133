//! Bounded intake queue and keyed turn workers.
//!
//! Turns for the same (tenant, user) key run strictly in arrival order on a
//! dedicated worker task; turns for different keys run in parallel up to a
//! global permit limit. When the intake queue is full, submission fails fast
//! instead of queueing unboundedly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::normalize::{Channel, InboundMessage, normalize};
use crate::pipeline::Processor;
use crate::session::SessionKey;

struct QueuedTurn {
    channel: Channel,
    raw: String,
}

/// Handle for submitting raw channel payloads into the pipeline.
#[derive(Clone)]
pub struct Ingress {
    tx: mpsc::Sender<QueuedTurn>,
    capacity: usize,
}

impl Ingress {
    /// Start the intake loop. Returns the submit handle and the loop's
    /// join handle; dropping every `Ingress` clone shuts the loop down.
    pub fn start(
        processor: Arc<Processor>,
        queue_capacity: usize,
        max_parallel_turns: usize,
        actor_idle_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let permits = Arc::new(Semaphore::new(max_parallel_turns.max(1)));
        let handle = tokio::spawn(run_intake(processor, rx, permits, actor_idle_timeout));
        (Self { tx, capacity }, handle)
    }

    /// Enqueue one raw payload. Fails fast with `Overloaded` when the
    /// intake queue is full.
    pub fn submit(&self, channel: Channel, raw: impl Into<String>) -> Result<(), PipelineError> {
        let turn = QueuedTurn {
            channel,
            raw: raw.into(),
        };
        match self.tx.try_send(turn) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(capacity = self.capacity, "Intake queue full, rejecting turn");
                Err(PipelineError::Overloaded {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(PipelineError::ShutDown),
        }
    }
}

type WorkerSender = mpsc::UnboundedSender<(InboundMessage, OwnedSemaphorePermit)>;

/// Sender plus join handle for one key's worker task. The handle lets the
/// intake wait out an exiting worker's drain before respawning, so only
/// one worker at a time ever runs a key's turns.
struct Worker {
    tx: WorkerSender,
    handle: JoinHandle<()>,
}

/// Drains the intake queue and forwards each turn to its key's worker.
///
/// The global permit is acquired here, before forwarding, so a saturated
/// pipeline backs up into the bounded intake queue and `submit` starts
/// rejecting instead of buffering without limit.
async fn run_intake(
    processor: Arc<Processor>,
    mut rx: mpsc::Receiver<QueuedTurn>,
    permits: Arc<Semaphore>,
    idle_timeout: Duration,
) {
    let mut workers: HashMap<SessionKey, Worker> = HashMap::new();

    while let Some(turn) = rx.recv().await {
        let message = match normalize(turn.channel, &turn.raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %turn.channel, error = %e, "Dropping malformed payload");
                continue;
            }
        };

        let Some(key) = processor.actor_key(&message) else {
            continue;
        };

        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(permit) => permit,
            // Semaphore is never closed; bail out if it somehow is.
            Err(_) => break,
        };

        let mut item = (message, permit);
        loop {
            let worker = workers
                .entry(key.clone())
                .or_insert_with(|| spawn_worker(Arc::clone(&processor), key.clone(), idle_timeout));
            match worker.tx.send(item) {
                Ok(()) => break,
                Err(mpsc::error::SendError(back)) => {
                    // Worker hit its idle timeout between lookups. It may
                    // still be draining turns that raced in before the
                    // close; wait for it so per-key order holds across the
                    // respawn.
                    if let Some(old) = workers.remove(&key) {
                        let _ = old.handle.await;
                    }
                    debug!(tenant_id = %key.tenant_id, "Respawning idle turn worker");
                    item = back;
                }
            }
        }
    }

    info!("Intake queue closed, shutting down");
}

/// One worker per session key. Processes its queue strictly in order and
/// exits after sitting idle.
fn spawn_worker(processor: Arc<Processor>, key: SessionKey, idle_timeout: Duration) -> Worker {
    let (tx, mut rx) = mpsc::unbounded_channel::<(InboundMessage, OwnedSemaphorePermit)>();

    let handle = tokio::spawn(async move {
        loop {
            let (message, permit) = match tokio::time::timeout(idle_timeout, rx.recv()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    rx.close();
                    // Drain anything that raced in before close; the intake
                    // joins this task before handing the key to a new
                    // worker.
                    while let Some((message, permit)) = rx.recv().await {
                        run_turn(&processor, &key, message).await;
                        drop(permit);
                    }
                    break;
                }
            };
            run_turn(&processor, &key, message).await;
            drop(permit);
        }
        debug!(tenant_id = %key.tenant_id, user_id = %key.user_id, "Turn worker exiting");
    });

    Worker { tx, handle }
}

async fn run_turn(processor: &Processor, key: &SessionKey, message: InboundMessage) {
    match processor.handle_message(message).await {
        Ok(outcome) => {
            debug!(
                tenant_id = %key.tenant_id,
                user_id = %key.user_id,
                outcome = outcome.label(),
                "Turn finished"
            );
        }
        Err(e) => {
            error!(
                tenant_id = %key.tenant_id,
                user_id = %key.user_id,
                error = %e,
                "Turn failed"
            );
        }
    }
}
