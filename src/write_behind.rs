use crate::{PinDb, PinRequestId, PinRequestRecord};
use log::*;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Bookkeeping operation for the pin store, applied asynchronously.
#[derive(Debug)]
pub enum PinWriteOp {
    Insert(PinRequestRecord),
    UpdateExpiration {
        id: PinRequestId,
        expiration: u64,
    },
    Delete {
        id: PinRequestId,
    },
}

enum Msg {
    Op(PinWriteOp),
    Flush(oneshot::Sender<()>),
}

/// Write-behind queue in front of `PinDb`. Callers enqueue without waiting
/// for the disk write; a background task drains the queue in order. Errors
/// are logged and swallowed, the in-memory state is authoritative until the
/// next recovery.
pub struct WriteBehindQueue {
    tx: mpsc::UnboundedSender<Msg>,
}

impl WriteBehindQueue {
    pub fn spawn(db: Arc<PinDb>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::Op(op) => {
                        let result = match &op {
                            PinWriteOp::Insert(record) => db.insert(record),
                            PinWriteOp::UpdateExpiration { id, expiration } => {
                                db.update_expiration(*id, *expiration)
                            }
                            PinWriteOp::Delete { id } => db.delete(*id),
                        };
                        if let Err(e) = result {
                            warn!("Write-behind op {:?} failed: {}", op, e);
                        }
                    }
                    Msg::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Write-behind queue drained, worker exiting");
        });

        WriteBehindQueue { tx }
    }

    pub fn enqueue(&self, op: PinWriteOp) {
        if self.tx.send(Msg::Op(op)).is_err() {
            warn!("Write-behind worker gone, op dropped");
        }
    }

    /// Resolves once every op enqueued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Msg::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
