//! Cola de chunks con entrega at-least-once.
//!
//! Un `receive` no borra el mensaje: lo presta al worker (lease) hasta que
//! éste lo confirma. Si el lease vence o el worker reporta error, el mensaje
//! vuelve a la cola; al llegar a `max_receive_count` entregas fallidas pasa
//! a la dead-letter.

use anyhow::{anyhow, Result};
use common::{ChunkWorkItem, Delivery, Receipt, WorkerId};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Mensaje que agotó sus entregas.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub item: ChunkWorkItem,
    pub receive_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct Message {
    item: ChunkWorkItem,
    receive_count: u32,
    last_error: Option<String>,
}

#[derive(Debug)]
struct Lease {
    message: Message,
    worker_id: WorkerId,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueInner {
    ready: VecDeque<Message>,
    in_flight: HashMap<Receipt, Lease>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
}

pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    dead_letters: mpsc::UnboundedSender<DeadLetter>,
    max_receive_count: u32,
    visibility_timeout: Duration,
}

impl WorkQueue {
    pub fn new(
        max_receive_count: u32,
        visibility_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Mutex::new(QueueInner::default()),
            dead_letters: tx,
            max_receive_count: max_receive_count.max(1),
            visibility_timeout,
        };
        (queue, rx)
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueInner>> {
        self.inner.lock().map_err(|_| anyhow!("lock work queue"))
    }

    /// Publica un work item al final de la cola.
    pub fn send(&self, item: ChunkWorkItem) -> Result<()> {
        let mut inner = self.lock()?;
        inner.ready.push_back(Message {
            item,
            receive_count: 0,
            last_error: None,
        });
        Ok(())
    }

    /// Presta hasta `max` mensajes al worker.
    pub fn receive(&self, worker_id: &str, max: usize) -> Result<Vec<Delivery>> {
        let mut inner = self.lock()?;
        let deadline = Instant::now() + self.visibility_timeout;
        let mut out = Vec::new();

        while out.len() < max {
            let Some(mut message) = inner.ready.pop_front() else {
                break;
            };
            message.receive_count += 1;

            let receipt = uuid::Uuid::new_v4().to_string();
            out.push(Delivery {
                receipt: receipt.clone(),
                receive_count: message.receive_count,
                item: message.item.clone(),
            });
            inner.in_flight.insert(
                receipt,
                Lease {
                    message,
                    worker_id: worker_id.to_string(),
                    deadline,
                },
            );
        }

        if !out.is_empty() {
            debug!("{} mensajes entregados al worker {}", out.len(), worker_id);
        }
        Ok(out)
    }

    /// Borra el mensaje. `false` si el receipt ya no es válido (lease vencido).
    pub fn ack(&self, receipt: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(inner.in_flight.remove(receipt).is_some())
    }

    /// Devuelve el mensaje a la cola (o a la dead-letter si agotó entregas).
    pub fn nack(&self, receipt: &str, error: Option<String>) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(lease) = inner.in_flight.remove(receipt) else {
            return Ok(false);
        };
        let mut message = lease.message;
        if error.is_some() {
            message.last_error = error;
        }
        self.release(&mut inner, message);
        Ok(true)
    }

    /// Libera los leases vencidos a `now`. Devuelve cuántos se liberaron.
    pub fn requeue_expired(&self, now: Instant) -> Result<usize> {
        let mut inner = self.lock()?;
        let expired: Vec<Receipt> = inner
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in &expired {
            if let Some(lease) = inner.in_flight.remove(receipt) {
                warn!(
                    "lease vencido: chunk {} de la tarea {} (worker {}, entrega {})",
                    lease.message.item.chunk_index,
                    lease.message.item.task_id,
                    lease.worker_id,
                    lease.message.receive_count
                );
                let mut message = lease.message;
                message.last_error = Some("visibility timeout".to_string());
                self.release(&mut inner, message);
            }
        }
        Ok(expired.len())
    }

    /// Vuelve a encolar un dead letter (reintento del failure handler).
    pub fn redrive(&self, letter: DeadLetter) -> Result<()> {
        self.dead_letters
            .send(letter)
            .map_err(|_| anyhow!("canal de dead letters cerrado"))
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let inner = self.lock()?;
        Ok(QueueStats {
            ready: inner.ready.len(),
            in_flight: inner.in_flight.len(),
        })
    }

    fn release(&self, inner: &mut QueueInner, message: Message) {
        if message.receive_count < self.max_receive_count {
            inner.ready.push_back(message);
            return;
        }

        info!(
            "chunk {} de la tarea {} agotó {} entregas, va a dead-letter",
            message.item.chunk_index, message.item.task_id, message.receive_count
        );
        let letter = DeadLetter {
            item: message.item,
            receive_count: message.receive_count,
            last_error: message.last_error,
        };
        if self.dead_letters.send(letter).is_err() {
            warn!("canal de dead letters cerrado, mensaje descartado");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ByteRange;

    fn item(idx: u32) -> ChunkWorkItem {
        ChunkWorkItem {
            task_id: "t1".to_string(),
            bucket: "uploads".to_string(),
            key: "t1/in.txt".to_string(),
            byte_range: ByteRange::new(idx as u64 * 10, idx as u64 * 10 + 10),
            chunk_index: idx,
            source_size: 100,
        }
    }

    #[test]
    fn receive_is_fifo_and_bounded() {
        let (q, _dlq) = WorkQueue::new(3, Duration::from_secs(60));
        for i in 0..5 {
            q.send(item(i)).unwrap();
        }

        let batch = q.receive("w1", 3).unwrap();
        let idx: Vec<u32> = batch.iter().map(|d| d.item.chunk_index).collect();
        assert_eq!(idx, vec![0, 1, 2]);
        assert!(batch.iter().all(|d| d.receive_count == 1));
        assert_eq!(q.stats().unwrap(), QueueStats { ready: 2, in_flight: 3 });
    }

    #[test]
    fn ack_removes_and_stale_receipt_is_rejected() {
        let (q, _dlq) = WorkQueue::new(3, Duration::from_secs(60));
        q.send(item(0)).unwrap();
        let d = q.receive("w1", 1).unwrap().remove(0);

        assert!(q.ack(&d.receipt).unwrap());
        assert!(!q.ack(&d.receipt).unwrap());
        assert_eq!(q.stats().unwrap(), QueueStats::default());
    }

    #[test]
    fn nack_redelivers_with_higher_count() {
        let (q, _dlq) = WorkQueue::new(3, Duration::from_secs(60));
        q.send(item(0)).unwrap();

        let d1 = q.receive("w1", 1).unwrap().remove(0);
        assert!(q.nack(&d1.receipt, Some("boom".into())).unwrap());

        let d2 = q.receive("w2", 1).unwrap().remove(0);
        assert_eq!(d2.receive_count, 2);
        assert_ne!(d1.receipt, d2.receipt);
    }

    #[test]
    fn expired_leases_are_redelivered() {
        let (q, _dlq) = WorkQueue::new(3, Duration::ZERO);
        q.send(item(0)).unwrap();
        let d1 = q.receive("w1", 1).unwrap().remove(0);

        assert_eq!(q.requeue_expired(Instant::now()).unwrap(), 1);
        // el receipt viejo ya no sirve
        assert!(!q.ack(&d1.receipt).unwrap());

        let d2 = q.receive("w2", 1).unwrap().remove(0);
        assert_eq!(d2.item, d1.item);
        assert_eq!(d2.receive_count, 2);
    }

    #[test]
    fn live_leases_are_not_touched() {
        let (q, _dlq) = WorkQueue::new(3, Duration::from_secs(300));
        q.send(item(0)).unwrap();
        q.receive("w1", 1).unwrap();
        assert_eq!(q.requeue_expired(Instant::now()).unwrap(), 0);
        assert_eq!(q.stats().unwrap().in_flight, 1);
    }

    #[test]
    fn dead_letter_after_max_receives() {
        let (q, mut dlq) = WorkQueue::new(3, Duration::from_secs(60));
        q.send(item(4)).unwrap();

        for attempt in 1..=3 {
            let d = q.receive("w1", 1).unwrap().remove(0);
            assert_eq!(d.receive_count, attempt);
            q.nack(&d.receipt, Some(format!("fallo {attempt}"))).unwrap();
        }

        assert!(q.receive("w1", 1).unwrap().is_empty());
        let letter = dlq.try_recv().unwrap();
        assert_eq!(letter.item.chunk_index, 4);
        assert_eq!(letter.receive_count, 3);
        assert_eq!(letter.last_error.as_deref(), Some("fallo 3"));
        assert!(dlq.try_recv().is_err());
    }

    #[test]
    fn timeouts_also_count_towards_dead_letter() {
        let (q, mut dlq) = WorkQueue::new(2, Duration::ZERO);
        q.send(item(0)).unwrap();

        q.receive("w1", 1).unwrap();
        q.requeue_expired(Instant::now()).unwrap();
        q.receive("w1", 1).unwrap();
        q.requeue_expired(Instant::now()).unwrap();

        let letter = dlq.try_recv().unwrap();
        assert_eq!(letter.last_error.as_deref(), Some("visibility timeout"));
        assert_eq!(q.stats().unwrap(), QueueStats::default());
    }
}
