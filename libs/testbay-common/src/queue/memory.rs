use super::{Delivery, MessageBroker, QueueError, QueueSpec};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Message {
    data: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, Message>,
    dead_letters: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    next_tag: u64,
    epoch: u64,
    connected: bool,
    reachable: bool,
    reconnects: u32,
    fail_next_publish: bool,
}

impl BrokerState {
    fn check_open(&self) -> Result<(), QueueError> {
        if self.connected {
            Ok(())
        } else {
            Err(QueueError::ChannelClosed("channel is closed".to_string()))
        }
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut MemoryQueue, QueueError> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    /// Unacked messages go back to the head of their queue, as when a channel dies
    fn requeue_unacked(&mut self) {
        for queue in self.queues.values_mut() {
            let pending = std::mem::take(&mut queue.unacked);
            for (_, mut message) in pending.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
    }
}

/// In-process broker with manual-ack semantics, for local runs and tests.
///
/// Mirrors what the services rely on from RabbitMQ: declared queues survive
/// reconnects, unacked deliveries are redelivered when the session dies, and
/// tags from a previous session are refused.
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState {
                queues: HashMap::new(),
                next_tag: 1,
                epoch: 1,
                connected: true,
                reachable: true,
                reconnects: 0,
                fail_next_publish: false,
            }),
        }
    }

    /// Drop the session: unacked messages are requeued and old tags become stale
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.requeue_unacked();
        state.connected = false;
        state.epoch += 1;
    }

    /// While unreachable, reconnect attempts fail
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.lock().await.reachable = reachable;
    }

    /// The next publish finds the session dead, as if the connection dropped mid-flight
    pub async fn drop_connection_on_next_publish(&self) {
        self.state.lock().await.fail_next_publish = true;
    }

    pub async fn reconnects(&self) -> u32 {
        self.state.lock().await.reconnects
    }

    pub async fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub async fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.check_open()?;

        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(QueueError::PreconditionFailed {
                queue: spec.name.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    MemoryQueue {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        unacked: BTreeMap::new(),
                        dead_letters: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.fail_next_publish {
            state.fail_next_publish = false;
            state.requeue_unacked();
            state.connected = false;
            state.epoch += 1;
        }
        state.check_open()?;

        state.queue_mut(queue)?.ready.push_back(Message {
            data: payload.to_vec(),
            redelivered: false,
        });
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock().await;
        state.check_open()?;

        let tag = state.next_tag;
        let epoch = state.epoch;
        let q = state.queue_mut(queue)?;
        let Some(message) = q.ready.pop_front() else {
            return Ok(None);
        };

        let delivery = Delivery {
            queue: queue.to_string(),
            delivery_tag: tag,
            data: message.data.clone(),
            redelivered: message.redelivered,
            epoch,
        };
        q.unacked.insert(tag, message);
        state.next_tag += 1;
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.check_open()?;
        if delivery.epoch != state.epoch {
            return Err(QueueError::StaleDelivery(delivery.delivery_tag));
        }

        state
            .queue_mut(&delivery.queue)?
            .unacked
            .remove(&delivery.delivery_tag)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(delivery.delivery_tag))
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.check_open()?;
        if delivery.epoch != state.epoch {
            return Err(QueueError::StaleDelivery(delivery.delivery_tag));
        }

        let q = state.queue_mut(&delivery.queue)?;
        let mut message = q
            .unacked
            .remove(&delivery.delivery_tag)
            .ok_or(QueueError::UnknownDelivery(delivery.delivery_tag))?;
        if requeue {
            message.redelivered = true;
            q.ready.push_front(message);
        } else {
            q.dead_letters.push(message.data);
        }
        Ok(())
    }

    async fn message_count(&self, queue: &str) -> Result<u32, QueueError> {
        let mut state = self.state.lock().await;
        state.check_open()?;
        Ok(state.queue_mut(queue)?.ready.len() as u32)
    }

    async fn health_check(&self) -> bool {
        self.state.lock().await.connected
    }

    async fn reconnect(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if !state.reachable {
            return Err(QueueError::Connection("broker unreachable".to_string()));
        }
        if state.connected {
            return Ok(());
        }
        state.connected = true;
        state.reconnects += 1;
        Ok(())
    }
}
