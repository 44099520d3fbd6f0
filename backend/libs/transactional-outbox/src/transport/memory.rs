use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DeliveryReceipt, OutboundMessage, Transport, TransportError};

/// Records every acknowledged message; failures can be scripted per send.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    scripted: Mutex<VecDeque<TransportError>>,
    unavailable: Mutex<bool>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next send with `error`. Queued errors are consumed in order.
    pub fn fail_next(&self, error: TransportError) {
        self.scripted.lock().push_back(error);
    }

    /// Fail every send until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    pub fn take_messages(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, TransportError> {
        if let Some(error) = self.scripted.lock().pop_front() {
            return Err(error);
        }
        if *self.unavailable.lock() {
            return Err(TransportError::Unavailable("in-memory broker down".to_string()));
        }

        let mut sent = self.sent.lock();
        sent.push(message.clone());
        Ok(DeliveryReceipt {
            partition: 0,
            offset: sent.len() as i64 - 1,
        })
    }
}
