//! In-flight tracking for acknowledged deliveries
//!
//! QoS 1 and 2 deliveries get a per-connection packet id and stay here until
//! the subscriber acknowledges them. The broker's retry loop asks for the
//! entries whose acknowledgement is overdue and re-sends them as duplicates,
//! giving up after a bounded number of attempts.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::broker::message::Delivery;

#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub delivery: Delivery,
    pub sent_at: Instant,
    pub retries: u8,
}

/// Result of one retry sweep.
#[derive(Debug, Default)]
pub struct RetrySweep {
    pub resend: Vec<Delivery>,
    pub dropped: Vec<u16>,
}

#[derive(Debug, Default)]
pub struct Inflight {
    next_id: u16,
    pending: HashMap<u16, PendingDelivery>,
    /// QoS 2 publishes received from this client and not yet released.
    incoming: HashSet<u16>,
}

impl Inflight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a packet id to `delivery` and start tracking it. Returns `None`
    /// when every id is already in flight.
    pub fn track(&mut self, delivery: &mut Delivery) -> Option<u16> {
        let id = self.next_free_id()?;
        delivery.packet_id = Some(id);
        self.pending.insert(
            id,
            PendingDelivery {
                delivery: delivery.clone(),
                sent_at: Instant::now(),
                retries: 0,
            },
        );
        Some(id)
    }

    /// Stop tracking `packet_id`. Returns false for unknown ids.
    pub fn acknowledge(&mut self, packet_id: u16) -> bool {
        self.pending.remove(&packet_id).is_some()
    }

    pub fn get(&self, packet_id: u16) -> Option<&PendingDelivery> {
        self.pending.get(&packet_id)
    }

    /// Collect deliveries not acknowledged within `ack_timeout`. Entries that
    /// already used `max_retries` attempts are dropped; the rest are returned
    /// as duplicates for re-sending. Nothing is counted as an attempt until
    /// `mark_resent` confirms the re-send was queued.
    pub fn sweep(&mut self, now: Instant, ack_timeout: Duration, max_retries: u8) -> RetrySweep {
        let mut sweep = RetrySweep::default();

        for (id, pending) in &self.pending {
            if now.duration_since(pending.sent_at) < ack_timeout {
                continue;
            }
            if pending.retries >= max_retries {
                sweep.dropped.push(*id);
                continue;
            }
            let mut delivery = pending.delivery.clone();
            delivery.dup = true;
            sweep.resend.push(delivery);
        }

        for id in &sweep.dropped {
            self.pending.remove(id);
        }
        sweep.resend.sort_by_key(|d| d.packet_id);
        sweep
    }

    /// Count a re-send of `packet_id` that reached the queue at `now`.
    pub fn mark_resent(&mut self, packet_id: u16, now: Instant) -> bool {
        match self.pending.get_mut(&packet_id) {
            Some(pending) => {
                pending.retries += 1;
                pending.sent_at = now;
                pending.delivery.dup = true;
                true
            }
            None => false,
        }
    }

    /// Record an incoming QoS 2 packet id. Returns false if the id is already
    /// held, meaning the publish is a retransmission.
    pub fn begin_incoming(&mut self, packet_id: u16) -> bool {
        self.incoming.insert(packet_id)
    }

    pub fn release_incoming(&mut self, packet_id: u16) -> bool {
        self.incoming.remove(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn next_free_id(&mut self) -> Option<u16> {
        if self.pending.len() >= usize::from(u16::MAX) {
            return None;
        }
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                continue;
            }
            if !self.pending.contains_key(&self.next_id) {
                return Some(self.next_id);
            }
        }
    }
}
