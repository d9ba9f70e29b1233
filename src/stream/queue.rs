//! Bounded send queue between the encoder and the publisher
//!
//! Pushing never blocks. When the queue is full the oldest packet is
//! dropped, so a stalled connection loses stale media instead of building
//! latency.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

use super::publisher::MediaPacket;

pub struct PacketQueue {
    packets: Mutex<VecDeque<MediaPacket>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            packets: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a packet. Returns false if an older packet was dropped to make room.
    pub fn push(&self, packet: MediaPacket) -> bool {
        let mut dropped_one = false;
        {
            let mut packets = self.packets.lock();
            if packets.len() >= self.capacity {
                packets.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                dropped_one = true;
            }
            packets.push_back(packet);
        }
        self.notify.notify_one();
        !dropped_one
    }

    pub fn try_pop(&self) -> Option<MediaPacket> {
        self.packets.lock().pop_front()
    }

    /// Wait for the next packet
    pub async fn pop(&self) -> MediaPacket {
        loop {
            let notified = self.notify.notified();
            if let Some(packet) = self.try_pop() {
                return packet;
            }
            notified.await;
        }
    }

    pub fn clear(&self) {
        self.packets.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fill level in 0.0..=1.0
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Packets dropped since the last reset
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn reset_dropped(&self) {
        self.dropped.store(0, Ordering::Relaxed);
    }
}
