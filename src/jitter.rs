//! Jitter buffer (C6). Reorders, smooths, and paces decoded-payload delivery.
//! Shared across a receive callback thread (producer) and a playback loop
//! (consumer); all state lives behind one lock, per the concurrency model.

use crate::config::JitterConfig;
use crate::error::VoipError;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

struct JitterState {
    queue: BTreeMap<u32, Vec<u8>>,
    arrival: std::collections::HashMap<u32, f64>,
    next_sequence: u32,
    last_sequence: Option<u32>,
    last_playout_time: f64,
    jitter: f64,
    current_delay: Duration,
    stale_count: u64,
    overflow_count: u64,
}

pub struct JitterBuffer {
    state: Mutex<JitterState>,
    max_size: usize,
    min_size: usize,
    max_delay: Duration,
    target_delay: Duration,
    adaptation_rate: f64,
    adaptive: bool,
    start: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct JitterStats {
    pub buffer_size: usize,
    pub jitter: f64,
    pub current_delay: Duration,
    pub next_sequence: u32,
    pub last_sequence: Option<u32>,
    pub stale_count: u64,
    pub overflow_count: u64,
}

impl JitterBuffer {
    pub fn new(cfg: &JitterConfig) -> Self {
        let target_delay = cfg.target_delay();
        JitterBuffer {
            state: Mutex::new(JitterState {
                queue: BTreeMap::new(),
                arrival: std::collections::HashMap::new(),
                next_sequence: 0,
                last_sequence: None,
                last_playout_time: 0.0,
                jitter: 0.0,
                current_delay: target_delay,
                stale_count: 0,
                overflow_count: 0,
            }),
            max_size: cfg.max_size,
            min_size: cfg.min_size,
            max_delay: cfg.max_delay(),
            target_delay,
            adaptation_rate: cfg.adaptation_rate,
            adaptive: cfg.adaptive,
            start: Instant::now(),
        }
    }

    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Returns `false` (and counts it) when the packet is discarded as stale.
    pub fn add_packet(&self, sequence: u32, payload: Vec<u8>) -> bool {
        let now = self.now();
        self.add_packet_at(sequence, payload, now)
    }

    /// Same as `add_packet` but with an explicit arrival time, for
    /// deterministic tests of the jitter estimator and adaptation curve.
    pub fn add_packet_at(&self, sequence: u32, payload: Vec<u8>, arrival: f64) -> bool {
        let mut s = self.state.lock();

        if let Some(last) = s.last_sequence {
            let floor = last.saturating_sub(self.max_size as u32);
            if sequence < floor {
                s.stale_count += 1;
                let err = VoipError::Stale { sequence, floor };
                warn!(error = %err, "discarding stale media packet");
                return false;
            }
        }

        s.queue.insert(sequence, payload);
        s.arrival.insert(sequence, arrival);

        if s.last_sequence.map_or(true, |last| sequence > last) {
            s.last_sequence = Some(sequence);
        }

        let prev_arrival = sequence
            .checked_sub(1)
            .and_then(|p| s.arrival.get(&p).copied());
        if let Some(prev) = prev_arrival {
            let cur = s.arrival[&sequence];
            let inter_arrival = cur - prev;
            s.jitter += (inter_arrival.abs() - s.jitter) / 16.0;

            if self.adaptive {
                if s.jitter > self.target_delay.as_secs_f64() {
                    let grown = s.current_delay.as_secs_f64() * (1.0 + self.adaptation_rate);
                    s.current_delay = Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()));
                } else {
                    let shrunk = s.current_delay.as_secs_f64() * (1.0 - self.adaptation_rate);
                    s.current_delay =
                        Duration::from_secs_f64(shrunk.max(self.target_delay.as_secs_f64()));
                }
            }
        }

        while s.queue.len() > self.max_size {
            match s.queue.keys().next().copied() {
                Some(lowest) => {
                    s.queue.remove(&lowest);
                    s.arrival.remove(&lowest);
                    s.overflow_count += 1;
                    let err = VoipError::Overflow(format!("jitter buffer over max_size, evicted sequence {lowest}"));
                    warn!(error = %err, "jitter buffer overflow");
                }
                None => break,
            }
        }

        true
    }

    pub fn get_next_packet(&self) -> Option<Vec<u8>> {
        let now = self.now();
        self.get_next_packet_at(now)
    }

    pub fn get_next_packet_at(&self, now: f64) -> Option<Vec<u8>> {
        let mut s = self.state.lock();

        if s.queue.len() < self.min_size {
            return None;
        }
        if now - s.last_playout_time < s.current_delay.as_secs_f64() {
            return None;
        }

        if let Some(payload) = s.queue.remove(&s.next_sequence) {
            s.arrival.remove(&s.next_sequence);
            s.next_sequence = s.next_sequence.wrapping_add(1);
            s.last_playout_time = now;
            return Some(payload);
        }

        if let Some(lowest) = s.queue.keys().next().copied() {
            if lowest > s.next_sequence {
                let payload = s.queue.remove(&lowest).unwrap();
                s.arrival.remove(&lowest);
                s.next_sequence = lowest.wrapping_add(1);
                s.last_playout_time = now;
                return Some(payload);
            }
        }

        None
    }

    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.queue.clear();
        s.arrival.clear();
        s.next_sequence = 0;
        s.last_sequence = None;
        s.last_playout_time = 0.0;
        s.jitter = 0.0;
        s.current_delay = self.target_delay;
        s.stale_count = 0;
        s.overflow_count = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> JitterStats {
        let s = self.state.lock();
        JitterStats {
            buffer_size: s.queue.len(),
            jitter: s.jitter,
            current_delay: s.current_delay,
            next_sequence: s.next_sequence,
            last_sequence: s.last_sequence,
            stale_count: s.stale_count,
            overflow_count: s.overflow_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(min_size: usize, target_delay_secs: f64) -> JitterConfig {
        JitterConfig {
            max_size: 50,
            min_size,
            max_delay_secs: 0.5,
            target_delay_secs,
            adaptation_rate: 0.1,
            adaptive: true,
        }
    }

    #[test]
    fn out_of_order_arrival_drains_in_sequence() {
        let jb = JitterBuffer::new(&cfg(1, 0.0));
        jb.add_packet_at(3, vec![3], 0.0);
        jb.add_packet_at(1, vec![1], 0.0);
        jb.add_packet_at(2, vec![2], 0.0);

        assert_eq!(jb.get_next_packet_at(10.0), Some(vec![1]));
        assert_eq!(jb.get_next_packet_at(10.0), Some(vec![2]));
        assert_eq!(jb.get_next_packet_at(10.0), Some(vec![3]));
        assert_eq!(jb.get_next_packet_at(10.0), None);
    }

    #[test]
    fn duplicate_sequence_overwrites_payload() {
        let jb = JitterBuffer::new(&cfg(1, 0.0));
        jb.add_packet_at(1, vec![1], 0.0);
        jb.add_packet_at(1, vec![99], 0.1);
        assert_eq!(jb.get_next_packet_at(10.0), Some(vec![99]));
    }

    #[test]
    fn gap_skips_to_next_available_and_advances_past_it() {
        let jb = JitterBuffer::new(&cfg(1, 0.0));
        jb.add_packet_at(1, vec![1], 0.0);
        jb.add_packet_at(2, vec![2], 0.0);
        jb.add_packet_at(5, vec![5], 0.0);

        assert_eq!(jb.get_next_packet_at(10.0), Some(vec![1]));
        assert_eq!(jb.get_next_packet_at(10.0), Some(vec![2]));
        assert_eq!(jb.get_next_packet_at(10.0), Some(vec![5]));
        assert_eq!(jb.stats().next_sequence, 6);
    }

    #[test]
    fn stale_packet_is_rejected_without_growing_buffer() {
        let jb = JitterBuffer::new(&cfg(1, 0.0));
        for seq in 951..=1000 {
            jb.add_packet_at(seq, vec![0], 0.0);
        }
        let size_before = jb.len();
        let accepted = jb.add_packet_at(900, vec![0], 0.0);
        assert!(!accepted);
        assert_eq!(jb.len(), size_before);
        assert_eq!(jb.stats().stale_count, 1);
    }

    #[test]
    fn never_exceeds_max_size_at_rest() {
        let mut c = cfg(1, 0.0);
        c.max_size = 5;
        let jb = JitterBuffer::new(&c);
        for seq in 0..20u32 {
            jb.add_packet_at(seq, vec![0], 0.0);
            assert!(jb.len() <= 5);
        }
    }

    #[test]
    fn requires_min_size_before_emitting() {
        let jb = JitterBuffer::new(&cfg(3, 0.0));
        jb.add_packet_at(0, vec![0], 0.0);
        assert_eq!(jb.get_next_packet_at(10.0), None);
        jb.add_packet_at(1, vec![1], 0.0);
        assert_eq!(jb.get_next_packet_at(10.0), None);
        jb.add_packet_at(2, vec![2], 0.0);
        assert_eq!(jb.get_next_packet_at(10.0), Some(vec![0]));
    }

    #[test]
    fn adapts_delay_upward_under_high_jitter_and_caps_at_max() {
        let mut c = cfg(1, 0.1);
        c.max_size = 200;
        let jb = JitterBuffer::new(&c);
        let mut t = 0.0;
        for seq in 0..100u32 {
            jb.add_packet_at(seq, vec![0], t);
            t += if seq % 2 == 0 { 0.01 } else { 0.1 };
        }
        let stats = jb.stats();
        assert!(stats.jitter > 0.0);
        assert!(stats.current_delay.as_secs_f64() > 0.1);
        assert!(stats.current_delay.as_secs_f64() <= 0.5 + 1e-9);
    }

    #[test]
    fn reset_restores_target_delay_and_clears_state() {
        let jb = JitterBuffer::new(&cfg(1, 0.1));
        jb.add_packet_at(0, vec![0], 0.0);
        jb.add_packet_at(1, vec![0], 0.2);
        jb.reset();
        let stats = jb.stats();
        assert_eq!(stats.buffer_size, 0);
        assert_eq!(stats.next_sequence, 0);
        assert_eq!(stats.last_sequence, None);
        assert_eq!(stats.current_delay.as_secs_f64(), 0.1);
    }
}
