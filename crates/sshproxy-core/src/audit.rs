//! Optional keystroke-capture mirror. Grounded in
//! `original_source/proxy/cwrapper/main.go`'s `typeWriterReadCloser`, which
//! wraps a `Read()` call and emits a synthetic "type" script fragment for
//! whatever bytes passed through. Not wired into the stdin data-copy path by
//! default (spec.md §9 leaves this an open question), so it's exposed as a
//! standalone utility a caller can layer on top of `SplicedChannel::send_stdin`
//! if they need it.

use std::time::{Duration, Instant};

/// One observed write, with the delay since the previous write — mirrors
/// the `.wait(ms)` fragments `typeWriterReadCloser` emits.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub since_previous: Duration,
    pub bytes: Vec<u8>,
}

/// Buffers timestamped copies of data passed through [`Tee::observe`]. Holds
/// the last `capacity` events; older ones are dropped.
pub struct Tee {
    capacity: usize,
    events: Vec<AuditEvent>,
    last_seen: Option<Instant>,
}

impl Tee {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Vec::new(),
            last_seen: None,
        }
    }

    pub fn observe(&mut self, data: &[u8]) {
        let now = Instant::now();
        let since_previous = self
            .last_seen
            .map(|prev| now.duration_since(prev))
            .unwrap_or_default();
        self.last_seen = Some(now);

        if self.events.len() == self.capacity {
            self.events.remove(0);
        }
        self.events.push(AuditEvent {
            since_previous,
            bytes: data.to_vec(),
        });
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_event_past_capacity() {
        let mut tee = Tee::new(2);
        tee.observe(b"a");
        tee.observe(b"b");
        tee.observe(b"c");

        assert_eq!(tee.events().len(), 2);
        assert_eq!(tee.events()[0].bytes, b"b");
        assert_eq!(tee.events()[1].bytes, b"c");
    }
}
