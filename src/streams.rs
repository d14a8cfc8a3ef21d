//! The connection-wide stream table (§3 "Connection state", §4.3). Keyed
//! concurrent map generalized from the teacher's `StreamCoordinator`, plus
//! the rapid-reset mitigation from §4.3's closing note: a client that resets
//! more than 100 streams in a rolling 10-second window is abusing the
//! connection and gets GOAWAY(ENHANCE_YOUR_CALM).
use crate::error::H2Error;
use crate::stream::Stream;
use crate::types::NonZeroStreamId;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const RAPID_RESET_LIMIT: usize = 100;
const RAPID_RESET_WINDOW: Duration = Duration::from_secs(10);

pub struct StreamMap {
    next_id: AtomicU32,
    streams: DashMap<NonZeroStreamId, Stream>,
    resets: Mutex<VecDeque<Instant>>,
}

impl StreamMap {
    /// Allocates the next client-initiated stream id. Starts at 1 and
    /// advances by 2, per §3's "next-client-stream-id counter".
    pub fn allocate_id(&self) -> NonZeroStreamId {
        let raw = self.next_id.fetch_add(2, Ordering::SeqCst);
        NonZeroStreamId::new(raw).expect("stream id counter wrapped to zero")
    }

    pub fn insert(&self, stream: Stream) {
        self.streams.insert(stream.id, stream);
    }

    pub fn with_stream<T>(&self, id: NonZeroStreamId, f: impl FnOnce(&mut Stream) -> T) -> Option<T> {
        self.streams.get_mut(&id).map(|mut s| f(s.value_mut()))
    }

    pub fn remove(&self, id: NonZeroStreamId) -> Option<Stream> {
        self.streams.remove(&id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn drain_all(&self) -> Vec<Stream> {
        let ids: Vec<_> = self.streams.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Fails every stream with an id greater than `last_stream_id` (§4.5
    /// GOAWAY handling): streams the peer has already processed are left
    /// alone to finish normally.
    pub fn fail_streams_after(&self, last_stream_id: u32, mut make_err: impl FnMut(u32) -> H2Error) {
        let ids: Vec<_> = self
            .streams
            .iter()
            .map(|e| *e.key())
            .filter(|id| id.get() > last_stream_id)
            .collect();
        for id in ids {
            if let Some(mut stream) = self.remove(id) {
                stream.fail(make_err(id.get()));
            }
        }
    }

    /// Applies `f` to every live stream, for propagating a
    /// `SETTINGS_INITIAL_WINDOW_SIZE` delta across open streams (§4.4).
    pub fn for_each(&self, mut f: impl FnMut(&mut Stream)) {
        for mut entry in self.streams.iter_mut() {
            f(entry.value_mut());
        }
    }

    /// Records an inbound RST_STREAM and reports whether the peer has
    /// crossed the rapid-reset abuse threshold.
    pub fn note_reset_and_check_abuse(&self) -> bool {
        let mut resets = self.resets.lock().expect("resets lock poisoned");
        let now = Instant::now();
        resets.push_back(now);
        while let Some(&front) = resets.front() {
            if now.duration_since(front) > RAPID_RESET_WINDOW {
                resets.pop_front();
            } else {
                break;
            }
        }
        resets.len() > RAPID_RESET_LIMIT
    }
}

impl Default for StreamMap {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            streams: DashMap::new(),
            resets: Mutex::new(VecDeque::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_ids_are_odd_and_increasing() {
        let map = StreamMap::default();
        assert_eq!(map.allocate_id().get(), 1);
        assert_eq!(map.allocate_id().get(), 3);
        assert_eq!(map.allocate_id().get(), 5);
    }

    #[test]
    fn rapid_reset_threshold_trips_past_limit() {
        let map = StreamMap::default();
        for _ in 0..RAPID_RESET_LIMIT {
            assert!(!map.note_reset_and_check_abuse());
        }
        assert!(map.note_reset_and_check_abuse());
    }
}
