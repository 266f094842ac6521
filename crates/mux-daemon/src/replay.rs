//! Session output history and the viewer-supplied contents snapshot.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::counter::WrapCount;

const MIN_GROWTH: usize = 1024;
const SHRINK_SLACK: usize = 512;
const GZIP_THRESHOLD: usize = 4096;

// ── Replay buffer ───────────────────────────────────────────────────

/// Bytes read from the pty that some viewer may still need.
///
/// `baseline` is the wrapping count of the first retained byte, so the count
/// of everything read so far is `baseline + len`.
#[derive(Debug, Default)]
pub struct ReplayBuffer {
    buf: Vec<u8>,
    baseline: WrapCount,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn read_count(&self) -> WrapCount {
        self.baseline.advance(self.buf.len())
    }

    pub fn append(&mut self, data: &[u8]) {
        let needed = self.buf.len() + data.len();
        if needed > self.buf.capacity() {
            let target = MIN_GROWTH
                .max(3 * self.buf.capacity() / 2)
                .max(needed);
            self.buf.reserve_exact(target - self.buf.len());
        }
        self.buf.extend_from_slice(data);
    }

    /// Retained bytes after `count`, or `None` when `count` is not strictly
    /// inside the retained window (already caught up, ahead, or trimmed).
    pub fn tail_since(&self, count: WrapCount) -> Option<&[u8]> {
        let missing = self.read_count().distance_from(count) as usize;
        if missing == 0 || missing > self.buf.len() {
            return None;
        }
        Some(&self.buf[self.buf.len() - missing..])
    }

    /// Drop history no viewer still needs.
    ///
    /// `max_unconfirmed` is the largest distance any reader is behind
    /// `read_count`. Compaction only happens once that is under two thirds
    /// of the retained length.
    pub fn trim(&mut self, max_unconfirmed: u32) {
        let max = max_unconfirmed as usize;
        let len = self.buf.len();
        if len == 0 || max >= 2 * len / 3 {
            return;
        }
        let unneeded = len - max;
        self.buf.drain(..unneeded);
        self.baseline = self.baseline.advance(unneeded);
        if self.buf.capacity() >= 2 * max {
            self.buf.shrink_to(max + SHRINK_SLACK);
        }
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Serialized window contents a viewer reported, tagged with the output
/// count it corresponds to. Large blobs are kept gzipped.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub count: WrapCount,
    data: SnapshotData,
}

#[derive(Debug, Clone)]
enum SnapshotData {
    Plain(String),
    Gzip(Vec<u8>),
}

impl Snapshot {
    pub fn new(count: WrapCount, blob: String) -> Self {
        let data = if blob.len() >= GZIP_THRESHOLD {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            match encoder.write_all(blob.as_bytes()).and_then(|_| encoder.finish()) {
                Ok(compressed) if compressed.len() < blob.len() => SnapshotData::Gzip(compressed),
                _ => SnapshotData::Plain(blob),
            }
        } else {
            SnapshotData::Plain(blob)
        };
        Self { count, data }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.data, SnapshotData::Gzip(_))
    }

    pub fn blob(&self) -> String {
        match &self.data {
            SnapshotData::Plain(s) => s.clone(),
            SnapshotData::Gzip(bytes) => {
                let mut out = String::new();
                let mut decoder = GzDecoder::new(&bytes[..]);
                if decoder.read_to_string(&mut out).is_err() {
                    tracing::warn!("stored snapshot failed to decompress");
                    out.clear();
                }
                out
            }
        }
    }
}

// ── Strip terminal query sequences ──────────────────────────────────

/// Remove cursor-position and device-attribute queries from replayed output
/// so a reattaching terminal does not answer them a second time.
pub fn strip_terminal_queries(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if data[i] == 0x1b && i + 1 < data.len() && data[i + 1] == b'[' {
            let mut j = i + 2;
            while j < data.len() && (0x20..=0x3f).contains(&data[j]) {
                j += 1;
            }
            if j < data.len() {
                let params = std::str::from_utf8(&data[i + 2..j]).unwrap_or("");
                let is_dsr = data[j] == b'n' && matches!(params, "5" | "6" | "?6");
                let is_da = data[j] == b'c' && matches!(params, "" | ">" | "=" | "0");
                if is_dsr || is_da {
                    i = j + 1;
                    continue;
                }
            }
        }
        result.push(data[i]);
        i += 1;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MASK;

    // ── ReplayBuffer tests ──────────────────────────────────────────

    #[test]
    fn append_tracks_read_count() {
        let mut buf = ReplayBuffer::new();
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.read_count(), WrapCount::new(11));
    }

    #[test]
    fn growth_is_at_least_half_again() {
        let mut buf = ReplayBuffer::new();
        buf.append(&[b'a'; 10]);
        assert!(buf.capacity() >= MIN_GROWTH);
        let cap = buf.capacity();
        buf.append(&vec![b'b'; cap]);
        assert!(buf.capacity() >= 3 * cap / 2);
    }

    #[test]
    fn tail_since_returns_missing_bytes() {
        let mut buf = ReplayBuffer::new();
        buf.append(b"abcdef");
        assert_eq!(buf.tail_since(WrapCount::new(4)), Some(&b"ef"[..]));
        assert_eq!(buf.tail_since(WrapCount::new(0)), Some(&b"abcdef"[..]));
    }

    #[test]
    fn tail_since_rejects_caught_up_and_future_counts() {
        let mut buf = ReplayBuffer::new();
        buf.append(b"abcdef");
        assert_eq!(buf.tail_since(WrapCount::new(6)), None);
        assert_eq!(buf.tail_since(WrapCount::new(9)), None);
    }

    #[test]
    fn trim_keeps_needed_tail() {
        let mut buf = ReplayBuffer::new();
        buf.append(&[b'x'; 90]);
        buf.append(b"0123456789");
        buf.trim(10);
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.read_count(), WrapCount::new(100));
        assert_eq!(buf.tail_since(WrapCount::new(95)), Some(&b"56789"[..]));
        // Trimmed bytes can no longer be replayed.
        assert_eq!(buf.tail_since(WrapCount::new(50)), None);
    }

    #[test]
    fn trim_waits_until_readers_catch_up() {
        let mut buf = ReplayBuffer::new();
        buf.append(&[b'x'; 30]);
        buf.trim(25);
        assert_eq!(buf.len(), 30);
        buf.trim(19);
        assert_eq!(buf.len(), 19);
    }

    #[test]
    fn trim_shrinks_large_allocation() {
        let mut buf = ReplayBuffer::new();
        buf.append(&vec![b'x'; 100_000]);
        buf.trim(100);
        assert_eq!(buf.len(), 100);
        assert!(buf.capacity() < 100_000);
    }

    #[test]
    fn counts_wrap_with_baseline() {
        let mut buf = ReplayBuffer {
            buf: Vec::new(),
            baseline: WrapCount::new(MASK - 1),
        };
        buf.append(b"abcd");
        assert_eq!(buf.read_count(), WrapCount::new(2));
        assert_eq!(buf.tail_since(WrapCount::new(0)), Some(&b"cd"[..]));
    }

    // ── Snapshot tests ──────────────────────────────────────────────

    #[test]
    fn small_snapshot_stays_plain() {
        let snap = Snapshot::new(WrapCount::new(3), "<pre>hi</pre>".into());
        assert!(!snap.is_compressed());
        assert_eq!(snap.blob(), "<pre>hi</pre>");
    }

    #[test]
    fn large_snapshot_is_compressed() {
        let blob = "<div>line</div>".repeat(1000);
        let snap = Snapshot::new(WrapCount::new(3), blob.clone());
        assert!(snap.is_compressed());
        assert_eq!(snap.blob(), blob);
    }

    // ── strip_terminal_queries tests ────────────────────────────────

    #[test]
    fn strip_dsr_sequence() {
        assert_eq!(strip_terminal_queries(b"before\x1b[6nafter"), b"beforeafter");
    }

    #[test]
    fn strip_da_variants() {
        for q in [&b"\x1b[c"[..], b"\x1b[>c", b"\x1b[=c", b"\x1b[0c"] {
            let mut input = b"a".to_vec();
            input.extend_from_slice(q);
            input.push(b'b');
            assert_eq!(strip_terminal_queries(&input), b"ab");
        }
    }

    #[test]
    fn keeps_other_csi() {
        let input = b"\x1b[31mred\x1b[0m\x1b[2J";
        assert_eq!(strip_terminal_queries(input), input.to_vec());
    }

    #[test]
    fn keeps_truncated_sequence() {
        assert_eq!(strip_terminal_queries(b"x\x1b[6"), b"x\x1b[6");
    }
}
