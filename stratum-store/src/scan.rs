//! Reference scanning.
//!
//! References of a freshly built or mutated path are discovered by
//! scanning its archive serialisation for the base32 hash parts of every
//! candidate path. The scanner slides a window over the byte stream and
//! validates characters right to left against the base32 alphabet,
//! skipping ahead past the first invalid character, so binary data is
//! traversed in large steps.

use std::collections::{BTreeSet, HashSet};

use stratum_store_core::base32;
use stratum_store_core::store_path::{StoreDirs, PATH_HASH_LEN};

const HASH_LEN: usize = PATH_HASH_LEN;

/// A streaming scanner over archive bytes. Feed chunks with
/// [`feed`](Self::feed), collect results with
/// [`found_paths`](Self::found_paths).
pub struct RefScanSink {
    /// Hash parts still being looked for; removed on first match.
    pending: HashSet<[u8; HASH_LEN]>,
    seen: HashSet<[u8; HASH_LEN]>,
    /// Map from hash part back to the full path for result construction.
    back_map: Vec<([u8; HASH_LEN], String)>,
    /// Tail of the previous chunk, for matches spanning a boundary.
    tail: Vec<u8>,
}

impl RefScanSink {
    /// Build a scanner for the hash parts of `candidates`.
    pub fn new<'a>(dirs: &StoreDirs, candidates: impl Iterator<Item = &'a str>) -> Self {
        let mut pending = HashSet::new();
        let mut back_map = Vec::new();

        for path in candidates {
            let Some(part) = dirs.hash_part(path) else {
                continue;
            };
            let mut buf = [0u8; HASH_LEN];
            buf.copy_from_slice(part.as_bytes());
            if pending.insert(buf) {
                back_map.push((buf, path.to_string()));
            }
        }

        RefScanSink {
            pending,
            seen: HashSet::new(),
            back_map,
            tail: Vec::with_capacity(HASH_LEN),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        if self.pending.is_empty() {
            return;
        }

        let tail_len = data.len().min(HASH_LEN);

        // Search the boundary region first: old tail plus the head of the
        // new chunk.
        if !self.tail.is_empty() {
            let mut overlap = self.tail.clone();
            overlap.extend_from_slice(&data[..tail_len]);
            search(&overlap, &mut self.pending, &mut self.seen);
        }

        search(data, &mut self.pending, &mut self.seen);

        let rest = HASH_LEN - tail_len;
        if rest < self.tail.len() {
            self.tail.drain(..self.tail.len() - rest);
        }
        self.tail.extend_from_slice(&data[data.len() - tail_len..]);
    }

    /// The candidate paths whose hash parts appeared in the stream.
    pub fn found_paths(&self) -> BTreeSet<String> {
        self.back_map
            .iter()
            .filter(|(hash, _)| self.seen.contains(hash))
            .map(|(_, path)| path.clone())
            .collect()
    }
}

fn search(data: &[u8], pending: &mut HashSet<[u8; HASH_LEN]>, seen: &mut HashSet<[u8; HASH_LEN]>) {
    if data.len() < HASH_LEN {
        return;
    }

    let mut i = 0;
    while i + HASH_LEN <= data.len() {
        let mut j = HASH_LEN;
        loop {
            if j == 0 {
                break;
            }
            j -= 1;
            if !base32::is_base32_char(data[i + j]) {
                i += j + 1;
                break;
            }
        }
        if j > 0 {
            // invalid character inside the window, i already advanced
            continue;
        }

        let window: [u8; HASH_LEN] = data[i..i + HASH_LEN].try_into().expect("window length");
        if pending.remove(&window) {
            seen.insert(window);
        }

        i += 1;
    }
}
