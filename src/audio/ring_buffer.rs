//! Fixed-capacity circular capture buffer with a sequence stamp for cheap
//! "anything new since last search?" checks.

/// Result of asking the ring for audio to search.
#[derive(Debug, PartialEq, Eq)]
pub enum Snapshot {
    /// No quantum of new audio since the last accepted snapshot.
    Unchanged,
    /// New audio exists but the ring holds fewer than the minimum bytes.
    TooShort { available: usize },
    /// Chronologically ordered copy of the ring contents.
    Audio { pcm: Vec<u8>, sequence: u64 },
}

#[derive(Debug)]
pub struct CaptureRing {
    buf: Vec<u8>,
    cursor: usize,
    wrapped: bool,
    sequence: u64,
    since_tick: usize,
    quantum: usize,
    searched: u64,
}

impl CaptureRing {
    /// `capacity` bytes of storage; `sequence` advances once per `quantum` bytes.
    pub fn new(capacity: usize, quantum: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(2)],
            cursor: 0,
            wrapped: false,
            sequence: 0,
            since_tick: 0,
            quantum: quantum.max(1),
            searched: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bytes currently holding valid audio.
    pub fn len(&self) -> usize {
        if self.wrapped { self.capacity() } else { self.cursor }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&mut self, mut data: &[u8]) {
        let capacity = self.capacity();
        if self.cursor > capacity {
            log::warn!(
                "Capture ring cursor {} beyond capacity {}, resetting",
                self.cursor,
                capacity
            );
            self.cursor = 0;
            self.wrapped = true;
        }

        self.since_tick += data.len();
        while self.since_tick >= self.quantum {
            self.since_tick -= self.quantum;
            self.sequence += 1;
        }

        while !data.is_empty() {
            if self.cursor == capacity {
                self.cursor = 0;
                self.wrapped = true;
            }
            let n = data.len().min(capacity - self.cursor);
            self.buf[self.cursor..self.cursor + n].copy_from_slice(&data[..n]);
            self.cursor += n;
            data = &data[n..];
        }
    }

    /// Copy the ring out in write order if new audio arrived since the last
    /// returned [`Snapshot::Audio`] and at least `min_bytes` are held.
    pub fn snapshot(&mut self, min_bytes: usize) -> Snapshot {
        if self.sequence == self.searched {
            return Snapshot::Unchanged;
        }
        let available = self.len();
        if available < min_bytes {
            return Snapshot::TooShort { available };
        }

        let pcm = if self.wrapped {
            let mut out = Vec::with_capacity(self.capacity());
            out.extend_from_slice(&self.buf[self.cursor..]);
            out.extend_from_slice(&self.buf[..self.cursor]);
            out
        } else {
            self.buf[..self.cursor].to_vec()
        };

        self.searched = self.sequence;
        Snapshot::Audio {
            pcm,
            sequence: self.sequence,
        }
    }

    /// Drop held audio so it is not searched again. The sequence keeps
    /// counting from where it was.
    pub fn clear(&mut self) {
        self.cursor = 0;
        self.wrapped = false;
        self.since_tick = 0;
        self.searched = self.sequence;
    }
}
