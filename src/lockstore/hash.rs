//! Bucket hashing for lock keys.

/// Jenkins one-at-a-time hash, fed incrementally.
#[derive(Clone, Copy, Debug, Default)]
pub struct OneAtATime {
    state: u32,
}

impl OneAtATime {
    pub const fn new() -> Self {
        Self { state: 0 }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        let mut hash = self.state;
        for byte in bytes {
            hash = hash.wrapping_add(u32::from(*byte));
            hash = hash.wrapping_add(hash << 10);
            hash ^= hash >> 6;
        }
        self.state = hash;
    }

    pub fn finish(self) -> u32 {
        let mut hash = self.state;
        hash = hash.wrapping_add(hash << 3);
        hash ^= hash >> 11;
        hash = hash.wrapping_add(hash << 15);
        hash
    }
}

pub fn one_at_a_time(bytes: &[u8]) -> u32 {
    let mut hasher = OneAtATime::new();
    hasher.update(bytes);
    hasher.finish()
}

/// Combined shift for integer pairs.
pub fn pair_hash(level1: u16, level2: u16) -> u32 {
    (u32::from(level1) << 16) ^ u32::from(level2)
}
