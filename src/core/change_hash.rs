use std::sync::atomic::{AtomicU32, Ordering};

use crc32fast::Hasher;

/// Running CRC32 over the ids of applied change logs.
///
/// Two nodes that applied the same ordered sequence of ids report the same value, which
/// makes it a cheap divergence check across a cluster.
#[derive(Debug, Default)]
pub struct ChangeHash {
    value: AtomicU32,
}

pub fn chain(prev: u32, id: &str) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&prev.to_be_bytes());
    hasher.update(id.as_bytes());
    hasher.finalize()
}

impl ChangeHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Fold `id` into the chain and return the new value.
    pub fn roll(&self, id: &str) -> u32 {
        let mut prev = self.value.load(Ordering::Acquire);
        loop {
            let next = chain(prev, id);
            match self
                .value
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(current) => prev = current,
            }
        }
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Release);
    }
}
