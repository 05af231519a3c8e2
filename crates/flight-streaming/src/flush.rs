//! Explicit flush control - no implicit buffering.

/// Flush policy for payload sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Forward every chunk as soon as it arrives.
    #[default]
    Immediate,
    /// Coalesce chunks until at least `max_bytes` are pending.
    Coalesce { max_bytes: usize },
}

/// Controller deciding when buffered bytes go out.
#[derive(Debug, Default)]
pub struct FlushController {
    policy: FlushPolicy,
    pending: Vec<u8>,
    flushes: usize,
}

impl FlushController {
    /// Create a new flush controller with given policy.
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
            flushes: 0,
        }
    }

    /// Buffer a chunk, returning the bytes to send now, if any.
    pub fn push(&mut self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        match self.policy {
            FlushPolicy::Immediate if self.pending.is_empty() => {
                self.flushes += 1;
                Some(chunk)
            }
            FlushPolicy::Immediate => {
                self.pending.extend_from_slice(&chunk);
                self.take()
            }
            FlushPolicy::Coalesce { max_bytes } => {
                self.pending.extend_from_slice(&chunk);
                if self.pending.len() >= max_bytes {
                    self.take()
                } else {
                    None
                }
            }
        }
    }

    /// Take whatever is still pending.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        self.flushes += 1;
        Some(std::mem::take(&mut self.pending))
    }

    /// Bytes waiting for the next flush.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Number of flushes handed out so far.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Get current policy.
    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }
}
