/// Holds locally discovered ICE candidates until the client asks for them.
///
/// Candidates recorded before [`CandidateBuffer::mark_ready`] are queued in
/// arrival order; the first `mark_ready` call releases them all and every later
/// candidate is released as soon as it is recorded. Readiness never resets.
#[derive(Debug)]
pub struct CandidateBuffer<T> {
    pending: Vec<T>,
    ready: bool,
}

impl<T> Default for CandidateBuffer<T> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            ready: false,
        }
    }
}

impl<T> CandidateBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns the candidate back when it should be sent right away.
    pub fn record(&mut self, candidate: T) -> Option<T> {
        if self.ready {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    /// Flips to ready and drains everything buffered so far, oldest first.
    /// Calls after the first return an empty batch.
    pub fn mark_ready(&mut self) -> Vec<T> {
        self.ready = true;
        std::mem::take(&mut self.pending)
    }
}
