use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct ResponseProgress {
    /// Server-bound outputs dispatched but not yet written.
    outstanding: usize,
    written: usize,
    done: bool,
}

/// Decides when the model may continue after server-bound tool results.
///
/// A response that asked for server-bound tools gets exactly one
/// `response.create`, sent once its `response.done` has been seen and every
/// one of its outputs has been written upstream. Owned by the upstream pump.
#[derive(Debug, Default)]
pub struct ContinuationTracker {
    responses: HashMap<String, ResponseProgress>,
    /// Responses whose `response.done` arrived with nothing outstanding.
    finished: HashSet<String>,
}

impl ContinuationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A server-bound output for `response_id` is on its way.
    pub fn expect_output(&mut self, response_id: &str) {
        let done = self.finished.contains(response_id);
        let progress = self.responses.entry(response_id.to_string()).or_default();
        progress.outstanding += 1;
        progress.done |= done;
    }

    /// The output was written. Returns `true` if the continuation is due now.
    pub fn output_written(&mut self, response_id: &str) -> bool {
        let Some(progress) = self.responses.get_mut(response_id) else {
            return false;
        };
        progress.outstanding = progress.outstanding.saturating_sub(1);
        progress.written += 1;
        self.settle(response_id)
    }

    /// The output will never be written, e.g. the session is closing.
    pub fn output_abandoned(&mut self, response_id: &str) -> bool {
        let Some(progress) = self.responses.get_mut(response_id) else {
            return false;
        };
        progress.outstanding = progress.outstanding.saturating_sub(1);
        self.settle(response_id)
    }

    /// `response.done` for `response_id`. Returns `true` if the continuation
    /// is due now.
    pub fn response_done(&mut self, response_id: &str) -> bool {
        match self.responses.get_mut(response_id) {
            Some(progress) => {
                progress.done = true;
                self.settle(response_id)
            }
            None => {
                self.finished.insert(response_id.to_string());
                false
            }
        }
    }

    /// Responses still waiting on outputs or on their `response.done`.
    pub fn waiting(&self) -> usize {
        self.responses.len()
    }

    fn settle(&mut self, response_id: &str) -> bool {
        let ready = match self.responses.get(response_id) {
            Some(p) if p.done && p.outstanding == 0 => p.written > 0,
            _ => return false,
        };
        self.responses.remove(response_id);
        self.finished.insert(response_id.to_string());
        ready
    }
}
