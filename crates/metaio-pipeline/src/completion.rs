//! Completion processor: the bottom half of the pipeline
//!
//! Storage callbacks only push events onto the completion queue. This
//! loop pops them (by priority weight), feeds each result into its page
//! unit and drives the unit on: a follow-up I/O is submitted, or the unit
//! is released to the pool (or left resident in the reuse cache) and its
//! orchestrator is told. The orchestrator's last unit unlocks its pages
//! and notifies the client.

use crate::shared::PipelineCore;
use std::sync::Arc;

/// Events handled per poll at most
const COMPLETION_BATCH: usize = 32;

/// Bottom-half polling loop
#[derive(Debug)]
pub struct CompletionProcessor {
    core: Arc<PipelineCore>,
}

impl CompletionProcessor {
    pub(crate) const fn new(core: Arc<PipelineCore>) -> Self {
        Self { core }
    }

    /// Handle queued completions; returns whether any were handled
    pub fn poll(&mut self) -> bool {
        let mut handled = 0;
        while handled < COMPLETION_BATCH {
            let Some(event) = self.core.next_completion() else {
                break;
            };
            self.core.handle_completion(event);
            handled += 1;
        }
        handled > 0
    }
}
