use async_trait::async_trait;

use prism_core::{Lane, LaneRequest, LaneResult};

/// One retrieval backend. Implementations must never panic or return an
/// error past this boundary: any fault becomes a [`LaneResult`] with
/// `status = Error` and empty items. The orchestrator enforces deadlines
/// around the call, so an adapter that overruns is simply dropped.
#[async_trait]
pub trait RetrievalLane: Send + Sync {
    fn lane(&self) -> Lane;

    async fn search(&self, request: &LaneRequest) -> LaneResult;
}
