//! Deadline-bounded pipeline dispatch.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::pipeline::{Pipeline, PipelineError, PipelineOutcome, PipelineRequest};

/// How a dispatched run ended, from the orchestrator's point of view.
#[derive(Debug)]
pub enum DispatchResult {
    Finished(Result<PipelineOutcome, PipelineError>),
    /// The deadline passed; cancellation was requested but not awaited
    TimedOut,
}

/// Runs the pipeline on its own task and waits at most `deadline`.
///
/// On expiry the run's token is cancelled and its task is detached, so the
/// caller records the failure without waiting for the run to wind down.
/// `shutdown` cancellation propagates into the run as well.
pub async fn dispatch_with_deadline(
    pipeline: Arc<dyn Pipeline>,
    request: PipelineRequest,
    deadline: Duration,
    shutdown: &CancellationToken,
) -> DispatchResult {
    let cancel = shutdown.child_token();
    let run_token = cancel.clone();
    let tenant_id = request.tenant_id;
    let mut handle = tokio::spawn(async move { pipeline.run(request, run_token).await });

    match tokio::time::timeout(deadline, &mut handle).await {
        Ok(Ok(result)) => DispatchResult::Finished(result),
        Ok(Err(join_err)) => {
            warn!(%tenant_id, error = %join_err, "Pipeline task aborted");
            DispatchResult::Finished(Err(PipelineError::aborted(join_err.to_string())))
        }
        Err(_) => {
            cancel.cancel();
            // Dropping the handle detaches the task; it observes the token.
            drop(handle);
            DispatchResult::TimedOut
        }
    }
}
