use tracing::info;

use super::{Coordinator, CoordinatorError, IngestMessage};
use crate::allocator::{AllocationKind, SubmitOutcome};
use crate::protocol::{NewAddressRange, Request, Response, SubmitAddressRange};

impl Coordinator {
    pub(super) async fn new_address_range(&self, request: &Request) -> Result<Response, CoordinatorError> {
        let worker_id = request
            .worker_id
            .as_deref()
            .ok_or(CoordinatorError::MissingWorkerId("NewAddressRange"))?;

        let allocation = self.allocator.allocate(worker_id).await?;
        match allocation.kind {
            AllocationKind::Validation => self.metrics.validations_issued.inc(),
            AllocationKind::Reclaimed => self.metrics.batches_reclaimed.inc(),
            AllocationKind::Fresh => self.metrics.batches_issued.inc(),
        }

        let batch = &allocation.batch;
        info!(
            worker = worker_id,
            batch = %batch.id,
            from = %batch.start_address(),
            to = %batch.end_address(),
            kind = ?allocation.kind,
            "address range assigned"
        );

        let range = NewAddressRange {
            batch_id: batch.id.clone(),
            epoch: batch.epoch,
            start: batch.start,
            count: batch.count,
            is_validation: allocation.is_validation(),
        };
        Ok(Response::ok(&range)?.with_message(allocation.message()))
    }

    /// Batch state is durable before the reply; host records are handed to
    /// the ingestion task.
    pub(super) async fn submit_address_range(&self, request: &Request) -> Result<Response, CoordinatorError> {
        let worker_id = request
            .worker_id
            .clone()
            .ok_or(CoordinatorError::MissingWorkerId("SubmitAddressRange"))?;
        let submission: SubmitAddressRange = request
            .payload()?
            .ok_or(CoordinatorError::MissingPayload("SubmitAddressRange"))?;

        // Nothing is reconciled unless its hosts can still be queued, so a
        // failed submission stays retryable.
        if !submission.hosts.is_empty() && self.ingest.is_closed() {
            return Err(CoordinatorError::IngestClosed);
        }

        let found = submission.found_count();
        let reconciled = self.allocator.reconcile(&submission.batch_id, found).await?;

        match reconciled.outcome {
            SubmitOutcome::Completed if !submission.hosts.is_empty() => {
                self.ingest.submit(IngestMessage::Hosts {
                    worker_id,
                    epoch: reconciled.batch.epoch,
                    hosts: submission.hosts,
                })?;
            }
            SubmitOutcome::ValidationFailed => self.metrics.validations_failed.inc(),
            _ => {}
        }

        Ok(Response::success(serde_json::Value::Null).with_message(reconciled.outcome.message()))
    }
}
