//! Running one downstream call per batch group, concurrently, with each
//! group's outcome captured independently of its siblings.

use std::{any::Any, num::NonZeroUsize, panic::AssertUnwindSafe, time::Duration};

use futures::{
    future::{self, Either},
    pin_mut, stream, FutureExt, StreamExt,
};
use futures_timer::Delay;
use tokio_util::sync::CancellationToken;

use crate::{
    fetch::{BatchLoad, ErrorDescriptor, Status},
    group::BatchGroup,
};

/// What one group's downstream call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOutcome<Payload> {
    Payload(Payload),
    /// The call returned an error or never completed normally.
    Failed(ErrorDescriptor),
    /// The cancellation token fired before the call completed.
    Cancelled,
}

impl<Payload> RawOutcome<Payload> {
    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, RawOutcome::Failed(..))
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RawOutcome::Cancelled)
    }
}

/// Limits applied to one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecLimits {
    /// Maximum number of group calls in flight at once. Unlimited if `None`.
    pub max_concurrency: Option<NonZeroUsize>,
    /// Deadline for each group call. Calls past it fail with a timeout.
    pub fetch_timeout: Option<Duration>,
}

/// One group together with the outcome of its downstream call.
pub type Executed<L> = (
    BatchGroup<<L as BatchLoad>::Group, <L as BatchLoad>::Key>,
    RawOutcome<<L as BatchLoad>::Payload>,
);

/// Issue one fetch per group and wait for all of them. Results are returned
/// in the same order as `groups`. A failure in one group never affects
/// another; cancelling `cancel` aborts every call still in flight.
pub async fn execute<L: BatchLoad>(
    loader: &L,
    groups: Vec<BatchGroup<L::Group, L::Key>>,
    cancel: &CancellationToken,
    limits: ExecLimits,
) -> Vec<Executed<L>> {
    let calls = groups
        .into_iter()
        .map(|group| run_group(loader, group, cancel, limits.fetch_timeout));

    match limits.max_concurrency {
        None => future::join_all(calls).await,
        Some(limit) => stream::iter(calls).buffered(limit.get()).collect().await,
    }
}

async fn run_group<L: BatchLoad>(
    loader: &L,
    group: BatchGroup<L::Group, L::Key>,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Executed<L> {
    if cancel.is_cancelled() {
        return (group, RawOutcome::Cancelled);
    }

    tracing::trace!(
        group = ?group.params(),
        ordinal = group.ordinal(),
        keys = group.len(),
        "fetching batch group"
    );

    let outcome = {
        let fetch = AssertUnwindSafe(loader.fetch(&group, cancel)).catch_unwind();
        let deadline = match timeout {
            Some(timeout) => Either::Left(Delay::new(timeout)),
            None => Either::Right(future::pending::<()>()),
        };
        let cancelled = cancel.cancelled();
        pin_mut!(fetch, deadline, cancelled);

        match future::select(cancelled, future::select(fetch, deadline)).await {
            Either::Left(..) => RawOutcome::Cancelled,
            Either::Right((Either::Left((Ok(Ok(payload)), _)), _)) => RawOutcome::Payload(payload),
            Either::Right((Either::Left((Ok(Err(err)), _)), _)) => RawOutcome::Failed(err),
            Either::Right((Either::Left((Err(panic), _)), _)) => {
                RawOutcome::Failed(ErrorDescriptor::new(Status::Other, panic_message(&*panic)))
            }
            Either::Right((Either::Right(..), _)) => RawOutcome::Failed(ErrorDescriptor::timeout(
                format!("batch fetch exceeded {:?}", timeout.unwrap_or_default()),
            )),
        }
    };

    match &outcome {
        RawOutcome::Failed(err) if !err.is_no_content() => tracing::warn!(
            group = ?group.params(),
            ordinal = group.ordinal(),
            keys = group.len(),
            status = %err.status,
            error = %err.message,
            "batch group failed"
        ),
        RawOutcome::Cancelled => tracing::debug!(
            group = ?group.params(),
            ordinal = group.ordinal(),
            "batch group cancelled"
        ),
        _ => {}
    }

    (group, outcome)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    };

    format!("batch fetch panicked: {}", detail)
}
