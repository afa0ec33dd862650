//! Blocking one-shot submissions for setup-time work such as texture uploads.

use crate::backend::{CommandContext, GpuBackend, SubmitDesc};
use crate::deletion::DeletionQueue;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

/// Dedicated command buffer and fence for synchronous submits.
///
/// Never use this on the per-frame path: every call stalls the CPU until the GPU is done.
pub struct ImmediateSubmitter<B: GpuBackend> {
    backend: Arc<B>,
    context: CommandContext,
    fence: vk::Fence,
    timeout: Duration,
}

impl<B: GpuBackend> ImmediateSubmitter<B> {
    /// Create the command context and fence, registering their teardown in `global`.
    pub fn new(backend: Arc<B>, timeout: Duration, global: &mut DeletionQueue) -> Result<Self> {
        let context = backend.create_command_context("immediate submit")?;
        let teardown_backend = Arc::clone(&backend);
        global.push(move || teardown_backend.destroy_command_context(context));

        let fence = backend.create_fence(false)?;
        let teardown_backend = Arc::clone(&backend);
        global.push(move || teardown_backend.destroy_fence(fence));

        Ok(Self {
            backend,
            context,
            fence,
            timeout,
        })
    }

    /// Record with `record`, submit, and block until the GPU has finished.
    ///
    /// The timeout and any submission error are returned; callers treat both as fatal.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn run_synchronously<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let cmd = self.context.command_buffer;

        self.backend.reset_fence(self.fence)?;
        self.backend.reset_command_buffer(cmd)?;
        self.backend.begin_command_buffer(cmd)?;
        record(cmd);
        self.backend.end_command_buffer(cmd)?;

        self.backend.submit(&SubmitDesc {
            command_buffer: cmd,
            wait: &[],
            signal: &[],
            fence: self.fence,
        })?;

        self.backend
            .wait_for_fence(self.fence, self.timeout)
            .map_err(|err| match err {
                GpuError::FenceTimeout { timeout, .. } => GpuError::FenceTimeout {
                    operation: "immediate submit",
                    timeout,
                },
                other => other,
            })?;

        tracing::trace!("immediate submit complete");
        Ok(())
    }

    /// The fence signaled by each submission.
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockCall};

    #[test]
    fn records_submits_and_waits_in_order() {
        let backend = Arc::new(MockBackend::auto_completing());
        let mut global = DeletionQueue::new();
        let submitter =
            ImmediateSubmitter::new(Arc::clone(&backend), Duration::from_secs(1), &mut global)
                .expect("submitter");
        backend.take_calls();

        let mut recorded = None;
        submitter
            .run_synchronously(|cmd| recorded = Some(cmd))
            .expect("submit");

        let cmd = recorded.expect("recording closure ran");
        let fence = submitter.fence();
        assert_eq!(
            backend.calls(),
            vec![
                MockCall::ResetFence(fence),
                MockCall::ResetCommandBuffer(cmd),
                MockCall::BeginCommandBuffer(cmd),
                MockCall::EndCommandBuffer(cmd),
                MockCall::Submit {
                    command_buffer: cmd,
                    wait: vec![],
                    signal: vec![],
                    fence,
                },
                MockCall::WaitFence(fence),
            ]
        );

        global.flush();
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn hung_gpu_is_a_fatal_timeout() {
        let backend = Arc::new(MockBackend::new());
        let mut global = DeletionQueue::new();
        let submitter =
            ImmediateSubmitter::new(Arc::clone(&backend), Duration::from_millis(5), &mut global)
                .expect("submitter");

        let err = submitter.run_synchronously(|_| {}).expect_err("never signals");
        assert!(matches!(
            err,
            GpuError::FenceTimeout {
                operation: "immediate submit",
                ..
            }
        ));
        assert!(err.is_fatal());

        global.flush();
    }

    #[test]
    fn submission_failure_is_returned() {
        let backend = Arc::new(MockBackend::auto_completing());
        let mut global = DeletionQueue::new();
        let submitter =
            ImmediateSubmitter::new(Arc::clone(&backend), Duration::from_secs(1), &mut global)
                .expect("submitter");

        backend.fail_next_submit();
        let err = submitter.run_synchronously(|_| {}).expect_err("device lost");
        assert!(matches!(err, GpuError::Submission(_)));

        submitter.run_synchronously(|_| {}).expect("next submit");
        global.flush();
    }
}
