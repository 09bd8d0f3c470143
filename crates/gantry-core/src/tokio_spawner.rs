//! Tokio-based job spawner.
//!
//! A panicking job is already mapped to an error result before it reaches
//! the spawner; a panic surfacing here means the runtime task itself died,
//! which we log rather than letting it take the worker down.

use pin_project_lite::pin_project;

use crate::worker::JobSpawner;

/// Spawn jobs onto the Tokio runtime.
pub struct TokioSpawner;

pin_project! {
    /// Wrap Tokio's `JoinHandle<()>` and log failures instead of bubbling
    /// them, so a lost task still frees its execution slot.
    pub struct TokioJoinHandle {
        #[pin]
        handle: tokio::task::JoinHandle<()>
    }
}

impl Future for TokioJoinHandle {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.project();
        match this.handle.poll(cx) {
            std::task::Poll::Ready(result) => {
                if let Err(error) = result {
                    tracing::error!(error = %error, "job task failed");
                };
                std::task::Poll::Ready(())
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl JobSpawner for TokioSpawner {
    type JobHandle<Fut>
        = TokioJoinHandle
    where
        Fut: Future<Output = ()> + Send + 'static;

    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        TokioJoinHandle {
            handle: tokio::spawn(fut),
        }
    }
}
