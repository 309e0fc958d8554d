use once_cell::sync::Lazy;
use std::future::Future;
use tokio::runtime::Runtime;

/// A single current-thread runtime shared by every blocking call site. The
/// engine's control flow (strategies, orchestrator) is synchronous by
/// design; this bridges it onto the async Kubernetes client without forcing
/// every caller to carry a runtime handle.
static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    Runtime::new().expect("failed to create the cluster-roller tokio runtime")
});

pub fn block_on<F: Future>(future: F) -> F::Output {
    RUNTIME.block_on(future)
}
