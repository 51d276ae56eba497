use std::future::Future;

/// Run a test body on a `LocalSet` so `spawn_local` continuations can make progress.
pub async fn local_test<F, Fut>(f: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()> + 'static,
{
    let local = tokio::task::LocalSet::new();
    local.run_until(f()).await;
}

/// Let every spawned continuation that is ready run to its next suspension point.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
