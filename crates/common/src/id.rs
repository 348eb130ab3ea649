use std::future::Future;

/// Per-namespace serial id generation backed by some coordination service.
///
/// Instances are cheap handles over shared state, so clones talk to the same
/// backend resources.
pub trait IdGenerator: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Allocates backend resources. Fails if the instance is already initialized.
    fn init(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Releases backend resources. Idempotent, and never fails: problems
    /// are logged and swallowed so shutdown can always proceed.
    fn destroy(&self) -> impl Future<Output = ()> + Send;

    fn is_initialized(&self) -> bool;

    /// Increments the counter of `namespace` and returns the new value.
    fn next_id(&self, namespace: &str) -> impl Future<Output = Result<i64, Self::Error>> + Send;

    /// Reads the counter of `namespace` without changing it.
    fn current_id(&self, namespace: &str)
        -> impl Future<Output = Result<i64, Self::Error>> + Send;
}
