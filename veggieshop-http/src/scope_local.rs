// Ergonomic sugar over the explicit `RequestScope` API (§4.3, §9). The
// engine itself never uses task-local state; this is purely a convenience
// for handlers that can't thread the scope through their own signature,
// grounded on the corpus's own task-local tenant-context pattern
// (`prax-query::tenant::task_local`). The middleware in `scope_mw` is the
// only writer of this task-local; handlers only ever read it.

use std::future::Future;
use std::sync::Arc;

use veggieshop_txn::RequestScope;

tokio::task_local! {
    static CURRENT_SCOPE: Arc<RequestScope>;
}

/// Runs `f` with `scope` available to `current_scope()` for its whole
/// (possibly `.await`-suspended) duration, including nested calls.
pub async fn with_scope<F, T>(scope: Arc<RequestScope>, f: F) -> T
where
    F: Future<Output = T>,
{
    CURRENT_SCOPE.scope(scope, f).await
}

/// Returns the scope the enclosing `with_scope` call installed, if any.
/// `None` outside of `consistency_scope` middleware or in a task spawned
/// off the request task without `with_scope` wrapping it explicitly.
pub fn current_scope() -> Option<Arc<RequestScope>> {
    CURRENT_SCOPE.try_with(Arc::clone).ok()
}
