use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::entry::QueueJob;

type RunTaskFn<Context> =
    Arc<dyn Fn(Context, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Maps entry kinds to their deserialize-and-run functions.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, RunTaskFn<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: QueueJob<Context = Context>>(&mut self) {
        self.entries.insert(J::KIND.to_owned(), Arc::new(run_job::<J>));
    }

    pub(crate) fn get(&self, kind: &str) -> Option<&RunTaskFn<Context>> {
        self.entries.get(kind)
    }

    pub(crate) fn kinds(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

fn run_job<J: QueueJob>(ctx: J::Context, args: Value) -> BoxFuture<'static, anyhow::Result<()>> {
    Box::pin(async move {
        let job: J = serde_json::from_value(args)?;
        job.run(ctx).await
    })
}
