use gatehouse_config::Policy;
use gatehouse_host_api::MockScheduler;
use gatehouse_store::SqliteStore;
use std::sync::Arc;

use crate::CoreEngine;

pub(crate) fn engine_with_scheduler(
    policy: Policy,
) -> (CoreEngine, Arc<SqliteStore>, Arc<MockScheduler>) {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let scheduler = Arc::new(MockScheduler::new());
    let engine = CoreEngine::new(policy, store.clone(), scheduler.clone());
    (engine, store, scheduler)
}

pub(crate) fn engine_with_policy(policy: Policy) -> (CoreEngine, Arc<SqliteStore>) {
    let (engine, store, _) = engine_with_scheduler(policy);
    (engine, store)
}
