//! Pre-aggregation of manifest objects into the local SQLite store.
//!
//! Every pre-aggregated model, metric and cumulative metric gets a materialization task. A run
//! rewrites `SELECT * FROM <object>` through the live pipeline, executes it on the source and
//! copies the rows into a fresh local table. Successful runs are refreshed periodically, failed
//! ones retried after a delay. At most one run per object is in flight at a time.

mod task;

pub use task::{TaskInfo, TaskStatus};

use crate::config::CacheConfig;
use crate::data_store::{DataStoreClient, DataStoreError, RecordIterator, SqliteDataStore, Value, Workload};
use crate::semantic_model::mdl::ObjectKind;
use crate::semantic_model::{CatalogSchemaTableName, Mdl};
use crate::sql_parser::transformations::quote;
use crate::sql_parser::{CacheLookup, SessionContext, SqlParser, SqlParserError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use uuid::Uuid;

type Key = CatalogSchemaTableName;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("{object} holds {size} bytes, over the {limit} byte limit for one cached table")]
    SizeLimitExceeded {
        object: String,
        size: usize,
        limit: usize,
    },

    #[error("{0} is not a model, metric or cumulative metric of the manifest")]
    ObjectNotFound(String),

    #[error(transparent)]
    DataStore(#[from] DataStoreError),

    #[error(transparent)]
    Rewrite(#[from] SqlParserError),
}

pub struct CacheManager<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for CacheManager<C> {
    fn clone(&self) -> Self {
        CacheManager {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<C> {
    runtime: Handle,
    local: Arc<SqliteDataStore>,
    source: Arc<C>,
    config: CacheConfig,
    tasks: DashMap<Key, watch::Sender<TaskInfo>>,
    cache_tables: DashMap<Key, String>,
    refresh_handles: DashMap<Key, JoinHandle<()>>,
    retry_handles: DashMap<Key, JoinHandle<()>>,
    run_locks: DashMap<Key, Arc<Mutex<()>>>,
}

impl<C: DataStoreClient> CacheManager<C> {
    /// Runs and timers are spawned on `runtime`.
    pub fn new(runtime: Handle, local: Arc<SqliteDataStore>, source: Arc<C>, config: CacheConfig) -> Self {
        CacheManager {
            inner: Arc::new(Inner {
                runtime,
                local,
                source,
                config,
                tasks: DashMap::new(),
                cache_tables: DashMap::new(),
                refresh_handles: DashMap::new(),
                retry_handles: DashMap::new(),
                run_locks: DashMap::new(),
            }),
        }
    }

    pub fn local_store(&self) -> &Arc<SqliteDataStore> {
        &self.inner.local
    }

    /// Queues a materialization run of `key` and returns without waiting for it.
    pub fn create_task(&self, mdl: &Arc<Mdl>, key: &Key) -> Result<TaskInfo, CacheError> {
        self.inner.create_task(mdl, key)
    }

    /// Waits until the current task of `key` is DONE or FAILED.
    ///
    /// Returns `None` when no task exists or the object is removed meanwhile.
    pub async fn until_task_done(&self, key: &Key) -> Option<TaskInfo> {
        let mut receiver = self.inner.tasks.get(key).map(|sender| sender.subscribe())?;
        let done = receiver.wait_for(|info| info.status.is_terminal()).await;
        done.ok().map(|info| info.clone())
    }

    pub fn get_task_info(&self, key: &Key) -> Option<TaskInfo> {
        self.inner.tasks.get(key).map(|sender| sender.borrow().clone())
    }

    /// Forgets everything known about `key` and drops its table.
    pub async fn remove_cache_if_exist(&self, key: &Key) {
        let inner = &self.inner;
        if let Some((_, handle)) = inner.refresh_handles.remove(key) {
            handle.abort();
        }
        if let Some((_, handle)) = inner.retry_handles.remove(key) {
            handle.abort();
        }
        inner.tasks.remove(key);
        inner.forget_run_lock(key);
        let table = inner.cache_tables.remove(key).map(|(_, table)| table);
        if let Some(table) = table {
            inner.local.drop_table_quietly(&table).await;
            info!("Removed cache table {} of {}", table, key);
        }
    }

    pub fn cache_scheduled_future_exists(&self, key: &Key) -> bool {
        self.inner
            .refresh_handles
            .get(key)
            .map_or(false, |handle| !handle.is_finished())
    }

    pub fn retry_scheduled_future_exists(&self, key: &Key) -> bool {
        self.inner
            .retry_handles
            .get(key)
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Runs `sql` against the local store.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<RecordIterator, CacheError> {
        Ok(self.inner.local.query(Workload::Metadata, sql, params).await?)
    }

    /// Brings the cache in line with a newly deployed manifest and waits for every run.
    pub async fn refresh(&self, mdl: Arc<Mdl>) -> Result<Vec<TaskInfo>, CacheError> {
        let wanted: BTreeSet<Key> = mdl.pre_aggregated_objects().into_iter().collect();
        let known: BTreeSet<Key> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.key().clone())
            .chain(self.inner.cache_tables.iter().map(|entry| entry.key().clone()))
            .collect();
        for key in known.difference(&wanted) {
            info!("{} is no longer pre-aggregated", key);
            self.remove_cache_if_exist(key).await;
        }

        for key in &wanted {
            self.create_task(&mdl, key)?;
        }
        let infos = join_all(wanted.iter().map(|key| self.until_task_done(key))).await;
        Ok(infos.into_iter().flatten().collect())
    }

    /// Cancels every periodic refresh and pending retry.
    pub fn stop(&self) {
        self.inner.refresh_handles.retain(|_, handle| {
            handle.abort();
            false
        });
        self.inner.retry_handles.retain(|_, handle| {
            handle.abort();
            false
        });
    }
}

impl<C> CacheLookup for CacheManager<C> {
    fn lookup_cache_table(&self, name: &CatalogSchemaTableName) -> Option<String> {
        self.inner.cache_tables.get(name).map(|table| table.value().clone())
    }
}

impl<C: DataStoreClient> Inner<C> {
    fn create_task(self: &Arc<Self>, mdl: &Arc<Mdl>, key: &Key) -> Result<TaskInfo, CacheError> {
        let cacheable = matches!(
            mdl.object_kind(&key.table),
            Some(ObjectKind::Model | ObjectKind::Metric | ObjectKind::CumulativeMetric)
        );
        if !mdl.owns(key) || !cacheable {
            return Err(CacheError::ObjectNotFound(key.to_string()));
        }

        let info = TaskInfo::queued(key.clone());
        match self.tasks.entry(key.clone()) {
            Entry::Occupied(entry) => {
                entry.get().send_replace(info.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(watch::channel(info.clone()).0);
            }
        }
        info!("Queued cache task {} for {}", info.task_id, key);

        let inner = self.clone();
        let mdl = mdl.clone();
        let key = key.clone();
        let task_id = info.task_id;
        self.runtime.spawn(async move { inner.run(mdl, key, task_id).await });
        Ok(info)
    }

    async fn run(self: Arc<Self>, mdl: Arc<Mdl>, key: Key, task_id: Uuid) {
        let lock = self.run_lock(&key);
        {
            let _guard = lock.lock().await;
            self.run_locked(&mdl, &key, task_id).await;
        }
        drop(lock);
        self.forget_run_lock(&key);
    }

    async fn run_locked(self: &Arc<Self>, mdl: &Arc<Mdl>, key: &Key, task_id: Uuid) {
        let table = format!("{}_{}", key.table, task_id.simple());
        if !self.update_task(key, task_id, |info| info.start(&table)) {
            debug!("Cache task {} for {} was superseded before it ran", task_id, key);
            return;
        }
        info!("Running cache task {} for {}", task_id, key);

        match self.materialize(mdl, key, &table).await {
            Ok(()) => self.install(mdl, key, task_id, table).await,
            Err(e) => {
                self.local.drop_table_quietly(&table).await;
                let message = format!("Failed to do cache for cacheInfo {}: {}", key, e);
                error!("{}", message);
                if self.update_task(key, task_id, |info| info.fail(message)) {
                    self.schedule_retry(mdl, key, task_id);
                }
            }
        }
    }

    async fn materialize(&self, mdl: &Mdl, key: &Key, table: &str) -> Result<(), CacheError> {
        let session = SessionContext::for_mdl(mdl);
        let parser = SqlParser::new(self.source.get_mapping());
        let sql = parser.parse(&format!("SELECT * FROM {}", quote(&key.table)), &session, mdl)?;
        debug!("Materializing {} with {}", key, sql);

        let records = self.source.execute_query(&sql, &[]).await?;
        let columns = records.columns().to_vec();
        let rows: Vec<Vec<Value>> = records.collect();
        let size: usize = rows.iter().flatten().map(Value::estimated_size).sum();
        let limit = self.config.table_size_limit();
        if size > limit {
            return Err(CacheError::SizeLimitExceeded {
                object: key.to_string(),
                size,
                limit,
            });
        }
        self.local.create_table_as(table, &columns, rows).await?;
        Ok(())
    }

    /// Points `key` at `table` if the run is still current, otherwise discards the table.
    async fn install(self: &Arc<Self>, mdl: &Arc<Mdl>, key: &Key, task_id: Uuid, table: String) {
        let installed = match self.tasks.get(key) {
            Some(sender) if sender.borrow().task_id == task_id => {
                Some(self.cache_tables.insert(key.clone(), table.clone()))
            }
            _ => None,
        };
        let Some(previous) = installed else {
            debug!("Cache task {} for {} was superseded, dropping {}", task_id, key, table);
            self.local.drop_table_quietly(&table).await;
            return;
        };

        if let Some(previous) = previous.filter(|previous| *previous != table) {
            self.local.drop_table_quietly(&previous).await;
        }
        if self.update_task(key, task_id, TaskInfo::finish) {
            info!("Cache task {} for {} is done, table {}", task_id, key, table);
            self.schedule_refresh(mdl, key, task_id);
        }
    }

    fn schedule_refresh(self: &Arc<Self>, mdl: &Arc<Mdl>, key: &Key, task_id: Uuid) {
        if let Some((_, handle)) = self.retry_handles.remove(key) {
            handle.abort();
        }
        let Some(period) = mdl.refresh_time(&key.table).filter(|period| !period.is_zero()) else {
            if let Some((_, handle)) = self.refresh_handles.remove(key) {
                handle.abort();
            }
            return;
        };

        let inner = self.clone();
        let mdl = mdl.clone();
        let task_key = key.clone();
        let handle = self.runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                inner.tick(&mdl, &task_key);
            }
        });
        if self.keep_handle(&self.refresh_handles, key, task_id, handle) {
            debug!("Refreshing {} every {:?}", key, period);
        }
    }

    fn schedule_retry(self: &Arc<Self>, mdl: &Arc<Mdl>, key: &Key, task_id: Uuid) {
        if let Some((_, handle)) = self.refresh_handles.remove(key) {
            handle.abort();
        }
        let delay = self.config.retry_delay();
        let inner = self.clone();
        let mdl = mdl.clone();
        let task_key = key.clone();
        let handle = self.runtime.spawn(async move {
            sleep(delay).await;
            if !inner.tasks.contains_key(&task_key) {
                return;
            }
            info!("Retrying cache task for {}", task_key);
            if let Err(e) = inner.create_task(&mdl, &task_key) {
                error!("Failed to retry cache task for {}: {}", task_key, e);
            }
        });
        if self.keep_handle(&self.retry_handles, key, task_id, handle) {
            debug!("Retrying {} in {:?}", key, delay);
        }
    }

    /// Stores `handle` as the scheduled future of `key`, aborting it instead when `task_id`
    /// stopped being current meanwhile, e.g. because the object was removed.
    ///
    /// Runs of one object hold its run lock, so no newer run can have stored a handle here.
    fn keep_handle(
        &self,
        handles: &DashMap<Key, JoinHandle<()>>,
        key: &Key,
        task_id: Uuid,
        handle: JoinHandle<()>,
    ) -> bool {
        if let Some(previous) = handles.insert(key.clone(), handle) {
            previous.abort();
        }
        if self.is_current(key, task_id) {
            return true;
        }
        if let Some((_, handle)) = handles.remove(key) {
            handle.abort();
        }
        debug!("Cache task {} for {} is no longer current, dropping its schedule", task_id, key);
        false
    }

    fn tick(self: &Arc<Self>, mdl: &Arc<Mdl>, key: &Key) {
        if !self.tasks.contains_key(key) {
            return;
        }
        if self.run_lock(key).try_lock().is_err() {
            warn!("Skipping refresh of {}: a run is still in flight", key);
            return;
        }
        if let Err(e) = self.create_task(mdl, key) {
            error!("Failed to refresh {}: {}", key, e);
        }
    }

    fn run_lock(&self, key: &Key) -> Arc<Mutex<()>> {
        self.run_locks.entry(key.clone()).or_default().clone()
    }

    /// Drops the run lock of a removed object once no run holds or awaits it.
    fn forget_run_lock(&self, key: &Key) {
        if !self.tasks.contains_key(key) {
            self.run_locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    fn is_current(&self, key: &Key, task_id: Uuid) -> bool {
        self.tasks
            .get(key)
            .map_or(false, |sender| sender.borrow().task_id == task_id)
    }

    /// Applies `update` if `task_id` is still the current task of `key`.
    fn update_task(&self, key: &Key, task_id: Uuid, update: impl FnOnce(&mut TaskInfo)) -> bool {
        match self.tasks.get(key) {
            Some(sender) => sender.send_if_modified(|info| {
                if info.task_id != task_id {
                    return false;
                }
                update(info);
                true
            }),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::{ColumnMetadata, SqliteMapping};
    use crate::tests::{sqlite_manifest, sqlite_source};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    /// A source whose queries wait for a permit, so tests can hold a run in RUNNING.
    struct GatedSource {
        inner: SqliteDataStore,
        gate: Semaphore,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl DataStoreClient for GatedSource {
        type Mapping = SqliteMapping;

        fn get_mapping(&self) -> Self::Mapping {
            SqliteMapping {}
        }

        async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<RecordIterator, DataStoreError> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            let result = self.inner.execute_query(sql, params).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn describe(&self, sql: &str, params: &[Value]) -> Result<Vec<ColumnMetadata>, DataStoreError> {
            self.inner.describe(sql, params).await
        }

        async fn execute_ddl(&self, sql: &str) -> Result<(), DataStoreError> {
            self.inner.execute_ddl(sql).await
        }
    }

    fn config(ratio: f64) -> CacheConfig {
        CacheConfig {
            local_store_path: "unused".to_string(),
            max_concurrent_tasks: 2,
            max_concurrent_metadata_queries: 2,
            memory_limit_bytes: 1024 * 1024,
            max_table_size_ratio: ratio,
            task_retry_delay_secs: 3600,
        }
    }

    async fn manager(dir: &TempDir, ratio: f64) -> CacheManager<SqliteDataStore> {
        let source = sqlite_source(dir).await;
        let local = SqliteDataStore::open(dir.path().join("cache.db"), 2, 2).unwrap();
        CacheManager::new(Handle::current(), Arc::new(local), Arc::new(source), config(ratio))
    }

    async fn gated_manager(dir: &TempDir) -> (CacheManager<GatedSource>, Arc<GatedSource>) {
        let source = Arc::new(GatedSource {
            inner: sqlite_source(dir).await,
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let local = SqliteDataStore::open(dir.path().join("cache.db"), 2, 2).unwrap();
        let cache = CacheManager::new(Handle::current(), Arc::new(local), source.clone(), config(0.5));
        (cache, source)
    }

    async fn until_running<C: DataStoreClient>(cache: &CacheManager<C>, key: &Key) -> TaskInfo {
        let mut receiver = cache.inner.tasks.get(key).unwrap().subscribe();
        let running = receiver
            .wait_for(|info| info.status == TaskStatus::Running)
            .await
            .unwrap()
            .clone();
        running
    }

    fn mdl(refresh_time: Option<Duration>) -> Arc<Mdl> {
        let mut manifest = sqlite_manifest();
        manifest.models[0].pre_aggregated = true;
        manifest.models[0].refresh_time = refresh_time;
        manifest.metrics[0].pre_aggregated = true;
        Arc::new(Mdl::from_manifest(manifest).unwrap())
    }

    #[test_log::test(tokio::test)]
    async fn test_task_done_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(&dir, 0.5).await;
        let mdl = mdl(Some(Duration::from_secs(3600)));
        let key = mdl.qualified("Album");

        let queued = cache.create_task(&mdl, &key).unwrap();
        assert_eq!(queued.status, TaskStatus::Queued);

        let done = cache.until_task_done(&key).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.task_id, queued.task_id);
        assert!(done.end_time.is_some());
        let table = done.table_name.clone().unwrap();
        assert!(table.starts_with("Album_"));
        assert_eq!(cache.lookup_cache_table(&key), Some(table.clone()));
        assert_eq!(cache.get_task_info(&key), Some(done));
        assert!(cache.cache_scheduled_future_exists(&key));
        assert!(!cache.retry_scheduled_future_exists(&key));

        let rows: Vec<Vec<Value>> = cache
            .query(&format!("SELECT count(*) FROM \"{}\"", table), &[])
            .await
            .unwrap()
            .collect();
        assert_eq!(rows, vec![vec![Value::Int(3)]]);

        cache.remove_cache_if_exist(&key).await;
        assert_eq!(cache.get_task_info(&key), None);
        assert_eq!(cache.lookup_cache_table(&key), None);
        assert!(!cache.cache_scheduled_future_exists(&key));
        assert!(!cache.retry_scheduled_future_exists(&key));
        assert!(!cache.local_store().list_tables().await.unwrap().contains(&table));
        assert!(!cache.inner.run_locks.contains_key(&key));

        cache.remove_cache_if_exist(&key).await;
    }

    #[test_log::test(tokio::test)]
    async fn test_schedules_of_removed_object_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(&dir, 0.5).await;
        let mdl = mdl(Some(Duration::from_secs(3600)));
        let key = mdl.qualified("Album");

        cache.create_task(&mdl, &key).unwrap();
        let done = cache.until_task_done(&key).await.unwrap();
        cache.remove_cache_if_exist(&key).await;

        // A run finishing right after the removal still tries to schedule its follow-ups.
        cache.inner.schedule_refresh(&mdl, &key, done.task_id);
        cache.inner.schedule_retry(&mdl, &key, done.task_id);
        assert!(!cache.cache_scheduled_future_exists(&key));
        assert!(!cache.retry_scheduled_future_exists(&key));

        cache.inner.tick(&mdl, &key);
        assert_eq!(cache.get_task_info(&key), None);
        assert!(!cache.inner.run_locks.contains_key(&key));
    }

    #[test_log::test(tokio::test)]
    async fn test_new_task_supersedes_running_one() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, source) = gated_manager(&dir).await;
        let mdl = mdl(Some(Duration::from_secs(3600)));
        let key = mdl.qualified("Album");

        let first = cache.create_task(&mdl, &key).unwrap();
        let running = until_running(&cache, &key).await;
        assert_eq!(running.task_id, first.task_id);
        let first_table = running.table_name.unwrap();

        cache.inner.tick(&mdl, &key);
        assert_eq!(cache.get_task_info(&key).unwrap().task_id, first.task_id);

        let second = cache.create_task(&mdl, &key).unwrap();
        assert_eq!(cache.get_task_info(&key).unwrap().status, TaskStatus::Queued);
        source.gate.add_permits(2);

        let done = cache.until_task_done(&key).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.task_id, second.task_id);
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);

        let second_table = done.table_name.unwrap();
        assert_eq!(cache.lookup_cache_table(&key), Some(second_table.clone()));
        let tables = cache.local_store().list_tables().await.unwrap();
        assert!(tables.contains(&second_table));
        assert!(!tables.contains(&first_table));
        cache.stop();
    }

    #[test_log::test(tokio::test)]
    async fn test_removal_during_run_installs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, source) = gated_manager(&dir).await;
        let mdl = mdl(Some(Duration::from_secs(3600)));
        let key = mdl.qualified("Album");

        cache.create_task(&mdl, &key).unwrap();
        until_running(&cache, &key).await;
        cache.remove_cache_if_exist(&key).await;
        assert_eq!(cache.get_task_info(&key), None);

        source.gate.add_permits(1);
        timeout(Duration::from_secs(10), async {
            while cache.inner.run_locks.contains_key(&key) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(cache.lookup_cache_table(&key), None);
        assert_eq!(cache.get_task_info(&key), None);
        assert!(!cache.cache_scheduled_future_exists(&key));
        assert!(!cache.retry_scheduled_future_exists(&key));
        assert!(cache.local_store().list_tables().await.unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_oversized_table_fails_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(&dir, 0.0).await;
        let mdl = mdl(Some(Duration::from_secs(3600)));
        let key = mdl.qualified("Album");

        cache.create_task(&mdl, &key).unwrap();
        let failed = cache.until_task_done(&key).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed
            .error
            .unwrap()
            .starts_with("Failed to do cache for cacheInfo mdl.test.Album:"));
        assert!(cache.retry_scheduled_future_exists(&key));
        assert!(!cache.cache_scheduled_future_exists(&key));
        assert_eq!(cache.lookup_cache_table(&key), None);
        assert!(cache.local_store().list_tables().await.unwrap().is_empty());
        cache.stop();
        assert!(!cache.retry_scheduled_future_exists(&key));
    }

    #[test_log::test(tokio::test)]
    async fn test_rerun_replaces_table() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(&dir, 0.5).await;
        let mdl = mdl(None);
        let key = mdl.qualified("Collection");

        cache.create_task(&mdl, &key).unwrap();
        let first = cache.until_task_done(&key).await.unwrap().table_name.unwrap();
        cache.create_task(&mdl, &key).unwrap();
        let second = cache.until_task_done(&key).await.unwrap().table_name.unwrap();

        assert_ne!(first, second);
        assert_eq!(cache.lookup_cache_table(&key), Some(second.clone()));
        assert!(!cache.cache_scheduled_future_exists(&key));
        let tables = cache.local_store().list_tables().await.unwrap();
        assert!(tables.contains(&second));
        assert!(!tables.contains(&first));
    }

    #[test_log::test(tokio::test)]
    async fn test_refresh_follows_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(&dir, 0.5).await;
        let mdl = mdl(None);

        let infos = cache.refresh(mdl.clone()).await.unwrap();
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().all(|info| info.status == TaskStatus::Done));
        assert!(cache.lookup_cache_table(&mdl.qualified("Album")).is_some());
        assert!(cache.lookup_cache_table(&mdl.qualified("Collection")).is_some());

        let plain = Arc::new(Mdl::from_manifest(sqlite_manifest()).unwrap());
        assert!(cache.refresh(plain).await.unwrap().is_empty());
        assert_eq!(cache.lookup_cache_table(&mdl.qualified("Album")), None);
        assert!(cache.local_store().list_tables().await.unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_object() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(&dir, 0.5).await;
        let mdl = mdl(None);
        let result = cache.create_task(&mdl, &mdl.qualified("ZutomayoAlbums"));
        assert!(matches!(result, Err(CacheError::ObjectNotFound(_))));
        assert_eq!(cache.get_task_info(&mdl.qualified("ZutomayoAlbums")), None);
    }
}
