//! In-memory data store for tests, embedded engines and benchmarks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use procflow_core::{
    EngineError, EngineResult, ExecutionEntity, ExecutionId, JobEntity, JobId, JobTable,
    TaskEntity, TaskId,
};

use super::{DataStore, JobQuery, Record, RecordKey, WriteBatch};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobTable, HashMap<JobId, JobEntity>>,
    executions: HashMap<ExecutionId, ExecutionEntity>,
    tasks: HashMap<TaskId, TaskEntity>,
}

impl Tables {
    fn revision(&self, key: &RecordKey) -> Option<u32> {
        match key {
            RecordKey::Job(table, id) => self.jobs.get(table)?.get(id).map(|job| job.revision),
            RecordKey::Execution(id) => self.executions.get(id).map(|e| e.revision),
            RecordKey::Task(id) => self.tasks.get(id).map(|t| t.revision),
        }
    }

    fn put(&mut self, record: Record) {
        match record {
            Record::Job(table, job) => {
                self.jobs.entry(table).or_default().insert(job.id, job);
            }
            Record::Execution(execution) => {
                self.executions.insert(execution.id, execution);
            }
            Record::Task(task) => {
                self.tasks.insert(task.id, task);
            }
        }
    }

    fn remove(&mut self, key: &RecordKey) {
        match key {
            RecordKey::Job(table, id) => {
                if let Some(rows) = self.jobs.get_mut(table) {
                    rows.remove(id);
                }
            }
            RecordKey::Execution(id) => {
                self.executions.remove(id);
            }
            RecordKey::Task(id) => {
                self.tasks.remove(id);
            }
        }
    }

    /// Check every write against the current rows before touching anything.
    fn validate(&self, batch: &WriteBatch) -> EngineResult<()> {
        let mut inserted = HashSet::new();
        for record in &batch.inserts {
            let key = record.key();
            if self.revision(&key).is_some() || !inserted.insert(key) {
                return Err(EngineError::optimistic_lock(format!("{key} already exists")));
            }
        }
        for record in &batch.updates {
            let key = record.key();
            match self.revision(&key) {
                Some(current) if current == record.revision() => {}
                Some(current) => {
                    return Err(EngineError::optimistic_lock(format!(
                        "{key} was updated by another transaction (expected revision {}, found {current})",
                        record.revision()
                    )));
                }
                None => {
                    return Err(EngineError::optimistic_lock(format!(
                        "{key} was deleted by another transaction"
                    )));
                }
            }
        }
        for (key, revision) in &batch.deletes {
            match self.revision(key) {
                Some(current) if current == *revision => {}
                Some(current) => {
                    return Err(EngineError::optimistic_lock(format!(
                        "{key} was updated by another transaction (expected revision {revision}, found {current})"
                    )));
                }
                None => {
                    return Err(EngineError::optimistic_lock(format!(
                        "{key} was deleted by another transaction"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Thread-safe in-memory [`DataStore`].
///
/// - No IO
/// - Batches validate completely before applying, so a rejected batch
///   leaves no trace
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    tables: RwLock<Tables>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of rows in one job store.
    pub fn count(&self, table: JobTable) -> usize {
        self.read()
            .jobs
            .get(&table)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Every job store that currently holds `id`.
    pub fn tables_holding(&self, id: JobId) -> Vec<JobTable> {
        let tables = self.read();
        JobTable::ALL
            .into_iter()
            .filter(|table| tables.jobs.get(table).is_some_and(|rows| rows.contains_key(&id)))
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DataStore for InMemoryDataStore {
    fn find_job(&self, table: JobTable, id: JobId) -> EngineResult<Option<JobEntity>> {
        Ok(self
            .read()
            .jobs
            .get(&table)
            .and_then(|rows| rows.get(&id))
            .cloned())
    }

    fn find_jobs(&self, table: JobTable, query: &JobQuery) -> EngineResult<Vec<JobEntity>> {
        let tables = self.read();
        let jobs = tables
            .jobs
            .get(&table)
            .map(|rows| rows.values().filter(|job| query.matches(job)).cloned().collect())
            .unwrap_or_default();
        Ok(query.finish(jobs))
    }

    fn find_execution(&self, id: ExecutionId) -> EngineResult<Option<ExecutionEntity>> {
        Ok(self.read().executions.get(&id).cloned())
    }

    fn find_executions_by_process_instance(
        &self,
        process_instance_id: ExecutionId,
    ) -> EngineResult<Vec<ExecutionEntity>> {
        let mut executions: Vec<ExecutionEntity> = self
            .read()
            .executions
            .values()
            .filter(|e| e.process_instance_id == process_instance_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.id);
        Ok(executions)
    }

    fn find_tasks_by_process_instance(
        &self,
        process_instance_id: ExecutionId,
    ) -> EngineResult<Vec<TaskEntity>> {
        let mut tasks: Vec<TaskEntity> = self
            .read()
            .tasks
            .values()
            .filter(|t| t.process_instance_id == process_instance_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    fn commit(&self, batch: WriteBatch) -> EngineResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tables = self
            .tables
            .write()
            .map_err(|_| EngineError::store("in-memory store lock poisoned"))?;
        tables.validate(&batch)?;

        let writes = batch.len();
        for record in batch.inserts {
            tables.put(record);
        }
        for mut record in batch.updates {
            record.set_revision(record.revision() + 1);
            tables.put(record);
        }
        for (key, _) in &batch.deletes {
            tables.remove(key);
        }

        debug!(writes, "committed write batch");
        Ok(())
    }
}
