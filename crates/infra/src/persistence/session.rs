//! Entity session: the per-command unit of work over the [`DataStore`].
//!
//! Reads go to the store once and are cached for the rest of the command;
//! every read also sees the command's own pending writes. Writes are
//! buffered and handed to the store as one [`WriteBatch`] on flush. Updates
//! whose persistent state equals what was loaded are dropped at flush.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use procflow_core::entity::PersistentState;
use procflow_core::{
    EngineError, EngineResult, ExecutionEntity, ExecutionId, JobEntity, JobId, JobTable,
    TaskEntity,
};

use crate::command::session::Session;

use super::{DataStore, JobQuery, Record, RecordKey, WriteBatch};

#[derive(Debug)]
enum PendingWrite {
    Insert(Record),
    Update(Record),
    /// Revision the row was read at.
    Delete(u32),
}

pub struct EntitySession {
    store: Arc<dyn DataStore>,
    loaded: HashMap<RecordKey, (Record, PersistentState)>,
    pending: HashMap<RecordKey, PendingWrite>,
    order: Vec<RecordKey>,
}

impl EntitySession {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            loaded: HashMap::new(),
            pending: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Buffered writes not yet flushed.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    // ---- reads ----

    pub fn find_job(&mut self, table: JobTable, id: JobId) -> EngineResult<Option<JobEntity>> {
        let key = RecordKey::Job(table, id);
        if let Some(found) = self.lookup(&key) {
            return Ok(found.and_then(Record::into_job));
        }
        Ok(self
            .store
            .find_job(table, id)?
            .and_then(|job| self.remember(Record::Job(table, job)).into_job()))
    }

    /// Jobs of one store matching `query`, including this command's writes.
    pub fn find_jobs(&mut self, table: JobTable, query: &JobQuery) -> EngineResult<Vec<JobEntity>> {
        let unbounded = JobQuery {
            limit: None,
            ..query.clone()
        };

        let mut jobs = Vec::new();
        for job in self.store.find_jobs(table, &unbounded)? {
            if self.pending.contains_key(&RecordKey::Job(table, job.id)) {
                continue;
            }
            if let Some(job) = self.remember(Record::Job(table, job)).into_job() {
                if query.matches(&job) {
                    jobs.push(job);
                }
            }
        }

        for key in &self.order {
            match (key, self.pending.get(key)) {
                (
                    RecordKey::Job(t, _),
                    Some(PendingWrite::Insert(Record::Job(_, job)) | PendingWrite::Update(Record::Job(_, job))),
                ) if *t == table && query.matches(job) => jobs.push(job.clone()),
                _ => {}
            }
        }

        Ok(query.finish(jobs))
    }

    pub fn find_execution(&mut self, id: ExecutionId) -> EngineResult<Option<ExecutionEntity>> {
        let key = RecordKey::Execution(id);
        if let Some(found) = self.lookup(&key) {
            return Ok(found.and_then(Record::into_execution));
        }
        Ok(self
            .store
            .find_execution(id)?
            .and_then(|execution| self.remember(Record::Execution(execution)).into_execution()))
    }

    pub fn find_executions_by_process_instance(
        &mut self,
        process_instance_id: ExecutionId,
    ) -> EngineResult<Vec<ExecutionEntity>> {
        let stored = self.store.find_executions_by_process_instance(process_instance_id)?;
        let records = stored.into_iter().map(Record::Execution).collect();
        let merged = self.overlay(records, |record| {
            matches!(record, Record::Execution(e) if e.process_instance_id == process_instance_id)
        });
        Ok(merged.into_iter().filter_map(Record::into_execution).collect())
    }

    pub fn find_tasks_by_process_instance(
        &mut self,
        process_instance_id: ExecutionId,
    ) -> EngineResult<Vec<TaskEntity>> {
        let stored = self.store.find_tasks_by_process_instance(process_instance_id)?;
        let records = stored.into_iter().map(Record::Task).collect();
        let merged = self.overlay(records, |record| {
            matches!(record, Record::Task(t) if t.process_instance_id == process_instance_id)
        });
        Ok(merged.into_iter().filter_map(Record::into_task).collect())
    }

    // ---- writes ----

    pub fn insert(&mut self, record: Record) -> EngineResult<()> {
        let key = record.key();
        match self.pending.remove(&key) {
            // delete + insert of the same row nets out to an update
            Some(PendingWrite::Delete(revision)) => {
                let mut record = record;
                record.set_revision(revision);
                self.pending.insert(key, PendingWrite::Update(record));
                Ok(())
            }
            Some(existing) => {
                self.pending.insert(key, existing);
                Err(EngineError::invalid_argument(format!("{key} already exists")))
            }
            None if self.loaded.contains_key(&key) => {
                Err(EngineError::invalid_argument(format!("{key} already exists")))
            }
            None => {
                self.pending.insert(key, PendingWrite::Insert(record));
                self.order.push(key);
                Ok(())
            }
        }
    }

    pub fn update(&mut self, record: Record) -> EngineResult<()> {
        let key = record.key();
        match self.pending.get_mut(&key) {
            Some(PendingWrite::Insert(existing) | PendingWrite::Update(existing)) => {
                let revision = existing.revision();
                *existing = record;
                existing.set_revision(revision);
                Ok(())
            }
            Some(PendingWrite::Delete(_)) => Err(EngineError::invalid_argument(format!(
                "{key} was deleted earlier in this command"
            ))),
            None => {
                self.pending.insert(key, PendingWrite::Update(record));
                self.order.push(key);
                Ok(())
            }
        }
    }

    pub fn delete(&mut self, key: RecordKey, revision: u32) -> EngineResult<()> {
        match self.pending.remove(&key) {
            Some(PendingWrite::Insert(_)) => {
                self.order.retain(|k| *k != key);
            }
            Some(PendingWrite::Update(record)) => {
                self.pending.insert(key, PendingWrite::Delete(record.revision()));
            }
            Some(PendingWrite::Delete(previous)) => {
                self.pending.insert(key, PendingWrite::Delete(previous));
            }
            None => {
                self.pending.insert(key, PendingWrite::Delete(revision));
                self.order.push(key);
            }
        }
        Ok(())
    }

    pub fn insert_job(&mut self, table: JobTable, job: JobEntity) -> EngineResult<()> {
        self.insert(Record::Job(table, job))
    }

    pub fn update_job(&mut self, table: JobTable, job: JobEntity) -> EngineResult<()> {
        self.update(Record::Job(table, job))
    }

    pub fn delete_job(&mut self, table: JobTable, job: &JobEntity) -> EngineResult<()> {
        self.delete(RecordKey::Job(table, job.id), job.revision)
    }

    pub fn insert_execution(&mut self, execution: ExecutionEntity) -> EngineResult<()> {
        self.insert(Record::Execution(execution))
    }

    pub fn update_execution(&mut self, execution: ExecutionEntity) -> EngineResult<()> {
        self.update(Record::Execution(execution))
    }

    pub fn insert_task(&mut self, task: TaskEntity) -> EngineResult<()> {
        self.insert(Record::Task(task))
    }

    pub fn update_task(&mut self, task: TaskEntity) -> EngineResult<()> {
        self.update(Record::Task(task))
    }

    // ---- internals ----

    /// `Some(None)` when this command deleted the row.
    fn lookup(&self, key: &RecordKey) -> Option<Option<Record>> {
        match self.pending.get(key) {
            Some(PendingWrite::Insert(record) | PendingWrite::Update(record)) => Some(Some(record.clone())),
            Some(PendingWrite::Delete(_)) => Some(None),
            None => self.loaded.get(key).map(|(record, _)| Some(record.clone())),
        }
    }

    /// Cache a freshly read row; an already cached copy wins.
    fn remember(&mut self, record: Record) -> Record {
        let key = record.key();
        self.loaded
            .entry(key)
            .or_insert_with(|| {
                let state = record.persistent_state();
                (record, state)
            })
            .0
            .clone()
    }

    fn overlay(&mut self, stored: Vec<Record>, matches: impl Fn(&Record) -> bool) -> Vec<Record> {
        let mut merged = Vec::new();
        for record in stored {
            if self.pending.contains_key(&record.key()) {
                continue;
            }
            merged.push(self.remember(record));
        }
        for key in &self.order {
            if let Some(PendingWrite::Insert(record) | PendingWrite::Update(record)) = self.pending.get(key) {
                if matches(record) {
                    merged.push(record.clone());
                }
            }
        }
        merged
    }
}

impl Session for EntitySession {
    fn flush(&mut self) -> EngineResult<()> {
        let mut batch = WriteBatch::new();
        let mut unchanged = 0usize;

        for key in &self.order {
            match self.pending.get(key) {
                Some(PendingWrite::Insert(record)) => batch.inserts.push(record.clone()),
                Some(PendingWrite::Update(record)) => {
                    let clean = self
                        .loaded
                        .get(key)
                        .is_some_and(|(_, state)| *state == record.persistent_state());
                    if clean {
                        unchanged += 1;
                    } else {
                        batch.updates.push(record.clone());
                    }
                }
                Some(PendingWrite::Delete(revision)) => batch.deletes.push((*key, *revision)),
                None => {}
            }
        }

        if !batch.is_empty() {
            debug!(
                inserts = batch.inserts.len(),
                updates = batch.updates.len(),
                deletes = batch.deletes.len(),
                unchanged,
                "flushing entity session"
            );
            self.store.commit(batch)?;
        }

        self.pending.clear();
        self.order.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.loaded.clear();
        self.pending.clear();
        self.order.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
