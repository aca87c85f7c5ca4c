//! In-process relational store.
//!
//! Tables hold rows keyed by a unique primary-key column. Transactions stage
//! their inserts privately (other sessions never see uncommitted rows) and
//! apply them on commit. A staged key stays locked until its transaction
//! ends: a second insert of the same key waits, then fails with
//! `StoreError::UniqueViolation` if the holder committed. Read-only
//! transactions reject writes. Serializable transactions fail at commit with
//! `StoreError::SerializationFailure` when a table they touched was changed
//! by another commit after they first touched it.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    AccessMode, ConnectionProvider, ExecSummary, Insert, IsolationLevel, QueryEngine, Row, Select,
    Statement, StoreError, Transaction, TxOptions, Value,
};
use crate::context::{Context, DeadlineExceeded};

/// How often a blocked insert re-checks a locked key.
const LOCK_POLL: Duration = Duration::from_millis(2);

/// One-shot failures that can be armed on the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStats {
    /// Options of every transaction opened, in order.
    pub begun: Vec<TxOptions>,
    pub commits: usize,
    pub rollbacks: usize,
}

struct Table {
    key: String,
    rows: Vec<Row>,
    version: u64,
}

/// Key staged by a live transaction.
struct KeyLock {
    tx: u64,
    table: String,
    key: Value,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    stats: MemoryStats,
    faults: HashSet<Fault>,
    locks: Vec<KeyLock>,
    next_tx: u64,
}

impl State {
    fn table(&self, name: &str) -> Result<&Table, StoreError> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::Unsupported(format!("unknown table {name}")))
    }

    /// Lock the key of `row` for `tx`, unless another transaction holds it.
    /// Returns the table version, or `None` when the caller must wait.
    /// Autocommit writes pass `tx = 0` and never keep the lock.
    fn try_lock_key(
        &mut self,
        tx: u64,
        name: &str,
        row: &Row,
        staged: &[&Row],
    ) -> Result<Option<u64>, StoreError> {
        let (key, version) = {
            let table = self.table(name)?;
            check_unique(table, name, row, staged)?;
            (row.value(&table.key).cloned(), table.version)
        };
        let Some(key) = key else {
            return Ok(Some(version));
        };

        let held = self
            .locks
            .iter()
            .any(|lock| lock.tx != tx && lock.table == name && lock.key == key);
        if held {
            return Ok(None);
        }
        if tx != 0 {
            self.locks.push(KeyLock {
                tx,
                table: name.to_string(),
                key,
            });
        }
        Ok(Some(version))
    }

    fn take_fault(&mut self, fault: Fault) -> Result<(), StoreError> {
        if self.faults.remove(&fault) {
            return Err(StoreError::ConnectionLost(format!("injected {fault:?} failure")));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table whose `key` column carries a uniqueness constraint.
    pub fn with_table(self, name: &str, key: &str) -> Self {
        self.lock().tables.insert(
            name.to_string(),
            Table {
                key: key.to_string(),
                rows: Vec::new(),
                version: 0,
            },
        );
        self
    }

    /// Every store call sleeps this long first (bounded by the context deadline).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn fail_next(&self, fault: Fault) {
        self.lock().faults.insert(fault);
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats.clone()
    }

    /// Committed rows in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self, ctx: &Context) -> Result<(), StoreError> {
        if ctx.is_expired() {
            return Err(DeadlineExceeded.into());
        }
        if let Some(latency) = self.latency {
            ctx.guard(tokio::time::sleep(latency)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueryEngine for MemoryStore {
    async fn execute(&self, ctx: &Context, stmt: &Statement) -> Result<ExecSummary, StoreError> {
        self.pause(ctx).await?;
        let insert = as_insert(stmt)?;
        let row = build_row(insert);

        loop {
            {
                let mut state = self.lock();
                if state.try_lock_key(0, &insert.table, &row, &[])?.is_some() {
                    if let Some(table) = state.tables.get_mut(&insert.table) {
                        table.rows.push(row);
                        table.version += 1;
                    }
                    return Ok(ExecSummary { rows_affected: 1 });
                }
            }
            ctx.guard(tokio::time::sleep(LOCK_POLL)).await?;
        }
    }

    async fn fetch_one(&self, ctx: &Context, stmt: &Statement) -> Result<Row, StoreError> {
        self.fetch_many(ctx, stmt)
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound)
    }

    async fn fetch_many(&self, ctx: &Context, stmt: &Statement) -> Result<Vec<Row>, StoreError> {
        self.pause(ctx).await?;
        let select = as_select(stmt)?;

        let state = self.lock();
        let table = state.table(&select.table)?;
        select_rows(select, table.rows.iter())
    }
}

#[async_trait]
impl ConnectionProvider for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self, ctx: &Context, options: TxOptions) -> Result<MemoryTransaction, StoreError> {
        self.pause(ctx).await?;

        let mut state = self.lock();
        state.take_fault(Fault::Begin)?;
        state.stats.begun.push(options);
        state.next_tx += 1;

        Ok(MemoryTransaction {
            id: state.next_tx,
            store: self.clone(),
            options,
            staged: Vec::new(),
            touched: HashMap::new(),
        })
    }
}

pub struct MemoryTransaction {
    id: u64,
    store: MemoryStore,
    options: TxOptions,
    staged: Vec<(String, Row)>,
    /// Table name -> version seen when this transaction first touched it.
    touched: HashMap<String, u64>,
}

impl MemoryTransaction {
    fn touch(&mut self, table: &str, version: u64) {
        self.touched.entry(table.to_string()).or_insert(version);
    }

    fn staged_rows<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Row> + 'a {
        self.staged
            .iter()
            .filter(move |(name, _)| name == table)
            .map(|(_, row)| row)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn execute(&mut self, ctx: &Context, stmt: &Statement) -> Result<ExecSummary, StoreError> {
        self.store.pause(ctx).await?;
        let insert = as_insert(stmt)?;
        if self.options.access_mode == AccessMode::ReadOnly {
            return Err(StoreError::ReadOnlyTransaction);
        }
        let row = build_row(insert);

        let version = loop {
            let locked = {
                let mut state = self.store.lock();
                let staged: Vec<&Row> = self.staged_rows(&insert.table).collect();
                state.try_lock_key(self.id, &insert.table, &row, &staged)?
            };
            match locked {
                Some(version) => break version,
                None => ctx.guard(tokio::time::sleep(LOCK_POLL)).await?,
            }
        };

        self.touch(&insert.table, version);
        self.staged.push((insert.table.clone(), row));
        Ok(ExecSummary { rows_affected: 1 })
    }

    async fn fetch_one(&mut self, ctx: &Context, stmt: &Statement) -> Result<Row, StoreError> {
        self.fetch_many(ctx, stmt)
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound)
    }

    async fn fetch_many(&mut self, ctx: &Context, stmt: &Statement) -> Result<Vec<Row>, StoreError> {
        self.store.pause(ctx).await?;
        let select = as_select(stmt)?;

        let (rows, version) = {
            let state = self.store.lock();
            let table = state.table(&select.table)?;
            let visible = table.rows.iter().chain(self.staged_rows(&select.table));
            (select_rows(select, visible)?, table.version)
        };

        self.touch(&select.table, version);
        Ok(rows)
    }

    async fn commit(mut self, ctx: &Context) -> Result<(), StoreError> {
        self.store.pause(ctx).await?;

        let staged = std::mem::take(&mut self.staged);
        let mut state = self.store.lock();
        let result = apply_commit(&mut state, self.options, &self.touched, staged);
        drop(state);
        result
    }

    async fn rollback(self, ctx: &Context) -> Result<(), StoreError> {
        self.store.pause(ctx).await?;

        let mut state = self.store.lock();
        let result = state.take_fault(Fault::Rollback);
        if result.is_ok() {
            state.stats.rollbacks += 1;
        }
        drop(state);
        result
    }
}

fn apply_commit(
    state: &mut State,
    options: TxOptions,
    touched: &HashMap<String, u64>,
    staged: Vec<(String, Row)>,
) -> Result<(), StoreError> {
    state.take_fault(Fault::Commit)?;

    if options.isolation == IsolationLevel::Serializable {
        for (name, seen) in touched {
            if state.table(name)?.version != *seen {
                state.stats.rollbacks += 1;
                return Err(StoreError::SerializationFailure(format!(
                    "concurrent update on {name}"
                )));
            }
        }
    }

    // Re-check keys against rows committed since staging.
    for (name, row) in &staged {
        check_unique(state.table(name)?, name, row, &[])?;
    }

    let mut written = HashSet::new();
    for (name, row) in staged {
        if let Some(table) = state.tables.get_mut(&name) {
            table.rows.push(row);
            written.insert(name);
        }
    }
    for name in written {
        if let Some(table) = state.tables.get_mut(&name) {
            table.version += 1;
        }
    }
    state.stats.commits += 1;
    Ok(())
}

/// Releases key locks however the transaction ends.
impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        let id = self.id;
        self.store.lock().locks.retain(|lock| lock.tx != id);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn as_insert(stmt: &Statement) -> Result<&Insert, StoreError> {
    match stmt {
        Statement::Insert(insert) => Ok(insert),
        other => Err(StoreError::Unsupported(format!("execute {other:?}"))),
    }
}

fn as_select(stmt: &Statement) -> Result<&Select, StoreError> {
    match stmt {
        Statement::Select(select) => Ok(select),
        other => Err(StoreError::Unsupported(format!("fetch {other:?}"))),
    }
}

fn build_row(insert: &Insert) -> Row {
    let mut row = Row::new();
    for (column, value) in insert.columns.iter().zip(&insert.values) {
        row.push(column.clone(), value.clone());
    }
    row
}

fn check_unique(table: &Table, name: &str, row: &Row, staged: &[&Row]) -> Result<(), StoreError> {
    let key = row.value(&table.key);
    let taken = table
        .rows
        .iter()
        .chain(staged.iter().copied())
        .any(|existing| existing.value(&table.key) == key);
    if taken {
        return Err(StoreError::UniqueViolation(format!("{name}_pkey")));
    }
    Ok(())
}

fn select_rows<'a>(
    select: &Select,
    rows: impl Iterator<Item = &'a Row>,
) -> Result<Vec<Row>, StoreError> {
    let mut matched: Vec<&Row> = rows
        .filter(|row| {
            select
                .filters
                .iter()
                .all(|(column, value)| row.value(column) == Some(value))
        })
        .collect();

    if let Some(order_by) = &select.order_by {
        matched.sort_by(|a, b| compare(a.value(order_by), b.value(order_by)));
    }

    matched
        .into_iter()
        .map(|row| project(select, row))
        .collect()
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Int(a)), Some(Value::Int(b))) => a.cmp(b),
        (Some(Value::Text(a)), Some(Value::Text(b))) => a.cmp(b),
        (Some(Value::Uuid(a)), Some(Value::Uuid(b))) => a.cmp(b),
        (Some(Value::Timestamp(a)), Some(Value::Timestamp(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

fn project(select: &Select, row: &Row) -> Result<Row, StoreError> {
    if select.columns.is_empty() {
        return Ok(row.clone());
    }
    let mut out = Row::new();
    for column in &select.columns {
        let value = row.value(column).ok_or_else(|| StoreError::Decode {
            column: column.clone(),
            reason: format!("no such column in {}", select.table),
        })?;
        out.push(column.clone(), value.clone());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AccessMode;

    fn store() -> MemoryStore {
        MemoryStore::new().with_table("things", "id")
    }

    fn insert(id: i64) -> Statement {
        Insert::into_table("things")
            .value("id", id)
            .value("name", format!("thing-{id}"))
            .into()
    }

    fn select_all() -> Statement {
        Select::from_table("things").order_by("id").into()
    }

    fn read_committed() -> TxOptions {
        TxOptions::new(IsolationLevel::ReadCommitted, AccessMode::ReadWrite)
    }

    #[tokio::test]
    async fn test_autocommit_insert_and_fetch() {
        let store = store();
        let ctx = Context::background();

        store.execute(&ctx, &insert(1)).await.unwrap();
        let row = store
            .fetch_one(&ctx, &Select::from_table("things").filter_eq("id", 1i64).into())
            .await
            .unwrap();

        assert_eq!(row.get::<String>("name").unwrap(), "thing-1");
        assert_eq!(store.row_count("things"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_unique_violation() {
        let store = store();
        let ctx = Context::background();

        store.execute(&ctx, &insert(1)).await.unwrap();
        let err = store.execute(&ctx, &insert(1)).await.unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn test_fetch_one_on_empty_result_is_not_found() {
        let store = store();
        let err = store
            .fetch_one(&Context::background(), &select_all())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_staged_rows_invisible_until_commit() {
        let store = store();
        let ctx = Context::background();

        let mut tx = store.begin(&ctx, read_committed()).await.unwrap();
        tx.execute(&ctx, &insert(1)).await.unwrap();

        assert_eq!(tx.fetch_many(&ctx, &select_all()).await.unwrap().len(), 1);
        assert!(store.fetch_many(&ctx, &select_all()).await.unwrap().is_empty());

        tx.commit(&ctx).await.unwrap();
        assert_eq!(store.row_count("things"), 1);
        assert_eq!(store.stats().commits, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_rows() {
        let store = store();
        let ctx = Context::background();

        let mut tx = store.begin(&ctx, read_committed()).await.unwrap();
        tx.execute(&ctx, &insert(1)).await.unwrap();
        tx.rollback(&ctx).await.unwrap();

        assert_eq!(store.row_count("things"), 0);
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_serializable_conflict_detected_at_commit() {
        let store = store();
        let ctx = Context::background();
        let serializable = TxOptions::new(IsolationLevel::Serializable, AccessMode::ReadWrite);

        let mut first = store.begin(&ctx, serializable).await.unwrap();
        let mut second = store.begin(&ctx, serializable).await.unwrap();
        first.fetch_many(&ctx, &select_all()).await.unwrap();
        second.fetch_many(&ctx, &select_all()).await.unwrap();
        first.execute(&ctx, &insert(1)).await.unwrap();
        second.execute(&ctx, &insert(2)).await.unwrap();

        first.commit(&ctx).await.unwrap();
        let err = second.commit(&ctx).await.unwrap_err();
        assert!(matches!(err, StoreError::SerializationFailure(_)));
        assert_eq!(store.row_count("things"), 1);
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let store = store();
        let ctx = Context::background();
        store.fail_next(Fault::Begin);

        let err = store.begin(&ctx, read_committed()).await.err().unwrap();
        assert!(matches!(err, StoreError::ConnectionLost(_)));
        assert!(store.begin(&ctx, read_committed()).await.is_ok());
    }

    #[tokio::test]
    async fn test_latency_respects_deadline() {
        let store = store().with_latency(Duration::from_millis(200));
        let ctx = Context::background().with_timeout(Duration::from_millis(10));

        let err = store.execute(&ctx, &insert(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::DeadlineExceeded(_)));
        assert_eq!(store.row_count("things"), 0);
    }

    #[tokio::test]
    async fn test_read_only_transaction_rejects_writes() {
        let store = store();
        let ctx = Context::background();
        let read_only = TxOptions::new(IsolationLevel::ReadCommitted, AccessMode::ReadOnly);

        let mut tx = store.begin(&ctx, read_only).await.unwrap();
        let err = tx.execute(&ctx, &insert(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::ReadOnlyTransaction));

        // Reads are still fine.
        assert!(tx.fetch_many(&ctx, &select_all()).await.unwrap().is_empty());
        tx.commit(&ctx).await.unwrap();
        assert_eq!(store.row_count("things"), 0);
    }

    #[tokio::test]
    async fn test_insert_of_key_staged_elsewhere_waits_then_conflicts() {
        let store = store();
        let ctx = Context::background();

        let mut holder = store.begin(&ctx, read_committed()).await.unwrap();
        let mut waiter = store.begin(&ctx, read_committed()).await.unwrap();
        holder.execute(&ctx, &insert(1)).await.unwrap();

        let blocked = tokio::spawn(async move {
            let ctx = Context::background();
            let result = waiter.execute(&ctx, &insert(1)).await;
            let _ = waiter.rollback(&ctx).await;
            result
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        holder.commit(&ctx).await.unwrap();
        let err = blocked.await.unwrap().unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(store.row_count("things"), 1);
    }

    #[tokio::test]
    async fn test_waiting_insert_proceeds_after_holder_rolls_back() {
        let store = store();
        let ctx = Context::background();

        let mut holder = store.begin(&ctx, read_committed()).await.unwrap();
        let mut waiter = store.begin(&ctx, read_committed()).await.unwrap();
        holder.execute(&ctx, &insert(1)).await.unwrap();

        let blocked = tokio::spawn(async move {
            let ctx = Context::background();
            waiter.execute(&ctx, &insert(1)).await?;
            waiter.commit(&ctx).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        holder.rollback(&ctx).await.unwrap();

        blocked.await.unwrap().unwrap();
        assert_eq!(store.row_count("things"), 1);
    }

    #[tokio::test]
    async fn test_autocommit_insert_waits_for_locked_key() {
        let store = store();
        let ctx = Context::background();

        let mut holder = store.begin(&ctx, read_committed()).await.unwrap();
        holder.execute(&ctx, &insert(1)).await.unwrap();

        let pool = store.clone();
        let blocked = tokio::spawn(async move {
            pool.execute(&Context::background(), &insert(1)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        holder.commit(&ctx).await.unwrap();
        assert!(blocked.await.unwrap().unwrap_err().is_unique_violation());
    }

    #[tokio::test]
    async fn test_blocked_insert_honours_deadline() {
        let store = store();
        let ctx = Context::background();

        let mut holder = store.begin(&ctx, read_committed()).await.unwrap();
        let mut waiter = store.begin(&ctx, read_committed()).await.unwrap();
        holder.execute(&ctx, &insert(1)).await.unwrap();

        let short = Context::background().with_timeout(Duration::from_millis(20));
        let err = waiter.execute(&short, &insert(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn test_dropped_transaction_releases_its_keys() {
        let store = store();
        let ctx = Context::background();

        let mut holder = store.begin(&ctx, read_committed()).await.unwrap();
        holder.execute(&ctx, &insert(1)).await.unwrap();
        drop(holder);

        store.execute(&ctx, &insert(1)).await.unwrap();
        assert_eq!(store.row_count("things"), 1);
    }

    #[tokio::test]
    async fn test_raw_statements_are_unsupported() {
        let err = store()
            .execute(&Context::background(), &Statement::raw("SELECT 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }
}
