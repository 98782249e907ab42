//! Relational tables driven by the SQL dialect in [`super::sql`].
//!
//! A transaction writes into a copy-on-first-write working set layered over the committed
//! tables, so statements outside it keep reading committed rows. Commit folds the working set
//! back in; rollback drops it.

use super::Store;
use super::sql::{self, Statement, Table, TableSet, UndoOp};
use crate::clock::SimEnv;
use crate::testing::Resettable;
use crate::traits::{
    CloudError, CloudResult, DatabaseIO, DatabaseIOExt, ExecuteResult, Migration,
    MigrationReport, Row, SqlExecutor,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

const MIGRATIONS_TABLE: &str = "_migrations";

#[derive(Debug, Default)]
pub struct DatabaseState {
    tables: BTreeMap<String, Table>,
    transaction_open: bool,
}

/// Committed tables seen through a transaction's private copies.
struct Overlay<'a> {
    base: &'a BTreeMap<String, Table>,
    working: &'a mut BTreeMap<String, Option<Table>>,
}

impl TableSet for Overlay<'_> {
    fn table(&self, name: &str) -> Option<&Table> {
        match self.working.get(name) {
            Some(entry) => entry.as_ref(),
            None => self.base.get(name),
        }
    }

    fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        if !self.working.contains_key(name) {
            let copy = self.base.get(name)?.clone();
            self.working.insert(name.to_string(), Some(copy));
        }
        self.working.get_mut(name).and_then(Option::as_mut)
    }

    fn create_table(&mut self, name: &str, table: Table) {
        self.working.insert(name.to_string(), Some(table));
    }

    fn drop_table(&mut self, name: &str) -> Option<Table> {
        let previous = match self.working.get_mut(name) {
            Some(entry) => entry.take(),
            None => self.base.get(name).cloned(),
        };
        if previous.is_some() {
            self.working.insert(name.to_string(), None);
        }
        previous
    }
}

/// Clears the open-transaction flag however the transaction ends, unwinding included.
struct TransactionGuard {
    store: Store<DatabaseState>,
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.store.lock().transaction_open = false;
    }
}

struct Transaction {
    store: Store<DatabaseState>,
    env: SimEnv,
    working: BTreeMap<String, Option<Table>>,
    undo: Vec<UndoOp>,
    _guard: TransactionGuard,
}

impl Transaction {
    fn commit(mut self) {
        let mut state = self.store.lock();
        let changed = self.working.len();
        for (name, table) in std::mem::take(&mut self.working) {
            match table {
                Some(table) => state.tables.insert(name, table),
                None => state.tables.remove(&name),
            };
        }
        state.transaction_open = false;
        debug!(tables = changed, writes = self.undo.len(), "transaction committed");
    }

    fn rollback(mut self) {
        let state = self.store.lock();
        let undone = self.undo.len();
        let mut overlay = Overlay {
            base: &state.tables,
            working: &mut self.working,
        };
        sql::rollback(&mut overlay, std::mem::take(&mut self.undo));
        debug!(writes = undone, "transaction rolled back");
    }
}

impl SqlExecutor for Transaction {
    fn query(&mut self, sql: &str, params: &[Value]) -> CloudResult<Vec<Row>> {
        self.env.enter("database.transaction.query")?;
        let Statement::Select(select) = sql::parse(sql, params)? else {
            return Err(CloudError::validation("query only accepts SELECT statements"));
        };
        let state = self.store.lock();
        let overlay = Overlay {
            base: &state.tables,
            working: &mut self.working,
        };
        sql::run_query(&overlay, &select)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> CloudResult<ExecuteResult> {
        self.env.enter("database.transaction.execute")?;
        let statement = sql::parse(sql, params)?;
        let state = self.store.lock();
        let mut overlay = Overlay {
            base: &state.tables,
            working: &mut self.working,
        };
        sql::execute_atomic(&mut overlay, statement, &mut self.undo)
    }
}

// ============================================================================
// FakeDatabaseIO
// ============================================================================

#[derive(Clone)]
pub struct FakeDatabaseIO {
    store: Store<DatabaseState>,
    env: SimEnv,
}

impl FakeDatabaseIO {
    #[must_use]
    pub fn new() -> Self {
        Self::with_env(SimEnv::default())
    }

    #[must_use]
    pub fn with_env(env: SimEnv) -> Self {
        Self::with_store(Store::default(), env)
    }

    /// Nothing in a database expires, so no sweeper is registered.
    #[must_use]
    pub fn with_store(store: Store<DatabaseState>, env: SimEnv) -> Self {
        Self { store, env }
    }

    #[must_use]
    pub fn store(&self) -> Store<DatabaseState> {
        self.store.clone()
    }

    /// Whether a transaction is currently open against this store.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.store.lock().transaction_open
    }
}

impl Default for FakeDatabaseIO {
    fn default() -> Self {
        Self::new()
    }
}

impl Resettable for FakeDatabaseIO {
    fn reset(&self) {
        *self.store.lock() = DatabaseState::default();
    }
}

impl DatabaseIO for FakeDatabaseIO {
    fn query(&self, sql: &str, params: &[Value]) -> CloudResult<Vec<Row>> {
        self.env.enter("database.query")?;
        let Statement::Select(select) = sql::parse(sql, params)? else {
            return Err(CloudError::validation("query only accepts SELECT statements"));
        };
        let state = self.store.lock();
        sql::run_query(&state.tables, &select)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> CloudResult<ExecuteResult> {
        self.env.enter("database.execute")?;
        let statement = sql::parse(sql, params)?;
        let mut state = self.store.lock();
        if state.transaction_open {
            return Err(CloudError::conflict(
                "a transaction is in progress; write through the transaction instead",
            ));
        }
        let result = sql::execute_atomic(&mut state.tables, statement, &mut Vec::new())?;
        debug!(rows = result.rows_affected, "statement executed");
        Ok(result)
    }

    fn transaction(
        &self,
        work: &mut dyn FnMut(&mut dyn SqlExecutor) -> CloudResult<()>,
    ) -> CloudResult<()> {
        self.env.enter("database.transaction")?;
        {
            let mut state = self.store.lock();
            if state.transaction_open {
                return Err(CloudError::validation("nested transactions are not supported"));
            }
            state.transaction_open = true;
        }

        let mut tx = Transaction {
            store: self.store.clone(),
            env: self.env.clone(),
            working: BTreeMap::new(),
            undo: Vec::new(),
            _guard: TransactionGuard {
                store: self.store.clone(),
            },
        };
        match work(&mut tx) {
            Ok(()) => {
                tx.commit();
                Ok(())
            }
            Err(err) => {
                tx.rollback();
                warn!(error = %err, "transaction failed");
                Err(err)
            }
        }
    }

    fn migrate(&self, migrations: &[Migration]) -> CloudResult<MigrationReport> {
        self.env.enter("database.migrate")?;
        let mut ordered: Vec<&Migration> = migrations.iter().collect();
        ordered.sort_by_key(|m| m.version);
        if let Some(pair) = ordered.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(CloudError::validation(format!(
                "duplicate migration version {}",
                pair[0].version
            )));
        }

        self.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} \
                 (version INTEGER PRIMARY KEY, name TEXT NOT NULL, applied_at INTEGER NOT NULL)"
            ),
            &[],
        )?;
        let applied: BTreeSet<i64> = self
            .query(&format!("SELECT version FROM {MIGRATIONS_TABLE}"), &[])?
            .iter()
            .filter_map(|row| row.get("version").and_then(Value::as_i64))
            .collect();

        let mut report = MigrationReport::default();
        for migration in ordered {
            if applied.contains(&migration.version) {
                report.skipped.push(migration.version);
                continue;
            }
            let statements = sql::split_statements(&migration.sql);
            if statements.is_empty() {
                return Err(CloudError::validation(format!(
                    "migration {} has no statements",
                    migration.version
                )));
            }

            let now = self.env.now();
            self.run_transaction(|tx| {
                for statement in &statements {
                    tx.execute(statement, &[])?;
                }
                tx.execute(
                    &format!(
                        "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at) VALUES (?, ?, ?)"
                    ),
                    &[json!(migration.version), json!(migration.name), json!(now)],
                )?;
                Ok(())
            })
            .inspect_err(|err| {
                warn!(version = migration.version, name = %migration.name, error = %err, "migration failed");
            })?;
            info!(version = migration.version, name = %migration.name, "migration applied");
            report.applied.push(migration.version);
        }
        Ok(report)
    }

    fn table_exists(&self, table: &str) -> CloudResult<bool> {
        self.env.enter("database.table_exists")?;
        Ok(self.store.lock().tables.contains_key(table))
    }

    /// User tables only; the migration ledger is left out.
    fn list_tables(&self) -> CloudResult<Vec<String>> {
        self.env.enter("database.list_tables")?;
        Ok(self
            .store
            .lock()
            .tables
            .keys()
            .filter(|name| name.as_str() != MIGRATIONS_TABLE)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ErrorKind;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn accounts() -> FakeDatabaseIO {
        let db = FakeDatabaseIO::new();
        db.execute(
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL, balance INTEGER NOT NULL)",
            &[],
        )
        .unwrap();
        db.execute(
            "INSERT INTO accounts (owner, balance) VALUES ('ada', 100), ('alan', 50)",
            &[],
        )
        .unwrap();
        db
    }

    #[test]
    fn outside_reads_see_committed_rows_during_a_transaction() {
        let db = accounts();
        let outside = db.clone();
        db.transaction(&mut |tx| {
            tx.execute("UPDATE accounts SET balance = 0 WHERE owner = 'ada'", &[])?;
            let inside = tx.query("SELECT balance FROM accounts WHERE owner = 'ada'", &[])?;
            assert_eq!(inside[0]["balance"], json!(0));
            let committed = outside.query("SELECT balance FROM accounts WHERE owner = 'ada'", &[])?;
            assert_eq!(committed[0]["balance"], json!(100));

            let err = outside.execute("DELETE FROM accounts", &[]).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Conflict);
            Ok(())
        })
        .unwrap();

        let rows = db.query("SELECT balance FROM accounts WHERE owner = 'ada'", &[]).unwrap();
        assert_eq!(rows[0]["balance"], json!(0));
    }

    #[test]
    fn nested_transactions_are_rejected() {
        let db = accounts();
        let inner = db.clone();
        db.transaction(&mut |_| {
            let err = inner.transaction(&mut |_| Ok(())).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Validation);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn panicking_work_leaves_no_open_transaction() {
        let db = accounts();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = db.transaction(&mut |tx| {
                tx.execute("DELETE FROM accounts", &[])?;
                panic!("boom");
            });
        }));
        assert!(result.is_err());
        assert!(!db.in_transaction());
        assert_eq!(db.query("SELECT * FROM accounts", &[]).unwrap().len(), 2);
    }

    #[test]
    fn tables_created_in_a_rolled_back_transaction_vanish() {
        let db = accounts();
        let err = db
            .transaction(&mut |tx| {
                tx.execute("CREATE TABLE audit (entry TEXT)", &[])?;
                tx.execute("DROP TABLE accounts", &[])?;
                Err(CloudError::validation("abort"))
            })
            .unwrap_err();
        assert_eq!(err.message, "abort");
        assert!(!db.table_exists("audit").unwrap());
        assert!(db.table_exists("accounts").unwrap());
    }
}
