// Integration tests for the relational engine: SQL, transactions, migrations.

mod common;

use anyhow::Result;
use cloudsim::testing::{assert_error_kind, assert_names};
use cloudsim::*;
use common::simulated;
use serde_json::json;

fn accounts(database: &dyn DatabaseIO) -> Result<()> {
    database.execute(
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL UNIQUE, balance INTEGER NOT NULL)",
        &[],
    )?;
    database.execute(
        "INSERT INTO accounts (owner, balance) VALUES (?, ?), (?, ?)",
        &[json!("ada"), json!(100), json!("alan"), json!(50)],
    )?;
    Ok(())
}

fn balance(database: &dyn DatabaseIO, owner: &str) -> Result<i64> {
    let rows = database.query("SELECT balance FROM accounts WHERE owner = ?", &[json!(owner)])?;
    rows.first()
        .and_then(|row| row["balance"].as_i64())
        .ok_or_else(|| anyhow::anyhow!("no account for {owner}"))
}

fn transfer(database: &dyn DatabaseIO, from: &str, to: &str, amount: i64) -> CloudResult<()> {
    database.run_transaction(|tx| {
        tx.execute(
            "UPDATE accounts SET balance = balance - ? WHERE owner = ?",
            &[json!(amount), json!(from)],
        )?;
        let rows = tx.query("SELECT balance FROM accounts WHERE owner = ?", &[json!(from)])?;
        if rows.first().and_then(|r| r["balance"].as_i64()).unwrap_or(0) < 0 {
            return Err(CloudError::validation("insufficient funds"));
        }
        let credited = tx.execute(
            "UPDATE accounts SET balance = balance + ? WHERE owner = ?",
            &[json!(amount), json!(to)],
        )?;
        if credited.rows_affected != 1 {
            return Err(CloudError::validation(format!("unknown account {to}")));
        }
        Ok(())
    })
}

// ============================================================================
// Statements
// ============================================================================

#[test]
fn test_insert_assigns_integer_primary_keys() -> Result<()> {
    let (_, cloud, _) = simulated();
    accounts(cloud.database.as_ref())?;

    let result = cloud.database.execute(
        "INSERT INTO accounts (owner, balance) VALUES ('grace', 10)",
        &[],
    )?;
    assert_eq!(result.rows_affected, 1);
    assert_eq!(result.last_insert_id, Some(3));

    let rows = cloud.database.query("SELECT id, owner FROM accounts ORDER BY id", &[])?;
    let ids: Vec<_> = rows.iter().filter_map(|r| r["id"].as_i64()).collect();
    assert_eq!(ids, [1, 2, 3]);
    Ok(())
}

#[test]
fn test_whole_float_primary_key_advances_the_sequence() -> Result<()> {
    let (_, cloud, _) = simulated();
    accounts(cloud.database.as_ref())?;

    let explicit = cloud.database.execute(
        "INSERT INTO accounts (id, owner, balance) VALUES (?, 'grace', 10)",
        &[json!(5.0)],
    )?;
    assert_eq!(explicit.last_insert_id, Some(5));
    let next = cloud.database.execute(
        "INSERT INTO accounts (owner, balance) VALUES ('edsger', 20)",
        &[],
    )?;
    assert_eq!(next.last_insert_id, Some(6));

    let rows = cloud.database.query("SELECT id FROM accounts ORDER BY id", &[])?;
    let ids: Vec<_> = rows.iter().filter_map(|r| r["id"].as_i64()).collect();
    assert_eq!(ids, [1, 2, 5, 6]);
    Ok(())
}

#[test]
fn test_constraint_violations() -> Result<()> {
    let (_, cloud, _) = simulated();
    accounts(cloud.database.as_ref())?;

    assert_error_kind(
        &cloud.database.execute("INSERT INTO accounts (owner, balance) VALUES ('ada', 1)", &[]),
        ErrorKind::Conflict,
    );
    assert_error_kind(
        &cloud.database.execute("INSERT INTO accounts (owner) VALUES ('nobody')", &[]),
        ErrorKind::Validation,
    );
    assert_error_kind(
        &cloud.database.query("SELECT * FROM ledger", &[]),
        ErrorKind::NotFound,
    );
    assert_error_kind(
        &cloud.database.query("SELEC * FROM accounts", &[]),
        ErrorKind::Validation,
    );
    assert_error_kind(
        &cloud.database.query("DELETE FROM accounts", &[]),
        ErrorKind::Validation,
    );
    Ok(())
}

#[test]
fn test_filtering_ordering_and_counting() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.database.execute(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL, age INTEGER)",
        &[],
    )?;
    for (email, age) in [
        ("ada@example.com", json!(36)),
        ("alan@example.com", json!(41)),
        ("grace@navy.mil", json!(85)),
        ("anon@example.com", json!(null)),
    ] {
        cloud
            .database
            .execute("INSERT INTO users (email, age) VALUES ($1, $2)", &[json!(email), age])?;
    }

    let rows = cloud.database.query(
        "SELECT email FROM users WHERE email LIKE '%@example.com' AND age IS NOT NULL ORDER BY age DESC",
        &[],
    )?;
    let emails: Vec<_> = rows.iter().filter_map(|r| r["email"].as_str()).collect();
    assert_eq!(emails, ["alan@example.com", "ada@example.com"]);

    let rows = cloud.database.query(
        "SELECT email AS address FROM users ORDER BY email LIMIT 2 OFFSET 1",
        &[],
    )?;
    let emails: Vec<_> = rows.iter().filter_map(|r| r["address"].as_str()).collect();
    assert_eq!(emails, ["alan@example.com", "anon@example.com"]);

    let rows = cloud
        .database
        .query("SELECT COUNT(*) AS n FROM users WHERE age BETWEEN 30 AND 50", &[])?;
    assert_eq!(rows[0]["n"], json!(2));

    let removed = cloud.database.execute("DELETE FROM users WHERE age IS NULL", &[])?;
    assert_eq!(removed.rows_affected, 1);
    let rows = cloud.database.query("SELECT COUNT(*) FROM users", &[])?;
    assert_eq!(rows[0]["count"], json!(3));
    Ok(())
}

// ============================================================================
// Transactions
// ============================================================================

#[test]
fn test_committed_transfer() -> Result<()> {
    let (_, cloud, _) = simulated();
    accounts(cloud.database.as_ref())?;

    transfer(cloud.database.as_ref(), "ada", "alan", 30)?;
    assert_eq!(balance(cloud.database.as_ref(), "ada")?, 70);
    assert_eq!(balance(cloud.database.as_ref(), "alan")?, 80);
    Ok(())
}

#[test]
fn test_failed_transfer_changes_nothing() -> Result<()> {
    let (_, cloud, _) = simulated();
    accounts(cloud.database.as_ref())?;

    assert_error_kind(
        &transfer(cloud.database.as_ref(), "alan", "ada", 80),
        ErrorKind::Validation,
    );
    assert_error_kind(
        &transfer(cloud.database.as_ref(), "ada", "nobody", 10),
        ErrorKind::Validation,
    );
    assert_eq!(balance(cloud.database.as_ref(), "ada")?, 100);
    assert_eq!(balance(cloud.database.as_ref(), "alan")?, 50);
    Ok(())
}

#[test]
fn test_outside_writes_conflict_during_a_transaction() -> Result<()> {
    let (_, cloud, fakes) = simulated();
    accounts(cloud.database.as_ref())?;
    let outside = cloud.database.clone();

    let seen = cloud.database.run_transaction(|tx| {
        tx.execute("UPDATE accounts SET balance = 0 WHERE owner = 'ada'", &[])?;
        assert!(fakes.database.in_transaction());
        assert_error_kind(
            &outside.execute("UPDATE accounts SET balance = 1", &[]),
            ErrorKind::Conflict,
        );
        let committed = outside.query("SELECT balance FROM accounts WHERE owner = 'ada'", &[])?;
        Ok(committed[0]["balance"].clone())
    })?;

    assert_eq!(seen, json!(100));
    assert!(!fakes.database.in_transaction());
    assert_eq!(balance(cloud.database.as_ref(), "ada")?, 0);
    Ok(())
}

#[test]
fn test_injected_fault_inside_transaction_rolls_back() -> Result<()> {
    let (_, cloud, fakes) = simulated();
    accounts(cloud.database.as_ref())?;
    fakes.faults.fail_next("database.transaction.execute", 1);

    let result = cloud.database.run_transaction(|tx| {
        tx.execute("DELETE FROM accounts WHERE owner = 'ada'", &[])
    });
    assert_error_kind(&result, ErrorKind::Unavailable);
    assert_eq!(balance(cloud.database.as_ref(), "ada")?, 100);
    Ok(())
}

// ============================================================================
// Migrations
// ============================================================================

fn migrations() -> Vec<Migration> {
    vec![
        Migration::new(
            2,
            "seed_plans",
            "INSERT INTO plans (name, price) VALUES ('free', 0); INSERT INTO plans (name, price) VALUES ('pro', 12.5)",
        ),
        Migration::new(
            1,
            "create_plans",
            "CREATE TABLE plans (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, price REAL)",
        ),
    ]
}

#[test]
fn test_migrations_apply_once_in_version_order() -> Result<()> {
    let (_, cloud, _) = simulated();

    let first = cloud.database.migrate(&migrations())?;
    assert_eq!(first.applied, [1, 2]);
    assert!(first.skipped.is_empty());

    let second = cloud.database.migrate(&migrations())?;
    assert!(second.applied.is_empty());
    assert_eq!(second.skipped, [1, 2]);

    let rows = cloud.database.query("SELECT name FROM plans ORDER BY price DESC", &[])?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], json!("pro"));

    assert_names(&cloud.database.list_tables(), &["plans"]);
    assert!(cloud.database.table_exists("plans")?);
    Ok(())
}

#[test]
fn test_failed_migration_is_not_recorded() -> Result<()> {
    let (_, cloud, _) = simulated();
    let broken = vec![
        Migration::new(1, "create_plans", "CREATE TABLE plans (id INTEGER PRIMARY KEY, name TEXT)"),
        Migration::new(2, "bad", "CREATE TABLE tiers (id INTEGER); INSERT INTO missing (x) VALUES (1)"),
    ];
    assert_error_kind(&cloud.database.migrate(&broken), ErrorKind::NotFound);
    assert!(cloud.database.table_exists("plans")?);
    assert!(!cloud.database.table_exists("tiers")?);

    let fixed = vec![
        broken[0].clone(),
        Migration::new(2, "tiers", "CREATE TABLE tiers (id INTEGER)"),
    ];
    let report = cloud.database.migrate(&fixed)?;
    assert_eq!(report.skipped, [1]);
    assert_eq!(report.applied, [2]);
    Ok(())
}

#[test]
fn test_duplicate_migration_versions_are_rejected() -> Result<()> {
    let (_, cloud, _) = simulated();
    let duplicated = vec![
        Migration::new(1, "a", "CREATE TABLE a (id INTEGER)"),
        Migration::new(1, "b", "CREATE TABLE b (id INTEGER)"),
    ];
    assert_error_kind(&cloud.database.migrate(&duplicated), ErrorKind::Validation);
    assert_names(&cloud.database.list_tables(), &[]);
    Ok(())
}
