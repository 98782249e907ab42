//! Behavioral checks every implementation of a service trait must pass.
//!
//! Each check creates its own uniquely named resources, cleans them up again and panics with
//! a descriptive message on the first mismatch. None of them moves or waits on the clock, so
//! they run unchanged against a fake or a vendor adapter:
//!
//! ```
//! use cloudsim::testing::contract;
//! use cloudsim::{CloudProvider, SimulationConfig};
//!
//! let provider = CloudProvider::memory(&SimulationConfig::default());
//! contract::check_all(&provider);
//! ```

use super::assertions::{assert_error_kind, assert_names};
use crate::provider::CloudProvider;
use crate::traits::{
    AppConfig, AuthIO, BatchIO, CollectionConfig, Condition, ConfigIO, DatabaseIO, DatabaseIOExt,
    DeploymentRequest, DeploymentStatus, DocumentIO, DocumentQuery, ErrorKind, Event, EventBusIO,
    EventPattern, EventRule, Filter, HostingIO, JobDefinition, JobRequest, NotificationIO, ObjectIO,
    OutgoingMessage, ParameterKind, Protocol, PutOptions, QueueConfig, QueueIO, ReceiveOptions,
    SecretsIO, SignUp, SortOrder, TopicMessage, UrlMethod,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT: AtomicU64 = AtomicU64::new(1);

fn unique(service: &str) -> String {
    format!("contract-{service}-{}", NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Run every check against one provider.
pub fn check_all(provider: &CloudProvider) {
    check_queue_contract(provider.queues.as_ref());
    check_document_contract(provider.documents.as_ref());
    check_database_contract(provider.database.as_ref());
    check_event_contract(provider.events.as_ref());
    check_object_contract(provider.objects.as_ref());
    check_notification_contract(provider.notifications.as_ref());
    check_secrets_contract(provider.secrets.as_ref());
    check_config_contract(provider.config.as_ref());
    check_auth_contract(provider.auth.as_ref());
    check_hosting_contract(provider.hosting.as_ref());
    check_batch_contract(provider.batch.as_ref());
}

// ============================================================================
// Queues
// ============================================================================

pub fn check_queue_contract(queues: &dyn QueueIO) {
    let name = unique("queue");
    queues
        .create_queue(&name, QueueConfig::default())
        .expect("create_queue");
    assert_error_kind(
        &queues.create_queue(&name, QueueConfig::default()),
        ErrorKind::Conflict,
    );
    assert!(
        queues.list_queues(Some(&name)).expect("list_queues").contains(&name),
        "created queue is not listed"
    );

    queues
        .send(&name, OutgoingMessage::text("hello").with_attribute("kind", "greeting"))
        .expect("send");
    let received = queues
        .receive(&name, ReceiveOptions::up_to(10))
        .expect("receive");
    assert_eq!(received.len(), 1, "exactly one message should be delivered");
    let message = &received[0];
    assert_eq!(message.body_text(), Some("hello"));
    assert_eq!(message.attributes.get("kind").map(String::as_str), Some("greeting"));
    assert_eq!(message.receive_count, 1);

    assert!(
        queues.receive(&name, ReceiveOptions::default()).expect("receive").is_empty(),
        "an in-flight message must not be delivered again"
    );
    queues
        .acknowledge(&name, &message.receipt_handle)
        .expect("acknowledge");
    assert_error_kind(
        &queues.acknowledge(&name, &message.receipt_handle),
        ErrorKind::Validation,
    );

    let batch = queues
        .send_batch(&name, vec![OutgoingMessage::text("a"), OutgoingMessage::text("b")])
        .expect("send_batch");
    assert!(batch.all_succeeded());
    assert_error_kind(&queues.send_batch(&name, Vec::new()), ErrorKind::Validation);
    queues.purge(&name).expect("purge");
    assert_eq!(queues.queue_stats(&name).expect("queue_stats").available, 0);

    assert_error_kind(
        &queues.receive(&name, ReceiveOptions::up_to(0)),
        ErrorKind::Validation,
    );
    queues.delete_queue(&name).expect("delete_queue");
    assert_error_kind(&queues.delete_queue(&name), ErrorKind::NotFound);
    assert_error_kind(&queues.send(&name, OutgoingMessage::text("x")), ErrorKind::NotFound);
}

// ============================================================================
// Documents
// ============================================================================

pub fn check_document_contract(documents: &dyn DocumentIO) {
    let name = unique("collection");
    documents
        .create_collection(&name, CollectionConfig::default())
        .expect("create_collection");

    documents
        .insert(&name, json!({ "id": "ada", "name": "Ada", "age": 36 }))
        .expect("insert");
    documents
        .insert(&name, json!({ "id": "alan", "name": "Alan", "age": 41 }))
        .expect("insert");
    documents
        .insert(&name, json!({ "id": "anon", "name": "Anonymous" }))
        .expect("insert");
    assert_error_kind(
        &documents.insert(&name, json!({ "id": "ada" })),
        ErrorKind::Conflict,
    );
    assert_error_kind(&documents.insert(&name, json!([1, 2])), ErrorKind::Validation);

    let generated = documents.insert(&name, json!({ "name": "Grace" })).expect("insert");
    assert!(!generated.id.is_empty(), "a missing id must be generated");

    let older = Filter::from_json(&json!({ "age": { "$gt": 30 } })).expect("filter");
    let ids: Vec<String> = documents
        .query(&name, &DocumentQuery::new(older.clone()).sort_by("age", SortOrder::Descending))
        .expect("query")
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, ["alan", "ada"], "absent fields must not satisfy a comparison");
    assert_eq!(documents.count(&name, &older).expect("count"), 2);
    let without_age = Filter::new().with("age", Condition::Exists(false));
    assert_eq!(documents.count(&name, &without_age).expect("count"), 2);

    let updated = documents
        .update(&name, "ada", json!({ "age": 37 }))
        .expect("update");
    assert_eq!(updated.data["age"], json!(37));
    assert_eq!(updated.data["name"], json!("Ada"));
    assert_error_kind(
        &documents.update(&name, "ada", json!({ "id": "other" })),
        ErrorKind::Validation,
    );

    documents.delete(&name, "ada").expect("delete");
    assert_eq!(documents.find_by_id(&name, "ada").expect("find_by_id"), None);
    assert_error_kind(&documents.delete(&name, "ada"), ErrorKind::NotFound);

    documents.delete_collection(&name).expect("delete_collection");
    assert_error_kind(&documents.get_collection(&name), ErrorKind::NotFound);
}

// ============================================================================
// Relational
// ============================================================================

pub fn check_database_contract(database: &dyn DatabaseIO) {
    let table = unique("table").replace('-', "_");
    database
        .execute(
            &format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, score INTEGER)"),
            &[],
        )
        .expect("create table");
    let inserted = database
        .execute(
            &format!("INSERT INTO {table} (name, score) VALUES (?, ?)"),
            &[json!("ada"), json!(10)],
        )
        .expect("insert");
    assert_eq!(inserted.rows_affected, 1);
    assert!(inserted.last_insert_id.is_some(), "an integer key must be assigned");

    assert_error_kind(
        &database.execute(&format!("INSERT INTO {table} (name) VALUES ('ada')"), &[]),
        ErrorKind::Conflict,
    );
    assert_error_kind(
        &database.execute(&format!("INSERT INTO {table} (score) VALUES (1)"), &[]),
        ErrorKind::Validation,
    );
    assert_error_kind(&database.query("SELEKT 1", &[]), ErrorKind::Validation);
    assert_error_kind(
        &database.query("SELECT * FROM contract_missing_table", &[]),
        ErrorKind::NotFound,
    );

    let failed = database.run_transaction(|tx| {
        tx.execute(&format!("UPDATE {table} SET score = score + 5"), &[])?;
        tx.execute(&format!("INSERT INTO {table} (name) VALUES ('ada')"), &[])?;
        Ok(())
    });
    assert_error_kind(&failed, ErrorKind::Conflict);
    let rows = database
        .query(&format!("SELECT score FROM {table} WHERE name = ?"), &[json!("ada")])
        .expect("select");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["score"], json!(10), "a failed transaction must leave no trace");

    database
        .run_transaction(|tx| {
            tx.execute(&format!("UPDATE {table} SET score = score + 5"), &[])?;
            Ok(())
        })
        .expect("transaction");
    let rows = database
        .query(&format!("SELECT score FROM {table}"), &[])
        .expect("select");
    assert_eq!(rows[0]["score"], json!(15));

    assert!(database.table_exists(&table).expect("table_exists"));
    database
        .execute(&format!("DROP TABLE {table}"), &[])
        .expect("drop table");
    assert!(!database.table_exists(&table).expect("table_exists"));
}

// ============================================================================
// Events
// ============================================================================

pub fn check_event_contract(events: &dyn EventBusIO) {
    let bus = unique("bus");
    events.create_event_bus(&bus).expect("create_event_bus");
    assert_error_kind(&events.create_event_bus(&bus), ErrorKind::Conflict);

    let rule = EventRule::new("orders", EventPattern::any().with_sources(["shop"]));
    events.put_rule(&bus, rule.clone()).expect("put_rule");
    assert_error_kind(&events.put_rule(&bus, rule), ErrorKind::Conflict);
    assert_error_kind(
        &events.put_rule(
            &bus,
            EventRule::new(
                "ranges",
                EventPattern::any().with_field("total", Condition::Gt(json!(1))),
            ),
        ),
        ErrorKind::Validation,
    );

    let id = events
        .publish(&bus, Event::new("shop", "OrderPlaced", json!({ "total": 3 })))
        .expect("publish");
    assert!(!id.is_empty());
    assert_error_kind(
        &events.publish(&bus, Event::new("", "OrderPlaced", json!({}))),
        ErrorKind::Validation,
    );

    let batch = events
        .publish_batch(
            &bus,
            vec![
                Event::new("shop", "OrderPlaced", json!({})),
                Event::new("shop", "", json!({})),
            ],
        )
        .expect("publish_batch");
    assert_eq!(batch.failed_count(), 1, "a malformed entry fails on its own");
    assert!(batch.entries[0].is_ok());

    let rules = events.list_rules(&bus).expect("list_rules");
    assert_eq!(rules.len(), 1);
    events.delete_rule(&bus, "orders").expect("delete_rule");
    assert_error_kind(&events.describe_rule(&bus, "orders"), ErrorKind::NotFound);

    events.delete_event_bus(&bus).expect("delete_event_bus");
    assert_error_kind(
        &events.publish(&bus, Event::new("shop", "OrderPlaced", json!({}))),
        ErrorKind::NotFound,
    );
}

// ============================================================================
// Objects
// ============================================================================

pub fn check_object_contract(objects: &dyn ObjectIO) {
    let bucket = unique("bucket");
    objects.create_bucket(&bucket).expect("create_bucket");
    assert_error_kind(&objects.create_bucket(&bucket), ErrorKind::Conflict);

    let meta = objects
        .put_object(
            &bucket,
            "docs/readme.txt",
            b"hello",
            PutOptions::content_type("text/plain").with_metadata("owner", "ops"),
        )
        .expect("put_object");
    assert_eq!(meta.size, 5);
    assert_eq!(
        meta.content_hash,
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    objects
        .put_object(&bucket, "images/cat.png", &[1, 2, 3], PutOptions::default())
        .expect("put_object");

    let stored = objects.get_object(&bucket, "docs/readme.txt").expect("get_object");
    assert_eq!(stored.data, b"hello");
    assert_eq!(stored.metadata.content_type, "text/plain");
    assert_eq!(
        stored.metadata.custom_metadata.get("owner").map(String::as_str),
        Some("ops")
    );

    let listed: Vec<String> = objects
        .list_objects(&bucket, Some("docs/"))
        .expect("list_objects")
        .into_iter()
        .map(|m| m.key)
        .collect();
    assert_eq!(listed, ["docs/readme.txt"]);

    let copy = objects
        .copy_object(&bucket, "docs/readme.txt", &bucket, "docs/copy.txt")
        .expect("copy_object");
    assert_eq!(copy.content_hash, meta.content_hash);

    let url = objects
        .presigned_url(&bucket, "docs/readme.txt", UrlMethod::Get, Duration::from_secs(60))
        .expect("presigned_url");
    assert_eq!(url.method, UrlMethod::Get);
    assert_error_kind(
        &objects.presigned_url(&bucket, "docs/readme.txt", UrlMethod::Get, Duration::ZERO),
        ErrorKind::Validation,
    );

    assert_error_kind(&objects.delete_bucket(&bucket), ErrorKind::Conflict);
    objects
        .delete_object(&bucket, "never-written")
        .expect("deleting a missing key succeeds");
    assert_error_kind(&objects.get_object(&bucket, "never-written"), ErrorKind::NotFound);
    for key in ["docs/readme.txt", "docs/copy.txt", "images/cat.png"] {
        objects.delete_object(&bucket, key).expect("delete_object");
    }
    assert!(!objects.object_exists(&bucket, "docs/readme.txt").expect("object_exists"));
    objects.delete_bucket(&bucket).expect("delete_bucket");
    assert_error_kind(&objects.list_objects(&bucket, None), ErrorKind::NotFound);
}

// ============================================================================
// Notifications
// ============================================================================

pub fn check_notification_contract(notifications: &dyn NotificationIO) {
    let topic = unique("topic");
    notifications.create_topic(&topic).expect("create_topic");
    assert_error_kind(&notifications.create_topic(&topic), ErrorKind::Conflict);

    let subscription = notifications
        .subscribe(&topic, Protocol::Email, "ops@example.com")
        .expect("subscribe");
    assert!(!subscription.confirmed, "email subscriptions start unconfirmed");
    assert_error_kind(
        &notifications.subscribe(&topic, Protocol::Email, "not-an-address"),
        ErrorKind::Validation,
    );
    assert_error_kind(
        &notifications.confirm_subscription(&topic, "bogus-token"),
        ErrorKind::Validation,
    );

    let receipt = notifications
        .publish(&topic, TopicMessage::new("deploy finished").with_subject("ci"))
        .expect("publish");
    assert_eq!(receipt.delivered, 0, "unconfirmed subscriptions receive nothing");
    assert_error_kind(
        &notifications.publish(&topic, TopicMessage::new("")),
        ErrorKind::Validation,
    );

    notifications.unsubscribe(&subscription.id).expect("unsubscribe");
    assert_error_kind(&notifications.unsubscribe(&subscription.id), ErrorKind::NotFound);
    assert!(
        notifications.list_subscriptions(&topic).expect("list_subscriptions").is_empty()
    );

    notifications.delete_topic(&topic).expect("delete_topic");
    assert_error_kind(&notifications.list_subscriptions(&topic), ErrorKind::NotFound);
}

// ============================================================================
// Secrets, configuration, auth
// ============================================================================

pub fn check_secrets_contract(secrets: &dyn SecretsIO) {
    let name = unique("secret");
    let first = secrets.create_secret(&name, "v1").expect("create_secret");
    assert_eq!(first.version, 1);
    assert_error_kind(&secrets.create_secret(&name, "again"), ErrorKind::Conflict);

    let second = secrets.put_secret_value(&name, "v2").expect("put_secret_value");
    assert_eq!(second.version, 2);
    assert_eq!(secrets.get_secret(&name, None).expect("get_secret").value, "v2");
    assert_eq!(secrets.get_secret(&name, Some(1)).expect("get_secret").value, "v1");
    assert_error_kind(&secrets.get_secret(&name, Some(9)), ErrorKind::NotFound);

    secrets.delete_secret(&name).expect("delete_secret");
    assert_error_kind(&secrets.get_secret(&name, None), ErrorKind::NotFound);
}

pub fn check_config_contract(config: &dyn ConfigIO) {
    let root = format!("/{}", unique("config"));
    let host = format!("{root}/db/host");
    let name = format!("{root}/name");
    assert_eq!(
        config
            .put_parameter(&host, "localhost", ParameterKind::String, false)
            .expect("put_parameter"),
        1
    );
    config
        .put_parameter(&name, "shop", ParameterKind::String, false)
        .expect("put_parameter");
    assert_error_kind(
        &config.put_parameter(&host, "other", ParameterKind::String, false),
        ErrorKind::Conflict,
    );
    assert_eq!(
        config
            .put_parameter(&host, "db.internal", ParameterKind::String, true)
            .expect("overwrite"),
        2
    );

    let direct: Vec<String> = config
        .get_parameters_by_path(&root, false)
        .expect("get_parameters_by_path")
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(direct, [name.clone()]);
    let all = config
        .get_parameters_by_path(&root, true)
        .expect("get_parameters_by_path");
    assert_eq!(all.len(), 2);

    let batch = config
        .get_parameters(&[host.clone(), format!("{root}/missing")])
        .expect("get_parameters");
    assert_eq!(batch.found.len(), 1);
    assert_eq!(batch.missing, [format!("{root}/missing")]);

    config.delete_parameter(&host).expect("delete_parameter");
    config.delete_parameter(&name).expect("delete_parameter");
    assert_error_kind(&config.get_parameter(&host), ErrorKind::NotFound);
    assert_names(&config.list_parameters(Some(&root)), &[]);
}

pub fn check_auth_contract(auth: &dyn AuthIO) {
    let username = unique("user");
    auth.sign_up(SignUp::new(&username, "correct horse").with_attribute("email", "a@example.com"))
        .expect("sign_up");
    assert_error_kind(&auth.sign_up(SignUp::new(&username, "correct horse")), ErrorKind::Conflict);
    assert_error_kind(&auth.sign_up(SignUp::new(unique("user"), "short")), ErrorKind::Validation);
    assert_error_kind(&auth.sign_in(&username, "wrong password"), ErrorKind::Validation);

    let tokens = auth.sign_in(&username, "correct horse").expect("sign_in");
    assert_eq!(
        auth.verify_token(&tokens.access_token).expect("verify_token").username,
        username
    );
    let refreshed = auth.refresh(&tokens.refresh_token).expect("refresh");
    assert_error_kind(&auth.refresh(&tokens.refresh_token), ErrorKind::Validation);

    auth.sign_out(&refreshed.access_token).expect("sign_out");
    assert_error_kind(&auth.verify_token(&refreshed.access_token), ErrorKind::Validation);

    auth.set_user_enabled(&username, false).expect("set_user_enabled");
    assert_error_kind(&auth.sign_in(&username, "correct horse"), ErrorKind::Validation);
    auth.delete_user(&username).expect("delete_user");
    assert_error_kind(&auth.get_user(&username), ErrorKind::NotFound);
}

// ============================================================================
// Hosting, batch
// ============================================================================

pub fn check_hosting_contract(hosting: &dyn HostingIO) {
    let name = unique("app");
    hosting
        .create_app(
            &name,
            AppConfig {
                runtime: "node20".to_string(),
                ..AppConfig::default()
            },
        )
        .expect("create_app");
    assert_error_kind(
        &hosting.create_app(&name, AppConfig::default()),
        ErrorKind::Validation,
    );
    assert_error_kind(&hosting.rollback(&name), ErrorKind::Conflict);

    let v1 = hosting
        .deploy(&name, DeploymentRequest::new("1.0.0", "build-1.tar.gz"))
        .expect("deploy");
    let v2 = hosting
        .deploy(&name, DeploymentRequest::new("1.1.0", "build-2.tar.gz"))
        .expect("deploy");
    assert_eq!(
        hosting.get_app(&name).expect("get_app").active_deployment,
        Some(v2.id.clone())
    );

    let restored = hosting.rollback(&name).expect("rollback");
    assert_eq!(restored.id, v1.id);
    let statuses: Vec<DeploymentStatus> = hosting
        .list_deployments(&name)
        .expect("list_deployments")
        .into_iter()
        .map(|d| d.status)
        .collect();
    assert_eq!(statuses, [DeploymentStatus::Active, DeploymentStatus::RolledBack]);

    hosting.delete_app(&name).expect("delete_app");
    assert_error_kind(&hosting.get_app(&name), ErrorKind::NotFound);
}

pub fn check_batch_contract(batch: &dyn BatchIO) {
    let definition = unique("jobdef");
    batch
        .register_job_definition(JobDefinition::new(&definition, "worker:latest"))
        .expect("register_job_definition");
    assert_error_kind(
        &batch.register_job_definition(JobDefinition::new(&definition, "worker:latest")),
        ErrorKind::Conflict,
    );
    assert_error_kind(
        &batch.submit_job(JobRequest::new("orphan", unique("jobdef"))),
        ErrorKind::NotFound,
    );

    let job = batch
        .submit_job(JobRequest::new("nightly", &definition).with_parameter("day", "monday"))
        .expect("submit_job");
    let described = batch.describe_job(&job.id).expect("describe_job");
    assert_eq!(described.name, "nightly");
    assert_eq!(described.parameters.get("day").map(String::as_str), Some("monday"));
    assert!(
        batch.list_jobs(None).expect("list_jobs").iter().any(|j| j.id == job.id),
        "submitted job is not listed"
    );
    assert_error_kind(&batch.describe_job("no-such-job"), ErrorKind::NotFound);
}
