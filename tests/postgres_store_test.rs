use sqlx::{Pool, Postgres};

use idhub::event::EventCommand;
use idhub::store::postgres::PgEventStoreBuilder;
use idhub::store::{EventFilter, Eventstore, ExpectedVersion, StoreError};
use idhub::types::{Aggregate, Position};

fn org_command(instance_id: &str, org_id: &str, event_type: &str) -> EventCommand {
    EventCommand::new(Aggregate::new(instance_id, "org", org_id, org_id), event_type, "system")
}

#[sqlx::test]
async fn setup_creates_store_tables(pool: Pool<Postgres>) {
    let _ = PgEventStoreBuilder::new(pool.clone())
        .try_build()
        .await
        .expect("failed to create event store");

    for table in ["events", "projection_states", "failed_events", "schema_migrations"] {
        let rows = sqlx::query("SELECT table_name FROM information_schema.tables WHERE table_name = $1")
            .bind(table)
            .fetch_all(&pool)
            .await
            .unwrap();
        assert!(!rows.is_empty(), "missing table {table}");
    }
}

#[sqlx::test]
async fn push_assigns_contiguous_versions(pool: Pool<Postgres>) {
    let store = PgEventStoreBuilder::new(pool).try_build().await.unwrap();

    store
        .push(vec![
            org_command("inst1", "org1", "org.added"),
            org_command("inst1", "org1", "org.domain.added"),
        ])
        .await
        .unwrap();
    let events = store
        .push(vec![org_command("inst1", "org1", "org.domain.verified")])
        .await
        .unwrap();
    assert_eq!(events[0].aggregate_version, 3);

    let all = store
        .filter(&EventFilter::for_aggregate("org", "inst1", "org1"))
        .await
        .unwrap();
    let versions: Vec<i64> = all.iter().map(|e| e.aggregate_version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[sqlx::test]
async fn batch_shares_position_and_orders_by_in_tx_order(pool: Pool<Postgres>) {
    let store = PgEventStoreBuilder::new(pool).try_build().await.unwrap();

    let events = store
        .push(vec![
            org_command("inst1", "org1", "org.added"),
            org_command("inst1", "org1", "org.domain.added"),
            org_command("inst1", "org1", "org.domain.verified"),
        ])
        .await
        .unwrap();

    assert!(events.windows(2).all(|w| w[0].position.global == w[1].position.global));
    let orders: Vec<i32> = events.iter().map(|e| e.position.in_tx_order).collect();
    assert_eq!(orders, vec![0, 1, 2]);

    // A later push strictly follows.
    let later = store.push(vec![org_command("inst1", "org1", "org.changed")]).await.unwrap();
    assert!(later[0].position > events[2].position);
}

#[sqlx::test]
async fn concurrency_check_is_enforced(pool: Pool<Postgres>) {
    let store = PgEventStoreBuilder::new(pool).try_build().await.unwrap();

    store.push(vec![org_command("inst1", "org1", "org.added")]).await.unwrap();

    let aggregate = Aggregate::new("inst1", "org", "org1", "org1");
    let ok = store
        .push_with_concurrency_check(
            vec![org_command("inst1", "org1", "org.changed")],
            vec![ExpectedVersion {
                aggregate: aggregate.clone(),
                version: 1,
            }],
        )
        .await;
    assert!(ok.is_ok());

    // The same expectation again is now stale.
    let err = store
        .push_with_concurrency_check(
            vec![org_command("inst1", "org1", "org.changed")],
            vec![ExpectedVersion { aggregate, version: 1 }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ConcurrencyConflict { expected: 1, current: 2, .. }));
}

#[sqlx::test]
async fn failed_batch_leaves_nothing_behind(pool: Pool<Postgres>) {
    let store = PgEventStoreBuilder::new(pool).try_build().await.unwrap();

    store.push(vec![org_command("inst1", "org1", "org.added")]).await.unwrap();

    // Multi-aggregate batch where the second expectation is stale: the
    // fresh aggregate's events must not appear either.
    let err = store
        .push_with_concurrency_check(
            vec![
                org_command("inst1", "org2", "org.added"),
                org_command("inst1", "org1", "org.changed"),
            ],
            vec![
                ExpectedVersion {
                    aggregate: Aggregate::new("inst1", "org", "org2", "org2"),
                    version: 0,
                },
                ExpectedVersion {
                    aggregate: Aggregate::new("inst1", "org", "org1", "org1"),
                    version: 99,
                },
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));

    let org2_events = store
        .filter(&EventFilter::for_aggregate("org", "inst1", "org2"))
        .await
        .unwrap();
    assert!(org2_events.is_empty());
}

#[sqlx::test]
async fn filter_supports_the_conjunction(pool: Pool<Postgres>) {
    let store = PgEventStoreBuilder::new(pool).try_build().await.unwrap();

    store
        .push(vec![
            org_command("inst1", "org1", "org.added"),
            org_command("inst1", "org1", "org.domain.added"),
        ])
        .await
        .unwrap();
    store.push(vec![org_command("inst2", "org9", "org.added")]).await.unwrap();

    let events = store
        .filter(
            &EventFilter::builder()
                .instance_id("inst1")
                .event_types(vec!["org.added".to_owned()])
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].instance_id, "inst1");

    let after = events[0].position;
    let rest = store
        .filter(&EventFilter::builder().instance_id("inst1").position_after(after).build())
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].event_type, "org.domain.added");
}

#[sqlx::test]
async fn latest_position_and_instance_isolation(pool: Pool<Postgres>) {
    let store = PgEventStoreBuilder::new(pool).try_build().await.unwrap();

    assert_eq!(store.latest_position(None).await.unwrap(), Position::MIN);

    store.push(vec![org_command("inst1", "org1", "org.added")]).await.unwrap();
    let inst2 = store.push(vec![org_command("inst2", "org2", "org.added")]).await.unwrap();

    let head = store.latest_position(None).await.unwrap();
    assert_eq!(head, inst2[0].position);

    let inst1_head = store.latest_position(Some("inst1")).await.unwrap();
    assert!(inst1_head < head);

    let mut ids = store.distinct_instance_ids().await.unwrap();
    ids.sort();
    assert_eq!(ids, vec!["inst1".to_owned(), "inst2".to_owned()]);

    store.purge_instance("inst1").await.unwrap();
    let remaining = store
        .filter(&EventFilter::builder().instance_id("inst1").build())
        .await
        .unwrap();
    assert!(remaining.is_empty());
    let other = store
        .filter(&EventFilter::builder().instance_id("inst2").build())
        .await
        .unwrap();
    assert_eq!(other.len(), 1);
}

#[sqlx::test]
async fn subscription_notifies_after_commit(pool: Pool<Postgres>) {
    let store = PgEventStoreBuilder::new(pool).try_build().await.unwrap();
    let mut subscription = store.subscribe();

    store.push(vec![org_command("inst1", "org1", "org.added")]).await.unwrap();

    match subscription.recv().await {
        idhub::store::Notification::Events(events) => {
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].event_type, "org.added");
        }
        _ => panic!("expected an event notification"),
    }
}
