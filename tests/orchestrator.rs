//! Orchestrator integration tests: validation, deduplication, dispatch

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tractus_edge::db::{IdempotencyLedger, LedgerStatus};
use tractus_edge::protocol::opcua::DEMO_SPEED_NODE;
use tractus_edge::{ExecuteError, Outcome, RawCommand};

mod common;
use common::{FakeModbus, Harness, MISSING_REGISTER, UnrecordableLedger};

fn raw(value: Value) -> RawCommand {
    serde_json::from_value(value).unwrap()
}

fn write_coil(key: &str) -> RawCommand {
    raw(json!({
        "deviceId": "plc-1",
        "capability": "modbus.write_coil@v1",
        "params": {"address": 1, "value": true},
        "idempotencyKey": key,
    }))
}

#[tokio::test]
async fn test_duplicate_key_replays_without_dispatch() {
    let h = Harness::default();

    let first = h.orchestrator.execute(write_coil("abcdefgh")).await.unwrap();
    let second = h.orchestrator.execute(write_coil("abcdefgh")).await.unwrap();

    assert!(matches!(first, Outcome::Completed { replayed: false, .. }));
    assert!(matches!(second, Outcome::Completed { replayed: true, .. }));
    assert_eq!(first.payload(), second.payload());
    assert_eq!(h.modbus.calls(), 1);
    assert_eq!(h.modbus.coil(1), Some(true));

    let payload = first.payload().unwrap();
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["result"]["kind"], "modbus.write_coil");
    assert_eq!(payload["result"]["ack"], true);

    let counts = h.counters.snapshot();
    assert_eq!(counts.dispatched.get("modbus.write_coil"), Some(&1));
    assert_eq!(counts.replayed, 1);
}

#[tokio::test]
async fn test_concurrent_duplicates_dispatch_once() {
    let h = Harness::with_modbus(FakeModbus::slow(Duration::from_millis(50)));

    let attempts = (0..8).map(|_| h.orchestrator.execute(write_coil("abcdefgh")));
    let outcomes = futures::future::join_all(attempts).await;

    assert_eq!(h.modbus.calls(), 1);

    let mut fresh = 0;
    for outcome in outcomes {
        match outcome.unwrap() {
            Outcome::Completed { replayed: false, .. } => fresh += 1,
            Outcome::Completed { replayed: true, .. } | Outcome::InFlight { .. } => {}
            Outcome::Failed { payload, .. } => panic!("unexpected failure: {payload}"),
        }
    }
    assert_eq!(fresh, 1);
}

#[tokio::test]
async fn test_unknown_capability_without_key_leaves_no_record() {
    let h = Harness::default();

    let outcome = h
        .orchestrator
        .execute(raw(json!({
            "deviceId": "plc-1",
            "capability": "unknown.op@v1",
            "params": {},
        })))
        .await
        .unwrap();

    let Outcome::Failed { payload, replayed } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(!replayed);
    assert_eq!(payload["ok"], false);
    assert_eq!(payload["error"]["code"], "unknown_capability");

    let conn = h.db.get().unwrap();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM idempotency", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn test_unknown_capability_with_key_is_recorded_failed() {
    let h = Harness::default();
    let command = || {
        raw(json!({
            "deviceId": "plc-1",
            "capability": "unknown.op@v1",
            "params": {},
            "idempotencyKey": "unknown-0001",
        }))
    };

    let first = h.orchestrator.execute(command()).await.unwrap();
    let second = h.orchestrator.execute(command()).await.unwrap();

    assert!(matches!(first, Outcome::Failed { replayed: false, .. }));
    assert!(matches!(second, Outcome::Failed { replayed: true, .. }));
    assert_eq!(first.payload(), second.payload());

    let entry = h.ledger.lookup("unknown-0001").unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Failed);
}

#[tokio::test]
async fn test_device_failure_is_replayed_not_retried() {
    let h = Harness::default();
    let command = || {
        raw(json!({
            "deviceId": "plc-1",
            "capability": "modbus.write_hr@v1",
            "params": {"address": MISSING_REGISTER, "value": 1},
            "idempotencyKey": "missing-register",
        }))
    };

    let first = h.orchestrator.execute(command()).await.unwrap();
    let second = h.orchestrator.execute(command()).await.unwrap();

    let payload = first.payload().unwrap();
    assert_eq!(payload["error"]["code"], "bad_params");
    assert!(matches!(second, Outcome::Failed { replayed: true, .. }));
    assert_eq!(h.modbus.calls(), 1);
    assert_eq!(h.counters.snapshot().failed.get("modbus.write_hr"), Some(&1));
}

#[tokio::test]
async fn test_naive_deadline_rejected_before_ledger() {
    let h = Harness::default();

    let err = h
        .orchestrator
        .execute(raw(json!({
            "deviceId": "plc-1",
            "capability": "modbus.write_coil@v1",
            "params": {"address": 1, "value": true},
            "deadline": "2024-01-01T00:00:00",
            "idempotencyKey": "deadline-0001",
        })))
        .await
        .unwrap_err();

    let ExecuteError::Validation(e) = err else {
        panic!("expected validation error, got {err:?}");
    };
    assert_eq!(e.field, "deadline");
    assert!(h.ledger.lookup("deadline-0001").unwrap().is_none());
    assert_eq!(h.modbus.calls(), 0);
}

#[tokio::test]
async fn test_commands_without_key_always_dispatch() {
    let h = Harness::default();
    let command = || {
        raw(json!({
            "deviceId": "opc-1",
            "capability": "opcua.write@v1",
            "params": {"nodeId": DEMO_SPEED_NODE, "value": 1500},
        }))
    };

    for _ in 0..3 {
        let outcome = h.orchestrator.execute(command()).await.unwrap();
        assert!(matches!(outcome, Outcome::Completed { replayed: false, .. }));
        assert_eq!(outcome.payload().unwrap()["result"]["value"], 1500);
    }
    assert_eq!(h.opcua.writes(), 3);
}

#[tokio::test]
async fn test_distinct_command_ids_with_same_key_replay_first_payload() {
    let h = Harness::default();
    let command = |id: &str| {
        raw(json!({
            "id": id,
            "deviceId": "plc-1",
            "capability": "modbus.write_hr@v1",
            "params": {"address": 1, "value": 456},
            "idempotencyKey": "same-key-0001",
        }))
    };

    let first = h
        .orchestrator
        .execute(command("6f1c2a4e-8b0d-4d7e-9a51-3c2b1f0e9d87"))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .execute(command("0e2d4c6b-1a3f-4e5d-8c7b-9a0f1e2d3c4b"))
        .await
        .unwrap();

    assert_eq!(first.payload(), second.payload());
    assert_eq!(
        second.payload().unwrap()["commandId"],
        "6f1c2a4e-8b0d-4d7e-9a51-3c2b1f0e9d87"
    );
    assert_eq!(h.modbus.register(1), Some(456));
    assert_eq!(h.modbus.calls(), 1);
}

#[tokio::test]
async fn test_reserved_key_reports_in_flight() {
    let h = Harness::default();
    assert!(
        h.ledger
            .reserve("pending-0001", "plc-1", "modbus.write_coil@v1")
            .unwrap()
    );

    let outcome = h.orchestrator.execute(write_coil("pending-0001")).await.unwrap();

    assert_eq!(
        outcome,
        Outcome::InFlight {
            key: "pending-0001".into()
        }
    );
    assert_eq!(h.modbus.calls(), 0);
    assert_eq!(h.counters.snapshot().conflicts, 1);
}

#[tokio::test]
async fn test_ledger_failure_prevents_dispatch() {
    let h = Harness::default();
    h.db.get()
        .unwrap()
        .execute_batch("DROP TABLE idempotency")
        .unwrap();

    let err = h
        .orchestrator
        .execute(write_coil("abcdefgh"))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::Storage(_)));
    assert_eq!(h.modbus.calls(), 0);

    // Unkeyed commands never touch the ledger
    let outcome = h
        .orchestrator
        .execute(raw(json!({
            "deviceId": "plc-1",
            "capability": "modbus.read_coil@v1",
            "params": {"address": 1},
        })))
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Completed { .. }));
}

#[tokio::test]
async fn test_shared_orchestrator_across_tasks() {
    let h = Arc::new(Harness::with_modbus(FakeModbus::slow(Duration::from_millis(20))));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                let key = format!("task-key-{i:04}");
                h.orchestrator.execute(write_coil(&key)).await
            })
        })
        .collect();

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Completed { replayed: false, .. }));
    }
    assert_eq!(h.modbus.calls(), 4);
}

#[tokio::test]
async fn test_dropped_caller_still_records_outcome() {
    let h = Harness::with_modbus(FakeModbus::slow(Duration::from_millis(200)));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        h.orchestrator.execute(write_coil("abcdefgh")),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(500)).await;

    let record = h.ledger.get("abcdefgh").unwrap().unwrap();
    assert_eq!(record.status, LedgerStatus::Completed);
    assert_eq!(h.modbus.calls(), 1);

    let retry = h.orchestrator.execute(write_coil("abcdefgh")).await.unwrap();
    assert!(matches!(retry, Outcome::Completed { replayed: true, .. }));
    assert_eq!(h.modbus.calls(), 1);
}

#[tokio::test]
async fn test_unrecorded_outcome_is_storage_error_and_blocks_retry() {
    let h = Harness::with_ledger(FakeModbus::default(), |repo| {
        Arc::new(UnrecordableLedger(repo)) as Arc<dyn IdempotencyLedger>
    });

    let err = h
        .orchestrator
        .execute(write_coil("abcdefgh"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::Storage(_)));
    assert_eq!(h.modbus.calls(), 1);

    let record = h.ledger.get("abcdefgh").unwrap().unwrap();
    assert_eq!(record.status, LedgerStatus::Accepted);

    let retry = h.orchestrator.execute(write_coil("abcdefgh")).await.unwrap();
    assert_eq!(
        retry,
        Outcome::InFlight {
            key: "abcdefgh".into()
        }
    );
    assert_eq!(h.modbus.calls(), 1);
}
