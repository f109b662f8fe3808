//! Durability and multi-writer behavior of the transaction log.

use keepsafe_txlog::{JsonlLogStore, Mutation, TransactionLog, TxLogConfig};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_concurrent_writers_with_explicit_ids() {
    let dir = TempDir::new().unwrap();
    let config = TxLogConfig {
        dir: dir.path().to_path_buf(),
    };
    let log = Arc::new(TransactionLog::open(&config).await.unwrap());

    let mut handles = Vec::new();
    for worker in 0..8 {
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            let tx = format!("worker-{}", worker);
            for row in 0..25 {
                log.log_in_transaction(&tx, Mutation::insert("points", &row.to_string(), json!({"w": worker})))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = log.get_stats().await.unwrap();
    assert_eq!(stats.total, 200);
    assert_eq!(stats.transactions, 8);

    let on_disk = JsonlLogStore::in_dir(dir.path()).read_all().await.unwrap();
    assert_eq!(on_disk.len(), 200);
    let ids: HashSet<_> = on_disk.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids.len(), 200);
}

#[tokio::test]
async fn test_reopened_log_continues_appending() {
    let dir = TempDir::new().unwrap();
    let config = TxLogConfig {
        dir: dir.path().to_path_buf(),
    };
    let first = TransactionLog::open(&config).await.unwrap();
    let tx = first.begin_transaction();
    first.log(Mutation::insert("users", "1", json!({"name": "ada"}))).await.unwrap();
    first.commit_transaction();
    drop(first);

    let second = TransactionLog::open(&config).await.unwrap();
    second
        .log(Mutation::update("users", "1", json!({"name": "ada"}), json!({"name": "grace"})))
        .await
        .unwrap();
    let stats = second.get_stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.operations.inserts, 1);
    assert_eq!(stats.operations.updates, 1);

    let entries = JsonlLogStore::in_dir(dir.path()).read_all().await.unwrap();
    assert_eq!(entries[0].tx_id, tx);
    assert_eq!(entries[1].tx_id, "standalone");
}

#[tokio::test]
async fn test_reopen_after_torn_write_keeps_appending() {
    let dir = TempDir::new().unwrap();
    let config = TxLogConfig {
        dir: dir.path().to_path_buf(),
    };
    let first = TransactionLog::open(&config).await.unwrap();
    first.log(Mutation::insert("points", "1", json!({"v": 1}))).await.unwrap();
    drop(first);

    let journal = JsonlLogStore::in_dir(dir.path());
    let mut text = std::fs::read_to_string(journal.path()).unwrap();
    text.push_str("{\"id\":\"half");
    std::fs::write(journal.path(), text).unwrap();

    let second = TransactionLog::open(&config).await.unwrap();
    second.log(Mutation::insert("points", "2", json!({"v": 2}))).await.unwrap();
    drop(second);

    let third = TransactionLog::open(&config).await.unwrap();
    assert_eq!(third.get_stats().await.unwrap().total, 2);
    let records: Vec<_> = journal
        .read_all()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.record_id)
        .collect();
    assert_eq!(records, vec!["1", "2"]);
}
