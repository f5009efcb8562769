#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_rocksdb_checkpoint_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First run: give up mid-route, leaving a checkpoint behind
    let mut cmd1 = Command::new(cargo_bin!("payrail"));
    cmd1.arg("--db-path").arg(&db_path).arg("--max-steps").arg("3");

    let output1 = cmd1.output().expect("Failed to execute command");
    assert!(!output1.status.success());
    let stderr1 = String::from_utf8_lossy(&output1.stderr);
    assert!(stderr1.contains("checkpointed as 'demo'"));

    // 2. Second run: resume from the same DB path and settle the token
    let mut cmd2 = Command::new(cargo_bin!("payrail"));
    cmd2.arg("--db-path").arg(&db_path);

    let output2 = cmd2.output().expect("Failed to execute command");
    assert!(output2.status.success());
    let stdout2 = String::from_utf8_lossy(&output2.stdout);

    // The fee charged before the checkpoint survived the restart.
    assert!(stdout2.contains("acquirer,card_fee,operation,0,eur,processing fee,30"));
    assert!(stdout2.contains("usd,5367"));
}
