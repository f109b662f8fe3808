//! Property-based tests for recovery-point selection.

mod common;

use common::{at, rig};
use keepsafe_backup::BackupStatus;
use proptest::prelude::*;

/// Generator for backup histories: (seconds past t0, succeeded).
fn any_history() -> impl Strategy<Value = Vec<(i64, bool)>> {
    prop::collection::vec((0i64..10_000, any::<bool>()), 1..40)
}

proptest! {
    #[test]
    fn prop_later_target_never_picks_older_base(
        history in any_history(),
        a in 0i64..12_000,
        b in 0i64..12_000,
    ) {
        let (t1, t2) = if a <= b { (a, b) } else { (b, a) };
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let rig = rig();
            for (i, (secs, ok)) in history.iter().enumerate() {
                let status = if *ok { BackupStatus::Success } else { BackupStatus::Failed };
                rig.backups.seed(&format!("backup-{}", i), at(*secs), status);
            }

            let first = rig.pitr.find_recovery_point(at(t1)).await;
            let second = rig.pitr.find_recovery_point(at(t2)).await;
            match (first, second) {
                (Ok(p1), Ok(p2)) => {
                    prop_assert!(p1.backup_timestamp <= p2.backup_timestamp);
                    prop_assert!(p1.backup_timestamp <= at(t1));
                    prop_assert!(p2.backup_timestamp <= at(t2));
                }
                // an earlier target can lack a point a later one has, never the reverse
                (Err(_), _) => {}
                (Ok(_), Err(e)) => prop_assert!(false, "later target lost its recovery point: {}", e),
            }

            let any_success = history.iter().any(|(secs, ok)| *ok && *secs <= t2);
            prop_assert_eq!(rig.pitr.find_recovery_point(at(t2)).await.is_ok(), any_success);
            Ok(())
        })?;
    }
}
