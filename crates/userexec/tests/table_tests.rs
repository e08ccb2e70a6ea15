//! End-to-end tests for user-scoped table generation.
//!
//! Tests cover:
//! - Constraint handling (missing user, injection filtering)
//! - Partial failure (unknown users, timeouts, bad output, non-zero exit)
//! - Row tagging and ordering
//! - Subprocess invocation shape
//! - Scratch workspace cleanup and cancellation
#![cfg(unix)]

mod common;

use common::harness;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use userexec::protocol::{Constraint, Operator, QueryContext, Row};
use userexec::{TableError, TablePlugin};

fn users(names: &[&str]) -> QueryContext {
    names
        .iter()
        .fold(QueryContext::new(), |ctx, name| ctx.with_equals("user", *name))
}

fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ============================================================================
// Constraints
// ============================================================================

mod constraints {
    use super::*;

    #[tokio::test]
    async fn test_missing_user_constraint_fails() {
        let h = harness();
        let err = h
            .table
            .generate(&QueryContext::new(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TableError::MissingConstraint { .. }));
        assert!(err.to_string().contains("missing required constraint"));
        assert_eq!(h.session.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_injection_only_query_spawns_nothing() {
        let h = harness();
        let err = h
            .table
            .generate(&users(&["alice; rm -rf /"]), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TableError::MissingConstraint { .. }));
        assert_eq!(h.session.launch_count(), 0);
        assert_eq!(*h.sink.rejected.lock().unwrap(), vec!["alice; rm -rf /"]);
    }

    #[tokio::test]
    async fn test_non_equality_operators_name_users() {
        let h = harness();
        let ctx = QueryContext::new().with_constraint(
            "user",
            Constraint {
                operator: Operator::Like,
                expression: "alice".to_string(),
            },
        );
        let rows = h
            .table
            .generate(&ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rows, vec![row(&[("key", "v"), ("user", "alice")])]);
        assert_eq!(h.session.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_injection_filtered_before_spawn() {
        let h = harness();
        let rows = h
            .table
            .generate(&users(&["alice", "alice; rm -rf /"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rows, vec![row(&[("key", "v"), ("user", "alice")])]);
        assert_eq!(*h.session.launched_users.lock().unwrap(), vec!["alice"]);
    }
}

// ============================================================================
// Partial failure
// ============================================================================

mod partial_failure {
    use super::*;

    #[tokio::test]
    async fn test_timeout_user_is_skipped() {
        let mut h = harness();
        h.table = h.table.with_timeout(Duration::from_secs(1));

        let started = Instant::now();
        let rows = h
            .table
            .generate(&users(&["alice", "bob"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rows, vec![row(&[("key", "v"), ("user", "alice")])]);
        assert!(started.elapsed() < Duration::from_secs(10));
        let reason = h.sink.skip_reason("bob").unwrap();
        assert!(reason.contains("timed out"), "{reason}");
        assert_eq!(h.leftover_workspaces(), 0);
    }

    #[tokio::test]
    async fn test_timeout_bounds_sequential_delay() {
        let mut h = harness();
        h.table = h
            .table
            .with_timeout(Duration::from_secs(1))
            .with_parallelism(1);

        let started = Instant::now();
        let rows = h
            .table
            .generate(&users(&["bob", "alice"]), &CancellationToken::new())
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert_eq!(rows, vec![row(&[("key", "v"), ("user", "alice")])]);
        assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_unknown_user_is_skipped() {
        let h = harness();
        let rows = h
            .table
            .generate(&users(&["alice", "zed"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rows, vec![row(&[("key", "v"), ("user", "alice")])]);
        assert_eq!(h.sink.skipped_users(), vec!["zed"]);
        assert!(h.sink.skip_reason("zed").unwrap().contains("looking up username zed"));
        assert_eq!(h.session.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_username_is_skipped() {
        let h = harness();
        let rows = h
            .table
            .generate(&users(&["", "alice"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rows, vec![row(&[("key", "v"), ("user", "alice")])]);
        assert_eq!(h.sink.skipped_users(), vec![""]);
        assert_eq!(h.session.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_output_is_skipped() {
        let h = harness();
        let rows = h
            .table
            .generate(&users(&["carol", "alice"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rows, vec![row(&[("key", "v"), ("user", "alice")])]);
        assert!(h.sink.skip_reason("carol").unwrap().contains("unmarshalling"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let h = harness();
        let rows = h
            .table
            .generate(&users(&["dave"]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(rows.is_empty());
        let reason = h.sink.skip_reason("dave").unwrap();
        assert!(reason.contains("exited with code 3"), "{reason}");
        assert!(reason.contains("boom"), "{reason}");
    }

    #[tokio::test]
    async fn test_every_user_failing_is_empty_not_error() {
        let mut h = harness();
        h.table = h.table.with_timeout(Duration::from_secs(1));

        let rows = h
            .table
            .generate(
                &users(&["bob", "carol", "dave", "zed"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(rows.is_empty());
        assert_eq!(h.sink.skipped_users().len(), 4);
        assert_eq!(h.leftover_workspaces(), 0);
    }

    #[tokio::test]
    async fn test_workspace_failure_is_fatal() {
        let h = harness();
        std::fs::remove_dir(&h.scratch_root).unwrap();

        let err = h
            .table
            .generate(&users(&["alice"]), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TableError::Workspace(_)));
        assert_eq!(h.session.launch_count(), 0);
    }
}

// ============================================================================
// Rows
// ============================================================================

mod rows {
    use super::*;

    #[tokio::test]
    async fn test_rows_tagged_with_requesting_user() {
        let h = harness();
        let rows = h
            .table
            .generate(&users(&["multi", "alice", "erin"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            rows,
            vec![
                row(&[("key", "a"), ("user", "multi")]),
                row(&[("key", "b"), ("user", "multi")]),
                row(&[("key", "v"), ("user", "alice")]),
            ]
        );
        for r in &rows {
            assert!(["multi", "alice", "erin"].contains(&r["user"].as_str()));
        }
    }

    #[tokio::test]
    async fn test_duplicate_users_run_once() {
        let h = harness();
        let rows = h
            .table
            .generate(&users(&["alice", "alice"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(h.session.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_shared_uid_runs_once_per_name() {
        let h = harness();
        let rows = h
            .table
            .generate(&users(&["alice", "alias"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            rows,
            vec![
                row(&[("key", "v"), ("user", "alice")]),
                row(&[("key", "v"), ("user", "alias")]),
            ]
        );
        assert_eq!(h.session.launch_count(), 2);
        assert_eq!(
            *h.session.launched_users.lock().unwrap(),
            vec!["alice", "alias"]
        );
        assert_eq!(h.leftover_workspaces(), 0);
    }

    #[tokio::test]
    async fn test_generate_through_plugin_contract() {
        let h = harness();
        let plugin: &dyn TablePlugin = &h.table;

        assert_eq!(plugin.name(), "user_fake");
        let columns: Vec<&str> = plugin.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(columns, ["key", "user"]);

        let ctx = QueryContext::from_json(
            r#"{"constraints":[{"name":"user","affinity":"TEXT","list":[{"op":2,"expr":"alice"}]}]}"#,
        )
        .unwrap();
        let rows = plugin.generate(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(rows, vec![row(&[("key", "v"), ("user", "alice")])]);
    }
}

// ============================================================================
// Invocation
// ============================================================================

mod invocation {
    use super::*;

    #[tokio::test]
    async fn test_binary_receives_flags_query_and_scratch_cwd() {
        let h = harness();
        let rows = h
            .table
            .generate(&users(&["echo"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        let r = &rows[0];
        assert_eq!(r["query"], "select key from fake");
        assert_eq!(
            r["argc"],
            (userexec::runner::EPHEMERAL_FLAGS.len() + 1).to_string()
        );

        let cwd = Path::new(&r["cwd"]);
        let name = cwd.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with(userexec::workspace::SCRATCH_PREFIX), "{name}");
        assert!(!cwd.exists());
        assert_eq!(h.leftover_workspaces(), 0);
    }

    #[tokio::test]
    async fn test_row_order_independent_of_parallelism() {
        let names = ["erin", "multi", "dave", "alice"];
        let mut results = Vec::new();
        for parallelism in [1, 4] {
            let mut h = harness();
            h.table = h.table.with_parallelism(parallelism);
            let rows = h
                .table
                .generate(&users(&names), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(h.session.launch_count(), names.len());
            assert_eq!(h.leftover_workspaces(), 0);
            results.push(rows);
        }

        assert_eq!(results[0], results[1]);
        let order: Vec<&str> = results[0].iter().map(|r| r["user"].as_str()).collect();
        assert_eq!(order, ["multi", "multi", "alice"]);
    }
}

// ============================================================================
// Cancellation
// ============================================================================

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn test_outer_cancel_kills_children_and_cleans_up() {
        let mut h = harness();
        h.table = h.table.with_timeout(Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let rows = h
            .table
            .generate(&users(&["bob", "alice"]), &cancel)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(rows, vec![row(&[("key", "v"), ("user", "alice")])]);
        assert!(h.sink.skip_reason("bob").unwrap().contains("cancelled"));
        assert_eq!(h.leftover_workspaces(), 0);
    }

    #[tokio::test]
    async fn test_dropped_generate_cleans_up() {
        let mut h = harness();
        h.table = h.table.with_timeout(Duration::from_secs(30));

        let ctx = users(&["bob"]);
        let cancel = CancellationToken::new();
        let result = tokio::time::timeout(
            Duration::from_millis(300),
            h.table.generate(&ctx, &cancel),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(h.leftover_workspaces(), 0);
    }

    #[tokio::test]
    async fn test_already_cancelled_spawns_nothing() {
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let rows = h.table.generate(&users(&["alice"]), &cancel).await.unwrap();
        assert!(rows.is_empty());
        assert!(h.sink.skip_reason("alice").unwrap().contains("cancelled"));
    }
}
