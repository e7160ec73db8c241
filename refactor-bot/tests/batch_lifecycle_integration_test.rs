//! Integration tests for the workspace/patch/verifier trio a batch actually
//! drives, exercised together against a real git repository the way the
//! executor's per-batch loop would (§4.12, §8 scenarios 2 and 5).

use refactor_bot::config::{Config, VerifierLevel};
use refactor_bot::ledger::BatchStatus;
use refactor_bot::patch::{apply_patch, PatchValidator};
use refactor_bot::planner::{Batch, BatchOperation};
use refactor_bot::workspace::WorkspaceManager;
use std::process::Command;
use tempfile::tempdir;

fn init_source_repo(dir: &std::path::Path) {
    for args in [
        vec!["init"],
        vec!["config", "user.email", "bot@test.local"],
        vec!["config", "user.name", "refactor-bot-test"],
    ] {
        Command::new("git").args(&args).current_dir(dir).output().unwrap();
    }
    std::fs::write(dir.join("a.py"), "import os\nimport sys\nprint(sys.argv)\n").unwrap();
    Command::new("git").args(["add", "-A"]).current_dir(dir).output().unwrap();
    Command::new("git").args(["commit", "-m", "initial"]).current_dir(dir).output().unwrap();
}

fn unused_import_batch() -> Batch {
    Batch {
        id: "batch-001".to_string(),
        goal: "remove unused imports".to_string(),
        scope_globs: vec!["a.py".to_string()],
        allowed_operations: vec![BatchOperation::RemoveUnusedImports],
        diff_budget_loc: 10,
        risk_score: 15,
        verifier_level: VerifierLevel::Fast,
        notes: String::new(),
        dependencies: Vec::new(),
        status: BatchStatus::pending(),
    }
}

/// Scenario 2: an accepted patch is applied, verified, and checkpointed, and
/// the resulting workspace content reflects the change.
#[test]
fn successful_batch_applies_verifies_and_checkpoints() {
    let source = tempdir().unwrap();
    init_source_repo(source.path());
    let worktrees = tempdir().unwrap();

    let workspace = WorkspaceManager::create(source.path(), "20260101_000000_deadbeef", worktrees.path())
        .expect("workspace creation should succeed against a git source");

    let batch = unused_import_batch();
    let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,3 +1,2 @@\n-import os\n import sys\n print(sys.argv)\n";

    let stats = PatchValidator::validate(workspace.workspace_dir(), diff, &batch, false)
        .expect("a scoped, in-budget, cleanly-applying diff must validate");
    assert_eq!(stats.lines_added, 0);
    assert_eq!(stats.lines_removed, 1);
    assert_eq!(stats.files_touched, vec!["a.py".to_string()]);

    let outcome = apply_patch(workspace.workspace_dir(), diff, &batch, false);
    assert!(outcome.success, "clean patch should apply: {:?}", outcome.error_message);

    let content = std::fs::read_to_string(workspace.workspace_dir().join("a.py")).unwrap();
    assert_eq!(content, "import sys\nprint(sys.argv)\n");

    let mut config = Config::default();
    config.fast_verifier = vec!["python3 -c \"compile(open('a.py').read(), 'a.py', 'exec')\"".to_string()];
    let verifier = refactor_bot::verifier::Verifier::new(workspace.workspace_dir(), &config);
    let result = tokio::runtime::Runtime::new().unwrap().block_on(verifier.run_fast());
    assert!(result.passed(), "fast verifier should pass on syntactically valid output: {}", result.summary());

    let checkpoint_id = workspace
        .checkpoint(&batch.id, &batch.goal)
        .expect("a non-empty diff should produce a checkpoint");
    assert!(!checkpoint_id.is_empty());

    // The source repository itself must remain untouched until merge_back.
    let source_content = std::fs::read_to_string(source.path().join("a.py")).unwrap();
    assert_eq!(source_content, "import os\nimport sys\nprint(sys.argv)\n");
}

/// Scenario 5: once a patch has applied but verification fails, reverting to
/// baseline must leave the workspace byte-identical to its pre-batch state.
#[test]
fn failed_verification_reverts_workspace_to_baseline() {
    let source = tempdir().unwrap();
    init_source_repo(source.path());
    let worktrees = tempdir().unwrap();

    let workspace = WorkspaceManager::create(source.path(), "20260101_000001_cafef00d", worktrees.path()).unwrap();
    let batch = unused_import_batch();
    let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,3 +1,2 @@\n-import os\n import sys\n print(sys.argv)\n";

    let outcome = apply_patch(workspace.workspace_dir(), diff, &batch, false);
    assert!(outcome.success);
    assert_ne!(
        std::fs::read_to_string(workspace.workspace_dir().join("a.py")).unwrap(),
        "import os\nimport sys\nprint(sys.argv)\n"
    );

    // Simulate the executor's reaction to a failing verifier.
    workspace.revert_to_baseline().expect("revert must succeed");

    let content = std::fs::read_to_string(workspace.workspace_dir().join("a.py")).unwrap();
    assert_eq!(content, "import os\nimport sys\nprint(sys.argv)\n");
}
