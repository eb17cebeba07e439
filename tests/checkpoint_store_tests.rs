//! File-system checkpoint store driven through a real orchestrator.

use std::path::Path;
use std::sync::Arc;

use agent_conductor::{
    AgentSpec, CheckpointStore, ExecutionStrategy, FileSystemStore, Orchestrator,
    ScriptedLauncher, SessionId, SessionPlan, SessionState, ShutdownMode,
};

mod fixtures;
use fixtures::fast_settings;

fn checkpoint_files(root: &Path, session_id: &SessionId) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(root.join(session_id.as_str()))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn orchestrator_prunes_to_the_configured_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSystemStore::new(dir.path()));
    let mut settings = fast_settings();
    settings.keep_checkpoints = 3;
    let (orchestrator, task) =
        Orchestrator::spawn(settings, Arc::new(ScriptedLauncher::new()), store.clone());

    let mut plan = SessionPlan::new("prune", ExecutionStrategy::Sequential);
    let ids: Vec<_> = (0..4)
        .map(|n| plan.agent(AgentSpec::new("engineer", format!("step {n}"))))
        .collect();
    let session = orchestrator.create_session(plan).await.unwrap();
    orchestrator.start_session(&session).await.unwrap();
    for id in &ids {
        orchestrator.report_completion(&session, id, 0).await.unwrap();
    }

    let files = checkpoint_files(dir.path(), &session);
    assert_eq!(files.len(), 3);
    assert!(files.iter().all(|name| name.ends_with(".checkpoint.json")));

    let latest = store.load_latest_checkpoint(&session).await.unwrap().unwrap();
    assert_eq!(latest.session_state(), Some(SessionState::Completed));

    orchestrator.shutdown(ShutdownMode::Detach).await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn detached_session_is_recovered_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut plan = SessionPlan::new("restart", ExecutionStrategy::Parallel);
    let a = plan.agent(AgentSpec::new("engineer", "api"));

    let session = {
        let store = Arc::new(FileSystemStore::new(dir.path()));
        let (orchestrator, task) =
            Orchestrator::spawn(fast_settings(), Arc::new(ScriptedLauncher::new()), store);
        let session = orchestrator.create_session(plan).await.unwrap();
        orchestrator.start_session(&session).await.unwrap();
        orchestrator
            .record_resume_token(&session, &a, "tok-api")
            .await
            .unwrap();
        orchestrator.shutdown(ShutdownMode::Detach).await.unwrap();
        task.await.unwrap();
        session
    };

    let store = Arc::new(FileSystemStore::new(dir.path()));
    assert_eq!(store.list_nonterminal_sessions().await.unwrap(), vec![session.clone()]);

    let launcher = Arc::new(ScriptedLauncher::new());
    let (orchestrator, task) = Orchestrator::spawn(fast_settings(), launcher.clone(), store.clone());
    let summary = orchestrator.recover().await.unwrap();
    assert_eq!(summary.recovered.len(), 1);

    let launches = launcher.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].resume_token.as_deref(), Some("tok-api"));

    orchestrator.report_completion(&session, &a, 0).await.unwrap();
    let snapshot = orchestrator.get_status(&session).await.unwrap();
    assert_eq!(snapshot.session.state, SessionState::Completed);
    assert!(store.list_nonterminal_sessions().await.unwrap().is_empty());

    orchestrator.shutdown(ShutdownMode::Detach).await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn unreadable_directory_is_recorded_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let session = SessionId::from("sess_garbled");
    let session_dir = dir.path().join(session.as_str());
    std::fs::create_dir_all(&session_dir).unwrap();
    std::fs::write(
        session_dir.join("00000000000000000007-000.checkpoint.json"),
        "{\"schema_version\": 1",
    )
    .unwrap();

    let store = Arc::new(FileSystemStore::new(dir.path()));
    let (orchestrator, task) =
        Orchestrator::spawn(fast_settings(), Arc::new(ScriptedLauncher::new()), store.clone());
    let summary = orchestrator.recover().await.unwrap();
    assert_eq!(summary.indeterminate, vec![session.clone()]);

    // The garbled file stays for inspection beside the failure record
    let files = checkpoint_files(dir.path(), &session);
    assert_eq!(files.len(), 2);
    assert!(store.list_nonterminal_sessions().await.unwrap().is_empty());

    orchestrator.shutdown(ShutdownMode::Detach).await.unwrap();
    task.await.unwrap();
}
