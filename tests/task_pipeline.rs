//! Task-dispatch pipeline scenarios driven through an assembled hub:
//! lifecycle happy path, the generation fence against stale workers, and
//! reaper-driven reclamation.

use agentcom::domain_types::AgentId;
use agentcom::reaper::Reaper;
use agentcom::tasks::{SubmitTask, TaskStatus};
use agentcom::{Hub, HubConfig};
use std::sync::Arc;

fn agent(id: &str) -> AgentId {
    AgentId::try_new(id).unwrap()
}

async fn hub_with(config_tweak: impl FnOnce(&mut HubConfig)) -> (Arc<Hub>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = HubConfig {
        data_dir: dir.path().join("data"),
        backup_dir: dir.path().join("backups"),
        ..HubConfig::default()
    };
    config_tweak(&mut config);
    (Hub::open(config).await.unwrap(), dir)
}

#[tokio::test]
async fn lifecycle_happy_path() {
    let (hub, _dir) = hub_with(|_| {}).await;
    let worker = agent("w1");

    hub.tasks
        .enqueue(SubmitTask {
            description: "add the feature and write tests for it".into(),
            ..SubmitTask::default()
        })
        .await
        .unwrap();

    let task = hub.tasks.assign_next(&worker, &[]).await.unwrap().unwrap();
    assert_eq!(task.generation, 1);
    assert_eq!(task.status, TaskStatus::Assigned);

    let task = hub.tasks.accept_task(&task.id, 1).await.unwrap();
    assert_eq!(task.status, TaskStatus::Working);

    let done = hub
        .tasks
        .complete_task(&task.id, 1, serde_json::json!({ "pr": 42 }))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Complete);
}

#[tokio::test]
async fn reaper_reclaims_and_fence_blocks_the_old_worker() {
    // Zero orphan timeout: anything assigned is immediately reclaimable.
    let (hub, _dir) = hub_with(|c| c.orphan_timeout_secs = 0).await;
    let (w1, w2) = (agent("w1"), agent("w2"));

    hub.tasks
        .enqueue(SubmitTask {
            description: "contested work item".into(),
            ..SubmitTask::default()
        })
        .await
        .unwrap();

    let assigned = hub.tasks.assign_next(&w1, &[]).await.unwrap().unwrap();
    let old_generation = assigned.generation;

    // Neither worker is registered in presence, so the sweep reclaims.
    Reaper::new(hub.clone()).sweep().await;
    let requeued = hub.tasks.get(&assigned.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, TaskStatus::Queued);
    assert!(requeued.generation > old_generation);
    assert_eq!(requeued.assigned_to, None);

    // The new worker picks it up at a newer generation.
    let reassigned = hub.tasks.assign_next(&w2, &[]).await.unwrap().unwrap();
    assert!(reassigned.generation > requeued.generation);

    // The stale worker's completion bounces off the fence...
    let err = hub
        .tasks
        .complete_task(&assigned.id, old_generation, serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("generation mismatch"));
    let untouched = hub.tasks.get(&assigned.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, TaskStatus::Assigned);
    assert_eq!(untouched.assigned_to, Some(w2.clone()));

    // ...while the current worker's lands.
    hub.tasks
        .complete_task(&assigned.id, reassigned.generation, serde_json::json!({}))
        .await
        .unwrap();
}

#[tokio::test]
async fn tasks_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = || HubConfig {
        data_dir: dir.path().join("data"),
        backup_dir: dir.path().join("backups"),
        ..HubConfig::default()
    };

    let task_id = {
        let hub = Hub::open(config()).await.unwrap();
        let task = hub
            .tasks
            .enqueue(SubmitTask {
                description: "durable work".into(),
                ..SubmitTask::default()
            })
            .await
            .unwrap();
        hub.shutdown().await;
        task.id
    };

    let hub = Hub::open(config()).await.unwrap();
    let task = hub.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.description, "durable work");
}

#[tokio::test]
async fn goal_pipeline_feeds_tasks() {
    let (hub, _dir) = hub_with(|_| {}).await;

    let goal = hub
        .goals
        .submit(agentcom::goals::SubmitGoal {
            description: "improve onboarding".into(),
            priority: Some(1),
            ..agentcom::goals::SubmitGoal::default()
        })
        .await
        .unwrap();

    // Decompose the goal into one task and walk it through execution.
    let goal = hub.goals.dequeue().await.unwrap().unwrap();
    let task = hub
        .tasks
        .enqueue(SubmitTask {
            description: "write the onboarding guide".into(),
            goal_id: Some(goal.id.clone()),
            ..SubmitTask::default()
        })
        .await
        .unwrap();
    hub.goals.attach_task(&goal.id, task.id.clone()).await.unwrap();

    hub.goals
        .transition(&goal.id, agentcom::goals::GoalStatus::Executing, None)
        .await
        .unwrap();

    let worker = agent("writer");
    let assigned = hub.tasks.assign_next(&worker, &[]).await.unwrap().unwrap();
    hub.tasks
        .complete_task(&assigned.id, assigned.generation, serde_json::json!({}))
        .await
        .unwrap();

    hub.goals
        .transition(&goal.id, agentcom::goals::GoalStatus::Verifying, None)
        .await
        .unwrap();
    let done = hub
        .goals
        .transition(&goal.id, agentcom::goals::GoalStatus::Complete, None)
        .await
        .unwrap();
    assert_eq!(done.status, agentcom::goals::GoalStatus::Complete);
    assert_eq!(done.child_task_ids, vec![task.id]);
}
