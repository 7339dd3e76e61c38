//! Hierarchy walking tests: parent ordering, fan-out, custom fields and time windows.

mod common;

use chrono::{Duration, Utc};
use clickup_tap::{Cursor, DEFINITIONS_FIELD, DEFAULT_LOOKBACK_DAYS, TimeEntryConfig, clickup_registry};
use common::{TestEnv, test_registry};
use serde_json::json;

// =============================================================================
// Parent Ordering Tests
// =============================================================================

#[tokio::test]
async fn test_children_requested_in_parent_order() {
    let env = TestEnv::new();
    env.source
        .page("/team", "teams", vec![json!({"id": "t1"}), json!({"id": "t2"})]);
    env.source.page(
        "/team/t1/goal",
        "goals",
        vec![
            json!({"id": "g1", "date_updated": "1"}),
            json!({"id": "g2", "date_updated": "2"}),
        ],
    );
    env.source
        .page("/team/t2/goal", "goals", vec![json!({"id": "g3", "date_updated": "3"})]);

    let stats = env.walk("goals").await;

    assert_eq!(stats.parents, 2);
    assert_eq!(env.source.paths(), vec!["/team", "/team/t1/goal", "/team/t2/goal"]);
    assert_eq!(env.emitted_ids("goals"), vec!["g1", "g2", "g3"]);
}

#[tokio::test]
async fn test_first_parent_emitted_before_second_requested() {
    let env = TestEnv::new();
    env.source
        .page("/team", "teams", vec![json!({"id": "t1"}), json!({"id": "t2"})]);
    env.source.page(
        "/team/t1/goal",
        "goals",
        vec![
            json!({"id": "g1", "date_updated": "1"}),
            json!({"id": "g2", "date_updated": "2"}),
        ],
    );
    env.source
        .page("/team/t2/goal", "goals", vec![json!({"id": "g3", "date_updated": "3"})]);

    env.walk("goals").await;

    let second = &env.source.requests_for("/team/t2/goal")[0];
    let records_before = env
        .sink
        .messages()
        .iter()
        .take(second.emitted_before)
        .filter(|m| matches!(m, clickup_tap::Message::Record { .. }))
        .count();
    assert_eq!(records_before, 2);
}

#[tokio::test]
async fn test_parent_pages_are_walked_lazily() {
    let env = TestEnv::new();
    env.source.page("/team", "teams", vec![json!({"id": "t1"})]);
    env.source.page("/team", "teams", vec![json!({"id": "t2"})]);
    env.source
        .page("/team/t1/goal", "goals", vec![json!({"id": "g1", "date_updated": "1"})]);
    env.source
        .page("/team/t2/goal", "goals", vec![json!({"id": "g2", "date_updated": "2"})]);

    env.walk("goals").await;

    let requests = env.source.requests();
    let seen: Vec<(String, Option<String>)> = requests.iter().map(|r| (r.path.clone(), r.token.clone())).collect();
    assert_eq!(
        seen,
        vec![
            ("/team".to_string(), None),
            ("/team/t1/goal".to_string(), None),
            ("/team".to_string(), Some("1".to_string())),
            ("/team/t2/goal".to_string(), None),
        ]
    );
}

#[tokio::test]
async fn test_parent_key_injected_into_children() {
    let env = TestEnv::new();
    env.source.page("/team", "teams", vec![json!({"id": 42})]);
    env.source
        .page("/team/42/goal", "goals", vec![json!({"id": "g1", "date_updated": "1"})]);

    env.walk("goals").await;

    let goals = env.sink.records("goals");
    assert_eq!(goals[0]["team_id"], json!("42"));
}

#[tokio::test]
async fn test_three_level_walk() {
    let env = TestEnv::new();
    env.source.page("/team", "teams", vec![json!({"id": "t1"})]);
    env.source
        .page("/team/t1/space", "spaces", vec![json!({"id": "s1"}), json!({"id": "s2"})]);
    env.source.page("/space/s1/folder", "folders", vec![json!({"id": "f1"})]);
    env.source.page("/space/s2/folder", "folders", vec![json!({"id": "f2"})]);

    env.walk("folders").await;

    assert_eq!(
        env.source.paths(),
        vec!["/team", "/team/t1/space", "/space/s1/folder", "/space/s2/folder"]
    );
    let folders = env.sink.records("folders");
    assert_eq!(folders[0]["space_id"], json!("s1"));
    assert_eq!(folders[1]["space_id"], json!("s2"));
    // intermediate streams are walked, not emitted
    assert!(env.sink.records("spaces").is_empty());
}

#[tokio::test]
async fn test_parent_without_id_is_skipped() {
    let env = TestEnv::new();
    env.source
        .page("/team", "teams", vec![json!({"name": "anonymous"}), json!({"id": "t2"})]);
    env.source
        .page("/team/t2/goal", "goals", vec![json!({"id": "g2", "date_updated": "1"})]);

    env.walk("goals").await;

    assert_eq!(env.source.paths(), vec!["/team", "/team/t2/goal"]);
    assert_eq!(env.emitted_ids("goals"), vec!["g2"]);
}

#[tokio::test]
async fn test_parent_concurrency_preserves_order() {
    let env = TestEnv::new();
    env.source.page(
        "/team",
        "teams",
        vec![json!({"id": "t1"}), json!({"id": "t2"}), json!({"id": "t3"})],
    );
    env.source
        .page("/team/t1/goal", "goals", vec![json!({"id": "g1", "date_updated": "30"})]);
    env.source
        .page("/team/t2/goal", "goals", vec![json!({"id": "g2", "date_updated": "10"})]);
    env.source.page("/team/t2/goal", "goals", vec![json!({"id": "g2b", "date_updated": "11"})]);
    env.source
        .page("/team/t3/goal", "goals", vec![json!({"id": "g3", "date_updated": "20"})]);

    let walker = env.walker_with(test_registry(), TimeEntryConfig::default(), 4);
    let stats = walker.walk("goals").await.unwrap();

    assert_eq!(stats.parents, 3);
    assert_eq!(env.emitted_ids("goals"), vec!["g1", "g2", "g2b", "g3"]);
    env.assert_bookmark("goals", json!("30"));
    assert!(env.cursor("goals").parent_context.is_none());
}

#[tokio::test]
async fn test_missing_resume_parent_rewalks_all_parents() {
    let env = TestEnv::new();
    env.save_cursor(&Cursor {
        stream: "goals".to_string(),
        bookmark: Some(json!("999")),
        parent_context: Some("deleted-team".to_string()),
        run_floor: None,
        boundary_keys: Vec::new(),
    });
    env.source
        .page("/team", "teams", vec![json!({"id": "t1"}), json!({"id": "t2"})]);
    env.source
        .page("/team/t1/goal", "goals", vec![json!({"id": "g1", "date_updated": "100"})]);
    env.source
        .page("/team/t2/goal", "goals", vec![json!({"id": "g2", "date_updated": "200"})]);

    env.walk("goals").await;

    assert_eq!(env.emitted_ids("goals"), vec!["g1", "g2"]);
    env.assert_bookmark("goals", json!("999"));
}

// =============================================================================
// Custom Field Tests
// =============================================================================

fn script_task_hierarchy(env: &TestEnv) {
    env.source.page("/team", "teams", vec![json!({"id": "t1"})]);
    env.source.page(
        "/team/t1/task",
        "tasks",
        vec![
            json!({
                "id": "task-1",
                "date_updated": "1700000000000",
                "space": {"id": "s1"},
                "folder": {"id": "f1", "hidden": true},
                "list": {"id": "l1"}
            }),
            json!({
                "id": "task-2",
                "date_updated": "1700000001000",
                "space": {"id": "s1"},
                "folder": {"id": "f1", "hidden": true},
                "list": {"id": "l1"}
            }),
        ],
    );
    env.source.page(
        "/space/s1/field",
        "fields",
        vec![
            json!({"id": "cf-1", "name": "Priority"}),
            json!({"id": "cf-2", "name": "Estimate"}),
        ],
    );
    env.source
        .page("/list/l1/field", "fields", vec![json!({"id": "cf-1", "name": "Priority Level"})]);
}

#[tokio::test]
async fn test_list_field_overrides_space_field() {
    let env = TestEnv::new();
    script_task_hierarchy(&env);

    env.walker(clickup_registry().unwrap()).walk("tasks").await.unwrap();

    let tasks = env.sink.records("tasks");
    assert_eq!(tasks.len(), 2);
    let definitions = &tasks[0][DEFINITIONS_FIELD];
    assert_eq!(definitions["cf-1"]["name"], json!("Priority Level"));
    assert_eq!(definitions["cf-2"]["name"], json!("Estimate"));
}

#[tokio::test]
async fn test_field_definitions_fetched_once_per_scope() {
    let env = TestEnv::new();
    script_task_hierarchy(&env);

    let walker = env.walker(clickup_registry().unwrap());
    walker.walk("tasks").await.unwrap();

    assert_eq!(env.source.requests_for("/space/s1/field").len(), 1);
    assert_eq!(env.source.requests_for("/list/l1/field").len(), 1);
    // hidden folders hold no fields of their own
    assert!(env.source.requests_for("/folder/f1/field").is_empty());
    assert_eq!(walker.merger().cached_scopes().await, 2);
}

#[tokio::test]
async fn test_tasks_request_carries_bookmark() {
    let mut env = TestEnv::new();
    script_task_hierarchy(&env);

    env.walker(clickup_registry().unwrap()).walk("tasks").await.unwrap();
    env.assert_bookmark("tasks", json!("1700000001000"));

    env.next_run();
    env.walker(clickup_registry().unwrap()).walk("tasks").await.unwrap();

    let request = &env.source.requests_for("/team/t1/task")[0];
    // ClickUp's `_gt` filter is exclusive, so the bookmark millisecond is re-requested
    assert_eq!(request.param("date_updated_gt"), Some("1700000000999"));
    assert_eq!(request.param("include_closed"), Some("true"));
    assert!(env.sink.records("tasks").is_empty());
}

#[tokio::test]
async fn test_task_updated_in_bookmark_millisecond_is_emitted() {
    let mut env = TestEnv::new();
    env.source.filter_after("/team/t1/task", "date_updated_gt", "date_updated");
    script_task_hierarchy(&env);

    env.walker(clickup_registry().unwrap()).walk("tasks").await.unwrap();
    env.assert_bookmark("tasks", json!("1700000001000"));

    // task-3 lands in the same millisecond as the saved bookmark
    env.next_run();
    env.source.clear("/team/t1/task");
    env.source.page(
        "/team/t1/task",
        "tasks",
        vec![
            json!({"id": "task-1", "date_updated": "1700000000000", "space": {"id": "s1"}}),
            json!({"id": "task-2", "date_updated": "1700000001000", "space": {"id": "s1"}}),
            json!({"id": "task-3", "date_updated": "1700000001000", "space": {"id": "s1"}}),
        ],
    );
    env.walker(clickup_registry().unwrap()).walk("tasks").await.unwrap();

    assert_eq!(env.emitted_ids("tasks"), vec!["task-3"]);
    env.assert_bookmark("tasks", json!("1700000001000"));
    assert_eq!(env.cursor("tasks").boundary_keys, vec!["task-2", "task-3"]);
}

// =============================================================================
// Time Window Tests
// =============================================================================

fn script_time_entries(env: &TestEnv) {
    env.source.page(
        "/team",
        "teams",
        vec![json!({
            "id": "t1",
            "members": [{"user": {"id": 11}}, {"user": {"id": 12}}]
        })],
    );
    env.source.page(
        "/team/t1/time_entries",
        "data",
        vec![json!({"id": "te-1", "at": "1700000000000", "duration": "60000"})],
    );
}

#[tokio::test]
async fn test_time_window_defaults_to_lookback() {
    let env = TestEnv::new();
    script_time_entries(&env);

    let before = Utc::now();
    env.walker(clickup_registry().unwrap()).walk("time_entries").await.unwrap();
    let after = Utc::now();

    let request = &env.source.requests_for("/team/t1/time_entries")[0];
    let start: i64 = request.param("start_date").unwrap().parse().unwrap();
    let lookback = Duration::days(DEFAULT_LOOKBACK_DAYS);
    assert!(start >= (before - lookback).timestamp_millis());
    assert!(start <= (after - lookback).timestamp_millis());
    assert_eq!(request.param("assignee"), Some("11,12"));
    assert!(request.param("end_date").is_none());

    env.assert_bookmark("time_entries", json!("1700000000000"));
}

#[tokio::test]
async fn test_time_window_starts_at_bookmark() {
    let mut env = TestEnv::new();
    script_time_entries(&env);
    env.walker(clickup_registry().unwrap()).walk("time_entries").await.unwrap();

    env.next_run();
    env.walker(clickup_registry().unwrap()).walk("time_entries").await.unwrap();

    let request = &env.source.requests_for("/team/t1/time_entries")[0];
    assert_eq!(request.param("start_date"), Some("1700000000000"));
    assert!(env.sink.records("time_entries").is_empty());
}

#[tokio::test]
async fn test_time_window_uses_configured_assignees_and_start() {
    let env = TestEnv::new();
    script_time_entries(&env);
    let config = TimeEntryConfig {
        assignees: vec!["7".to_string(), "8".to_string()],
        start_date: Some(clickup_tap::parse_start_date("2024-01-01").unwrap()),
    };

    env.walker_with(clickup_registry().unwrap(), config, 1)
        .walk("time_entries")
        .await
        .unwrap();

    let request = &env.source.requests_for("/team/t1/time_entries")[0];
    assert_eq!(request.param("assignee"), Some("7,8"));
    assert_eq!(request.param("start_date"), Some("1704067200000"));
    // no member lookup beyond walking the teams themselves
    assert_eq!(env.source.requests_for("/team").len(), 1);
}
