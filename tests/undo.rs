mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use common::{RecordingSink, ScriptedAdapter, record};
use folio::application::adapter::{
    DeleteParams, GetListParams, GetManyParams, GetOneParams, UpdateParams, Verb,
};
use folio::application::error::DataError;
use folio::application::mutation::{MutationOptions, MutationRequest, UndoScope};
use folio::application::provider::DataProvider;
use folio::cache::{CacheValue, Fingerprint};
use folio::config::DataSettings;
use folio::domain::types::{Identifier, Resource};

const DELAY: Duration = Duration::from_millis(1000);

fn posts() -> Resource {
    Resource::new("posts")
}

fn setup(scope: UndoScope) -> (DataProvider, Arc<ScriptedAdapter>, Arc<RecordingSink>) {
    let adapter = ScriptedAdapter::new(vec![
        (
            "posts",
            vec![
                record(json!({"id": 1, "title": "Hello"})),
                record(json!({"id": 2, "title": "Again"})),
            ],
        ),
        ("comments", vec![record(json!({"id": 7, "body": "Nice"}))]),
    ]);
    let sink = Arc::new(RecordingSink::default());
    let settings = DataSettings {
        undoable_delay: DELAY,
        undo_scope: scope,
        ..DataSettings::default()
    };
    let provider = DataProvider::new(adapter.clone(), sink.clone(), &settings);
    (provider, adapter, sink)
}

fn retitle(id: i64, title: &str) -> MutationRequest {
    MutationRequest::Update {
        resource: posts(),
        id: Identifier::Int(id),
        data: record(json!({ "title": title })),
        previous_data: None,
    }
}

fn cached_title(provider: &DataProvider, id: i64) -> Option<serde_json::Value> {
    provider
        .cache()
        .peek(&Fingerprint::one(&posts(), &Identifier::Int(id)))
        .and_then(CacheValue::into_record)
        .and_then(|record| record.get("title").cloned())
}

async fn prime(provider: &DataProvider, id: i64) {
    provider
        .get_one(
            &posts(),
            GetOneParams {
                id: Identifier::Int(id),
            },
        )
        .await
        .expect("prime cache");
}

#[tokio::test(start_paused = true)]
async fn cancel_inside_the_delay_never_reaches_the_backend() {
    let (provider, adapter, sink) = setup(UndoScope::Global);
    prime(&provider, 1).await;

    let handle = provider.stage(retitle(1, "Edited"), None);
    assert_eq!(cached_title(&provider, 1), Some(json!("Edited")));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(handle.cancel());

    assert_eq!(handle.settled().await, Err(DataError::Cancelled));
    assert_eq!(adapter.calls(Verb::Update), 0);
    assert_eq!(cached_title(&provider, 1), Some(json!("Hello")));
    assert!(sink.is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_is_idempotent() {
    let (provider, adapter, _) = setup(UndoScope::Global);
    prime(&provider, 1).await;

    let handle = provider.stage(retitle(1, "Edited"), None);
    assert!(handle.cancel());
    assert!(!handle.cancel());

    assert_eq!(handle.settled().await, Err(DataError::Cancelled));
    assert_eq!(cached_title(&provider, 1), Some(json!("Hello")));
    assert!(provider.pipeline().ledger().is_empty());
    assert_eq!(adapter.total_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn elapsed_delay_commits_with_an_undoable_notification() {
    let (provider, adapter, sink) = setup(UndoScope::Global);
    prime(&provider, 1).await;

    let started = Instant::now();
    let handle = provider.stage(retitle(1, "Edited"), None);
    let outcome = handle.settled().await.expect("committed");

    assert!(started.elapsed() >= DELAY);
    assert_eq!(
        outcome.record().and_then(|record| record.get("title").cloned()),
        Some(json!("Edited"))
    );
    assert_eq!(adapter.calls(Verb::Update), 1);
    assert_eq!(provider.undo_queue().pending_count(), 0);

    let notifications = sink.notifications();
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].undoable);
}

#[tokio::test(start_paused = true)]
async fn undoable_mode_waits_out_the_delay() {
    let (provider, adapter, _) = setup(UndoScope::Global);
    prime(&provider, 2).await;

    let started = Instant::now();
    provider
        .update(
            &posts(),
            UpdateParams {
                id: Identifier::Int(2),
                data: record(json!({"title": "Later"})),
                previous_data: None,
            },
            MutationOptions::undoable(),
        )
        .await
        .expect("committed");

    assert!(started.elapsed() >= DELAY);
    assert_eq!(adapter.calls(Verb::Update), 1);
}

#[tokio::test(start_paused = true)]
async fn staging_again_commits_the_previous_mutation() {
    let (provider, adapter, _) = setup(UndoScope::Global);
    prime(&provider, 1).await;
    prime(&provider, 2).await;

    let started = Instant::now();
    let first = provider.stage(retitle(1, "One"), None);
    let second = provider.stage(retitle(2, "Two"), None);

    first.settled().await.expect("first committed early");
    assert!(started.elapsed() < DELAY);
    assert_eq!(adapter.calls(Verb::Update), 1);
    assert_eq!(provider.undo_queue().pending_count(), 1);

    assert!(second.cancel());
    assert_eq!(second.settled().await, Err(DataError::Cancelled));
    assert_eq!(cached_title(&provider, 1), Some(json!("One")));
    assert_eq!(cached_title(&provider, 2), Some(json!("Again")));
}

#[tokio::test(start_paused = true)]
async fn per_resource_scope_keeps_resources_independent() {
    let (provider, adapter, _) = setup(UndoScope::PerResource);
    prime(&provider, 1).await;

    let post = provider.stage(retitle(1, "Edited"), None);
    let comment = provider.stage(
        MutationRequest::Delete {
            resource: Resource::new("comments"),
            id: Identifier::Int(7),
            previous_data: None,
        },
        None,
    );
    assert_eq!(provider.undo_queue().pending_count(), 2);

    assert!(comment.cancel());
    post.settled().await.expect("post committed");

    assert_eq!(adapter.calls(Verb::Update), 1);
    assert_eq!(adapter.calls(Verb::Delete), 0);
    assert_eq!(adapter.records("comments").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_delete_puts_the_record_back_in_lists() {
    let (provider, _, _) = setup(UndoScope::Global);
    let key = Fingerprint::list(&posts(), &GetListParams::default());
    provider
        .get_list(&posts(), GetListParams::default())
        .await
        .expect("prime list");
    let before = provider.cache().peek(&key);

    let handle = provider.stage(
        MutationRequest::Delete {
            resource: posts(),
            id: Identifier::Int(2),
            previous_data: None,
        },
        None,
    );
    let during = provider.cache().peek(&key).expect("list entry");
    assert_eq!(during.total(), Some(1));

    assert!(handle.cancel());
    assert_eq!(handle.settled().await, Err(DataError::Cancelled));
    assert_eq!(provider.cache().peek(&key), before);
}

#[tokio::test(start_paused = true)]
async fn shutdown_commits_staged_mutations() {
    let (provider, adapter, _) = setup(UndoScope::Global);
    prime(&provider, 1).await;

    let handle = provider.stage(retitle(1, "Flushed"), None);
    provider.shutdown().await;
    handle.settled().await.expect("committed at shutdown");

    assert_eq!(adapter.calls(Verb::Update), 1);
    let stored = adapter
        .records("posts")
        .into_iter()
        .find(|record| record.id() == Some(Identifier::Int(1)))
        .and_then(|record| record.get("title").cloned());
    assert_eq!(stored, Some(json!("Flushed")));
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_until_staged_commits_settle() {
    let (provider, adapter, _) = setup(UndoScope::Global);
    prime(&provider, 1).await;
    adapter.hold();

    let handle = provider.stage(retitle(1, "Flushed"), None);
    let shutdown = provider.shutdown();
    tokio::pin!(shutdown);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), &mut shutdown)
            .await
            .is_err()
    );

    adapter.release();
    shutdown.await;
    assert_eq!(adapter.calls(Verb::Update), 1);
    let stored = adapter
        .records("posts")
        .into_iter()
        .find(|record| record.id() == Some(Identifier::Int(1)))
        .and_then(|record| record.get("title").cloned());
    assert_eq!(stored, Some(json!("Flushed")));
    handle.settled().await.expect("committed at shutdown");
}

#[tokio::test(start_paused = true)]
async fn batched_reads_keep_a_staged_edit_visible() {
    let posts = posts();
    let (provider, _, _) = setup(UndoScope::Global);
    prime(&provider, 1).await;

    let handle = provider.stage(retitle(1, "Staged"), None);
    provider
        .get_many(
            &posts,
            GetManyParams {
                ids: vec![Identifier::Int(1), Identifier::Int(2)],
            },
        )
        .await
        .expect("batched read");
    assert_eq!(cached_title(&provider, 1), Some(json!("Staged")));
    assert_eq!(cached_title(&provider, 2), Some(json!("Again")));

    provider
        .refetch_one(
            &posts,
            GetOneParams {
                id: Identifier::Int(1),
            },
        )
        .await
        .expect("refetch");
    assert_eq!(cached_title(&provider, 1), Some(json!("Staged")));

    assert!(handle.cancel());
    assert_eq!(handle.settled().await, Err(DataError::Cancelled));
    assert_eq!(cached_title(&provider, 1), Some(json!("Hello")));
}

#[tokio::test(start_paused = true)]
async fn failed_commit_rolls_back_and_notifies() {
    let (provider, adapter, sink) = setup(UndoScope::Global);
    prime(&provider, 1).await;
    adapter.fail_next(Verb::Delete, DataError::adapter(500, "boom"));

    let result = provider
        .delete(
            &posts(),
            DeleteParams {
                id: Identifier::Int(1),
                previous_data: None,
            },
            MutationOptions::undoable(),
        )
        .await;

    assert!(matches!(result, Err(DataError::Adapter { status: 500, .. })));
    assert_eq!(cached_title(&provider, 1), Some(json!("Hello")));
    assert_eq!(sink.notifications().len(), 1);
}
