use super::*;
use crate::membership::MembershipCache;
use crate::test_helpers::{FakeApi, network_error, test_db};
use crate::types::{Action, UserHandle};
use serde_json::json;
use std::collections::VecDeque;
use tempfile::NamedTempFile;

/// Context whose API fails every call
pub(crate) async fn test_context() -> (Context, NamedTempFile) {
    let (ctx, _api, file) = test_context_with(FakeApi::new(|_, _| Err(network_error()))).await;
    (ctx, file)
}

/// Context over a scripted API; the returned handle exposes the calls made
pub(crate) async fn test_context_with(api: FakeApi) -> (Context, Arc<FakeApi>, NamedTempFile) {
    let (db, file) = test_db().await;
    let api = Arc::new(api);
    let membership = Arc::new(MembershipCache::new(db.clone()));
    membership.init().await.unwrap();
    let (events, _) = broadcast::channel(100);
    let ctx = Context {
        db,
        api: api.clone(),
        membership,
        scheduling: SchedulingConfig::default(),
        events,
    };
    (ctx, api, file)
}

#[test]
fn test_state_is_tagged_by_type() {
    let state = OperationState::MuteQueue(QueueState {
        users: VecDeque::from([UserHandle::new("1", "one")]),
    });

    let json = serde_json::to_value(&state).unwrap();
    assert_eq!(json, json!({"type": "mute_queue", "users": [{"id": "1", "username": "one"}]}));
    assert_eq!(state.type_tag(), "mute_queue");

    let back: OperationState = serde_json::from_value(json).unwrap();
    assert_eq!(back, state);
}

#[test]
fn test_type_tag_matches_serialized_tag() {
    let states = [
        OperationState::BlockLikers(BlockLikersState::new(
            "op",
            BlockLikersRequest {
                tweet_id: "1".into(),
                action: Action::Block,
                exclude_followers: false,
                exclude_follows: false,
                include_likers: true,
                include_retweeters: false,
            },
        )),
        OperationState::BlockQueue(QueueState::default()),
        OperationState::MuteQueue(QueueState::default()),
        OperationState::CollectBlocked(UserListState::default()),
        OperationState::CollectMuted(UserListState::default()),
    ];
    for state in states {
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["type"], state.type_tag());
    }
}

#[tokio::test]
async fn test_state_store_lifecycle() {
    let (db, _file) = test_db().await;
    assert!(list(&db).await.unwrap().is_empty());

    add(&db, "block_queue", &OperationState::BlockQueue(QueueState::default()))
        .await
        .unwrap();
    add(&db, "collect_muted", &OperationState::CollectMuted(UserListState::default()))
        .await
        .unwrap();
    db.kv_set("block_queue:batch", &json!([])).await.unwrap();

    let mut ids = list(&db).await.unwrap();
    ids.sort();
    assert_eq!(ids, vec!["block_queue", "collect_muted"]);

    let raw = get_raw(&db, "block_queue").await.unwrap().unwrap();
    assert_eq!(raw["type"], "block_queue");
    assert!(matches!(
        get_state(&db, "block_queue").await.unwrap(),
        Some(OperationState::BlockQueue(_))
    ));

    remove(&db, "block_queue").await.unwrap();
    assert!(get_state(&db, "block_queue").await.unwrap().is_none());
    assert_eq!(list(&db).await.unwrap(), vec!["collect_muted"]);
}

#[tokio::test]
async fn test_schedule_emits_event() {
    let (ctx, _file) = test_context().await;
    let mut events = ctx.events.subscribe();

    let at = ctx
        .schedule_in("job", std::time::Duration::from_secs(5))
        .await
        .unwrap();

    let timer = ctx.db.get_timer("job").await.unwrap().unwrap();
    assert_eq!(timer.scheduled_time.timestamp_millis(), at.timestamp_millis());
    assert_eq!(
        events.recv().await.unwrap(),
        Event::OperationScheduled {
            id: "job".into(),
            at
        }
    );
}
