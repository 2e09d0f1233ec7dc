mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{RecordingDraftStore, harness, project, settle};
use folio_common::CacheConfig;
use folio_drafts::store::MemoryPublishedStore;
use folio_drafts::{
    ChangeStore, ChangeValue, CommitOutcome, DraftError, EditKey, EditMode, EventBus, FieldEditor,
    FieldKind, FieldOptions, KeyAction, NoticeLevel, Notifier, PublishedCache, SyncStatus,
    SyncTracker, ValidationError,
};

struct Parts {
    drafts: Arc<RecordingDraftStore>,
    store: ChangeStore<RecordingDraftStore>,
    published: PublishedCache<MemoryPublishedStore>,
    notifier: Notifier,
}

fn parts() -> Parts {
    let drafts = Arc::new(RecordingDraftStore::new());
    let store = ChangeStore::new(
        drafts.clone(),
        project(),
        EventBus::new(),
        SyncTracker::new(Duration::from_secs(30)),
    );
    Parts {
        drafts,
        store,
        published: PublishedCache::new(Arc::new(MemoryPublishedStore::new()), &CacheConfig::default()),
        notifier: Notifier::new(),
    }
}

fn editor(parts: &Parts, key: Option<&str>, kind: FieldKind, initial: &str) -> FieldEditor<RecordingDraftStore> {
    FieldEditor::new(
        parts.store.clone(),
        parts.notifier.clone(),
        FieldOptions {
            key: key.map(Into::into),
            kind,
            initial: initial.to_string(),
            default: "Untitled".to_string(),
            debounce: Duration::from_millis(1000),
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_keystrokes_within_window_write_once() {
    let h = harness();
    h.workspace.begin_session();
    let field = h
        .workspace
        .field("hero.title", FieldKind::SingleLine, "Untitled")
        .await
        .unwrap();
    h.workspace.start_edit("hero.title").unwrap();

    for text in ["H", "He", "Hel", "Hell", "Hello"] {
        h.workspace.input("hero.title", text).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert_eq!(h.drafts.save_count(), 0);
    assert!(field.has_pending());
    assert_eq!(h.workspace.sync_state().status(), SyncStatus::Queued);
    assert_eq!(h.workspace.sync_state().pending_changes, 1);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let saves = h.drafts.saves();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].key, "hero.title");
    assert_eq!(saves[0].value, ChangeValue::Text("Hello".into()));
    // the debounced write does not end the edit
    assert!(field.is_editing());
    assert_eq!(field.last_persisted(), "Hello");

    let state = h.workspace.sync_state();
    assert_eq!(state.status(), SyncStatus::Settled);
    assert!(state.last_sync_time.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_commit_after_debounced_write_is_unchanged() {
    let h = harness();
    h.workspace.begin_session();
    let field = h
        .workspace
        .field("about.body", FieldKind::MultiLine, "")
        .await
        .unwrap();
    h.workspace.start_edit("about.body").unwrap();
    h.workspace.input("about.body", "We build boats").unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.drafts.save_count(), 1);

    assert_eq!(field.commit().await.unwrap(), CommitOutcome::Unchanged);
    assert_eq!(h.drafts.save_count(), 1);
    assert!(!field.is_editing());
}

#[tokio::test(start_paused = true)]
async fn test_commit_cancels_pending_timer() {
    let h = harness();
    h.workspace.begin_session();
    let field = h
        .workspace
        .field("hero.title", FieldKind::SingleLine, "Untitled")
        .await
        .unwrap();
    h.workspace.start_edit("hero.title").unwrap();
    h.workspace.input("hero.title", "Draft").unwrap();

    let outcome = h.workspace.commit_edit("hero.title", "Final").await.unwrap();
    assert_eq!(outcome, CommitOutcome::Saved);
    assert!(!field.has_pending());

    tokio::time::sleep(Duration::from_secs(3)).await;
    let saves = h.drafts.saves();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].value, ChangeValue::Text("Final".into()));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reverts_without_writing() {
    let h = harness();
    h.workspace.begin_session();
    let field = h
        .workspace
        .field("hero.title", FieldKind::SingleLine, "Untitled")
        .await
        .unwrap();
    h.workspace.start_edit("hero.title").unwrap();
    h.workspace.input("hero.title", "Oops").unwrap();
    assert_eq!(field.text(), "Oops");

    h.workspace.cancel_edit("hero.title").unwrap();
    assert_eq!(field.text(), "Untitled");
    assert!(!field.is_editing());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.drafts.save_count(), 0);
    assert_eq!(h.workspace.sync_state().status(), SyncStatus::Settled);
}

#[tokio::test]
async fn test_editing_requires_edit_mode() {
    let h = harness();
    let mut notices = h.workspace.notifier().subscribe();
    h.workspace
        .field("hero.title", FieldKind::SingleLine, "Untitled")
        .await
        .unwrap();

    let err = h.workspace.start_edit("hero.title").unwrap_err();
    assert!(matches!(
        err,
        DraftError::Validation(ValidationError::EditModeDisabled)
    ));
    let notice = notices.try_recv().unwrap();
    assert_eq!(notice.level, NoticeLevel::Error);
    assert_eq!(notice.subject.as_deref(), Some("hero.title"));
}

#[tokio::test]
async fn test_unknown_field_is_rejected() {
    let h = harness();
    h.workspace.begin_session();
    let err = h.workspace.input("nope", "x").unwrap_err();
    assert!(matches!(
        err,
        DraftError::Validation(ValidationError::UnknownField { .. })
    ));
}

#[tokio::test]
async fn test_field_without_key_is_read_only() {
    let parts = parts();
    let field = editor(&parts, None, FieldKind::SingleLine, "Static");
    let err = field.start_edit(EditMode::ENABLED).unwrap_err();
    assert!(matches!(err, DraftError::Validation(ValidationError::ReadOnly)));
    assert!(!field.spawn_listener(parts.published.clone()));
    assert_eq!(field.text(), "Static");
}

#[tokio::test]
async fn test_input_outside_edit_state_is_rejected() {
    let parts = parts();
    let field = editor(&parts, Some("title"), FieldKind::SingleLine, "Old");
    let err = field.input("New").unwrap_err();
    assert!(matches!(
        err,
        DraftError::Validation(ValidationError::NotEditing { .. })
    ));
}

#[tokio::test]
async fn test_key_bindings_by_field_kind() {
    let parts = parts();
    let single = editor(&parts, Some("title"), FieldKind::SingleLine, "Old");
    single.start_edit(EditMode::ENABLED).unwrap();
    single.input("New title").unwrap();
    assert_eq!(
        single.key_press(EditKey::Enter).await.unwrap(),
        KeyAction::Committed(CommitOutcome::Saved)
    );

    let multi = editor(&parts, Some("body"), FieldKind::MultiLine, "Old");
    multi.start_edit(EditMode::ENABLED).unwrap();
    multi.input("Line one\n").unwrap();
    assert_eq!(multi.key_press(EditKey::Enter).await.unwrap(), KeyAction::Ignored);
    assert!(multi.is_editing());
    assert_eq!(
        multi.key_press(EditKey::ModEnter).await.unwrap(),
        KeyAction::Committed(CommitOutcome::Saved)
    );

    multi.start_edit(EditMode::ENABLED).unwrap();
    multi.input("Discard me").unwrap();
    assert_eq!(multi.key_press(EditKey::Escape).await.unwrap(), KeyAction::Cancelled);
    assert_eq!(multi.text(), "Line one\n");

    assert_eq!(parts.drafts.save_count(), 2);
}

#[tokio::test]
async fn test_failed_write_keeps_local_text() {
    let h = harness();
    h.workspace.begin_session();
    let mut notices = h.workspace.notifier().subscribe();
    let field = h
        .workspace
        .field("hero.title", FieldKind::SingleLine, "Untitled")
        .await
        .unwrap();
    h.workspace.start_edit("hero.title").unwrap();
    h.drafts.set_failing(true);

    let err = h.workspace.commit_edit("hero.title", "Keep me").await.unwrap_err();
    assert!(matches!(err, DraftError::Persistence(_)));
    assert_eq!(field.text(), "Keep me");
    assert_eq!(field.last_persisted(), "Untitled");
    assert!(field.is_editing());

    let notice = notices.try_recv().unwrap();
    assert_eq!(notice.level, NoticeLevel::Error);
    assert!(notice.message.contains("Could not save"));
    // the workspace does not report the same failure twice
    assert!(notices.try_recv().is_err());

    h.drafts.set_failing(false);
    assert_eq!(field.commit().await.unwrap(), CommitOutcome::Saved);
    assert_eq!(h.drafts.save_count(), 1);
}

#[tokio::test]
async fn test_other_editor_changes_are_reconciled_when_idle() {
    let parts = parts();
    let writer = editor(&parts, Some("title"), FieldKind::SingleLine, "Old");
    let reader = editor(&parts, Some("title"), FieldKind::SingleLine, "Old");
    let busy = editor(&parts, Some("title"), FieldKind::SingleLine, "Old");
    assert!(reader.spawn_listener(parts.published.clone()));
    assert!(busy.spawn_listener(parts.published.clone()));
    busy.start_edit(EditMode::ENABLED).unwrap();
    busy.input("Mine").unwrap();

    writer.start_edit(EditMode::ENABLED).unwrap();
    writer.commit_value("From writer").await.unwrap();
    settle().await;

    assert_eq!(reader.text(), "From writer");
    assert_eq!(reader.last_persisted(), "From writer");
    assert_eq!(busy.text(), "Mine");
}

#[tokio::test]
async fn test_reconcile_ignores_own_echo() {
    let parts = parts();
    let field = editor(&parts, Some("title"), FieldKind::SingleLine, "Old");
    field.start_edit(EditMode::ENABLED).unwrap();
    field.commit_value("New").await.unwrap();
    assert!(!field.reconcile("New"));
    assert!(field.reconcile("Newer"));
    assert_eq!(field.text(), "Newer");
}

#[tokio::test(start_paused = true)]
async fn test_closed_field_never_writes() {
    let parts = parts();
    let field = editor(&parts, Some("title"), FieldKind::SingleLine, "Old");
    field.start_edit(EditMode::ENABLED).unwrap();
    field.input("Typed then closed").unwrap();
    assert_eq!(parts.store.tracker().state().pending_changes, 1);

    field.close();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(parts.drafts.attempts(), 0);
    assert_eq!(parts.store.tracker().state().pending_changes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_field_never_writes() {
    let parts = parts();
    {
        let field = editor(&parts, Some("title"), FieldKind::SingleLine, "Old");
        field.start_edit(EditMode::ENABLED).unwrap();
        field.input("Typed then dropped").unwrap();
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(parts.drafts.attempts(), 0);
    assert_eq!(parts.store.tracker().state().status(), SyncStatus::Settled);
}
