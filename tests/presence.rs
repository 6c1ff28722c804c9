//! Typing-engine behavior: idempotent merges, decay, call-site debounce,
//! IME composition, and submit semantics.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use textcall::{AppConfig, MemoryStore, RoomManager, RoomUser, TypingSession};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn setup() -> (RoomManager<MemoryStore>, String, String) {
    let store = MemoryStore::new();
    let (manager, _events) = RoomManager::new(store, AppConfig::default());
    let (room_id, user_id) = manager
        .create_and_join("Test", "Alice", false, None)
        .await
        .unwrap();
    (manager, room_id, user_id)
}

async fn user_state(manager: &RoomManager<MemoryStore>, room_id: &str, user_id: &str) -> RoomUser {
    let room = manager.read_room(room_id).await.unwrap().unwrap();
    room.users[user_id].clone()
}

async fn drain_count<T>(rx: &mut UnboundedReceiver<T>) -> usize {
    let mut count = 0;
    loop {
        match tokio::time::timeout(Duration::from_millis(10), rx.recv()).await {
            Ok(Some(_)) => count += 1,
            _ => break,
        }
    }
    count
}

#[tokio::test(start_paused = true)]
async fn update_typing_sets_derived_state() {
    init_logging();
    let (manager, room_id, user_id) = setup().await;

    manager
        .update_typing(&room_id, &user_id, "hello", "")
        .await
        .unwrap();

    let user = user_state(&manager, &room_id, &user_id).await;
    assert_eq!(user.typing, "hello");
    assert_eq!(user.composing, "");
    assert!(user.is_typing);
    assert_eq!(user.status, "active");
}

#[tokio::test(start_paused = true)]
async fn update_typing_is_idempotent() {
    init_logging();
    let (manager, room_id, user_id) = setup().await;

    manager
        .update_typing(&room_id, &user_id, "hello", "")
        .await
        .unwrap();
    manager
        .update_typing(&room_id, &user_id, "hello", "")
        .await
        .unwrap();

    let user = user_state(&manager, &room_id, &user_id).await;
    assert_eq!(user.typing, "hello");
    assert!(user.is_typing);
}

#[tokio::test(start_paused = true)]
async fn typing_state_decays_after_the_quiet_window() {
    init_logging();
    let (manager, room_id, user_id) = setup().await;

    manager
        .update_typing(&room_id, &user_id, "hello", "")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5100)).await;

    let user = user_state(&manager, &room_id, &user_id).await;
    assert_eq!(user.typing, "");
    assert_eq!(user.composing, "");
    assert!(!user.is_typing);
}

#[tokio::test(start_paused = true)]
async fn each_update_resets_the_decay_timer() {
    init_logging();
    let (manager, room_id, user_id) = setup().await;

    manager
        .update_typing(&room_id, &user_id, "hello", "")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(3000)).await;
    manager
        .update_typing(&room_id, &user_id, "hello again", "")
        .await
        .unwrap();

    // 6s after the first update but only 3s after the second: still live.
    tokio::time::sleep(Duration::from_millis(3000)).await;
    let user = user_state(&manager, &room_id, &user_id).await;
    assert_eq!(user.typing, "hello again");

    tokio::time::sleep(Duration::from_millis(2200)).await;
    let user = user_state(&manager, &room_id, &user_id).await;
    assert!(!user.is_typing);
}

#[tokio::test(start_paused = true)]
async fn clearing_typing_cancels_the_decay() {
    init_logging();
    let (manager, room_id, user_id) = setup().await;

    manager
        .update_typing(&room_id, &user_id, "hello", "")
        .await
        .unwrap();
    manager
        .update_typing(&room_id, &user_id, "", "")
        .await
        .unwrap();
    let before = user_state(&manager, &room_id, &user_id).await.last_update;

    tokio::time::sleep(Duration::from_millis(6000)).await;
    let user = user_state(&manager, &room_id, &user_id).await;
    // No decay task fired afterward: lastUpdate is untouched.
    assert_eq!(user.last_update, before);
    assert!(!user.is_typing);
}

#[tokio::test(start_paused = true)]
async fn rapid_keystrokes_coalesce_into_one_write() {
    init_logging();
    let (manager, room_id, user_id) = setup().await;

    let mut sub_rx = manager.listen_to_room(&room_id).await.unwrap();
    // Swallow the initial snapshot before typing starts.
    let _ = sub_rx.recv().await;

    let mut session = TypingSession::new(manager.clone(), &room_id, &user_id);
    session.keystroke("a");
    session.keystroke("ab");
    session.keystroke("abc");

    tokio::time::sleep(Duration::from_millis(200)).await;

    let user = user_state(&manager, &room_id, &user_id).await;
    assert_eq!(user.typing, "abc");
    // One debounced write for three keystrokes.
    assert_eq!(drain_count(&mut sub_rx).await, 1);
}

#[tokio::test(start_paused = true)]
async fn composition_is_carried_separately_then_promoted() {
    init_logging();
    let (manager, room_id, user_id) = setup().await;
    let mut session = TypingSession::new(manager.clone(), &room_id, &user_id);

    session.composition("こんにちは");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let user = user_state(&manager, &room_id, &user_id).await;
    assert_eq!(user.typing, "");
    assert_eq!(user.composing, "こんにちは");
    assert!(user.is_typing);

    session.composition_end("こんにちは");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let user = user_state(&manager, &room_id, &user_id).await;
    assert_eq!(user.typing, "こんにちは");
    assert_eq!(user.composing, "");
}

#[tokio::test(start_paused = true)]
async fn submit_clears_immediately_and_cancels_the_pending_push() {
    init_logging();
    let (manager, room_id, user_id) = setup().await;
    let mut session = TypingSession::new(manager.clone(), &room_id, &user_id);

    session.keystroke("hello");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(user_state(&manager, &room_id, &user_id).await.typing, "hello");

    session.keystroke("hello again");
    // Enter lands before the debounce window closes.
    session.submit().await.unwrap();
    assert_eq!(session.text(), "");

    let user = user_state(&manager, &room_id, &user_id).await;
    assert_eq!(user.typing, "");
    assert!(!user.is_typing);

    // The aborted debounce push never lands late.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let user = user_state(&manager, &room_id, &user_id).await;
    assert_eq!(user.typing, "");
}

#[tokio::test(start_paused = true)]
async fn muting_clears_and_silences_publishing() {
    init_logging();
    let (manager, room_id, user_id) = setup().await;
    let mut session = TypingSession::new(manager.clone(), &room_id, &user_id);

    session.keystroke("visible");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(user_state(&manager, &room_id, &user_id).await.typing, "visible");

    session.set_muted(true).await.unwrap();
    assert!(session.is_muted());
    assert_eq!(user_state(&manager, &room_id, &user_id).await.typing, "");

    session.keystroke("hidden");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(user_state(&manager, &room_id, &user_id).await.typing, "");

    session.set_muted(false).await.unwrap();
    session.keystroke("back");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(user_state(&manager, &room_id, &user_id).await.typing, "back");
}

#[tokio::test(start_paused = true)]
async fn teardown_aborts_the_pending_debounce() {
    init_logging();
    let (manager, room_id, user_id) = setup().await;
    let mut session = TypingSession::new(manager.clone(), &room_id, &user_id);

    session.keystroke("never sent");
    drop(session);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let user = user_state(&manager, &room_id, &user_id).await;
    assert_eq!(user.typing, "");
}
