//! Scoped-access broker integration tests.
//!
//! Tests run against real directories in a temp root and a scope provider that counts
//! every grant and release.

mod common;

use common::{ScriptedPicker, TestBridge};
use drivesync_bridge::{AccessMode, Bookmark, BrokerError, PickOutcome, TokenState};
use proptest::prelude::*;
use std::sync::atomic::Ordering;

fn mint(tb: &TestBridge, rel: &str, mode: AccessMode) -> Bookmark {
    let path = tb.mkdir(rel);
    tb.bridge
        .broker()
        .mint(path.to_str().unwrap(), mode)
        .expect("Failed to mint bookmark")
}

// ============================================================================
// Minting and resolution
// ============================================================================

#[test]
fn token_resolves_to_its_folder() {
    let tb = TestBridge::new();
    let path = tb.mkdir("docs");
    let token = mint(&tb, "docs", AccessMode::ReadWrite);

    let resolved = tb.bridge.broker().resolve(&token).unwrap();
    assert_eq!(resolved.path, path);
    assert!(!resolved.stale);
    assert_eq!(resolved.mode, AccessMode::ReadWrite);
}

#[test]
fn token_survives_transport_encoding() {
    let tb = TestBridge::new();
    let token = mint(&tb, "docs", AccessMode::ReadOnly);
    let decoded = Bookmark::from_base64(&token.to_base64()).unwrap();
    assert_eq!(decoded, token);
    assert_eq!(decoded.digest(), token.digest());
}

#[test]
fn missing_location_cannot_be_minted() {
    let tb = TestBridge::new();
    let missing = tb.temp.path().join("nope");
    assert!(matches!(
        tb.bridge
            .broker()
            .mint(missing.to_str().unwrap(), AccessMode::ReadOnly),
        Err(BrokerError::BookmarkFailed { .. })
    ));
    assert!(matches!(
        tb.bridge.broker().mint("relative", AccessMode::ReadOnly),
        Err(BrokerError::InvalidPath(_))
    ));
}

#[test]
fn garbage_bytes_are_unreadable() {
    let tb = TestBridge::new();
    let garbage = Bookmark::from_bytes(b"not a bookmark at all".to_vec());
    assert!(matches!(
        tb.bridge.broker().resolve(&garbage),
        Err(BrokerError::Unreadable(_))
    ));

    let token = mint(&tb, "docs", AccessMode::ReadOnly);
    let mut bytes = token.into_bytes();
    let last = bytes.len() - 2;
    bytes[last] ^= 0x20;
    assert!(matches!(
        tb.bridge.broker().resolve(&Bookmark::from_bytes(bytes)),
        Err(BrokerError::Unreadable(_))
    ));
}

#[cfg(unix)]
#[test]
fn renamed_folder_resolves_stale() {
    let tb = TestBridge::new();
    tb.mkdir("parent/old");
    let token = mint(&tb, "parent/old", AccessMode::ReadOnly);

    let new_path = tb.temp.path().join("parent/new");
    std::fs::rename(tb.temp.path().join("parent/old"), &new_path).unwrap();

    let resolved = tb.bridge.broker().resolve(&token).unwrap();
    assert!(resolved.stale);
    assert_eq!(resolved.path, new_path.canonicalize().unwrap());

    // Activation follows the referent to its new home.
    let (session, _) = tb.bridge.broker().activate(&token).unwrap();
    assert_eq!(session.path(), resolved.path.as_path());
}

#[test]
fn deleted_folder_is_unreadable() {
    let tb = TestBridge::new();
    let path = tb.mkdir("gone");
    let token = mint(&tb, "gone", AccessMode::ReadOnly);
    std::fs::remove_dir(&path).unwrap();

    assert!(matches!(
        tb.bridge.broker().resolve(&token),
        Err(BrokerError::Unreadable(_))
    ));
    assert!(matches!(
        tb.bridge.broker().activate(&token),
        Err(BrokerError::Unreadable(_))
    ));
    assert_eq!(tb.scopes.acquired(), 0);
}

// ============================================================================
// Sessions
// ============================================================================

#[test]
fn activate_twice_deactivate_once_keeps_access() {
    let tb = TestBridge::new();
    let broker = tb.bridge.broker();
    let token = mint(&tb, "docs", AccessMode::ReadWrite);

    let (first, resolved) = broker.activate(&token).unwrap();
    let (second, _) = broker.activate(&token).unwrap();
    assert_eq!(broker.active_count(&resolved), 2);
    assert_eq!(tb.scopes.acquired(), 1);

    broker.deactivate(first);
    assert_eq!(broker.active_count(&resolved), 1);
    assert_eq!(tb.scopes.outstanding(), 1);
    assert!(second.is_active());

    broker.deactivate(second);
    assert_eq!(broker.active_count(&resolved), 0);
    assert_eq!(tb.scopes.outstanding(), 0);
    assert_eq!(tb.scopes.released(), 1);
}

#[test]
fn dropping_a_session_releases_it() {
    let tb = TestBridge::new();
    let token = mint(&tb, "docs", AccessMode::ReadOnly);
    {
        let _session = tb.bridge.broker().activate(&token).unwrap();
        assert_eq!(tb.scopes.outstanding(), 1);
    }
    assert_eq!(tb.scopes.outstanding(), 0);
}

#[test]
fn modes_are_counted_separately() {
    let tb = TestBridge::new();
    let ro = mint(&tb, "docs", AccessMode::ReadOnly);
    let rw = mint(&tb, "docs", AccessMode::ReadWrite);

    let (a, _) = tb.bridge.broker().activate(&ro).unwrap();
    let (b, _) = tb.bridge.broker().activate(&rw).unwrap();
    assert_eq!(tb.scopes.acquired(), 2);
    drop(a);
    assert_eq!(tb.scopes.outstanding(), 1);
    drop(b);
    assert_eq!(tb.scopes.outstanding(), 0);
}

#[test]
fn refused_grant_is_access_denied_without_leaking_count() {
    let tb = TestBridge::new();
    let path = tb.mkdir("locked");
    let token = mint(&tb, "locked", AccessMode::ReadWrite);
    tb.scopes.deny(&path);

    let err = tb.bridge.broker().activate(&token).unwrap_err();
    assert!(matches!(err, BrokerError::AccessDenied { .. }));
    let resolved = tb.bridge.broker().resolve(&token).unwrap();
    assert_eq!(tb.bridge.broker().active_count(&resolved), 0);
    assert_eq!(tb.bridge.broker().state(&token), TokenState::Resolved);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn balanced_activations_release_exactly_once(
        n in 1usize..12,
        order in prop::collection::vec(any::<prop::sample::Index>(), 12),
    ) {
        let tb = TestBridge::new();
        let broker = tb.bridge.broker();
        let token = mint(&tb, "docs", AccessMode::ReadOnly);

        let mut sessions: Vec<_> = (0..n).map(|_| broker.activate(&token).unwrap().0).collect();
        prop_assert_eq!(tb.scopes.acquired(), 1);

        let mut i = 0;
        while !sessions.is_empty() {
            prop_assert_eq!(tb.scopes.outstanding(), 1);
            let idx = order[i % order.len()].index(sessions.len());
            broker.deactivate(sessions.swap_remove(idx));
            i += 1;
        }
        prop_assert_eq!(tb.scopes.outstanding(), 0);
        prop_assert_eq!(tb.scopes.released(), 1);
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn token_state_follows_lifecycle() {
    let tb = TestBridge::new();
    let broker = tb.bridge.broker();
    let token = mint(&tb, "docs", AccessMode::ReadOnly);

    assert_eq!(broker.state(&token), TokenState::Unresolved);
    broker.resolve(&token).unwrap();
    assert_eq!(broker.state(&token), TokenState::Resolved);

    let (session, _) = broker.activate(&token).unwrap();
    assert_eq!(broker.state(&token), TokenState::Active);
    broker.deactivate(session);
    assert_eq!(broker.state(&token), TokenState::Resolved);

    broker.revoke(&token);
    assert_eq!(broker.state(&token), TokenState::Revoked);
}

#[test]
fn revoke_cuts_live_sessions() {
    let tb = TestBridge::new();
    let broker = tb.bridge.broker();
    let token = mint(&tb, "docs", AccessMode::ReadOnly);

    let (a, _) = broker.activate(&token).unwrap();
    let (b, _) = broker.activate(&token).unwrap();
    broker.revoke(&token);

    assert!(!a.is_active());
    assert!(!b.is_active());
    assert_eq!(tb.scopes.outstanding(), 0);

    // Ending a cut session does not release twice.
    broker.deactivate(a);
    drop(b);
    assert_eq!(tb.scopes.released(), 1);

    assert!(matches!(
        broker.activate(&token),
        Err(BrokerError::AccessDenied { .. })
    ));
    assert_eq!(tb.scopes.acquired(), 1);
}

#[test]
fn revoke_during_activations_leaves_no_live_grant() {
    let tb = TestBridge::new();
    let broker = tb.bridge.broker();
    let token = mint(&tb, "docs", AccessMode::ReadOnly);
    broker.resolve(&token).unwrap();

    let survivors = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    (0..100)
                        .filter_map(|_| broker.activate(&token).ok().map(|(session, _)| session))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        broker.revoke(&token);
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert!(survivors.iter().all(|session| !session.is_active()));
    assert_eq!(tb.scopes.outstanding(), 0);
    assert_eq!(broker.state(&token), TokenState::Revoked);
    assert!(broker.activate(&token).is_err());
}

// ============================================================================
// Folder picker
// ============================================================================

#[tokio::test]
async fn picked_folder_comes_back_with_token() {
    let tb = TestBridge::new();
    let path = tb.mkdir("chosen");
    let picker = ScriptedPicker::new();
    picker.queue(PickOutcome::Selected(path.clone()));

    let picked = tb
        .bridge
        .broker()
        .pick_directory(&*picker, AccessMode::ReadWrite)
        .await
        .unwrap();
    assert_eq!(picked.path, path);
    let resolved = tb.bridge.broker().resolve(&picked.bookmark).unwrap();
    assert_eq!(resolved.path, path);
    assert_eq!(resolved.mode, AccessMode::ReadWrite);
    assert!(!tb.bridge.broker().picker_pending());
}

#[tokio::test]
async fn empty_and_cancelled_prompts_are_distinct() {
    let tb = TestBridge::new();
    let picker = ScriptedPicker::new();
    picker.queue(PickOutcome::NoSelection);
    picker.queue(PickOutcome::Cancelled);

    let broker = tb.bridge.broker();
    assert!(matches!(
        broker.pick_directory(&*picker, AccessMode::ReadOnly).await,
        Err(BrokerError::NoSelection)
    ));
    assert!(matches!(
        broker.pick_directory(&*picker, AccessMode::ReadOnly).await,
        Err(BrokerError::Cancelled)
    ));
}

#[tokio::test]
async fn second_prompt_while_pending_is_busy() {
    let tb = TestBridge::new();
    let picker = ScriptedPicker::new();
    let broker = tb.bridge.broker();

    let waiting = picker.waiting.notified();
    let first = broker.pick_directory(&*picker, AccessMode::ReadOnly);
    let second = async {
        waiting.await;
        assert!(broker.picker_pending());
        let busy = broker.pick_directory(&*picker, AccessMode::ReadOnly).await;
        assert!(broker.dismiss_picker());
        busy
    };
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(second, Err(BrokerError::Busy)));
    assert!(matches!(first, Err(BrokerError::Cancelled)));
    // The busy call never reached the picker.
    assert_eq!(picker.prompts.load(Ordering::SeqCst), 1);

    // The slot is free again.
    assert!(!broker.picker_pending());
    assert!(!broker.dismiss_picker());
    let path = tb.mkdir("later");
    picker.queue(PickOutcome::Selected(path));
    assert!(broker.pick_directory(&*picker, AccessMode::ReadOnly).await.is_ok());
}
