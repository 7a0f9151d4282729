mod common;

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use common::*;
use lease_store::{LeaseStore, ManualClock, MemoryStore};
use session_core::{ReleaseOutcome, SessionError, SessionEvent, identity::Authenticator};

#[tokio::test]
async fn second_device_is_refused_and_rolled_back() {
    let (store, clock) = manual_store();
    let laptop = Device::new(store.clone(), "laptop");
    let phone = Device::new(store.clone(), "phone");

    let session = laptop.manager.sign_in(&login("alice")).await.unwrap();
    assert!(session.is_held());

    clock.set(epoch() + secs(5));
    match phone.manager.sign_in(&login("alice")).await {
        Err(SessionError::AlreadySignedInElsewhere { holder_info }) => {
            assert_eq!(holder_info.as_str(), "laptop")
        }
        other => panic!("expected refusal, got {other:?}"),
    }
    // the refused device is signed out locally
    assert!(phone.auth.identity_changes().borrow().is_none());

    let record = store.get(&"alice".into()).await.unwrap().unwrap().value;
    assert_eq!(&record.session_token, session.token());

    session.sign_out().await.unwrap();
}

#[tokio::test]
async fn sign_out_releases_for_the_next_device() {
    let (store, clock) = manual_store();
    let laptop = Device::new(store.clone(), "laptop");
    let phone = Device::new(store.clone(), "phone");

    let session = laptop.manager.sign_in(&login("alice")).await.unwrap();
    clock.set(epoch() + secs(10));
    assert_eq!(session.sign_out().await.unwrap(), ReleaseOutcome::Released);
    assert!(laptop.auth.identity_changes().borrow().is_none());
    assert!(store.get(&"alice".into()).await.unwrap().is_none());

    clock.set(epoch() + secs(11));
    let session = phone.manager.sign_in(&login("alice")).await.unwrap();
    assert_eq!(session.holder_info().as_str(), "phone");
    session.sign_out().await.unwrap();
}

#[tokio::test]
async fn takeover_evicts_the_old_session_exactly_once() {
    let (store, clock) = manual_store();
    let laptop = Device::new(store.clone(), "laptop");
    let phone = Device::new(store.clone(), "phone");

    let mut old = laptop.manager.sign_in(&login("alice")).await.unwrap();

    // laptop lost its network: no heartbeats, the lease runs out
    clock.set(epoch() + secs(61));
    let new = phone.manager.sign_in(&login("alice")).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), old.next_event())
        .await
        .expect("eviction observed");
    assert_eq!(
        event,
        Some(SessionEvent::Evicted {
            by: "phone".into()
        })
    );
    assert!(!old.is_held());
    assert!(laptop.auth.identity_changes().borrow().is_none());

    // further writes by the new owner produce no more events
    clock.set(epoch() + secs(70));
    phone
        .manager
        .engine()
        .renew(&session_core::LeaseIdentity::new("alice", new.token().clone()))
        .await
        .unwrap();
    assert_eq!(old.next_event().await, None);

    // signing out the evicted session must not touch the new owner's lease
    assert_eq!(old.sign_out().await.unwrap(), ReleaseOutcome::NotHeld);
    let record = store.get(&"alice".into()).await.unwrap().unwrap().value;
    assert_eq!(&record.session_token, new.token());

    new.sign_out().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn eviction_stops_the_old_heartbeat() {
    let clock = ManualClock::new(epoch());
    let store = Arc::new(CountingStore::new(MemoryStore::with_clock(clock.clone())));
    let laptop = Device::with_store(store.clone(), "laptop");
    let phone = Device::with_store(store.clone(), "phone");

    let mut old = laptop.manager.sign_in(&login("alice")).await.unwrap();
    clock.set(epoch() + secs(61));
    let new = phone.manager.sign_in(&login("alice")).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), old.next_event())
        .await
        .expect("eviction observed");
    assert!(matches!(event, Some(SessionEvent::Evicted { .. })));

    // both heartbeats would beat at 20s and 40s; only the new owner's runs
    store.gets.store(0, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(store.gets.load(Ordering::SeqCst), 2);
    let merged = store.merged_tokens();
    assert_eq!(merged.len(), 2);
    assert!(merged.iter().all(|token| token == new.token()));
    assert!(!merged.contains(old.token()));

    old.sign_out().await.unwrap();
    new.sign_out().await.unwrap();
}

#[tokio::test]
async fn re_sign_in_on_the_same_device_evicts_nothing() {
    let (store, _clock) = manual_store();
    let laptop = Device::new(store.clone(), "laptop");

    let session = laptop.manager.sign_in(&login("alice")).await.unwrap();
    session.sign_out().await.unwrap();
    let mut again = laptop.manager.sign_in(&login("alice")).await.unwrap();

    assert!(
        tokio::time::timeout(Duration::from_millis(200), again.next_event())
            .await
            .is_err()
    );
    again.sign_out().await.unwrap();
}

#[tokio::test]
async fn external_sign_out_releases_the_lease() {
    let (store, _clock) = manual_store();
    let laptop = Device::new(store.clone(), "laptop");

    let mut session = laptop.manager.sign_in(&login("alice")).await.unwrap();
    laptop.auth.sign_out().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), session.next_event())
        .await
        .expect("sign-out observed");
    assert_eq!(event, Some(SessionEvent::SignedOut));
    assert!(!session.is_held());
    assert!(store.get(&"alice".into()).await.unwrap().is_none());
}

#[tokio::test]
async fn dropped_session_releases_in_background() {
    let (store, _clock) = manual_store();
    let laptop = Device::new(store.clone(), "laptop");

    let session = laptop.manager.sign_in(&login("alice")).await.unwrap();
    drop(session);

    let mut released = false;
    for _ in 0..50 {
        if store.get(&"alice".into()).await.unwrap().is_none() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released);
}
