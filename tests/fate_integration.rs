//! Transaction store scenarios spanning several managers over one
//! coordination service.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::TEST_TIMEOUT;
use common::open_peer_fate_store;
use common::setup_fate_store;
use common::test_config;
use futures::StreamExt;
use keystone::FateError;
use keystone::OwnerId;
use keystone::TStatus;
use keystone::fate::ReservationTakeoverPolicy;

fn takeover_config() -> keystone::KeystoneConfig {
    let mut config = test_config();
    config.takeover_policy = ReservationTakeoverPolicy::AfterAge {
        threshold_ms: 1,
        clock_skew_allowance_ms: 0,
    };
    config
}

#[tokio::test]
async fn test_transaction_lifecycle() -> Result<()> {
    let (_client, store) = setup_fate_store().await?;
    let manager = OwnerId::new("manager-1:9999")?;

    let id = store.create().await?;
    assert_eq!(store.get_status(id).await?, TStatus::New);
    assert!(store.reserve(id, &manager).await?);

    store.set_payload(id, &manager, b"compact table 4".to_vec()).await?;
    store.set_status(id, &manager, TStatus::Submitted).await?;
    store.set_status(id, &manager, TStatus::InProgress).await?;
    store.set_status(id, &manager, TStatus::Successful).await?;
    assert_eq!(store.get_payload(id).await?, Some(b"compact table 4".to_vec()));

    assert!(store.redact(id).await?);
    assert_eq!(store.get_payload(id).await?, None);
    assert_eq!(store.get_status(id).await?, TStatus::Successful);

    assert!(store.unreserve(id, &manager).await?);
    store.delete(id).await?;
    assert_eq!(store.get_status(id).await?, TStatus::Unknown);
    Ok(())
}

#[tokio::test]
async fn test_racing_reservers_have_one_winner() -> Result<()> {
    let (_client, store) = setup_fate_store().await?;
    let id = store.create().await?;

    let contenders: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move { anyhow::Ok(store.reserve(id, &OwnerId::new(format!("manager-{i}"))?).await?) })
        })
        .collect();

    let mut winners = 0;
    for contender in contenders {
        if contender.await?? {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert!(store.get_reservation(id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_independent_workers_race_for_one_reservation() -> Result<()> {
    let (client, creator) = setup_fate_store().await?;
    let config = test_config();
    let id = creator.create().await?;

    let mut contenders = Vec::new();
    for i in 0..8 {
        let worker = open_peer_fate_store(&client, &config).await?;
        // Every worker has already seen the record as unreserved.
        assert_eq!(worker.get_reservation(id).await?, None);
        contenders.push(tokio::spawn(async move {
            let owner = OwnerId::new(format!("worker-{i}"))?;
            anyhow::Ok((worker.reserve(id, &owner).await?, owner))
        }));
    }

    let mut winners = Vec::new();
    for contender in contenders {
        let (won, owner) = contender.await??;
        if won {
            winners.push(owner);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(creator.get_reservation(id).await?.map(|r| r.owner), winners.pop());
    Ok(())
}

#[tokio::test]
async fn test_second_manager_sees_first_managers_work() -> Result<()> {
    let (client, first) = setup_fate_store().await?;
    let second = open_peer_fate_store(&client, &test_config()).await?;
    let owner_a = OwnerId::new("manager-a")?;
    let owner_b = OwnerId::new("manager-b")?;

    let id = first.create().await?;
    assert!(first.reserve(id, &owner_a).await?);
    assert!(!second.reserve(id, &owner_b).await?);

    let err = second.set_status(id, &owner_b, TStatus::InProgress).await.unwrap_err();
    assert!(matches!(err, FateError::ReservationLost { .. }));

    first.set_status(id, &owner_a, TStatus::InProgress).await?;
    assert_eq!(second.get_status(id).await?, TStatus::InProgress);

    assert!(first.unreserve(id, &owner_a).await?);
    assert!(second.reserve(id, &owner_b).await?);
    second.set_status(id, &owner_b, TStatus::FailedInProgress).await?;
    assert_eq!(first.get_status(id).await?, TStatus::FailedInProgress);
    Ok(())
}

#[tokio::test]
async fn test_reserve_sees_release_by_another_worker() -> Result<()> {
    let (client, first) = setup_fate_store().await?;
    let second = open_peer_fate_store(&client, &test_config()).await?;
    let owner_a = OwnerId::new("manager-a")?;
    let owner_b = OwnerId::new("manager-b")?;

    let id = first.create().await?;
    assert!(first.reserve(id, &owner_a).await?);
    // Released elsewhere; `first` last saw its own reservation.
    assert!(second.unreserve(id, &owner_a).await?);

    assert!(first.reserve(id, &owner_b).await?);
    assert_eq!(second.get_reservation(id).await?.map(|r| r.owner), Some(owner_b));
    Ok(())
}

#[tokio::test]
async fn test_unreserve_sees_reservation_made_elsewhere() -> Result<()> {
    let (client, first) = setup_fate_store().await?;
    let second = open_peer_fate_store(&client, &test_config()).await?;
    let owner = OwnerId::new("manager-a")?;

    let id = first.create().await?;
    assert!(first.reserve(id, &owner).await?);
    assert!(first.unreserve(id, &owner).await?);
    // Re-reserved through another store after a restart; `first` last saw it free.
    assert!(second.reserve(id, &owner).await?);

    assert!(first.unreserve(id, &owner).await?);
    assert_eq!(second.get_reservation(id).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_delete_sees_completion_by_another_worker() -> Result<()> {
    let (client, first) = setup_fate_store().await?;
    let second = open_peer_fate_store(&client, &test_config()).await?;
    let owner = OwnerId::new("manager-b")?;

    let id = first.create().await?;
    assert!(second.reserve(id, &owner).await?);
    second.set_status(id, &owner, TStatus::InProgress).await?;
    second.set_status(id, &owner, TStatus::Successful).await?;

    // `first` last saw the record as NEW.
    first.delete(id).await?;
    assert_eq!(second.get_status(id).await?, TStatus::Unknown);
    Ok(())
}

#[tokio::test]
async fn test_set_status_after_takeover_is_reservation_lost() -> Result<()> {
    let (client, stuck_store) = setup_fate_store().await?;
    let rescuer_store = open_peer_fate_store(&client, &takeover_config()).await?;
    let stuck = OwnerId::new("manager-stuck")?;
    let rescuer = OwnerId::new("manager-rescuer")?;

    let id = stuck_store.create().await?;
    assert!(stuck_store.reserve(id, &stuck).await?);
    stuck_store.set_status(id, &stuck, TStatus::InProgress).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let observed = rescuer_store.get_reservation(id).await?.ok_or_else(|| anyhow::anyhow!("no reservation"))?;
    assert!(rescuer_store.take_over_stale(id, &rescuer, &observed).await?);

    // Rewriting the same status still has to hold the reservation.
    let err = stuck_store.set_status(id, &stuck, TStatus::InProgress).await.unwrap_err();
    assert!(matches!(err, FateError::ReservationLost { .. }));
    Ok(())
}

#[tokio::test]
async fn test_dead_manager_reservations_are_reclaimed() -> Result<()> {
    let (_client, store) = setup_fate_store().await?;
    let dead = OwnerId::new("manager-dead")?;
    let live = OwnerId::new("manager-live")?;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = store.create().await?;
        assert!(store.reserve(id, &dead).await?);
        ids.push(id);
    }
    let cleared = store.delete_dead_reservations(|owner| *owner == live).await?;
    assert_eq!(cleared, 3);
    for id in ids {
        assert!(store.reserve(id, &live).await?);
    }
    Ok(())
}

#[tokio::test]
async fn test_configured_takeover() -> Result<()> {
    let (client, _store) = setup_fate_store().await?;
    let config = takeover_config();
    config.validate()?;
    let store = open_peer_fate_store(&client, &config).await?;
    let stuck = OwnerId::new("manager-stuck")?;
    let rescuer = OwnerId::new("manager-rescuer")?;

    let id = store.create().await?;
    assert!(store.reserve(id, &stuck).await?);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let observed = store.get_reservation(id).await?.ok_or_else(|| anyhow::anyhow!("no reservation"))?;
    assert!(store.take_over_stale(id, &rescuer, &observed).await?);
    // A second attempt against the same snapshot no longer matches.
    assert!(!store.take_over_stale(id, &rescuer, &observed).await?);
    assert_eq!(store.get_reservation(id).await?.map(|r| r.owner), Some(rescuer));
    Ok(())
}

#[tokio::test]
async fn test_independent_rescuers_race_for_takeover() -> Result<()> {
    let (client, stuck_store) = setup_fate_store().await?;
    let stuck = OwnerId::new("manager-stuck")?;
    let id = stuck_store.create().await?;
    assert!(stuck_store.reserve(id, &stuck).await?);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let config = takeover_config();
    let mut rescuers = Vec::new();
    for i in 0..4 {
        let store = open_peer_fate_store(&client, &config).await?;
        let observed = store.get_reservation(id).await?.ok_or_else(|| anyhow::anyhow!("no reservation"))?;
        rescuers.push(tokio::spawn(async move {
            let owner = OwnerId::new(format!("rescuer-{i}"))?;
            anyhow::Ok((store.take_over_stale(id, &owner, &observed).await?, owner))
        }));
    }

    let mut winners = Vec::new();
    for rescuer in rescuers {
        let (won, owner) = rescuer.await??;
        if won {
            winners.push(owner);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(stuck_store.get_reservation(id).await?.map(|r| r.owner), winners.pop());
    Ok(())
}

#[tokio::test]
async fn test_waiter_observes_completion() -> Result<()> {
    let (_client, store) = setup_fate_store().await?;
    let owner = OwnerId::new("manager-1")?;
    let id = store.create().await?;
    assert!(store.reserve(id, &owner).await?);

    let waiter = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store.wait_for_status_change(id, &[TStatus::Successful, TStatus::Failed], TEST_TIMEOUT).await
        })
    };
    store.set_status(id, &owner, TStatus::InProgress).await?;
    store.set_status(id, &owner, TStatus::Successful).await?;
    assert_eq!(waiter.await??, TStatus::Successful);
    Ok(())
}

#[tokio::test]
async fn test_listing_tracks_statuses() -> Result<()> {
    let (_client, store) = setup_fate_store().await?;
    let owner = OwnerId::new("manager-1")?;
    let done = store.create().await?;
    let pending = store.create().await?;
    assert!(store.reserve(done, &owner).await?);
    store.set_status(done, &owner, TStatus::InProgress).await?;
    store.set_status(done, &owner, TStatus::Failed).await?;

    let listed: Vec<_> = store.list().await?.collect().await;
    assert_eq!(listed.len(), 2);

    let finished = store.list_with_status(&[TStatus::Successful, TStatus::Failed]).await?;
    assert_eq!(finished.iter().map(|e| e.fate_id).collect::<Vec<_>>(), vec![done]);
    let fresh = store.list_with_status(&[TStatus::New]).await?;
    assert_eq!(fresh.iter().map(|e| e.fate_id).collect::<Vec<_>>(), vec![pending]);
    Ok(())
}

#[test]
fn test_owner_id_must_fit_record() {
    assert!(OwnerId::new("").is_err());
    assert!(OwnerId::new("x".repeat(70_000)).is_err());
}
