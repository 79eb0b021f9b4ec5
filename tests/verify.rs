//! Independent verification of published round values

mod common;

use certdraw::{engine::DrawEngine, rng::commit_hash};
use common::{expected_order, grid_config, seed, Harness};

#[tokio::test]
async fn test_finished_round_is_certified() {
    let h = Harness::new(grid_config(9, 3));
    let rounds = h.engine.rounds();
    rounds.ensure_current_round().await.unwrap();
    rounds.start_round().await.unwrap();
    h.pass_reveal_delay();
    while !rounds.call_next().await.unwrap().ended() {}

    let report = h.engine.verify_round(1).await.unwrap();
    assert!(report.commitment_valid);
    assert_eq!(report.draw_order_matches, Some(true));
    assert_eq!(report.calls_follow_order, Some(true));
    assert!(report.audit_integrity.valid);
    assert!(report.certified);

    let commitment = report.commitment.unwrap();
    assert_eq!(commitment.commit_hash, commit_hash(&seed(), 1));
    let reveal = h.engine.protocol().reveal_for(1).await.unwrap().unwrap();
    assert!(reveal.verified);

    let round = h.engine.round(1).await.unwrap();
    assert_eq!(round.called_symbols, expected_order(1, 9));
}

#[tokio::test]
async fn test_partial_round_still_follows_order() {
    let h = Harness::new(grid_config(9, 3));
    let rounds = h.engine.rounds();
    rounds.ensure_current_round().await.unwrap();
    rounds.start_round().await.unwrap();
    h.pass_reveal_delay();
    for _ in 0..3 {
        rounds.call_next().await.unwrap();
    }
    rounds.end_round().await.unwrap();

    let report = h.engine.verify_round(1).await.unwrap();
    assert_eq!(report.calls_follow_order, Some(true));
    assert!(report.certified);
}

#[tokio::test]
async fn test_unrevealed_round_is_not_certified() {
    let h = Harness::new(grid_config(9, 3));
    let rounds = h.engine.rounds();
    rounds.ensure_current_round().await.unwrap();
    rounds.start_round().await.unwrap();

    let report = h.engine.verify_round(1).await.unwrap();
    assert!(report.commitment.is_some());
    assert!(report.reveal.is_none());
    assert!(!report.commitment_valid);
    assert_eq!(report.draw_order_matches, None);
    assert!(!report.certified);
}

#[tokio::test]
async fn test_auditor_commitment_check() {
    let h = Harness::new(grid_config(9, 3));
    let rounds = h.engine.rounds();
    rounds.ensure_current_round().await.unwrap();
    rounds.start_round().await.unwrap();
    h.pass_reveal_delay();
    rounds.call_next().await.unwrap();

    let seed_hex = hex::encode(seed());
    let hash = h.engine.protocol().commitment(1).await.unwrap().unwrap().commit_hash;

    assert!(DrawEngine::check_commitment(&seed_hex, 1, &hash));
    assert!(DrawEngine::check_commitment(&seed_hex, 1, &hash.to_uppercase()));
    assert!(!DrawEngine::check_commitment(&seed_hex, 2, &hash));
    assert!(!DrawEngine::check_commitment(&hex::encode([0u8; 32]), 1, &hash));

    let protocol = h.engine.protocol();
    assert!(!protocol.verify(1, &hex::encode([1u8; 32]), &hash).await.unwrap());
    assert!(!protocol.reveal_for(1).await.unwrap().unwrap().verified);
    assert!(protocol.verify(1, &seed_hex, &hash).await.unwrap());
    assert!(protocol.reveal_for(1).await.unwrap().unwrap().verified);
}
