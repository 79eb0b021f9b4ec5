//! End-to-end round scenarios with a known draw order

mod common;

use certdraw::{
    errors::{EngineError, ProtocolError, RoundError},
    game::{EndReason, Phase, ShieldState, Winner},
};
use common::{expected_order, grid_config, layout_with_trap, letter_config, Harness};

#[tokio::test]
async fn test_trap_explosion_excludes_card_from_winners() {
    let h = Harness::new(grid_config(9, 4));
    let order = expected_order(1, 9);

    let trapped = h.buy("ana", &layout_with_trap(&order[0..4], order[3])).await;
    // Never reached: only the first four symbols are called.
    let clean = h.buy("bo", &order[4..8]).await;

    let rounds = h.engine.rounds();
    rounds.start_round().await.unwrap();
    h.pass_reveal_delay();

    for expected in &order[0..3] {
        let outcome = rounds.call_next().await.unwrap();
        assert_eq!(outcome.symbol, *expected);
        assert_eq!(outcome.matched_cards, vec![trapped.id.clone()]);
    }
    let fourth = rounds.call_next().await.unwrap();
    assert_eq!(fourth.exploded_cards, vec![trapped.id.clone()]);
    assert!(!fourth.ended(), "one card is still in play");

    let card = rounds.card(&trapped.id).await.unwrap();
    assert!(card.exploded);
    assert_eq!(card.match_count(), 3);

    let ended = rounds.end_round().await.unwrap();
    assert_eq!(ended.end_reason, Some(EndReason::Forced));
    let winner = ended.winner.unwrap();
    assert_eq!(winner.winner, Winner::Single("bo".to_string()));
    assert_eq!(winner.match_count, 0);
    assert_eq!(rounds.card(&clean.id).await.unwrap().match_count(), 0);
}

#[tokio::test]
async fn test_armed_shield_absorbs_trap() {
    let h = Harness::new(grid_config(9, 4));
    let order = expected_order(1, 9);

    let card = h.buy("ana", &layout_with_trap(&order[0..4], order[3])).await;
    h.engine.purchase_shield(&card.id).await.unwrap();

    let rounds = h.engine.rounds();
    rounds.start_round().await.unwrap();
    h.pass_reveal_delay();
    for _ in 0..3 {
        rounds.call_next().await.unwrap();
    }
    let fourth = rounds.call_next().await.unwrap();
    assert_eq!(fourth.shields_consumed, vec![card.id.clone()]);
    assert!(fourth.exploded_cards.is_empty());

    let after = rounds.card(&card.id).await.unwrap();
    assert_eq!(after.shield, ShieldState::Consumed);
    assert!(!after.exploded);

    let ended = rounds.end_round().await.unwrap();
    let winner = ended.winner.unwrap();
    assert_eq!(winner.winner, Winner::Single("ana".to_string()));
    assert_eq!(winner.match_count, 3);
    assert_eq!(ended.total_collected, 150);
    assert_eq!(ended.prize_pool, 120);
}

#[tokio::test]
async fn test_round_ends_when_every_card_explodes() {
    let h = Harness::new(grid_config(9, 3));
    let order = expected_order(1, 9);
    h.buy("ana", &layout_with_trap(&order[0..3], order[0])).await;

    let rounds = h.engine.rounds();
    rounds.start_round().await.unwrap();
    h.pass_reveal_delay();

    let outcome = rounds.call_next().await.unwrap();
    assert!(outcome.ended());
    assert_eq!(outcome.round.end_reason, Some(EndReason::AllCardsExploded));
    assert_eq!(outcome.round.winner, None);
    assert_eq!(outcome.round.called_symbols.len(), 1);
}

#[tokio::test]
async fn test_letter_cards_completing_together_share_the_win() {
    let h = Harness::new(letter_config());
    let order = expected_order(1, 26);

    h.buy("zed", &order[0..5]).await;
    h.buy("amy", &order[0..5]).await;
    h.buy("kim", &order[5..10]).await;

    let rounds = h.engine.rounds();
    rounds.start_round().await.unwrap();
    h.pass_reveal_delay();

    for _ in 0..4 {
        let outcome = rounds.call_next().await.unwrap();
        assert!(!outcome.ended());
        assert!(outcome.completed_cards.is_empty());
    }
    let fifth = rounds.call_next().await.unwrap();
    assert!(fifth.ended());
    assert_eq!(fifth.completed_cards.len(), 2);
    assert_eq!(fifth.round.end_reason, Some(EndReason::CardCompleted));

    let winner = fifth.round.winner.unwrap();
    assert_eq!(winner.winner, Winner::Draw(vec!["amy".to_string(), "zed".to_string()]));
    assert_eq!(winner.match_count, 5);
    assert_eq!(fifth.round.variant.label(fifth.symbol), fifth.label);
}

#[tokio::test]
async fn test_domain_exhaustion_ends_round_and_further_calls_fail() {
    let h = Harness::new(grid_config(9, 3));
    let order = expected_order(1, 9);

    let rounds = h.engine.rounds();
    rounds.ensure_current_round().await.unwrap();
    rounds.start_round().await.unwrap();
    h.pass_reveal_delay();

    let mut last = None;
    for (i, expected) in order.iter().enumerate() {
        let outcome = rounds.call_next().await.unwrap();
        assert_eq!(outcome.symbol, *expected);
        assert_eq!(outcome.position, i + 1);
        assert_eq!(outcome.ended(), i == 8, "no cards, so only exhaustion ends it");
        last = Some(outcome);
    }

    let round = last.unwrap().round;
    assert_eq!(round.phase, Phase::Ended);
    assert_eq!(round.end_reason, Some(EndReason::DomainExhausted));
    assert_eq!(round.called_symbols, order);
    assert_eq!(round.winner, None);

    let err = rounds.call_next().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Round(RoundError::InvalidPhaseTransition { phase: Phase::Ended, .. })
    ));

    let again = rounds.end_round().await.unwrap();
    assert_eq!(again, round);
}

#[tokio::test]
async fn test_reveal_waits_for_minimum_delay() {
    let h = Harness::new(grid_config(9, 3));
    let rounds = h.engine.rounds();
    rounds.ensure_current_round().await.unwrap();
    rounds.start_round().await.unwrap();

    match rounds.call_next().await.unwrap_err() {
        EngineError::Protocol(ProtocolError::RevealTooEarly { remaining_ms, .. }) => assert_eq!(remaining_ms, 1_000),
        other => panic!("unexpected error: {other}"),
    }

    h.clock.advance(999);
    match rounds.call_next().await.unwrap_err() {
        EngineError::Protocol(ProtocolError::RevealTooEarly { remaining_ms, .. }) => assert_eq!(remaining_ms, 1),
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.engine.protocol().reveal_for(1).await.unwrap().is_none());

    h.clock.advance(1);
    let outcome = rounds.call_next().await.unwrap();
    assert_eq!(outcome.position, 1);
    let reveal = h.engine.protocol().reveal_for(1).await.unwrap().unwrap();
    assert!(reveal.consumed);
    assert_eq!(reveal.operator_seed, hex::encode(common::seed()));
}

#[tokio::test]
async fn test_card_purchase_validation() {
    let h = Harness::new(grid_config(9, 3));
    let rounds = h.engine.rounds();
    rounds.ensure_current_round().await.unwrap();

    let err = h
        .engine
        .purchase_card(
            "ana",
            certdraw::game::CardLayout {
                symbols: vec![1, 2, 12],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Round(RoundError::InvalidCard(_))));

    let err = h
        .engine
        .purchase_card(
            "  ",
            certdraw::game::CardLayout {
                symbols: vec![1, 2, 3],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Round(RoundError::InvalidCard(_))));
    assert!(rounds.cards(1).await.unwrap().is_empty());
}
