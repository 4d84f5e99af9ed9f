// Grid session lifecycle tests against the paper exchange

mod common;

use std::time::Duration;

use common::*;
use grid_trading_engine::core::gateway::GatewayError;
use grid_trading_engine::core::session::OrderStatus;
use grid_trading_engine::core::types::Side;
use grid_trading_engine::config::SessionConfig;
use grid_trading_engine::{ExitReason, SessionState, TradingError};

fn states(session: &grid_trading_engine::GridSession) -> Vec<SessionState> {
    let mut path = vec![SessionState::Armed];
    path.extend(session.history.iter().map(|t| t.to));
    path
}

#[tokio::test]
async fn test_full_cycle_without_refill_closes_with_spread_profit() {
    let (harness, mut events) = Harness::new(no_refill());
    let ctx = harness.ctx();
    let plan = plan_with_levels(8, 10.0);
    let mut session = harness.arm(plan.clone());

    session.deploy(&ctx, t0()).await.unwrap();
    assert_eq!(session.state, SessionState::Deployed);
    assert_eq!(harness.exchange.resting_orders(SYMBOL).len(), 4);

    // Buys fill one at a time, highest first
    let mut buys = open_orders(&session, Side::Buy);
    buys.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap());
    for (i, buy) in buys.iter().enumerate() {
        assert!(harness.exchange.fill_order(&exchange_id(buy)));
        pump(&mut events, &mut session, &ctx, t0() + minutes(i as i64 + 1)).await;
    }
    assert_eq!(session.state, SessionState::Active);
    let sells = open_orders(&session, Side::Sell);
    assert_eq!(sells.len(), 4);
    assert!(open_orders(&session, Side::Buy).is_empty());

    for (i, sell) in sells.iter().enumerate() {
        assert!(harness.exchange.fill_order(&exchange_id(sell)));
        pump(&mut events, &mut session, &ctx, t0() + minutes(10 + i as i64)).await;
    }

    assert_eq!(session.state, SessionState::Closed);
    assert_eq!(session.exit_reason, Some(ExitReason::GridCompleted));
    assert_eq!(
        states(&session),
        vec![
            SessionState::Armed,
            SessionState::Deployed,
            SessionState::Active,
            SessionState::Closing,
            SessionState::Closed,
        ]
    );

    let fee = harness.session_config.fee_rate;
    let expected: f64 = (0..4)
        .map(|level| {
            let buy = plan.buy_levels()[level];
            let sell = plan.take_profit_price(level).unwrap();
            let size = plan.quantity_at(level);
            size * (sell - buy) - fee * size * (buy + sell)
        })
        .sum();
    assert!((session.realized_pnl - expected).abs() < 1e-9);
    assert!(session.realized_pnl > 0.0);

    let risk = harness.risk.snapshot();
    assert!((risk.current_balance - (1000.0 + expected)).abs() < 1e-9);
    assert_eq!(risk.active_sessions, 0);
    assert_eq!(harness.exchange.closed_volume(SYMBOL), 0.0);
    assert_eq!(session.summary().round_trips, 4);
}

#[tokio::test]
async fn test_every_buy_fill_places_exactly_one_sell_one_level_up() {
    let (harness, mut events) = Harness::new(SessionConfig::default());
    let ctx = harness.ctx();
    let plan = plan_with_levels(8, 10.0);
    let mut session = harness.arm(plan.clone());
    session.deploy(&ctx, t0()).await.unwrap();

    // A sweep to 98.9 crosses the two highest buys
    assert_eq!(harness.exchange.on_price(SYMBOL, 98.9), 2);
    pump(&mut events, &mut session, &ctx, t0() + minutes(1)).await;

    let sells = open_orders(&session, Side::Sell);
    assert_eq!(sells.len(), 2);
    for sell in &sells {
        assert_eq!(sell.price, plan.take_profit_price(sell.level).unwrap());
        assert_eq!(sell.size, plan.quantity_at(sell.level));
    }
    assert_eq!(harness.exchange.submitted_count(), 6);
}

#[tokio::test]
async fn test_duplicate_fill_events_are_applied_once() {
    let (harness, mut events) = Harness::new(SessionConfig::default());
    let ctx = harness.ctx();
    let mut session = harness.arm(plan_with_levels(8, 10.0));
    session.deploy(&ctx, t0()).await.unwrap();

    let buy = open_orders(&session, Side::Buy).remove(0);
    harness.exchange.fill_order(&exchange_id(&buy));
    let event = events.recv().await.unwrap();

    session.handle_event(&event, &ctx, t0()).await.unwrap();
    session.handle_event(&event, &ctx, t0()).await.unwrap();

    // Replayed with a fresh sequence number, still the same fill
    let mut replay = event.clone();
    replay.seq += 100;
    session.handle_event(&replay, &ctx, t0()).await.unwrap();

    assert_eq!(open_orders(&session, Side::Sell).len(), 1);
    assert_eq!(harness.exchange.submitted_count(), 5);
}

#[tokio::test]
async fn test_sell_fill_refills_its_level() {
    let (harness, mut events) = Harness::new(SessionConfig::default());
    let ctx = harness.ctx();
    let mut session = harness.arm(plan_with_levels(8, 10.0));
    session.deploy(&ctx, t0()).await.unwrap();

    let buy = open_orders(&session, Side::Buy)
        .into_iter()
        .find(|o| o.level == 3)
        .unwrap();
    harness.exchange.fill_order(&exchange_id(&buy));
    pump(&mut events, &mut session, &ctx, t0()).await;

    let sell = open_orders(&session, Side::Sell).remove(0);
    harness.exchange.fill_order(&exchange_id(&sell));
    pump(&mut events, &mut session, &ctx, t0()).await;

    let level_buys: Vec<_> = session
        .orders
        .iter()
        .filter(|o| o.side == Side::Buy && o.level == 3)
        .collect();
    assert_eq!(level_buys.len(), 2);
    assert_eq!(level_buys[1].status, OrderStatus::Open);
    assert_eq!(level_buys[1].price, buy.price);
    assert_eq!(session.state, SessionState::Active);
}

#[tokio::test]
async fn test_closed_regime_gate_skips_refill() {
    let config = SessionConfig {
        regime_gate_refills: true,
        ..SessionConfig::default()
    };
    let (harness, mut events) = Harness::new(config);
    let ctx = harness.ctx();
    let mut session = harness.arm(plan_with_levels(8, 10.0));
    session.deploy(&ctx, t0()).await.unwrap();
    session.regime_ok = false;

    let buy = open_orders(&session, Side::Buy).remove(3);
    harness.exchange.fill_order(&exchange_id(&buy));
    pump(&mut events, &mut session, &ctx, t0()).await;
    let sell = open_orders(&session, Side::Sell).remove(0);
    harness.exchange.fill_order(&exchange_id(&sell));
    pump(&mut events, &mut session, &ctx, t0()).await;

    assert_eq!(open_orders(&session, Side::Buy).len(), 3);
    assert_eq!(harness.exchange.submitted_count(), 5);
}

#[tokio::test]
async fn test_take_profit_closes_after_target_is_exceeded() {
    let config = SessionConfig {
        take_profit_fraction: 0.0001,
        ..SessionConfig::default()
    };
    let (harness, mut events) = Harness::new(config);
    let ctx = harness.ctx();
    let mut session = harness.arm(plan_with_levels(8, 10.0));
    session.deploy(&ctx, t0()).await.unwrap();
    harness.exchange.on_price(SYMBOL, 100.0);

    let buy = open_orders(&session, Side::Buy).remove(3);
    harness.exchange.fill_order(&exchange_id(&buy));
    pump(&mut events, &mut session, &ctx, t0()).await;
    let sell = open_orders(&session, Side::Sell).remove(0);
    harness.exchange.fill_order(&exchange_id(&sell));
    pump(&mut events, &mut session, &ctx, t0()).await;

    assert_eq!(session.state, SessionState::Closed);
    assert_eq!(session.exit_reason, Some(ExitReason::TakeProfit));
    assert!(harness.exchange.resting_orders(SYMBOL).is_empty());
    assert!(session.working_orders().next().is_none());
}

#[tokio::test]
async fn test_stop_loss_unwinds_including_fills_that_beat_the_cancel() {
    let (harness, mut events) = Harness::new(SessionConfig::default());
    let ctx = harness.ctx();
    let plan = plan_with_levels(8, 10.0);
    let mut session = harness.arm(plan.clone());
    session.deploy(&ctx, t0()).await.unwrap();

    let mut buys = open_orders(&session, Side::Buy);
    buys.sort_by_key(|o| std::cmp::Reverse(o.level));
    for buy in &buys[..2] {
        harness.exchange.fill_order(&exchange_id(buy));
    }
    pump(&mut events, &mut session, &ctx, t0() + minutes(1)).await;
    assert_eq!(open_orders(&session, Side::Sell).len(), 2);

    // The crash fills the remaining buys before the session hears about it
    harness.exchange.on_price(SYMBOL, 95.0);
    session.on_price(95.0, &ctx, t0() + minutes(2)).await.unwrap();

    assert_eq!(session.state, SessionState::Closed);
    assert_eq!(session.exit_reason, Some(ExitReason::StopLoss));
    assert!(harness.exchange.resting_orders(SYMBOL).is_empty());

    let total: f64 = plan.quantities.iter().sum();
    assert!((harness.exchange.closed_volume(SYMBOL) - total).abs() < 1e-12);
    assert_eq!(session.held_quantity(), 0.0);
    assert!(session.realized_pnl < 0.0);
    assert!(harness.risk.snapshot().current_balance < 1000.0);

    // Stale notifications for the crash are ignored once closed
    pump(&mut events, &mut session, &ctx, t0() + minutes(3)).await;
    assert_eq!(session.state, SessionState::Closed);
}

#[tokio::test]
async fn test_price_at_stop_level_does_not_trigger() {
    let (harness, _events) = Harness::new(SessionConfig::default());
    let ctx = harness.ctx();
    let plan = plan_with_levels(8, 10.0);
    let mut session = harness.arm(plan.clone());
    session.deploy(&ctx, t0()).await.unwrap();

    let stop = plan.lower_bound * (1.0 - harness.session_config.stop_margin);
    session.on_price(stop, &ctx, t0()).await.unwrap();
    assert_eq!(session.state, SessionState::Deployed);
}

#[tokio::test]
async fn test_max_duration_closes_session() {
    let (harness, _events) = Harness::new(SessionConfig::default());
    let ctx = harness.ctx();
    let mut session = harness.arm(plan_with_levels(8, 10.0));
    session.deploy(&ctx, t0()).await.unwrap();
    harness.exchange.on_price(SYMBOL, 100.0);

    session.on_price(100.0, &ctx, t0() + minutes(60 * 24 - 1)).await.unwrap();
    assert_eq!(session.state, SessionState::Deployed);

    session.on_price(100.0, &ctx, t0() + minutes(60 * 24)).await.unwrap();
    assert_eq!(session.state, SessionState::Closed);
    assert_eq!(session.exit_reason, Some(ExitReason::MaxDuration));
    assert!(harness.exchange.resting_orders(SYMBOL).is_empty());
}

#[tokio::test]
async fn test_global_halt_aborts_and_flattens() {
    let (harness, mut events) = Harness::new(SessionConfig::default());
    let ctx = harness.ctx();
    let plan = plan_with_levels(8, 10.0);
    let mut session = harness.arm(plan.clone());
    session.deploy(&ctx, t0()).await.unwrap();
    harness.exchange.on_price(SYMBOL, 100.0);

    let buy = open_orders(&session, Side::Buy)
        .into_iter()
        .find(|o| o.level == 3)
        .unwrap();
    harness.exchange.fill_order(&exchange_id(&buy));
    pump(&mut events, &mut session, &ctx, t0()).await;

    harness.risk.halt("drawdown limit breached elsewhere");
    session.on_price(99.8, &ctx, t0() + minutes(1)).await.unwrap();

    assert_eq!(session.state, SessionState::Aborted);
    assert_eq!(session.exit_reason, Some(ExitReason::Halted));
    assert_eq!(
        states(&session),
        vec![
            SessionState::Armed,
            SessionState::Deployed,
            SessionState::Active,
            SessionState::Closing,
            SessionState::Aborted,
        ]
    );
    assert!(harness.exchange.resting_orders(SYMBOL).is_empty());
    assert_eq!(harness.exchange.closed_volume(SYMBOL), plan.quantity_at(3));
    assert_eq!(harness.risk.snapshot().active_sessions, 0);
}

#[tokio::test]
async fn test_halted_controller_refuses_to_arm() {
    let (harness, _events) = Harness::new(SessionConfig::default());
    harness.risk.halt("manual");

    let result = grid_trading_engine::GridSession::arm(plan_with_levels(8, 10.0), &harness.risk, t0());
    assert!(matches!(result, Err(TradingError::RiskViolation(_))));
    assert_eq!(harness.risk.snapshot().active_sessions, 0);
}

#[tokio::test]
async fn test_transient_submit_failures_are_retried() {
    let (harness, _events) = Harness::new(SessionConfig::default());
    let ctx = harness.ctx();
    let mut session = harness.arm(plan_with_levels(8, 10.0));

    harness
        .exchange
        .fail_next_submits(2, GatewayError::Transport("connection reset".to_string()));
    session.deploy(&ctx, t0()).await.unwrap();

    assert_eq!(session.state, SessionState::Deployed);
    assert_eq!(harness.exchange.submitted_count(), 4);
    assert_eq!(harness.exchange.submit_attempts(), 6);
}

#[tokio::test]
async fn test_exhausted_retries_abort_the_deploy() {
    let (harness, _events) = Harness::new(SessionConfig::default());
    let ctx = harness.ctx();
    let mut session = harness.arm(plan_with_levels(8, 10.0));

    harness.exchange.fail_next_submits(3, GatewayError::RateLimited);
    session.deploy(&ctx, t0()).await.unwrap();

    assert_eq!(session.state, SessionState::Aborted);
    assert!(matches!(
        session.exit_reason,
        Some(ExitReason::RetriesExhausted(_))
    ));
    assert_eq!(harness.exchange.submit_attempts(), 3);
    assert!(harness.exchange.resting_orders(SYMBOL).is_empty());
    assert_eq!(harness.risk.snapshot().active_sessions, 0);
}

#[tokio::test]
async fn test_rejected_sell_aborts_and_sells_inventory_at_market() {
    let (harness, mut events) = Harness::new(SessionConfig::default());
    let ctx = harness.ctx();
    let plan = plan_with_levels(8, 10.0);
    let mut session = harness.arm(plan.clone());
    session.deploy(&ctx, t0()).await.unwrap();
    harness.exchange.on_price(SYMBOL, 100.0);

    harness
        .exchange
        .fail_next_submits(1, GatewayError::Rejected("insufficient balance".to_string()));
    let buy = open_orders(&session, Side::Buy)
        .into_iter()
        .find(|o| o.level == 2)
        .unwrap();
    harness.exchange.fill_order(&exchange_id(&buy));
    pump(&mut events, &mut session, &ctx, t0()).await;

    assert_eq!(session.state, SessionState::Aborted);
    assert!(matches!(session.exit_reason, Some(ExitReason::ExchangeRejection(_))));
    // Rejections are final, not retried
    assert_eq!(harness.exchange.submit_attempts(), 5);
    assert!(harness.exchange.resting_orders(SYMBOL).is_empty());
    assert_eq!(harness.exchange.closed_volume(SYMBOL), plan.quantity_at(2));
}

#[tokio::test]
async fn test_lost_acknowledgement_never_duplicates_an_order() {
    let (mut harness, _events) = Harness::new(SessionConfig::default());
    harness.order_timeout = Duration::from_millis(20);
    harness.exchange.set_submit_latency(Some(Duration::from_millis(500)));
    let ctx = harness.ctx();
    let mut session = harness.arm(plan_with_levels(8, 10.0));

    session.deploy(&ctx, t0()).await.unwrap();

    assert_eq!(session.state, SessionState::Deployed);
    assert_eq!(harness.exchange.submitted_count(), 4);
    for order in &session.orders {
        assert_eq!(harness.exchange.orders_with_client_id(&order.client_id), 1);
        assert_eq!(order.status, OrderStatus::Open);
    }
}

#[tokio::test]
async fn test_external_cancel_replaces_the_level() {
    let (harness, mut events) = Harness::new(SessionConfig::default());
    let ctx = harness.ctx();
    let mut session = harness.arm(plan_with_levels(8, 10.0));
    session.deploy(&ctx, t0()).await.unwrap();

    let victim = open_orders(&session, Side::Buy).remove(1);
    assert!(harness.exchange.cancel_externally(&exchange_id(&victim)));
    pump(&mut events, &mut session, &ctx, t0()).await;

    assert_eq!(harness.exchange.submitted_count(), 5);
    assert_eq!(harness.exchange.resting_orders(SYMBOL).len(), 4);
    let level: Vec<_> = session
        .orders
        .iter()
        .filter(|o| o.level == victim.level && o.side == Side::Buy)
        .map(|o| o.status)
        .collect();
    assert_eq!(level, vec![OrderStatus::Cancelled, OrderStatus::Open]);
}

#[tokio::test]
async fn test_failed_cancel_keeps_session_closing_until_retried() {
    let (harness, _events) = Harness::new(SessionConfig::default());
    let harness = harness.with_store(memory_store());
    let ctx = harness.ctx();
    let store = harness.store.as_ref().unwrap();
    let mut session = harness.arm(plan_with_levels(8, 10.0));
    session.deploy(&ctx, t0()).await.unwrap();
    harness.exchange.on_price(SYMBOL, 100.0);

    // Every attempt at the first cancel fails
    harness
        .exchange
        .fail_next_cancels(3, GatewayError::Transport("connection reset".to_string()));
    session.close(ExitReason::Manual, &ctx, t0() + minutes(1)).await.unwrap();

    assert_eq!(session.state, SessionState::Closing);
    assert_eq!(harness.exchange.resting_orders(SYMBOL).len(), 1);
    assert_eq!(session.working_orders().count(), 1);
    assert_eq!(harness.risk.snapshot().active_sessions, 1);
    assert_eq!(store.load_active_sessions().unwrap().len(), 1);

    // The next price tick retries the unwind
    session.on_price(100.0, &ctx, t0() + minutes(2)).await.unwrap();

    assert_eq!(session.state, SessionState::Closed);
    assert!(harness.exchange.resting_orders(SYMBOL).is_empty());
    assert_eq!(session.working_orders().count(), 0);
    assert_eq!(harness.risk.snapshot().active_sessions, 0);
    assert!(store.load_active_sessions().unwrap().is_empty());
}

#[tokio::test]
async fn test_order_filling_after_failed_cancel_is_sold_before_close() {
    let (harness, mut events) = Harness::new(SessionConfig::default());
    let ctx = harness.ctx();
    let mut session = harness.arm(plan_with_levels(8, 10.0));
    session.deploy(&ctx, t0()).await.unwrap();
    harness.exchange.on_price(SYMBOL, 100.0);

    harness
        .exchange
        .fail_next_cancels(3, GatewayError::Transport("connection reset".to_string()));
    session.close(ExitReason::Manual, &ctx, t0() + minutes(1)).await.unwrap();
    assert_eq!(session.state, SessionState::Closing);

    let stuck = session.working_orders().next().cloned().unwrap();
    assert_eq!(stuck.side, Side::Buy);
    assert!(harness.exchange.fill_order(&exchange_id(&stuck)));
    pump(&mut events, &mut session, &ctx, t0() + minutes(2)).await;

    assert_eq!(session.state, SessionState::Closed);
    assert_eq!(session.exit_reason, Some(ExitReason::Manual));
    assert!(harness.exchange.resting_orders(SYMBOL).is_empty());
    assert!((harness.exchange.closed_volume(SYMBOL) - stuck.size).abs() < 1e-12);
    assert_eq!(session.held_quantity(), 0.0);
    assert_eq!(harness.risk.snapshot().active_sessions, 0);
}
