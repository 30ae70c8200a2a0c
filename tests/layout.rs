//! Persisted account layouts. Offsets here are what clients decode against.

use bytemuck::Zeroable;
use core::mem::size_of;
use clearing_house::history::*;
use clearing_house::oracle;
use clearing_house::state::*;
use memoffset::offset_of;

#[test]
fn record_sizes() {
    assert_eq!(size_of::<State>(), 1200);
    assert_eq!(size_of::<Market>(), 496);
    assert_eq!(size_of::<Amm>(), 352);
    assert_eq!(size_of::<OrderState>(), 96);
    assert_eq!(size_of::<FeeStructure>(), 288);
    assert_eq!(size_of::<OracleGuardRails>(), 96);
    assert_eq!(size_of::<TradeRecord>(), 256);
    assert_eq!(size_of::<DepositRecord>(), 144);
    assert_eq!(size_of::<FundingRateRecord>(), 112);
    assert_eq!(size_of::<FundingPaymentRecord>(), 192);
    assert_eq!(size_of::<LiquidationRecord>(), 256);
    assert_eq!(size_of::<CurveRecord>(), 304);
    assert_eq!(size_of::<Order>(), 224);
    assert_eq!(size_of::<OrderRecord>(), 448);
    assert_eq!(size_of::<User>(), 208);
    assert_eq!(size_of::<MarketPosition>(), 208);
    assert_eq!(size_of::<UserPositions>(), 1072);

    assert_eq!(State::ACCOUNT_LEN, 1208);
    assert_eq!(OrderState::ACCOUNT_LEN, 104);
    assert_eq!(User::ACCOUNT_LEN, 216);
    assert_eq!(UserPositions::ACCOUNT_LEN, 1080);
    assert_eq!(MARKETS_ACCOUNT_LEN, 8 + 64 * 496);
}

#[test]
fn state_offsets() {
    assert_eq!(offset_of!(State, admin), 16);
    assert_eq!(offset_of!(State, collateral_mint), 48);
    assert_eq!(offset_of!(State, collateral_vault), 80);
    assert_eq!(offset_of!(State, collateral_vault_authority), 112);
    assert_eq!(offset_of!(State, deposit_history), 144);
    assert_eq!(offset_of!(State, trade_history), 176);
    assert_eq!(offset_of!(State, funding_payment_history), 208);
    assert_eq!(offset_of!(State, funding_rate_history), 240);
    assert_eq!(offset_of!(State, liquidation_history), 272);
    assert_eq!(offset_of!(State, curve_history), 304);
    assert_eq!(offset_of!(State, insurance_vault), 336);
    assert_eq!(offset_of!(State, insurance_vault_authority), 368);
    assert_eq!(offset_of!(State, markets), 400);
    assert_eq!(offset_of!(State, margin_ratio_initial), 432);
    assert_eq!(offset_of!(State, fee_structure), 608);
    assert_eq!(offset_of!(State, whitelist_mint), 896);
    assert_eq!(offset_of!(State, discount_mint), 928);
    assert_eq!(offset_of!(State, oracle_guard_rails), 960);
    assert_eq!(offset_of!(State, max_deposit), 1056);
    assert_eq!(offset_of!(State, extended_curve_history), 1072);
    assert_eq!(offset_of!(State, order_state), 1104);
    assert_eq!(offset_of!(State, _padding1), 1136);
}

#[test]
fn market_offsets() {
    assert_eq!(offset_of!(Market, amm), 64);
    assert_eq!(offset_of!(Market, margin_ratio_initial), 416);
    assert_eq!(offset_of!(Market, initialized), 428);

    assert_eq!(offset_of!(Amm, oracle), 288);
    assert_eq!(offset_of!(Amm, last_oracle_price), 320);
    assert_eq!(offset_of!(Amm, base_spread), 336);
    assert_eq!(offset_of!(Amm, oracle_source), 338);

    assert_eq!(market_offset(0).unwrap(), 8);
    assert_eq!(market_offset(63).unwrap(), 8 + 63 * 496);
}

#[test]
fn user_offsets() {
    assert_eq!(offset_of!(User, collateral), 32);
    assert_eq!(offset_of!(User, total_fee_paid), 64);
    assert_eq!(offset_of!(User, positions), 128);
    assert_eq!(offset_of!(User, settled_position_value), 160);
    assert_eq!(offset_of!(User, forgo_position_settlement), 192);
    assert_eq!(offset_of!(User, has_settled_position), 193);

    assert_eq!(offset_of!(MarketPosition, base_asset_amount), 16);
    assert_eq!(offset_of!(MarketPosition, open_orders), 80);
    assert_eq!(offset_of!(UserPositions, positions), 32);
}

#[test]
fn order_offsets() {
    assert_eq!(offset_of!(Order, order_id), 32);
    assert_eq!(offset_of!(Order, referrer), 176);
    assert_eq!(offset_of!(OrderRecord, order), 96);
    assert_eq!(offset_of!(OrderRecord, filler), 320);
}

#[test]
fn ring_log_lengths() {
    assert_eq!(TradeHistory::BODY_LEN, 16 + 1024 * 256);
    assert_eq!(DepositHistory::BODY_LEN, 16 + 1024 * 144);
    assert_eq!(FundingRateHistory::BODY_LEN, 16 + 1024 * 112);
    assert_eq!(FundingPaymentHistory::BODY_LEN, 16 + 1024 * 192);
    assert_eq!(LiquidationHistory::BODY_LEN, 16 + 1024 * 256);
    assert_eq!(CurveHistory::BODY_LEN, 16 + 1024 * 304);
    assert_eq!(OrderHistory::BODY_LEN, 32 + 1024 * 448);
    assert_eq!(OrderHistory::ACCOUNT_LEN, 8 + OrderHistory::BODY_LEN);
}

#[test]
fn order_log_header_bytes() {
    let mut data = vec![0u8; OrderHistory::ACCOUNT_LEN];
    let mut log = OrderHistory::init(&mut data).unwrap();
    log.append_order(OrderRecord::zeroed()).unwrap();
    log.append_order(OrderRecord::zeroed()).unwrap();
    drop(log);

    assert_eq!(&data[..8], b"ORDERHST");
    assert_eq!(u64::from_le_bytes(data[8..16].try_into().unwrap()), 2);
    assert_eq!(u128::from_le_bytes(data[24..40].try_into().unwrap()), 2);
    // second record, order id field
    let off = 40 + 448 + 96 + 32;
    assert_eq!(u128::from_le_bytes(data[off..off + 16].try_into().unwrap()), 2);
}

#[test]
fn price_feed_layout() {
    assert_eq!(oracle::POSTED_SLOT_OFF + 8, oracle::PRICE_FEED_LEN);
    assert_eq!(oracle::EXPONENT_OFF + 4, oracle::PUBLISH_TIME_OFF);
    assert_eq!(oracle::FEED_ID_OFF + 32, oracle::PRICE_OFF);
}
