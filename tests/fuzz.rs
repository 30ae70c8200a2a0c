use bytemuck::Zeroable;
use clearing_house::constants::{HISTORY_CAPACITY, MAXIMUM_MARGIN_RATIO, MINIMUM_MARGIN_RATIO};
use clearing_house::history::{DepositHistory, DepositRecord, OrderHistory, OrderRecord};
use clearing_house::market::validate_margin_ratios;
use clearing_house::verify;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

fn reference_margin_chain(initial: u32, partial: u32, maintenance: u32) -> bool {
    MINIMUM_MARGIN_RATIO <= maintenance
        && maintenance <= partial
        && partial <= initial
        && initial <= MAXIMUM_MARGIN_RATIO
}

// Mostly near the bounds, where the interesting cases are
fn margin_ratio(rng: &mut XorShiftRng) -> u32 {
    match rng.gen_range(0..4) {
        0 => rng.gen(),
        1 => rng.gen_range(MINIMUM_MARGIN_RATIO - 5..MINIMUM_MARGIN_RATIO + 5),
        2 => rng.gen_range(MAXIMUM_MARGIN_RATIO - 5..MAXIMUM_MARGIN_RATIO + 5),
        _ => rng.gen_range(0..MAXIMUM_MARGIN_RATIO + 100),
    }
}

#[test]
fn deterministic_margin_ratio_fuzz() {
    let mut rng = XorShiftRng::from_seed([0xabu8; 16]);
    let mut accepted = 0;

    for i in 0..20_000 {
        let initial = margin_ratio(&mut rng);
        let partial = margin_ratio(&mut rng);
        let maintenance = margin_ratio(&mut rng);

        let expected = reference_margin_chain(initial, partial, maintenance);
        assert_eq!(
            validate_margin_ratios(initial, partial, maintenance).is_ok(),
            expected,
            "step {}: ({}, {}, {})",
            i,
            initial,
            partial,
            maintenance
        );
        assert_eq!(verify::margin_chain_ok(initial, partial, maintenance), expected);
        if expected {
            accepted += 1;
        }
    }
    assert!(accepted > 0, "generator never produced a valid chain");
}

#[test]
fn deterministic_ring_log_fuzz() {
    let mut rng = XorShiftRng::from_seed([0xabu8; 16]);
    let mut data = vec![0u8; DepositHistory::ACCOUNT_LEN];
    DepositHistory::init(&mut data).unwrap();

    // Every appended amount, in order
    let mut model: Vec<u64> = Vec::new();
    let total = 3 * HISTORY_CAPACITY + 17;

    for n in 0..total {
        let mut log = DepositHistory::load(&mut data).unwrap();
        let record_id = log.next_record_id().unwrap();
        assert_eq!(record_id, n as u128 + 1);

        let mut rec = DepositRecord::zeroed();
        rec.record_id = record_id;
        rec.amount = rng.gen();
        rec.direction = rng.gen_range(0..2);
        let slot = log.append(rec);
        assert_eq!(slot as usize, n % HISTORY_CAPACITY);
        model.push(rec.amount);

        assert_eq!(log.head() as usize, (n + 1) % HISTORY_CAPACITY);

        for _ in 0..4 {
            let slot_ix = rng.gen_range(0..HISTORY_CAPACITY);
            let got = log.get(slot_ix).unwrap();
            // latest append that landed in this slot, if any
            let written = (0..=n).rev().find(|k| k % HISTORY_CAPACITY == slot_ix);
            match written {
                Some(k) => {
                    assert_eq!(got.record_id, k as u128 + 1);
                    assert_eq!(got.amount, model[k]);
                    assert!(got.direction().is_some());
                }
                None => assert_eq!(got.record_id, 0),
            }
        }
    }
}

#[test]
fn deterministic_order_id_fuzz() {
    let mut rng = XorShiftRng::from_seed([0xabu8; 16]);
    let mut data = vec![0u8; OrderHistory::ACCOUNT_LEN];
    let mut log = OrderHistory::init(&mut data).unwrap();
    let mut last = 0u128;

    for _ in 0..2 * HISTORY_CAPACITY {
        let mut rec = OrderRecord::zeroed();
        rec.action = rng.gen_range(0..4);
        rec.order.order_id = rng.gen();
        let (slot, order_id) = log.append_order(rec).unwrap();
        assert!(order_id > last);
        assert_eq!(log.get(slot as usize).unwrap().order.order_id, order_id);
        last = order_id;
    }
    assert_eq!(log.last_order_id(), last);
}
