//! Kani formal verification harnesses for clearing-house.
//!
//! Run with: `cargo kani --tests`
//!
//! Proven properties:
//! - Admin authorization never passes for a null admin or a different signer
//! - Margin ratio validation accepts exactly `MIN <= maint <= partial <= initial <= MAX`
//! - Ring log cursor arithmetic stays in bounds and steps are invertible
//! - Market slot and initial peg predicates
//!
//! Account parsing and the token program are NOT modeled.

#![cfg(kani)]

extern crate kani;

use clearing_house::constants::{HISTORY_CAPACITY, MAXIMUM_MARGIN_RATIO, MINIMUM_MARGIN_RATIO};
use clearing_house::market::validate_margin_ratios;
use clearing_house::verify::{
    admin_ok, initial_peg_ok, key_unset, margin_chain_ok, margin_ratio_in_range, ring_next, ring_prev,
    slot_free,
};

// =============================================================================
// A. ADMIN AUTHORIZATION
// =============================================================================

/// Prove: admin_ok implies the signer is the stored admin and it is not null
#[kani::proof]
fn kani_admin_ok_implies_match() {
    let stored: [u8; 32] = kani::any();
    let signer: [u8; 32] = kani::any();

    if admin_ok(stored, signer) {
        assert!(stored == signer);
        assert!(!key_unset(&stored));
    }
}

/// Prove: a null admin authorizes nobody, including the null key
#[kani::proof]
fn kani_null_admin_rejects_all() {
    let signer: [u8; 32] = kani::any();
    assert!(!admin_ok([0u8; 32], signer));
}

/// Prove: a set admin authorizes itself
#[kani::proof]
fn kani_admin_accepts_self() {
    let stored: [u8; 32] = kani::any();
    kani::assume(!key_unset(&stored));
    assert!(admin_ok(stored, stored));
}

// =============================================================================
// B. MARGIN RATIOS
// =============================================================================

/// Prove: the predicate and the validator agree on every input
#[kani::proof]
fn kani_margin_chain_matches_validator() {
    let initial: u32 = kani::any();
    let partial: u32 = kani::any();
    let maintenance: u32 = kani::any();

    assert_eq!(
        margin_chain_ok(initial, partial, maintenance),
        validate_margin_ratios(initial, partial, maintenance).is_ok()
    );
}

/// Prove: accepted ratios are ordered and in range
#[kani::proof]
fn kani_margin_chain_ordered() {
    let initial: u32 = kani::any();
    let partial: u32 = kani::any();
    let maintenance: u32 = kani::any();

    if margin_chain_ok(initial, partial, maintenance) {
        assert!(MINIMUM_MARGIN_RATIO <= maintenance);
        assert!(maintenance <= partial);
        assert!(partial <= initial);
        assert!(initial <= MAXIMUM_MARGIN_RATIO);
    }
}

/// Prove: any ordered in-range triple is accepted
#[kani::proof]
fn kani_margin_chain_complete() {
    let initial: u32 = kani::any();
    let partial: u32 = kani::any();
    let maintenance: u32 = kani::any();
    kani::assume(MINIMUM_MARGIN_RATIO <= maintenance);
    kani::assume(maintenance <= partial);
    kani::assume(partial <= initial);
    kani::assume(initial <= MAXIMUM_MARGIN_RATIO);

    assert!(margin_chain_ok(initial, partial, maintenance));
}

#[kani::proof]
fn kani_margin_ratio_bounds() {
    let ratio: u32 = kani::any();
    assert_eq!(
        margin_ratio_in_range(ratio),
        ratio >= MINIMUM_MARGIN_RATIO && ratio <= MAXIMUM_MARGIN_RATIO
    );
}

// =============================================================================
// C. RING LOG CURSOR
// =============================================================================

/// Prove: ring_next stays inside the ring
#[kani::proof]
fn kani_ring_next_in_range() {
    let capacity: u64 = kani::any();
    let head: u64 = kani::any();
    kani::assume(capacity > 0);
    kani::assume(head < capacity);

    assert!(ring_next(head, capacity) < capacity);
}

/// Prove: ring_prev undoes ring_next and vice versa
#[kani::proof]
fn kani_ring_steps_invert() {
    let capacity: u64 = kani::any();
    let head: u64 = kani::any();
    kani::assume(capacity > 0);
    kani::assume(head < capacity);

    assert_eq!(ring_prev(ring_next(head, capacity), capacity), head);
    assert_eq!(ring_next(ring_prev(head, capacity), capacity), head);
}

/// Prove: at the deployed capacity the last slot wraps to zero
#[kani::proof]
fn kani_ring_wraps_at_capacity() {
    let capacity = HISTORY_CAPACITY as u64;
    assert_eq!(ring_next(capacity - 1, capacity), 0);
    assert_eq!(ring_prev(0, capacity), capacity - 1);
}

// =============================================================================
// D. MARKET SLOTS
// =============================================================================

#[kani::proof]
fn kani_slot_free_only_when_zero() {
    let initialized: u8 = kani::any();
    assert_eq!(slot_free(initialized), initialized == 0);
}

/// Prove: unequal reserves never pass the initial peg check
#[kani::proof]
fn kani_initial_peg_requires_equal_reserves() {
    let base: u128 = kani::any();
    let quote: u128 = kani::any();
    assert_eq!(initial_peg_ok(base, quote), base == quote);
}
