//! Instruction tag constants for the clearing house and the mock oracle.
//!
//! Tags are part of the wire format: never reorder, remove, or reuse one.
//! Append new instructions at the end.

pub const TAG_INITIALIZE: u8 = 0;
pub const TAG_INITIALIZE_HISTORY: u8 = 1;
pub const TAG_INITIALIZE_ORDER_STATE: u8 = 2;
pub const TAG_INITIALIZE_MARKET: u8 = 3;
pub const TAG_INITIALIZE_USER: u8 = 4;

// Mock oracle program
pub const TAG_ORACLE_INITIALIZE_PRICE: u8 = 0;
pub const TAG_ORACLE_SET_PRICE: u8 = 1;
pub const TAG_ORACLE_SET_EMA_PRICE: u8 = 2;
