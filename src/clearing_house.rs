//! Clearing House: single-file Solana program holding the state singleton,
//! the market registry and the history ring logs of a perpetuals exchange.

#![deny(unsafe_code)]

use solana_program::declare_id;

declare_id!("8LfxrA255MRfjpgdUSG9384YbAP4QsdEe9gvURA8UcUH");

#[path = "tags.rs"]
pub mod tags;

// 1. mod constants
pub mod constants {
    use core::mem::size_of;
    use crate::history::{
        CurveRecord, DepositRecord, FundingPaymentRecord, FundingRateRecord, LiquidationRecord,
        Order, OrderRecord, TradeRecord,
    };
    use crate::state::{Amm, Market, MarketPosition, OrderState, State, User, UserPositions};

    pub const DISCRIMINATOR_LEN: usize = 8;

    // Precision
    pub const MARK_PRICE_PRECISION: u128 = 10_000_000_000;
    pub const PEG_PRECISION: u128 = 1_000;
    pub const PRICE_TO_PEG_PRECISION_RATIO: u128 = MARK_PRICE_PRECISION / PEG_PRECISION;
    pub const MARGIN_PRECISION: u32 = 10_000;
    pub const MINIMUM_MARGIN_RATIO: u32 = MARGIN_PRECISION / 50;
    pub const MAXIMUM_MARGIN_RATIO: u32 = MARGIN_PRECISION;

    pub const MAX_MARKETS: usize = 64;
    pub const MAX_USER_POSITIONS: usize = 5;
    pub const HISTORY_CAPACITY: usize = 1024;
    pub const MINIMUM_TRADE_SIZE: u128 = 10_000_000;

    pub const STATE_LEN: usize = size_of::<State>();
    pub const MARKET_LEN: usize = size_of::<Market>();
    pub const MARKETS_LEN: usize = MAX_MARKETS * MARKET_LEN;
    pub const ORDER_STATE_LEN: usize = size_of::<OrderState>();
    pub const USER_LEN: usize = size_of::<User>();
    pub const USER_POSITIONS_LEN: usize = size_of::<UserPositions>();

    // Persisted sizes. Changing any of these breaks existing accounts.
    const _: [(); 1200] = [(); STATE_LEN];
    const _: [(); 496] = [(); MARKET_LEN];
    const _: [(); 352] = [(); size_of::<Amm>()];
    const _: [(); 31744] = [(); MARKETS_LEN];
    const _: [(); 96] = [(); ORDER_STATE_LEN];
    const _: [(); 208] = [(); USER_LEN];
    const _: [(); 208] = [(); size_of::<MarketPosition>()];
    const _: [(); 1072] = [(); USER_POSITIONS_LEN];
    const _: [(); 256] = [(); size_of::<TradeRecord>()];
    const _: [(); 144] = [(); size_of::<DepositRecord>()];
    const _: [(); 112] = [(); size_of::<FundingRateRecord>()];
    const _: [(); 192] = [(); size_of::<FundingPaymentRecord>()];
    const _: [(); 256] = [(); size_of::<LiquidationRecord>()];
    const _: [(); 304] = [(); size_of::<CurveRecord>()];
    const _: [(); 224] = [(); size_of::<Order>()];
    const _: [(); 448] = [(); size_of::<OrderRecord>()];

    // State defaults written by `initialize`
    pub const DEFAULT_MARGIN_RATIO_INITIAL: u128 = 2000;
    pub const DEFAULT_MARGIN_RATIO_MAINTENANCE: u128 = 625;
    pub const DEFAULT_MARGIN_RATIO_PARTIAL: u128 = 500;

    pub const DEFAULT_PARTIAL_LIQUIDATION_CLOSE_NUMERATOR: u128 = 25;
    pub const DEFAULT_PARTIAL_LIQUIDATION_CLOSE_DENOMINATOR: u128 = 100;
    pub const DEFAULT_PARTIAL_LIQUIDATION_PENALTY_NUMERATOR: u128 = 25;
    pub const DEFAULT_PARTIAL_LIQUIDATION_PENALTY_DENOMINATOR: u128 = 1000;
    pub const DEFAULT_FULL_LIQUIDATION_PENALTY_NUMERATOR: u128 = 1;
    pub const DEFAULT_FULL_LIQUIDATION_PENALTY_DENOMINATOR: u128 = 1;
    pub const DEFAULT_PARTIAL_LIQUIDATION_LIQUIDATOR_SHARE_DENOMINATOR: u128 = 2;
    pub const DEFAULT_FULL_LIQUIDATION_LIQUIDATOR_SHARE_DENOMINATOR: u128 = 20;

    pub const DEFAULT_FEE_NUMERATOR: u128 = 1;
    pub const DEFAULT_FEE_DENOMINATOR: u128 = 1000;
    /// (discount numerator, discount denominator, minimum balance) per tier, best tier first.
    pub const DEFAULT_DISCOUNT_TOKEN_TIERS: [(u128, u128, u64); 4] = [
        (20, 100, 1_000_000_000),
        (15, 100, 100_000_000),
        (10, 100, 10_000_000),
        (5, 100, 1_000_000),
    ];
    pub const DEFAULT_REFERRER_REWARD_NUMERATOR: u128 = 5;
    pub const DEFAULT_REFERRER_REWARD_DENOMINATOR: u128 = 100;
    pub const DEFAULT_REFEREE_DISCOUNT_NUMERATOR: u128 = 5;
    pub const DEFAULT_REFEREE_DISCOUNT_DENOMINATOR: u128 = 100;

    pub const DEFAULT_MARK_ORACLE_DIVERGENCE_NUMERATOR: u128 = 1;
    pub const DEFAULT_MARK_ORACLE_DIVERGENCE_DENOMINATOR: u128 = 10;
    pub const DEFAULT_SLOTS_BEFORE_STABLE: i64 = 1000;
    pub const DEFAULT_CONFIDENCE_INTERVAL_MAX_SIZE: u128 = 4;
    pub const DEFAULT_TOO_VOLATILE_RATIO: i128 = 5;

    // Order state defaults written by `initialize_order_state`
    pub const DEFAULT_FILLER_REWARD_NUMERATOR: u128 = 1;
    pub const DEFAULT_FILLER_REWARD_DENOMINATOR: u128 = 10;
    pub const DEFAULT_TIME_BASED_REWARD_LOWER_BOUND: u128 = 10_000;
    pub const DEFAULT_MIN_ORDER_QUOTE_ASSET_AMOUNT: u128 = 500_000;
}

// 2. mod error
pub mod error {
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive as _;
    use solana_program::{decode_error::DecodeError, program_error::ProgramError};
    use thiserror::Error;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error, FromPrimitive)]
    pub enum ClearingHouseError {
        // Authorization
        #[error("Signer does not match the stored admin")]
        ConstraintHasOne,
        // Validation
        #[error("Base and quote reserves must be equal at market creation")]
        InvalidInitialPeg,
        #[error("Margin ratios out of range or not ordered")]
        InvalidMarginRatio,
        #[error("Oracle source not supported")]
        InvalidOracleSource,
        // Arithmetic
        #[error("Math error")]
        MathError,
        #[error("Conversion to u128/u64 failed with an overflow or underflow")]
        BnConversionError,
        #[error("Casting failure")]
        FailToCast,
        // Lifecycle
        #[error("Market index already initialized")]
        MarketIndexAlreadyInitialized,
        #[error("History accounts already initialized")]
        HistoriesAllInitialized,
        #[error("Order state already initialized")]
        OrderStateAlreadyInitialized,
        #[error("State already initialized")]
        StateAlreadyInitialized,
        #[error("Account already initialized")]
        AccountAlreadyInitialized,
        #[error("Account not initialized")]
        AccountNotInitialized,
        #[error("Market index out of range")]
        InvalidMarketIndex,
        // Configuration mismatch
        #[error("Clearing house not collateral vault owner")]
        InvalidCollateralVaultAuthority,
        #[error("Clearing house not insurance vault owner")]
        InvalidInsuranceVaultAuthority,
        #[error("Collateral vault is not a token account of the collateral mint")]
        InvalidCollateralVault,
        #[error("Insurance vault is not a token account of the collateral mint")]
        InvalidInsuranceVault,
        #[error("Markets account does not match state")]
        InvalidMarketsAccount,
        // Oracle
        #[error("Unable to load oracle")]
        FailToLoadOracle,
        // Account shape
        #[error("Expected signer")]
        ExpectedSigner,
        #[error("Expected writable account")]
        ExpectedWritable,
        #[error("Account has the wrong length")]
        InvalidAccountLen,
        // User onboarding
        #[error("Fail to find whitelist token")]
        FailToFindWhitelistToken,
        #[error("Invalid whitelist token")]
        InvalidWhitelistToken,
        #[error("Whitelist token has no balance")]
        WhitelistTokenNoBalance,
        #[error("User account is not the authority's user address")]
        InvalidUserAccount,
    }

    pub type ClearingHouseResult<T = ()> = Result<T, ClearingHouseError>;

    impl ClearingHouseError {
        pub fn from_code(code: u32) -> Option<Self> {
            Self::from_u32(code)
        }
    }

    impl From<ClearingHouseError> for ProgramError {
        fn from(e: ClearingHouseError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for ClearingHouseError {
        fn type_of() -> &'static str {
            "ClearingHouseError"
        }
    }

    /// Closure that logs the call site and yields `MathError`.
    /// Use as `.ok_or_else(math_error!())?`.
    #[macro_export]
    macro_rules! math_error {
        () => {{
            || {
                let error_code = $crate::error::ClearingHouseError::MathError;
                ::solana_program::msg!("Error {} thrown at {}:{}", error_code, file!(), line!());
                error_code
            }
        }};
    }

}

// 3. mod math
pub mod math {
    use crate::constants::{MARK_PRICE_PRECISION, PRICE_TO_PEG_PRECISION_RATIO};
    use crate::error::{ClearingHouseError, ClearingHouseResult};
    use crate::math_error;

    pub use self::bn::U192;

    #[allow(unsafe_code)]
    #[allow(clippy::all)]
    mod bn {
        use uint::construct_uint;

        construct_uint! {
            /// 192-bit unsigned integer for reserve products.
            pub struct U192(3);
        }
    }

    impl U192 {
        pub fn try_to_u128(self) -> ClearingHouseResult<u128> {
            self.try_into().map_err(|_| ClearingHouseError::BnConversionError)
        }

        pub fn try_to_u64(self) -> ClearingHouseResult<u64> {
            self.try_into().map_err(|_| ClearingHouseError::BnConversionError)
        }
    }

    pub fn cast<T: TryInto<U>, U>(t: T) -> ClearingHouseResult<U> {
        t.try_into().map_err(|_| ClearingHouseError::FailToCast)
    }

    pub fn cast_to_i128<T: TryInto<i128>>(t: T) -> ClearingHouseResult<i128> {
        cast(t)
    }

    pub fn cast_to_u128<T: TryInto<u128>>(t: T) -> ClearingHouseResult<u128> {
        cast(t)
    }

    pub fn cast_to_i64<T: TryInto<i64>>(t: T) -> ClearingHouseResult<i64> {
        cast(t)
    }

    /// `(mul, div)` that bring a feed value with `10^|exponent|` precision to
    /// `MARK_PRICE_PRECISION`. Exactly one of the two is 1.
    pub fn mark_price_scale(exponent: i32) -> ClearingHouseResult<(u128, u128)> {
        let feed_precision = 10u128
            .checked_pow(exponent.unsigned_abs())
            .ok_or_else(math_error!())?;

        if feed_precision > MARK_PRICE_PRECISION {
            let div = feed_precision
                .checked_div(MARK_PRICE_PRECISION)
                .ok_or_else(math_error!())?;
            Ok((1, div))
        } else {
            let mul = MARK_PRICE_PRECISION
                .checked_div(feed_precision)
                .ok_or_else(math_error!())?;
            Ok((mul, 1))
        }
    }

    pub fn scale_to_mark_price(raw_price: i64, exponent: i32) -> ClearingHouseResult<i128> {
        let (mul, div) = mark_price_scale(exponent)?;
        cast_to_i128(raw_price)?
            .checked_mul(cast(mul)?)
            .ok_or_else(math_error!())?
            .checked_div(cast(div)?)
            .ok_or_else(math_error!())
    }

    pub fn checked_reserve_product(base_asset_reserve: u128, quote_asset_reserve: u128) -> ClearingHouseResult<U192> {
        U192::from(base_asset_reserve)
            .checked_mul(U192::from(quote_asset_reserve))
            .ok_or_else(math_error!())
    }

    /// Mark price of `quote / base` adjusted by `peg`, in `MARK_PRICE_PRECISION`.
    pub fn calculate_price(
        quote_asset_reserve: u128,
        base_asset_reserve: u128,
        peg_multiplier: u128,
    ) -> ClearingHouseResult<u128> {
        let peg_quote_asset_amount = quote_asset_reserve
            .checked_mul(peg_multiplier)
            .ok_or_else(math_error!())?;

        U192::from(peg_quote_asset_amount)
            .checked_mul(U192::from(PRICE_TO_PEG_PRECISION_RATIO))
            .ok_or_else(math_error!())?
            .checked_div(U192::from(base_asset_reserve))
            .ok_or_else(math_error!())?
            .try_to_u128()
    }

}

// 4. mod verify (pure predicates, proven in tests/kani.rs)
pub mod verify {
    use crate::constants::{MAXIMUM_MARGIN_RATIO, MINIMUM_MARGIN_RATIO};

    #[inline]
    pub fn key_unset(key: &[u8; 32]) -> bool {
        *key == [0u8; 32]
    }

    /// A null admin never authorizes anything.
    #[inline]
    pub fn admin_ok(stored_admin: [u8; 32], signer: [u8; 32]) -> bool {
        !key_unset(&stored_admin) && stored_admin == signer
    }

    #[inline]
    pub fn margin_ratio_in_range(ratio: u32) -> bool {
        (MINIMUM_MARGIN_RATIO..=MAXIMUM_MARGIN_RATIO).contains(&ratio)
    }

    #[inline]
    pub fn margin_chain_ok(initial: u32, partial: u32, maintenance: u32) -> bool {
        margin_ratio_in_range(initial)
            && initial >= partial
            && margin_ratio_in_range(partial)
            && partial >= maintenance
            && margin_ratio_in_range(maintenance)
    }

    #[inline]
    pub fn initial_peg_ok(base_asset_reserve: u128, quote_asset_reserve: u128) -> bool {
        base_asset_reserve == quote_asset_reserve
    }

    #[inline]
    pub fn slot_free(initialized: u8) -> bool {
        initialized == 0
    }

    /// Slot after `head` in a ring of `capacity` slots.
    #[inline]
    pub fn ring_next(head: u64, capacity: u64) -> u64 {
        let next = head.wrapping_add(1);
        if next >= capacity {
            0
        } else {
            next
        }
    }

    /// Slot written most recently when the ring's next write goes to `head`.
    #[inline]
    pub fn ring_prev(head: u64, capacity: u64) -> u64 {
        if head == 0 {
            capacity.saturating_sub(1)
        } else {
            head - 1
        }
    }
}

// 5. mod ix
pub mod ix {
    use arrayref::array_ref;
    use num_traits::FromPrimitive;
    use solana_program::program_error::ProgramError;
    use crate::market::MarketParams;
    use crate::state::OracleSource;
    use crate::tags::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Instruction {
        Initialize { admin_controls_prices: bool },
        InitializeHistory,
        InitializeOrderState,
        InitializeMarket(MarketParams),
        /// `whitelist_token`: the caller passes its whitelist token account last.
        InitializeUser { whitelist_token: bool },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input
                .split_first()
                .ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                TAG_INITIALIZE => {
                    let admin_controls_prices = read_bool(&mut rest)?;
                    Ok(Instruction::Initialize { admin_controls_prices })
                }
                TAG_INITIALIZE_HISTORY => Ok(Instruction::InitializeHistory),
                TAG_INITIALIZE_ORDER_STATE => Ok(Instruction::InitializeOrderState),
                TAG_INITIALIZE_MARKET => {
                    let market_index = read_u64(&mut rest)?;
                    let base_asset_reserve = read_u128(&mut rest)?;
                    let quote_asset_reserve = read_u128(&mut rest)?;
                    let periodicity = read_i64(&mut rest)?;
                    let peg_multiplier = read_u128(&mut rest)?;
                    let oracle_source = OracleSource::from_u8(read_u8(&mut rest)?)
                        .ok_or(ProgramError::InvalidInstructionData)?;
                    let margin_ratio_initial = read_u32(&mut rest)?;
                    let margin_ratio_partial = read_u32(&mut rest)?;
                    let margin_ratio_maintenance = read_u32(&mut rest)?;
                    Ok(Instruction::InitializeMarket(MarketParams {
                        market_index,
                        base_asset_reserve,
                        quote_asset_reserve,
                        periodicity,
                        peg_multiplier,
                        oracle_source,
                        margin_ratio_initial,
                        margin_ratio_partial,
                        margin_ratio_maintenance,
                    }))
                }
                TAG_INITIALIZE_USER => {
                    let whitelist_token = read_bool(&mut rest)?;
                    Ok(Instruction::InitializeUser { whitelist_token })
                }
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProgramError> {
        if input.len() < n {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(n);
        *input = rest;
        Ok(bytes)
    }

    pub(crate) fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
    }

    fn read_bool(input: &mut &[u8]) -> Result<bool, ProgramError> {
        match read_u8(input)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ProgramError::InvalidInstructionData),
        }
    }

    pub(crate) fn read_u32(input: &mut &[u8]) -> Result<u32, ProgramError> {
        let bytes = take(input, 4)?;
        Ok(u32::from_le_bytes(*array_ref![bytes, 0, 4]))
    }

    pub(crate) fn read_i32(input: &mut &[u8]) -> Result<i32, ProgramError> {
        let bytes = take(input, 4)?;
        Ok(i32::from_le_bytes(*array_ref![bytes, 0, 4]))
    }

    pub(crate) fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        let bytes = take(input, 8)?;
        Ok(u64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    pub(crate) fn read_i64(input: &mut &[u8]) -> Result<i64, ProgramError> {
        let bytes = take(input, 8)?;
        Ok(i64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    pub(crate) fn read_u128(input: &mut &[u8]) -> Result<u128, ProgramError> {
        let bytes = take(input, 16)?;
        Ok(u128::from_le_bytes(*array_ref![bytes, 0, 16]))
    }
}

// 6. mod accounts
pub mod accounts {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};
    use crate::error::ClearingHouseError;

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(ClearingHouseError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(ClearingHouseError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    /// Program-owned, writable account about to be created or mutated.
    pub fn expect_program_writable(ai: &AccountInfo, program_id: &Pubkey) -> Result<(), ProgramError> {
        expect_writable(ai)?;
        expect_owner(ai, program_id)
    }

    pub fn expect_distinct(accounts: &[AccountInfo]) -> Result<(), ProgramError> {
        for (i, a) in accounts.iter().enumerate() {
            if accounts[i + 1..].iter().any(|b| a.key == b.key) {
                return Err(ProgramError::InvalidArgument);
            }
        }
        Ok(())
    }

    pub fn derive_vault_authority(program_id: &Pubkey, vault_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[vault_key.as_ref()], program_id)
    }

    pub fn derive_user_address(program_id: &Pubkey, authority: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"user", authority.as_ref()], program_id)
    }
}

// 7. mod state
pub mod state {
    use bytemuck::{Pod, Zeroable};
    use core::mem::size_of;
    use num_derive::FromPrimitive;
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};
    use crate::constants::*;
    use crate::error::{ClearingHouseError, ClearingHouseResult};
    use crate::verify;

    /// Account record with an 8-byte type tag ahead of its body.
    pub trait Discriminated: Pod {
        const DISCRIMINATOR: [u8; 8];
        const ACCOUNT_LEN: usize = DISCRIMINATOR_LEN + size_of::<Self>();
    }

    pub const MARKETS_DISCRIMINATOR: [u8; 8] = *b"MARKETS_";
    pub const MARKETS_ACCOUNT_LEN: usize = DISCRIMINATOR_LEN + MARKETS_LEN;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct State {
        pub exchange_paused: u8,
        pub funding_paused: u8,
        pub admin_controls_prices: u8,
        pub collateral_vault_authority_nonce: u8,
        pub insurance_vault_authority_nonce: u8,
        pub _padding0: [u8; 11],
        pub admin: [u8; 32],
        pub collateral_mint: [u8; 32],
        pub collateral_vault: [u8; 32],
        pub collateral_vault_authority: [u8; 32],
        pub deposit_history: [u8; 32],
        pub trade_history: [u8; 32],
        pub funding_payment_history: [u8; 32],
        pub funding_rate_history: [u8; 32],
        pub liquidation_history: [u8; 32],
        pub curve_history: [u8; 32],
        pub insurance_vault: [u8; 32],
        pub insurance_vault_authority: [u8; 32],
        pub markets: [u8; 32],
        pub margin_ratio_initial: u128,
        pub margin_ratio_maintenance: u128,
        pub margin_ratio_partial: u128,
        pub partial_liquidation_close_percentage_numerator: u128,
        pub partial_liquidation_close_percentage_denominator: u128,
        pub partial_liquidation_penalty_percentage_numerator: u128,
        pub partial_liquidation_penalty_percentage_denominator: u128,
        pub full_liquidation_penalty_percentage_numerator: u128,
        pub full_liquidation_penalty_percentage_denominator: u128,
        pub partial_liquidation_liquidator_share_denominator: u128,
        pub full_liquidation_liquidator_share_denominator: u128,
        pub fee_structure: FeeStructure,
        pub whitelist_mint: [u8; 32],
        pub discount_mint: [u8; 32],
        pub oracle_guard_rails: OracleGuardRails,
        pub max_deposit: u128,
        pub extended_curve_history: [u8; 32],
        pub order_state: [u8; 32],
        pub _padding1: [u128; 4],
    }

    impl Discriminated for State {
        const DISCRIMINATOR: [u8; 8] = *b"STATE___";
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct FeeStructure {
        pub fee_numerator: u128,
        pub fee_denominator: u128,
        pub discount_token_tiers: [DiscountTokenTier; 4],
        pub referral_discount: ReferralDiscount,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct DiscountTokenTier {
        pub discount_numerator: u128,
        pub discount_denominator: u128,
        pub minimum_balance: u64,
        pub _padding: [u8; 8],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct ReferralDiscount {
        pub referral_reward_numerator: u128,
        pub referral_reward_denominator: u128,
        pub referee_discount_numerator: u128,
        pub referee_discount_denominator: u128,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct OracleGuardRails {
        pub mark_oracle_divergence_numerator: u128,
        pub mark_oracle_divergence_denominator: u128,
        pub confidence_interval_max_size: u128,
        pub too_volatile_ratio: i128,
        pub slots_before_stable: i64,
        pub _padding0: [u8; 8],
        pub use_for_liquidations: u8,
        pub _padding1: [u8; 15],
    }

    /// Keys fixed at `initialize`.
    pub struct StateInit {
        pub admin: Pubkey,
        pub admin_controls_prices: bool,
        pub collateral_mint: Pubkey,
        pub collateral_vault: Pubkey,
        pub collateral_vault_authority: Pubkey,
        pub collateral_vault_authority_nonce: u8,
        pub insurance_vault: Pubkey,
        pub insurance_vault_authority: Pubkey,
        pub insurance_vault_authority_nonce: u8,
        pub markets: Pubkey,
    }

    pub struct HistoryKeys {
        pub deposit_history: Pubkey,
        pub trade_history: Pubkey,
        pub funding_payment_history: Pubkey,
        pub funding_rate_history: Pubkey,
        pub liquidation_history: Pubkey,
        pub curve_history: Pubkey,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Lifecycle {
        Uncreated,
        Created,
        HistoriesAttached,
        OrderStateAttached,
        Complete,
    }

    impl State {
        pub fn new(init: &StateInit) -> Self {
            let mut s = State::zeroed();
            s.admin_controls_prices = init.admin_controls_prices as u8;
            s.collateral_vault_authority_nonce = init.collateral_vault_authority_nonce;
            s.insurance_vault_authority_nonce = init.insurance_vault_authority_nonce;
            s.admin = init.admin.to_bytes();
            s.collateral_mint = init.collateral_mint.to_bytes();
            s.collateral_vault = init.collateral_vault.to_bytes();
            s.collateral_vault_authority = init.collateral_vault_authority.to_bytes();
            s.insurance_vault = init.insurance_vault.to_bytes();
            s.insurance_vault_authority = init.insurance_vault_authority.to_bytes();
            s.markets = init.markets.to_bytes();

            s.margin_ratio_initial = DEFAULT_MARGIN_RATIO_INITIAL;
            s.margin_ratio_maintenance = DEFAULT_MARGIN_RATIO_MAINTENANCE;
            s.margin_ratio_partial = DEFAULT_MARGIN_RATIO_PARTIAL;
            s.partial_liquidation_close_percentage_numerator = DEFAULT_PARTIAL_LIQUIDATION_CLOSE_NUMERATOR;
            s.partial_liquidation_close_percentage_denominator = DEFAULT_PARTIAL_LIQUIDATION_CLOSE_DENOMINATOR;
            s.partial_liquidation_penalty_percentage_numerator = DEFAULT_PARTIAL_LIQUIDATION_PENALTY_NUMERATOR;
            s.partial_liquidation_penalty_percentage_denominator = DEFAULT_PARTIAL_LIQUIDATION_PENALTY_DENOMINATOR;
            s.full_liquidation_penalty_percentage_numerator = DEFAULT_FULL_LIQUIDATION_PENALTY_NUMERATOR;
            s.full_liquidation_penalty_percentage_denominator = DEFAULT_FULL_LIQUIDATION_PENALTY_DENOMINATOR;
            s.partial_liquidation_liquidator_share_denominator =
                DEFAULT_PARTIAL_LIQUIDATION_LIQUIDATOR_SHARE_DENOMINATOR;
            s.full_liquidation_liquidator_share_denominator = DEFAULT_FULL_LIQUIDATION_LIQUIDATOR_SHARE_DENOMINATOR;

            s.fee_structure.fee_numerator = DEFAULT_FEE_NUMERATOR;
            s.fee_structure.fee_denominator = DEFAULT_FEE_DENOMINATOR;
            for (tier, &(num, den, min_balance)) in s
                .fee_structure
                .discount_token_tiers
                .iter_mut()
                .zip(DEFAULT_DISCOUNT_TOKEN_TIERS.iter())
            {
                tier.discount_numerator = num;
                tier.discount_denominator = den;
                tier.minimum_balance = min_balance;
            }
            s.fee_structure.referral_discount = ReferralDiscount {
                referral_reward_numerator: DEFAULT_REFERRER_REWARD_NUMERATOR,
                referral_reward_denominator: DEFAULT_REFERRER_REWARD_DENOMINATOR,
                referee_discount_numerator: DEFAULT_REFEREE_DISCOUNT_NUMERATOR,
                referee_discount_denominator: DEFAULT_REFEREE_DISCOUNT_DENOMINATOR,
            };

            let rails = &mut s.oracle_guard_rails;
            rails.mark_oracle_divergence_numerator = DEFAULT_MARK_ORACLE_DIVERGENCE_NUMERATOR;
            rails.mark_oracle_divergence_denominator = DEFAULT_MARK_ORACLE_DIVERGENCE_DENOMINATOR;
            rails.confidence_interval_max_size = DEFAULT_CONFIDENCE_INTERVAL_MAX_SIZE;
            rails.too_volatile_ratio = DEFAULT_TOO_VOLATILE_RATIO;
            rails.slots_before_stable = DEFAULT_SLOTS_BEFORE_STABLE;
            rails.use_for_liquidations = 1;
            s
        }

        pub fn admin_key(&self) -> Pubkey {
            Pubkey::new_from_array(self.admin)
        }

        pub fn markets_key(&self) -> Pubkey {
            Pubkey::new_from_array(self.markets)
        }

        pub fn order_state_key(&self) -> Pubkey {
            Pubkey::new_from_array(self.order_state)
        }

        /// `None` while onboarding is open to everyone.
        pub fn whitelist_mint_key(&self) -> Option<Pubkey> {
            if verify::key_unset(&self.whitelist_mint) {
                None
            } else {
                Some(Pubkey::new_from_array(self.whitelist_mint))
            }
        }

        fn history_pointers(&self) -> [&[u8; 32]; 6] {
            [
                &self.deposit_history,
                &self.trade_history,
                &self.funding_payment_history,
                &self.funding_rate_history,
                &self.liquidation_history,
                &self.curve_history,
            ]
        }

        pub fn histories_attached(&self) -> bool {
            self.history_pointers().iter().any(|k| !verify::key_unset(k))
        }

        pub fn order_state_attached(&self) -> bool {
            !verify::key_unset(&self.order_state)
        }

        pub fn lifecycle(&self) -> Lifecycle {
            match (self.histories_attached(), self.order_state_attached()) {
                (false, false) => Lifecycle::Created,
                (true, false) => Lifecycle::HistoriesAttached,
                (false, true) => Lifecycle::OrderStateAttached,
                (true, true) => Lifecycle::Complete,
            }
        }

        /// Sets the six history pointers. They are never changed afterwards.
        pub fn attach_histories(&mut self, keys: &HistoryKeys) -> ClearingHouseResult {
            if self.histories_attached() {
                return Err(ClearingHouseError::HistoriesAllInitialized);
            }
            self.deposit_history = keys.deposit_history.to_bytes();
            self.trade_history = keys.trade_history.to_bytes();
            self.funding_payment_history = keys.funding_payment_history.to_bytes();
            self.funding_rate_history = keys.funding_rate_history.to_bytes();
            self.liquidation_history = keys.liquidation_history.to_bytes();
            self.curve_history = keys.curve_history.to_bytes();
            Ok(())
        }

        pub fn attach_order_state(&mut self, order_state: &Pubkey) -> ClearingHouseResult {
            if self.order_state_attached() {
                return Err(ClearingHouseError::OrderStateAlreadyInitialized);
            }
            self.order_state = order_state.to_bytes();
            Ok(())
        }
    }

    /// Lifecycle of a raw state account, `Uncreated` before `initialize`.
    pub fn lifecycle(data: &[u8]) -> Lifecycle {
        match read_record::<State>(data) {
            Ok(s) => s.lifecycle(),
            Err(_) => Lifecycle::Uncreated,
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    #[repr(u8)]
    pub enum OracleSource {
        Pyth = 0,
        Switchboard = 1,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct Market {
        pub base_asset_amount_long: i128,
        pub base_asset_amount_short: i128,
        pub base_asset_amount: i128,
        pub open_interest: u128,
        pub amm: Amm,
        pub margin_ratio_initial: u32,
        pub margin_ratio_partial: u32,
        pub margin_ratio_maintenance: u32,
        pub initialized: u8,
        pub _padding0: [u8; 3],
        pub _padding1: [u128; 4],
    }

    impl Market {
        pub fn is_initialized(&self) -> bool {
            !verify::slot_free(self.initialized)
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct Amm {
        pub base_asset_reserve: u128,
        pub quote_asset_reserve: u128,
        pub sqrt_k: u128,
        pub cumulative_repeg_rebate_long: u128,
        pub cumulative_repeg_rebate_short: u128,
        pub cumulative_funding_rate_long: i128,
        pub cumulative_funding_rate_short: i128,
        pub last_funding_rate: i128,
        pub last_funding_rate_ts: i64,
        pub funding_period: i64,
        pub peg_multiplier: u128,
        pub total_fee: u128,
        pub total_fee_minus_distributions: u128,
        pub total_fee_withdrawn: u128,
        pub minimum_base_asset_trade_size: u128,
        pub minimum_quote_asset_trade_size: u128,
        pub last_mark_price_twap: u128,
        pub last_mark_price_twap_ts: i64,
        pub last_oracle_price_twap_ts: i64,
        pub last_oracle_price_twap: i128,
        pub oracle: [u8; 32],
        pub last_oracle_price: i128,
        pub base_spread: u16,
        pub oracle_source: u8,
        pub _padding: [u8; 13],
    }

    impl Amm {
        pub fn mark_price(&self) -> ClearingHouseResult<u128> {
            crate::math::calculate_price(self.quote_asset_reserve, self.base_asset_reserve, self.peg_multiplier)
        }

        pub fn oracle_key(&self) -> Pubkey {
            Pubkey::new_from_array(self.oracle)
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct OrderState {
        pub order_history: [u8; 32],
        pub order_filler_reward_structure: OrderFillerRewardStructure,
        pub min_order_quote_asset_amount: u128,
    }

    impl Discriminated for OrderState {
        const DISCRIMINATOR: [u8; 8] = *b"ORDSTATE";
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct OrderFillerRewardStructure {
        pub reward_numerator: u128,
        pub reward_denominator: u128,
        pub time_based_reward_lower_bound: u128,
    }

    impl OrderState {
        pub fn new(order_history: &Pubkey) -> Self {
            OrderState {
                order_history: order_history.to_bytes(),
                order_filler_reward_structure: OrderFillerRewardStructure {
                    reward_numerator: DEFAULT_FILLER_REWARD_NUMERATOR,
                    reward_denominator: DEFAULT_FILLER_REWARD_DENOMINATOR,
                    time_based_reward_lower_bound: DEFAULT_TIME_BASED_REWARD_LOWER_BOUND,
                },
                min_order_quote_asset_amount: DEFAULT_MIN_ORDER_QUOTE_ASSET_AMOUNT,
            }
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct User {
        pub authority: [u8; 32],
        pub collateral: u128,
        pub cumulative_deposits: i128,
        pub total_fee_paid: u64,
        pub total_fee_rebate: u64,
        pub total_token_discount: u128,
        pub total_referral_reward: u128,
        pub total_referee_discount: u128,
        pub positions: [u8; 32],
        pub settled_position_value: u128,
        pub collateral_claimed: u64,
        pub last_collateral_available_to_claim: u64,
        pub forgo_position_settlement: u8,
        pub has_settled_position: u8,
        pub _padding: [u8; 14],
    }

    impl Discriminated for User {
        const DISCRIMINATOR: [u8; 8] = *b"USER____";
    }

    impl User {
        pub fn new(authority: &Pubkey, positions: &Pubkey) -> Self {
            let mut u = User::zeroed();
            u.authority = authority.to_bytes();
            u.positions = positions.to_bytes();
            u
        }

        pub fn authority_key(&self) -> Pubkey {
            Pubkey::new_from_array(self.authority)
        }

        pub fn positions_key(&self) -> Pubkey {
            Pubkey::new_from_array(self.positions)
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct MarketPosition {
        pub market_index: u64,
        pub last_funding_rate_ts: i64,
        pub base_asset_amount: i128,
        pub quote_asset_amount: i128,
        pub last_cumulative_funding_rate: i128,
        pub last_cumulative_repeg_rebate: i128,
        pub open_orders: u128,
        pub _padding: [u128; 7],
    }

    impl MarketPosition {
        pub fn is_open_position(&self) -> bool {
            self.base_asset_amount != 0
        }

        pub fn has_open_order(&self) -> bool {
            self.open_orders != 0
        }

        pub fn is_available(&self) -> bool {
            !self.is_open_position() && !self.has_open_order()
        }

        /// Active position or resting order in `market_index`.
        pub fn is_for(&self, market_index: u64) -> bool {
            self.market_index == market_index && !self.is_available()
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct UserPositions {
        pub user: [u8; 32],
        pub positions: [MarketPosition; MAX_USER_POSITIONS],
    }

    impl Discriminated for UserPositions {
        const DISCRIMINATOR: [u8; 8] = *b"USERPOS_";
    }

    impl UserPositions {
        pub fn new(user: &Pubkey) -> Self {
            let mut p = UserPositions::zeroed();
            p.user = user.to_bytes();
            p
        }

        pub fn user_key(&self) -> Pubkey {
            Pubkey::new_from_array(self.user)
        }

        pub fn find(&self, market_index: u64) -> Option<&MarketPosition> {
            self.positions.iter().find(|p| p.is_for(market_index))
        }

        pub fn first_available(&self) -> Option<usize> {
            self.positions.iter().position(|p| p.is_available())
        }
    }

    // Records are copied in and out: the discriminator leaves bodies unaligned.

    pub fn expect_account_len(data: &[u8], len: usize) -> Result<(), ProgramError> {
        if data.len() != len {
            return Err(ClearingHouseError::InvalidAccountLen.into());
        }
        Ok(())
    }

    pub fn has_discriminator(data: &[u8], discriminator: &[u8; 8]) -> bool {
        data.len() >= DISCRIMINATOR_LEN && data[..DISCRIMINATOR_LEN] == discriminator[..]
    }

    /// Storage never claimed by any record type.
    pub fn expect_uninitialized(data: &[u8]) -> Result<(), ProgramError> {
        if !has_discriminator(data, &[0u8; 8]) {
            return Err(ClearingHouseError::AccountAlreadyInitialized.into());
        }
        Ok(())
    }

    pub fn read_record<T: Discriminated>(data: &[u8]) -> Result<T, ProgramError> {
        expect_account_len(data, T::ACCOUNT_LEN)?;
        if !has_discriminator(data, &T::DISCRIMINATOR) {
            return Err(ClearingHouseError::AccountNotInitialized.into());
        }
        Ok(bytemuck::pod_read_unaligned(&data[DISCRIMINATOR_LEN..]))
    }

    pub fn write_record<T: Discriminated>(data: &mut [u8], record: &T) -> Result<(), ProgramError> {
        expect_account_len(data, T::ACCOUNT_LEN)?;
        data[..DISCRIMINATOR_LEN].copy_from_slice(&T::DISCRIMINATOR);
        data[DISCRIMINATOR_LEN..].copy_from_slice(bytemuck::bytes_of(record));
        Ok(())
    }

    pub fn market_offset(market_index: u64) -> ClearingHouseResult<usize> {
        let index = usize::try_from(market_index).map_err(|_| ClearingHouseError::InvalidMarketIndex)?;
        if index >= MAX_MARKETS {
            return Err(ClearingHouseError::InvalidMarketIndex);
        }
        Ok(DISCRIMINATOR_LEN + index * MARKET_LEN)
    }

    fn expect_markets(data: &[u8]) -> Result<(), ProgramError> {
        expect_account_len(data, MARKETS_ACCOUNT_LEN)?;
        if !has_discriminator(data, &MARKETS_DISCRIMINATOR) {
            return Err(ClearingHouseError::AccountNotInitialized.into());
        }
        Ok(())
    }

    /// Tags zeroed storage as the market table; every slot stays zero.
    pub fn init_markets(data: &mut [u8]) -> Result<(), ProgramError> {
        expect_account_len(data, MARKETS_ACCOUNT_LEN)?;
        expect_uninitialized(data)?;
        data[..DISCRIMINATOR_LEN].copy_from_slice(&MARKETS_DISCRIMINATOR);
        data[DISCRIMINATOR_LEN..].fill(0);
        Ok(())
    }

    pub fn read_market(data: &[u8], market_index: u64) -> Result<Market, ProgramError> {
        expect_markets(data)?;
        let off = market_offset(market_index)?;
        Ok(bytemuck::pod_read_unaligned(&data[off..off + MARKET_LEN]))
    }

    pub fn write_market(data: &mut [u8], market_index: u64, market: &Market) -> Result<(), ProgramError> {
        expect_markets(data)?;
        let off = market_offset(market_index)?;
        data[off..off + MARKET_LEN].copy_from_slice(bytemuck::bytes_of(market));
        Ok(())
    }
}

// 8. mod history
pub mod history {
    use bytemuck::{Pod, Zeroable};
    use core::marker::PhantomData;
    use core::mem::size_of;
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive as _;
    use solana_program::program_error::ProgramError;
    use crate::constants::{DISCRIMINATOR_LEN, HISTORY_CAPACITY};
    use crate::error::{ClearingHouseError, ClearingHouseResult};
    use crate::state;
    use crate::{math_error, verify};

    const HEAD_OFF: usize = DISCRIMINATOR_LEN;
    const LAST_ORDER_ID_OFF: usize = DISCRIMINATOR_LEN + 16;

    /// Fixed-size entry of a ring log.
    pub trait HistoryRecord: Pod {
        const DISCRIMINATOR: [u8; 8];
        /// Header bytes between the discriminator and the first record.
        const HEADER_LEN: usize = 16;

        fn record_id(&self) -> u128;
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    #[repr(u8)]
    pub enum PositionDirection {
        Long = 0,
        Short = 1,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    #[repr(u8)]
    pub enum DepositDirection {
        Deposit = 0,
        Withdraw = 1,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    #[repr(u8)]
    pub enum OrderAction {
        Place = 0,
        Cancel = 1,
        Fill = 2,
        Expire = 3,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    #[repr(u8)]
    pub enum OrderType {
        Market = 0,
        Limit = 1,
        TriggerMarket = 2,
        TriggerLimit = 3,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct TradeRecord {
        pub ts: i64,
        pub market_index: u64,
        pub record_id: u128,
        pub user_authority: [u8; 32],
        pub user: [u8; 32],
        pub base_asset_amount: u128,
        pub quote_asset_amount: u128,
        pub mark_price_before: u128,
        pub mark_price_after: u128,
        pub fee: i128,
        pub quote_asset_amount_surplus: u128,
        pub referee_discount: u128,
        pub token_discount: u128,
        pub oracle_price: i128,
        pub liquidation: u8,
        pub direction: u8,
        pub _padding: [u8; 14],
    }

    impl TradeRecord {
        pub fn direction(&self) -> Option<PositionDirection> {
            PositionDirection::from_u8(self.direction)
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct DepositRecord {
        pub ts: i64,
        pub amount: u64,
        pub record_id: u128,
        pub user_authority: [u8; 32],
        pub user: [u8; 32],
        pub collateral_before: u128,
        pub cumulative_deposits_before: i128,
        pub direction: u8,
        pub _padding: [u8; 15],
    }

    impl DepositRecord {
        pub fn direction(&self) -> Option<DepositDirection> {
            DepositDirection::from_u8(self.direction)
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct FundingRateRecord {
        pub ts: i64,
        pub market_index: u64,
        pub record_id: u128,
        pub funding_rate: i128,
        pub cumulative_funding_rate_long: i128,
        pub cumulative_funding_rate_short: i128,
        pub oracle_price_twap: i128,
        pub mark_price_twap: u128,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct FundingPaymentRecord {
        pub ts: i64,
        pub market_index: u64,
        pub record_id: u128,
        pub user_authority: [u8; 32],
        pub user: [u8; 32],
        pub funding_payment: i128,
        pub base_asset_amount: i128,
        pub amm_cumulative_funding_long: i128,
        pub amm_cumulative_funding_short: i128,
        pub user_last_cumulative_funding: i128,
        pub user_last_funding_rate_ts: i64,
        pub _padding: [u8; 8],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct LiquidationRecord {
        pub record_id: u128,
        pub user_authority: [u8; 32],
        pub user: [u8; 32],
        pub liquidator: [u8; 32],
        pub base_asset_value: u128,
        pub base_asset_value_closed: u128,
        pub liquidation_fee: u128,
        pub fee_to_liquidator: u64,
        pub fee_to_insurance_fund: u64,
        pub total_collateral: u128,
        pub collateral: u128,
        pub unrealized_pnl: i128,
        pub margin_ratio: u128,
        pub ts: i64,
        pub partial: u8,
        pub _padding: [u8; 7],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct CurveRecord {
        pub ts: i64,
        pub market_index: u64,
        pub record_id: u128,
        pub peg_multiplier_before: u128,
        pub base_asset_reserve_before: u128,
        pub quote_asset_reserve_before: u128,
        pub sqrt_k_before: u128,
        pub peg_multiplier_after: u128,
        pub base_asset_reserve_after: u128,
        pub quote_asset_reserve_after: u128,
        pub sqrt_k_after: u128,
        pub base_asset_amount_long: u128,
        pub base_asset_amount_short: u128,
        pub base_asset_amount: i128,
        pub open_interest: u128,
        pub total_fee: u128,
        pub total_fee_minus_distributions: u128,
        pub adjustment_cost: i128,
        pub oracle_price: i128,
        pub trade_record: u128,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct Order {
        pub status: u8,
        pub order_type: u8,
        pub direction: u8,
        pub user_order_id: u8,
        pub reduce_only: u8,
        pub post_only: u8,
        pub immediate_or_cancel: u8,
        pub discount_tier: u8,
        pub trigger_condition: u8,
        pub _padding: [u8; 7],
        pub ts: i64,
        pub market_index: u64,
        pub order_id: u128,
        pub price: u128,
        pub user_base_asset_amount: i128,
        pub quote_asset_amount: u128,
        pub base_asset_amount: u128,
        pub base_asset_amount_filled: u128,
        pub quote_asset_amount_filled: u128,
        pub fee: i128,
        pub trigger_price: u128,
        pub referrer: [u8; 32],
        pub oracle_price_offset: i128,
    }

    impl Order {
        pub fn order_type(&self) -> Option<OrderType> {
            OrderType::from_u8(self.order_type)
        }

        pub fn direction(&self) -> Option<PositionDirection> {
            PositionDirection::from_u8(self.direction)
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct OrderRecord {
        pub ts: i64,
        pub action: u8,
        pub _padding: [u8; 7],
        pub record_id: u128,
        pub user: [u8; 32],
        pub authority: [u8; 32],
        pub order: Order,
        pub filler: [u8; 32],
        pub trade_record_id: u128,
        pub base_asset_amount_filled: u128,
        pub quote_asset_amount_filled: u128,
        pub fee: i128,
        pub filler_reward: u128,
        pub quote_asset_amount_surplus: u128,
    }

    impl OrderRecord {
        pub fn action(&self) -> Option<OrderAction> {
            OrderAction::from_u8(self.action)
        }
    }

    macro_rules! history_record {
        ($record:ty, $disc:expr) => {
            impl HistoryRecord for $record {
                const DISCRIMINATOR: [u8; 8] = *$disc;

                fn record_id(&self) -> u128 {
                    self.record_id
                }
            }
        };
        ($record:ty, $disc:expr, header = $header:expr) => {
            impl HistoryRecord for $record {
                const DISCRIMINATOR: [u8; 8] = *$disc;
                const HEADER_LEN: usize = $header;

                fn record_id(&self) -> u128 {
                    self.record_id
                }
            }
        };
    }

    history_record!(TradeRecord, b"TRADEHST");
    history_record!(DepositRecord, b"DEPOSHST");
    history_record!(FundingRateRecord, b"FRATEHST");
    history_record!(FundingPaymentRecord, b"FPAYHIST");
    history_record!(LiquidationRecord, b"LIQDHIST");
    history_record!(CurveRecord, b"CURVEHST");
    // head, padding, last_order_id
    history_record!(OrderRecord, b"ORDERHST", header = 32);

    /// Fixed-capacity circular log laid over an account's bytes.
    ///
    /// `head` is the slot the next append writes; once all slots are used
    /// each append overwrites the oldest record.
    pub struct RingLog<'a, R: HistoryRecord> {
        data: &'a mut [u8],
        _record: PhantomData<R>,
    }

    pub type TradeHistory<'a> = RingLog<'a, TradeRecord>;
    pub type DepositHistory<'a> = RingLog<'a, DepositRecord>;
    pub type FundingRateHistory<'a> = RingLog<'a, FundingRateRecord>;
    pub type FundingPaymentHistory<'a> = RingLog<'a, FundingPaymentRecord>;
    pub type LiquidationHistory<'a> = RingLog<'a, LiquidationRecord>;
    pub type CurveHistory<'a> = RingLog<'a, CurveRecord>;
    pub type OrderHistory<'a> = RingLog<'a, OrderRecord>;

    impl<'a, R: HistoryRecord> RingLog<'a, R> {
        pub const BODY_LEN: usize = R::HEADER_LEN + HISTORY_CAPACITY * size_of::<R>();
        pub const ACCOUNT_LEN: usize = DISCRIMINATOR_LEN + Self::BODY_LEN;
        const RECORDS_OFF: usize = DISCRIMINATOR_LEN + R::HEADER_LEN;

        /// Storage of the exact size that no record type has claimed yet.
        pub fn check_uninitialized(data: &[u8]) -> Result<(), ProgramError> {
            state::expect_account_len(data, Self::ACCOUNT_LEN)?;
            state::expect_uninitialized(data)
        }

        pub fn init(data: &'a mut [u8]) -> Result<Self, ProgramError> {
            Self::check_uninitialized(data)?;
            data[..DISCRIMINATOR_LEN].copy_from_slice(&R::DISCRIMINATOR);
            data[DISCRIMINATOR_LEN..Self::RECORDS_OFF].fill(0);
            Ok(RingLog { data, _record: PhantomData })
        }

        pub fn load(data: &'a mut [u8]) -> Result<Self, ProgramError> {
            state::expect_account_len(data, Self::ACCOUNT_LEN)?;
            if !state::has_discriminator(data, &R::DISCRIMINATOR) {
                return Err(ClearingHouseError::AccountNotInitialized.into());
            }
            let log = RingLog { data, _record: PhantomData };
            if log.head() >= HISTORY_CAPACITY as u64 {
                return Err(ProgramError::InvalidAccountData);
            }
            Ok(log)
        }

        pub fn head(&self) -> u64 {
            bytemuck::pod_read_unaligned(&self.data[HEAD_OFF..HEAD_OFF + 8])
        }

        fn set_head(&mut self, head: u64) {
            self.data[HEAD_OFF..HEAD_OFF + 8].copy_from_slice(&head.to_le_bytes());
        }

        pub fn capacity(&self) -> usize {
            HISTORY_CAPACITY
        }

        fn record_off(index: usize) -> usize {
            Self::RECORDS_OFF + index * size_of::<R>()
        }

        pub fn get(&self, index: usize) -> Option<R> {
            if index >= HISTORY_CAPACITY {
                return None;
            }
            let off = Self::record_off(index);
            Some(bytemuck::pod_read_unaligned(&self.data[off..off + size_of::<R>()]))
        }

        /// Writes `record` at `head` and returns that slot.
        pub fn append(&mut self, record: R) -> u64 {
            let slot = self.head();
            let off = Self::record_off(slot as usize);
            self.data[off..off + size_of::<R>()].copy_from_slice(bytemuck::bytes_of(&record));
            self.set_head(verify::ring_next(slot, HISTORY_CAPACITY as u64));
            slot
        }

        /// One past the record id in the most recently written slot.
        pub fn next_record_id(&self) -> ClearingHouseResult<u128> {
            let prev = verify::ring_prev(self.head(), HISTORY_CAPACITY as u64) as usize;
            let last = self.get(prev).map(|r| r.record_id()).unwrap_or(0);
            last.checked_add(1).ok_or_else(math_error!())
        }
    }

    impl<'a> RingLog<'a, OrderRecord> {
        pub fn last_order_id(&self) -> u128 {
            bytemuck::pod_read_unaligned(&self.data[LAST_ORDER_ID_OFF..LAST_ORDER_ID_OFF + 16])
        }

        pub fn next_order_id(&mut self) -> ClearingHouseResult<u128> {
            let next = self.last_order_id().checked_add(1).ok_or_else(math_error!())?;
            self.data[LAST_ORDER_ID_OFF..LAST_ORDER_ID_OFF + 16].copy_from_slice(&next.to_le_bytes());
            Ok(next)
        }

        /// Stamps a fresh order id into the record, appends it, returns `(slot, order_id)`.
        pub fn append_order(&mut self, mut record: OrderRecord) -> ClearingHouseResult<(u64, u128)> {
            let order_id = self.next_order_id()?;
            record.order.order_id = order_id;
            Ok((self.append(record), order_id))
        }
    }
}

// 9. mod oracle
pub mod oracle {
    use arrayref::{array_mut_ref, array_ref};
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};
    use crate::error::{ClearingHouseError, ClearingHouseResult};
    use crate::math;

    // Price update account: disc(8) write_authority(32) verification_level(2) feed_id(32) message
    pub const PRICE_FEED_LEN: usize = 134;
    pub const PRICE_FEED_DISCRIMINATOR: [u8; 8] = *b"PRICEUPD";
    pub const WRITE_AUTHORITY_OFF: usize = 8;
    pub const VERIFICATION_LEVEL_OFF: usize = 40;
    pub const FEED_ID_OFF: usize = 42;
    pub const PRICE_OFF: usize = 74;
    pub const CONF_OFF: usize = 82;
    pub const EXPONENT_OFF: usize = 90;
    pub const PUBLISH_TIME_OFF: usize = 94;
    pub const PREV_PUBLISH_TIME_OFF: usize = 102;
    pub const EMA_PRICE_OFF: usize = 110;
    pub const EMA_CONF_OFF: usize = 118;
    pub const POSTED_SLOT_OFF: usize = 126;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PriceFeedSnapshot {
        pub price: i64,
        pub conf: u64,
        pub exponent: i32,
        pub publish_time: i64,
        pub ema_price: i64,
        pub ema_conf: u64,
        pub posted_slot: u64,
    }

    pub fn parse_price_feed(data: &[u8]) -> ClearingHouseResult<PriceFeedSnapshot> {
        if data.len() < PRICE_FEED_LEN || data[..8] != PRICE_FEED_DISCRIMINATOR {
            return Err(ClearingHouseError::FailToLoadOracle);
        }
        Ok(PriceFeedSnapshot {
            price: i64::from_le_bytes(*array_ref![data, PRICE_OFF, 8]),
            conf: u64::from_le_bytes(*array_ref![data, CONF_OFF, 8]),
            exponent: i32::from_le_bytes(*array_ref![data, EXPONENT_OFF, 4]),
            publish_time: i64::from_le_bytes(*array_ref![data, PUBLISH_TIME_OFF, 8]),
            ema_price: i64::from_le_bytes(*array_ref![data, EMA_PRICE_OFF, 8]),
            ema_conf: u64::from_le_bytes(*array_ref![data, EMA_CONF_OFF, 8]),
            posted_slot: u64::from_le_bytes(*array_ref![data, POSTED_SLOT_OFF, 8]),
        })
    }

    pub fn read_price_feed(ai: &AccountInfo) -> Result<PriceFeedSnapshot, ProgramError> {
        let data = ai
            .try_borrow_data()
            .map_err(|_| ClearingHouseError::FailToLoadOracle)?;
        Ok(parse_price_feed(&data)?)
    }

    impl PriceFeedSnapshot {
        /// `(price, ema_price)` in mark precision.
        pub fn scaled_prices(&self) -> ClearingHouseResult<(i128, i128)> {
            let price = math::scale_to_mark_price(self.price, self.exponent)?;
            let ema_price = math::scale_to_mark_price(self.ema_price, self.exponent)?;
            Ok((price, ema_price))
        }

        pub fn scaled_confidence(&self) -> ClearingHouseResult<u128> {
            let (mul, div) = math::mark_price_scale(self.exponent)?;
            math::cast_to_u128(self.conf)?
                .checked_mul(mul)
                .ok_or_else(crate::math_error!())?
                .checked_div(div)
                .ok_or_else(crate::math_error!())
        }
    }

    // Callers check `data.len() >= PRICE_FEED_LEN` first.

    pub fn write_i64(data: &mut [u8], off: usize, v: i64) {
        *array_mut_ref![data, off, 8] = v.to_le_bytes();
    }

    pub fn write_u64(data: &mut [u8], off: usize, v: u64) {
        *array_mut_ref![data, off, 8] = v.to_le_bytes();
    }

    pub fn write_i32(data: &mut [u8], off: usize, v: i32) {
        *array_mut_ref![data, off, 4] = v.to_le_bytes();
    }
}

// 10. mod market
pub mod market {
    use bytemuck::Zeroable;
    use solana_program::pubkey::Pubkey;
    use crate::constants::MINIMUM_TRADE_SIZE;
    use crate::error::{ClearingHouseError, ClearingHouseResult};
    use crate::math;
    use crate::oracle::PriceFeedSnapshot;
    use crate::state::{Amm, Market, OracleSource};
    use crate::verify;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MarketParams {
        pub market_index: u64,
        pub base_asset_reserve: u128,
        pub quote_asset_reserve: u128,
        pub periodicity: i64,
        pub peg_multiplier: u128,
        pub oracle_source: OracleSource,
        pub margin_ratio_initial: u32,
        pub margin_ratio_partial: u32,
        pub margin_ratio_maintenance: u32,
    }

    /// Requires `MIN <= maintenance <= partial <= initial <= MAX`.
    pub fn validate_margin_ratios(
        margin_ratio_initial: u32,
        margin_ratio_partial: u32,
        margin_ratio_maintenance: u32,
    ) -> ClearingHouseResult {
        if !verify::margin_ratio_in_range(margin_ratio_initial) {
            return Err(ClearingHouseError::InvalidMarginRatio);
        }
        if margin_ratio_initial < margin_ratio_partial {
            return Err(ClearingHouseError::InvalidMarginRatio);
        }
        if !verify::margin_ratio_in_range(margin_ratio_partial) {
            return Err(ClearingHouseError::InvalidMarginRatio);
        }
        if margin_ratio_partial < margin_ratio_maintenance {
            return Err(ClearingHouseError::InvalidMarginRatio);
        }
        if !verify::margin_ratio_in_range(margin_ratio_maintenance) {
            return Err(ClearingHouseError::InvalidMarginRatio);
        }
        Ok(())
    }

    /// Checks run before the oracle is read. The first failure wins.
    pub fn validate_new_market(existing: &Market, params: &MarketParams) -> ClearingHouseResult {
        if existing.is_initialized() {
            return Err(ClearingHouseError::MarketIndexAlreadyInitialized);
        }
        if !verify::initial_peg_ok(params.base_asset_reserve, params.quote_asset_reserve) {
            return Err(ClearingHouseError::InvalidInitialPeg);
        }
        math::checked_reserve_product(params.base_asset_reserve, params.quote_asset_reserve)?;
        validate_margin_ratios(
            params.margin_ratio_initial,
            params.margin_ratio_partial,
            params.margin_ratio_maintenance,
        )?;
        if params.oracle_source != OracleSource::Pyth {
            return Err(ClearingHouseError::InvalidOracleSource);
        }
        Ok(())
    }

    pub fn new_market(
        params: &MarketParams,
        feed: &PriceFeedSnapshot,
        oracle: &Pubkey,
        now: i64,
    ) -> ClearingHouseResult<Market> {
        let (last_oracle_price, last_oracle_price_twap) = feed.scaled_prices()?;
        let last_mark_price_twap = math::calculate_price(
            params.quote_asset_reserve,
            params.base_asset_reserve,
            params.peg_multiplier,
        )?;

        let mut amm = Amm::zeroed();
        amm.base_asset_reserve = params.base_asset_reserve;
        amm.quote_asset_reserve = params.quote_asset_reserve;
        amm.sqrt_k = params.base_asset_reserve;
        amm.last_funding_rate_ts = now;
        amm.funding_period = params.periodicity;
        amm.peg_multiplier = params.peg_multiplier;
        amm.minimum_base_asset_trade_size = MINIMUM_TRADE_SIZE;
        amm.minimum_quote_asset_trade_size = MINIMUM_TRADE_SIZE;
        amm.last_mark_price_twap = last_mark_price_twap;
        amm.last_mark_price_twap_ts = now;
        amm.last_oracle_price_twap_ts = now;
        amm.last_oracle_price_twap = last_oracle_price_twap;
        amm.oracle = oracle.to_bytes();
        amm.last_oracle_price = last_oracle_price;
        amm.oracle_source = params.oracle_source as u8;

        let mut market = Market::zeroed();
        market.amm = amm;
        market.margin_ratio_initial = params.margin_ratio_initial;
        market.margin_ratio_partial = params.margin_ratio_partial;
        market.margin_ratio_maintenance = params.margin_ratio_maintenance;
        market.initialized = 1;
        Ok(market)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn margin_chain_examples() {
            assert!(validate_margin_ratios(300, 250, 200).is_ok());
            assert!(validate_margin_ratios(2000, 625, 500).is_ok());
            assert!(validate_margin_ratios(10000, 10000, 10000).is_ok());
            assert!(validate_margin_ratios(199, 250, 200).is_err());
            assert!(validate_margin_ratios(300, 199, 200).is_err());
            assert!(validate_margin_ratios(300, 250, 199).is_err());
            assert!(validate_margin_ratios(249, 250, 200).is_err());
            assert!(validate_margin_ratios(300, 200, 201).is_err());
            assert!(validate_margin_ratios(10001, 500, 400).is_err());
        }

        fn params() -> MarketParams {
            MarketParams {
                market_index: 0,
                base_asset_reserve: 1_000_000,
                quote_asset_reserve: 1_000_000,
                periodicity: 3600,
                peg_multiplier: 1000,
                oracle_source: OracleSource::Pyth,
                margin_ratio_initial: 2000,
                margin_ratio_partial: 625,
                margin_ratio_maintenance: 500,
            }
        }

        #[test]
        fn first_failing_check_wins() {
            let mut taken = Market::zeroed();
            taken.initialized = 1;
            let mut p = params();
            p.quote_asset_reserve += 1;
            p.margin_ratio_initial = 1;
            assert_eq!(
                validate_new_market(&taken, &p),
                Err(ClearingHouseError::MarketIndexAlreadyInitialized)
            );
            assert_eq!(
                validate_new_market(&Market::zeroed(), &p),
                Err(ClearingHouseError::InvalidInitialPeg)
            );

            let mut p = params();
            p.base_asset_reserve = 1 << 96;
            p.quote_asset_reserve = 1 << 96;
            p.margin_ratio_initial = 1;
            assert_eq!(validate_new_market(&Market::zeroed(), &p), Err(ClearingHouseError::MathError));

            let mut p = params();
            p.margin_ratio_initial = 1;
            p.oracle_source = OracleSource::Switchboard;
            assert_eq!(
                validate_new_market(&Market::zeroed(), &p),
                Err(ClearingHouseError::InvalidMarginRatio)
            );

            let mut p = params();
            p.oracle_source = OracleSource::Switchboard;
            assert_eq!(
                validate_new_market(&Market::zeroed(), &p),
                Err(ClearingHouseError::InvalidOracleSource)
            );
        }

        #[test]
        fn new_market_fields() {
            let feed = PriceFeedSnapshot {
                price: 2_500_000,
                conf: 1_000,
                exponent: -6,
                publish_time: 0,
                ema_price: 2_400_000,
                ema_conf: 1_000,
                posted_slot: 0,
            };
            let oracle = Pubkey::new_unique();
            let m = new_market(&params(), &feed, &oracle, 1_700_000_000).unwrap();
            assert!(m.is_initialized());
            assert_eq!(m.amm.sqrt_k, 1_000_000);
            assert_eq!(m.amm.last_mark_price_twap, crate::constants::MARK_PRICE_PRECISION);
            assert_eq!(m.amm.mark_price().unwrap(), crate::constants::MARK_PRICE_PRECISION);
            assert_eq!(m.amm.last_oracle_price, 25_000_000_000);
            assert_eq!(m.amm.last_oracle_price_twap, 24_000_000_000);
            assert_eq!(m.amm.last_funding_rate_ts, 1_700_000_000);
            assert_eq!(m.amm.last_mark_price_twap_ts, 1_700_000_000);
            assert_eq!(m.amm.last_oracle_price_twap_ts, 1_700_000_000);
            assert_eq!(m.amm.minimum_base_asset_trade_size, MINIMUM_TRADE_SIZE);
            assert_eq!(m.amm.oracle_key(), oracle);
            assert_eq!(m.base_asset_amount, 0);
            assert_eq!(m.open_interest, 0);
        }
    }
}

// 11. mod processor
pub mod processor {
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        msg,
        program_error::ProgramError,
        program_pack::Pack,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };
    use spl_token::state::Account as TokenAccount;
    use crate::{
        accounts,
        error::ClearingHouseError,
        history::{
            CurveHistory, DepositHistory, FundingPaymentHistory, FundingRateHistory,
            LiquidationHistory, OrderHistory, TradeHistory,
        },
        ix::Instruction,
        market::{self, MarketParams},
        oracle,
        state::{
            self, Discriminated, HistoryKeys, OrderState, State, StateInit, User, UserPositions,
            MARKETS_ACCOUNT_LEN,
        },
        verify,
    };

    macro_rules! cu_checkpoint {
        ($label:expr) => {
            #[cfg(feature = "cu-audit")]
            {
                msg!(concat!("CU_CHECKPOINT: ", $label));
                solana_program::log::sol_log_compute_units();
            }
        };
    }

    fn require_admin(state: &State, a_admin: &AccountInfo) -> Result<(), ProgramError> {
        accounts::expect_signer(a_admin)?;
        if !verify::admin_ok(state.admin, a_admin.key.to_bytes()) {
            return Err(ClearingHouseError::ConstraintHasOne.into());
        }
        Ok(())
    }

    fn vault_ok(a_vault: &AccountInfo, expected_owner: &Pubkey, expected_mint: &Pubkey) -> bool {
        if a_vault.owner != &spl_token::ID || a_vault.data_len() != TokenAccount::LEN {
            return false;
        }
        let Ok(data) = a_vault.try_borrow_data() else {
            return false;
        };
        match TokenAccount::unpack(&data) {
            Ok(tok) => tok.mint == *expected_mint && tok.owner == *expected_owner,
            Err(_) => false,
        }
    }

    /// Whitelist gate for onboarding. The token account must be one of the
    /// whitelist mint's, owned by the signer, and hold a non-zero balance.
    fn check_whitelist_token(
        whitelist_mint: &Pubkey,
        authority: &Pubkey,
        whitelist_token: Option<&AccountInfo>,
    ) -> Result<(), ProgramError> {
        let a_token = whitelist_token.ok_or(ClearingHouseError::FailToFindWhitelistToken)?;
        if a_token.owner != &spl_token::ID {
            return Err(ClearingHouseError::InvalidWhitelistToken.into());
        }
        let tok = {
            let data = a_token.try_borrow_data()?;
            TokenAccount::unpack(&data).map_err(|_| ClearingHouseError::InvalidWhitelistToken)?
        };
        if tok.mint != *whitelist_mint || tok.owner != *authority {
            return Err(ClearingHouseError::InvalidWhitelistToken.into());
        }
        if tok.amount == 0 {
            return Err(ClearingHouseError::WhitelistTokenNoBalance.into());
        }
        Ok(())
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::Initialize { admin_controls_prices } => {
                cu_checkpoint!("initialize_start");
                initialize(program_id, accounts, admin_controls_prices)?;
                cu_checkpoint!("initialize_end");
            }
            Instruction::InitializeHistory => {
                cu_checkpoint!("initialize_history_start");
                initialize_history(program_id, accounts)?;
                cu_checkpoint!("initialize_history_end");
            }
            Instruction::InitializeOrderState => {
                cu_checkpoint!("initialize_order_state_start");
                initialize_order_state(program_id, accounts)?;
                cu_checkpoint!("initialize_order_state_end");
            }
            Instruction::InitializeMarket(params) => {
                cu_checkpoint!("initialize_market_start");
                initialize_market(program_id, accounts, &params)?;
                cu_checkpoint!("initialize_market_end");
            }
            Instruction::InitializeUser { whitelist_token } => {
                cu_checkpoint!("initialize_user_start");
                initialize_user(program_id, accounts, whitelist_token)?;
                cu_checkpoint!("initialize_user_end");
            }
        }
        Ok(())
    }

    fn initialize(program_id: &Pubkey, accounts: &[AccountInfo], admin_controls_prices: bool) -> ProgramResult {
        accounts::expect_len(accounts, 8)?;
        let a_admin = &accounts[0];
        let a_state = &accounts[1];
        let a_collateral_mint = &accounts[2];
        let a_collateral_vault = &accounts[3];
        let a_collateral_vault_authority = &accounts[4];
        let a_insurance_vault = &accounts[5];
        let a_insurance_vault_authority = &accounts[6];
        let a_markets = &accounts[7];

        accounts::expect_signer(a_admin)?;
        accounts::expect_program_writable(a_state, program_id)?;
        accounts::expect_program_writable(a_markets, program_id)?;

        let mut state_data = a_state.try_borrow_mut_data()?;
        state::expect_account_len(&state_data, State::ACCOUNT_LEN)?;
        if state::has_discriminator(&state_data, &State::DISCRIMINATOR) {
            return Err(ClearingHouseError::StateAlreadyInitialized.into());
        }
        state::expect_uninitialized(&state_data)?;

        let mut markets_data = a_markets.try_borrow_mut_data()?;
        state::expect_account_len(&markets_data, MARKETS_ACCOUNT_LEN)?;
        state::expect_uninitialized(&markets_data)?;

        let (collateral_vault_authority, collateral_vault_authority_nonce) =
            accounts::derive_vault_authority(program_id, a_collateral_vault.key);
        if *a_collateral_vault_authority.key != collateral_vault_authority {
            return Err(ClearingHouseError::InvalidCollateralVaultAuthority.into());
        }

        let (insurance_vault_authority, insurance_vault_authority_nonce) =
            accounts::derive_vault_authority(program_id, a_insurance_vault.key);
        if *a_insurance_vault_authority.key != insurance_vault_authority {
            return Err(ClearingHouseError::InvalidInsuranceVaultAuthority.into());
        }

        if !vault_ok(a_collateral_vault, &collateral_vault_authority, a_collateral_mint.key) {
            return Err(ClearingHouseError::InvalidCollateralVault.into());
        }
        if !vault_ok(a_insurance_vault, &insurance_vault_authority, a_collateral_mint.key) {
            return Err(ClearingHouseError::InvalidInsuranceVault.into());
        }

        let st = State::new(&StateInit {
            admin: *a_admin.key,
            admin_controls_prices,
            collateral_mint: *a_collateral_mint.key,
            collateral_vault: *a_collateral_vault.key,
            collateral_vault_authority,
            collateral_vault_authority_nonce,
            insurance_vault: *a_insurance_vault.key,
            insurance_vault_authority,
            insurance_vault_authority_nonce,
            markets: *a_markets.key,
        });

        state::init_markets(&mut markets_data)?;
        state::write_record(&mut state_data, &st)?;

        msg!(
            "Clearing house initialized: admin={} admin_controls_prices={}",
            a_admin.key,
            admin_controls_prices
        );
        Ok(())
    }

    fn initialize_history(program_id: &Pubkey, accounts: &[AccountInfo]) -> ProgramResult {
        accounts::expect_len(accounts, 8)?;
        let a_admin = &accounts[0];
        let a_state = &accounts[1];
        let a_funding_payment_history = &accounts[2];
        let a_trade_history = &accounts[3];
        let a_liquidation_history = &accounts[4];
        let a_deposit_history = &accounts[5];
        let a_funding_rate_history = &accounts[6];
        let a_curve_history = &accounts[7];

        accounts::expect_signer(a_admin)?;
        accounts::expect_program_writable(a_state, program_id)?;

        let mut state_data = a_state.try_borrow_mut_data()?;
        let mut st: State = state::read_record(&state_data)?;
        require_admin(&st, a_admin)?;
        if st.histories_attached() {
            return Err(ClearingHouseError::HistoriesAllInitialized.into());
        }

        accounts::expect_distinct(&accounts[1..8])?;
        for a in &accounts[2..8] {
            accounts::expect_program_writable(a, program_id)?;
        }

        let mut funding_payment_data = a_funding_payment_history.try_borrow_mut_data()?;
        let mut trade_data = a_trade_history.try_borrow_mut_data()?;
        let mut liquidation_data = a_liquidation_history.try_borrow_mut_data()?;
        let mut deposit_data = a_deposit_history.try_borrow_mut_data()?;
        let mut funding_rate_data = a_funding_rate_history.try_borrow_mut_data()?;
        let mut curve_data = a_curve_history.try_borrow_mut_data()?;

        FundingPaymentHistory::check_uninitialized(&funding_payment_data)?;
        TradeHistory::check_uninitialized(&trade_data)?;
        LiquidationHistory::check_uninitialized(&liquidation_data)?;
        DepositHistory::check_uninitialized(&deposit_data)?;
        FundingRateHistory::check_uninitialized(&funding_rate_data)?;
        CurveHistory::check_uninitialized(&curve_data)?;

        st.attach_histories(&HistoryKeys {
            deposit_history: *a_deposit_history.key,
            trade_history: *a_trade_history.key,
            funding_payment_history: *a_funding_payment_history.key,
            funding_rate_history: *a_funding_rate_history.key,
            liquidation_history: *a_liquidation_history.key,
            curve_history: *a_curve_history.key,
        })?;

        FundingPaymentHistory::init(&mut funding_payment_data)?;
        TradeHistory::init(&mut trade_data)?;
        LiquidationHistory::init(&mut liquidation_data)?;
        DepositHistory::init(&mut deposit_data)?;
        FundingRateHistory::init(&mut funding_rate_data)?;
        CurveHistory::init(&mut curve_data)?;
        state::write_record(&mut state_data, &st)?;

        msg!("History logs attached: lifecycle={:?}", st.lifecycle());
        Ok(())
    }

    fn initialize_order_state(program_id: &Pubkey, accounts: &[AccountInfo]) -> ProgramResult {
        accounts::expect_len(accounts, 4)?;
        let a_admin = &accounts[0];
        let a_state = &accounts[1];
        let a_order_state = &accounts[2];
        let a_order_history = &accounts[3];

        accounts::expect_signer(a_admin)?;
        accounts::expect_program_writable(a_state, program_id)?;

        let mut state_data = a_state.try_borrow_mut_data()?;
        let mut st: State = state::read_record(&state_data)?;
        require_admin(&st, a_admin)?;
        if st.order_state_attached() {
            return Err(ClearingHouseError::OrderStateAlreadyInitialized.into());
        }

        accounts::expect_distinct(&accounts[1..4])?;
        accounts::expect_program_writable(a_order_state, program_id)?;
        accounts::expect_program_writable(a_order_history, program_id)?;

        let mut order_state_data = a_order_state.try_borrow_mut_data()?;
        let mut order_history_data = a_order_history.try_borrow_mut_data()?;
        state::expect_account_len(&order_state_data, OrderState::ACCOUNT_LEN)?;
        state::expect_uninitialized(&order_state_data)?;
        OrderHistory::check_uninitialized(&order_history_data)?;

        st.attach_order_state(a_order_state.key)?;

        OrderHistory::init(&mut order_history_data)?;
        state::write_record(&mut order_state_data, &OrderState::new(a_order_history.key))?;
        state::write_record(&mut state_data, &st)?;

        msg!(
            "Order state initialized: order_state={} order_history={} lifecycle={:?}",
            a_order_state.key,
            a_order_history.key,
            st.lifecycle()
        );
        Ok(())
    }

    fn initialize_market(program_id: &Pubkey, accounts: &[AccountInfo], params: &MarketParams) -> ProgramResult {
        accounts::expect_len(accounts, 5)?;
        let a_admin = &accounts[0];
        let a_state = &accounts[1];
        let a_markets = &accounts[2];
        let a_oracle = &accounts[3];
        let a_clock = &accounts[4];

        accounts::expect_signer(a_admin)?;
        accounts::expect_owner(a_state, program_id)?;

        let st: State = {
            let data = a_state.try_borrow_data()?;
            state::read_record(&data)?
        };
        require_admin(&st, a_admin)?;

        accounts::expect_program_writable(a_markets, program_id)?;
        if *a_markets.key != st.markets_key() {
            return Err(ClearingHouseError::InvalidMarketsAccount.into());
        }

        let clock = Clock::from_account_info(a_clock)?;

        let mut markets_data = a_markets.try_borrow_mut_data()?;
        let existing = state::read_market(&markets_data, params.market_index)?;
        market::validate_new_market(&existing, params)?;

        let feed = oracle::read_price_feed(a_oracle)?;
        let new = market::new_market(params, &feed, a_oracle.key, clock.unix_timestamp)?;
        state::write_market(&mut markets_data, params.market_index, &new)?;

        msg!(
            "Market {} initialized: sqrt_k={} peg={} oracle_price={} oracle_twap={}",
            params.market_index,
            new.amm.sqrt_k,
            new.amm.peg_multiplier,
            new.amm.last_oracle_price,
            new.amm.last_oracle_price_twap
        );
        Ok(())
    }

    fn initialize_user(program_id: &Pubkey, accounts: &[AccountInfo], whitelist_token: bool) -> ProgramResult {
        accounts::expect_len(accounts, 4)?;
        let a_authority = &accounts[0];
        let a_state = &accounts[1];
        let a_user = &accounts[2];
        let a_user_positions = &accounts[3];

        accounts::expect_signer(a_authority)?;
        accounts::expect_owner(a_state, program_id)?;

        let st: State = {
            let data = a_state.try_borrow_data()?;
            state::read_record(&data)?
        };

        if let Some(whitelist_mint) = st.whitelist_mint_key() {
            // Exactly one trailing account, and only when the caller declares it
            let a_token = match (whitelist_token, &accounts[4..]) {
                (true, [a_token]) => Some(a_token),
                _ => None,
            };
            check_whitelist_token(&whitelist_mint, a_authority.key, a_token)?;
        }

        accounts::expect_program_writable(a_user, program_id)?;
        accounts::expect_program_writable(a_user_positions, program_id)?;
        accounts::expect_distinct(&accounts[1..4])?;

        let (user_address, _) = accounts::derive_user_address(program_id, a_authority.key);
        if *a_user.key != user_address {
            return Err(ClearingHouseError::InvalidUserAccount.into());
        }

        let mut user_data = a_user.try_borrow_mut_data()?;
        let mut positions_data = a_user_positions.try_borrow_mut_data()?;
        state::expect_account_len(&user_data, User::ACCOUNT_LEN)?;
        state::expect_uninitialized(&user_data)?;
        state::expect_account_len(&positions_data, UserPositions::ACCOUNT_LEN)?;
        state::expect_uninitialized(&positions_data)?;

        state::write_record(&mut user_data, &User::new(a_authority.key, a_user_positions.key))?;
        state::write_record(&mut positions_data, &UserPositions::new(a_user.key))?;

        msg!("User initialized: authority={} user={}", a_authority.key, a_user.key);
        Ok(())
    }
}

// 12. mod mock_oracle
/// Price feed writer used on test networks. Lives in this crate so the
/// feed layout has a single definition; deployed as its own program id.
pub mod mock_oracle {
    use solana_program::{
        account_info::AccountInfo, entrypoint::ProgramResult, msg, program_error::ProgramError,
        pubkey::Pubkey,
    };
    use crate::{
        accounts,
        error::ClearingHouseError,
        ix::{read_i32, read_i64, read_u64},
        oracle::{self, *},
        state,
        tags::*,
    };

    pub const ID: Pubkey = solana_program::pubkey!("BMTJtdJvgMkgsre5mZq6PNTX9FoFtfjE7EwtCMiTRQkQ");

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum OracleInstruction {
        InitializePrice { price: i64, conf: u64, exponent: i32, ema_price: i64, ema_conf: u64 },
        SetPrice { price: i64 },
        SetEmaPrice { ema_price: i64 },
    }

    impl OracleInstruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input
                .split_first()
                .ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                TAG_ORACLE_INITIALIZE_PRICE => {
                    let price = read_i64(&mut rest)?;
                    let conf = read_u64(&mut rest)?;
                    let exponent = read_i32(&mut rest)?;
                    let ema_price = read_i64(&mut rest)?;
                    let ema_conf = read_u64(&mut rest)?;
                    Ok(OracleInstruction::InitializePrice { price, conf, exponent, ema_price, ema_conf })
                }
                TAG_ORACLE_SET_PRICE => Ok(OracleInstruction::SetPrice { price: read_i64(&mut rest)? }),
                TAG_ORACLE_SET_EMA_PRICE => Ok(OracleInstruction::SetEmaPrice { ema_price: read_i64(&mut rest)? }),
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn feed_guard(program_id: &Pubkey, a_feed: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_program_writable(a_feed, program_id)?;
        state::expect_account_len(data, PRICE_FEED_LEN)
    }

    fn initialized_feed_guard(program_id: &Pubkey, a_feed: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        feed_guard(program_id, a_feed, data)?;
        if !state::has_discriminator(data, &PRICE_FEED_DISCRIMINATOR) {
            return Err(ClearingHouseError::AccountNotInitialized.into());
        }
        Ok(())
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        match OracleInstruction::decode(instruction_data)? {
            OracleInstruction::InitializePrice { price, conf, exponent, ema_price, ema_conf } => {
                accounts::expect_len(accounts, 2)?;
                let a_authority = &accounts[0];
                let a_feed = &accounts[1];
                accounts::expect_signer(a_authority)?;

                let mut data = a_feed.try_borrow_mut_data()?;
                feed_guard(program_id, a_feed, &data)?;
                if state::has_discriminator(&data, &PRICE_FEED_DISCRIMINATOR) {
                    return Err(ClearingHouseError::AccountAlreadyInitialized.into());
                }

                data[..8].copy_from_slice(&PRICE_FEED_DISCRIMINATOR);
                data[WRITE_AUTHORITY_OFF..WRITE_AUTHORITY_OFF + 32].copy_from_slice(a_authority.key.as_ref());
                oracle::write_i64(&mut data, PRICE_OFF, price);
                oracle::write_u64(&mut data, CONF_OFF, conf);
                oracle::write_i32(&mut data, EXPONENT_OFF, exponent);
                oracle::write_i64(&mut data, EMA_PRICE_OFF, ema_price);
                oracle::write_u64(&mut data, EMA_CONF_OFF, ema_conf);
                msg!("Price feed {} initialized: price={} expo={}", a_feed.key, price, exponent);
            }
            OracleInstruction::SetPrice { price } => {
                accounts::expect_len(accounts, 1)?;
                let a_feed = &accounts[0];
                let mut data = a_feed.try_borrow_mut_data()?;
                initialized_feed_guard(program_id, a_feed, &data)?;
                oracle::write_i64(&mut data, PRICE_OFF, price);
            }
            OracleInstruction::SetEmaPrice { ema_price } => {
                accounts::expect_len(accounts, 1)?;
                let a_feed = &accounts[0];
                let mut data = a_feed.try_borrow_mut_data()?;
                initialized_feed_guard(program_id, a_feed, &data)?;
                oracle::write_i64(&mut data, EMA_PRICE_OFF, ema_price);
            }
        }
        Ok(())
    }
}

// 13. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
#[allow(unsafe_code)]
pub mod entrypoint {
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult, pubkey::Pubkey,
    };
    use crate::processor;

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        processor::process_instruction(program_id, accounts, instruction_data)
    }
}
