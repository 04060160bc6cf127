//! Chain and wallet boundary.
//!
//! The engine only talks to the exchange through these two traits. Amounts
//! crossing the boundary are whole-token `f64` values; implementations convert
//! to base units with the token's decimals.

pub mod abi;
pub mod uniswap;
pub mod wallet;

#[cfg(test)]
pub mod fake;

use alloy_primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use std::time::Duration;

use crate::error::ExecutionError;
use crate::models::{PoolState, Position, TokenId};

pub use uniswap::UniswapV3Client;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    /// Gas token of the chain
    Native,
    Token(Address),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Approval,
    Swap,
    Mint,
    DecreaseLiquidity,
    Collect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub hash: TxHash,
    pub kind: TxKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub hash: TxHash,
    pub block_number: Option<u64>,
    /// Set for mints: the NFT id taken from the position manager's Transfer log.
    pub minted_token_id: Option<TokenId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwapRequest {
    pub token_in: Address,
    pub token_out: Address,
    pub fee: u32,
    pub amount_in: f64,
    pub min_amount_out: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MintRequest {
    pub token0: Address,
    pub token1: Address,
    pub fee: u32,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub amount0: f64,
    pub amount1: f64,
    pub amount0_min: f64,
    pub amount1_min: f64,
}

/// Pool reads and position-mutating sends.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn pool_address(&self, token_a: Address, token_b: Address, fee: u32) -> Result<Address, ExecutionError>;

    async fn pool_state(&self, pool: Address) -> Result<PoolState, ExecutionError>;

    async fn position(&self, token_id: TokenId) -> Result<Position, ExecutionError>;

    async fn send_swap(&self, request: &SwapRequest) -> Result<PendingTx, ExecutionError>;

    async fn send_mint(&self, request: &MintRequest) -> Result<PendingTx, ExecutionError>;

    async fn send_decrease_liquidity(&self, token_id: TokenId, liquidity: u128) -> Result<PendingTx, ExecutionError>;

    async fn send_collect(&self, token_id: TokenId) -> Result<PendingTx, ExecutionError>;

    /// Reverted receipts map to `Reverted`, an elapsed `timeout` to `ConfirmationTimeout`.
    async fn wait_for_confirmation(&self, tx: &PendingTx, timeout: Duration) -> Result<Confirmation, ExecutionError>;
}

/// Balances and allowances of the bot's own account.
#[async_trait]
pub trait WalletClient: Send + Sync {
    fn address(&self) -> Address;

    async fn balance_of(&self, asset: Asset) -> Result<f64, ExecutionError>;

    async fn token_info(&self, token: Address) -> Result<TokenInfo, ExecutionError>;

    /// Make sure `spender` may pull at least `min_amount` of `token`, approving if needed.
    async fn ensure_approval(&self, token: Address, spender: Address, min_amount: f64) -> Result<bool, ExecutionError>;
}

/// Whole-token amount to base units, truncating toward zero.
pub fn to_base_units(amount: f64, decimals: u8) -> U256 {
    let scaled = (amount * 10f64.powi(decimals as i32)).floor();
    if !scaled.is_finite() || scaled <= 0.0 {
        return U256::ZERO;
    }
    if scaled >= u128::MAX as f64 {
        return U256::from(u128::MAX);
    }
    U256::from(scaled as u128)
}

pub fn from_base_units(amount: U256, decimals: u8) -> f64 {
    amount.to_string().parse::<f64>().unwrap_or(0.0) / 10f64.powi(decimals as i32)
}
