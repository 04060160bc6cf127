//! Scripted in-memory chain used by the engine's tests.

use alloy_primitives::{Address, TxHash, B256, U256};
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::time::Duration;

use super::{
    Asset, ChainClient, Confirmation, MintRequest, PendingTx, SwapRequest, TokenInfo, TxKind,
    WalletClient,
};
use crate::error::ExecutionError;
use crate::models::{PoolState, Position, TokenId};
use crate::strategy::tick_math::price_to_tick;

#[derive(Debug, Clone)]
enum Effect {
    Swap(SwapRequest),
    Mint(MintRequest, TokenId),
    Decrease(TokenId),
    Collect(TokenId),
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub pool_state: Option<PoolState>,
    pub pool_unavailable: bool,
    /// Next N pool reads fail.
    pub pool_read_failures: u32,
    pub positions: HashMap<TokenId, Position>,
    pub balances: HashMap<Asset, f64>,
    /// Next N swap submissions are rejected.
    pub swap_failures: u32,
    pub fail_all_swaps: bool,
    pub mint_failures: u32,
    pub decrease_failures: u32,
    /// Next N confirmations time out.
    pub confirmation_timeouts: u32,
    pub approval_denied: bool,
    /// Credited to the wallet when fees/liquidity are collected.
    pub collect_proceeds: (f64, f64),
    /// Mints confirm without the token id in the receipt.
    pub hide_minted_id: bool,
    pub calls: Vec<&'static str>,
    pub swaps: Vec<SwapRequest>,
    pub mints: Vec<MintRequest>,
    pub approvals: Vec<(Address, Address, f64)>,
    pub next_token_id: u64,
    pub in_flight: usize,
    pub max_in_flight: usize,
    tx_counter: u64,
    pending: HashMap<TxHash, Effect>,
}

pub struct FakeChain {
    pub pool: Address,
    pub token0: Address,
    pub token1: Address,
    pub owner: Address,
    state: Mutex<FakeState>,
}

impl FakeChain {
    /// Pool at price 1.0, 18-decimal tokens, 1000 of each and 1 unit of gas.
    pub fn new() -> Self {
        let chain = Self {
            pool: Address::repeat_byte(0xAA),
            token0: Address::repeat_byte(0x11),
            token1: Address::repeat_byte(0x22),
            owner: Address::repeat_byte(0x99),
            state: Mutex::new(FakeState {
                next_token_id: 1000,
                collect_proceeds: (100.0, 100.0),
                ..FakeState::default()
            }),
        };
        {
            let mut state = chain.state();
            state.balances.insert(Asset::Native, 1.0);
            state.balances.insert(Asset::Token(chain.token0), 1000.0);
            state.balances.insert(Asset::Token(chain.token1), 1000.0);
        }
        chain.set_price(1.0);
        chain
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock()
    }

    pub fn set_price(&self, price: f64) {
        let tick = price_to_tick(price).unwrap_or(0);
        self.state().pool_state = Some(PoolState {
            address: self.pool,
            sqrt_price_x96: U256::ZERO,
            price,
            tick,
        });
    }

    pub fn set_balance(&self, asset: Asset, amount: f64) {
        self.state().balances.insert(asset, amount);
    }

    pub fn balance(&self, asset: Asset) -> f64 {
        self.state().balances.get(&asset).copied().unwrap_or(0.0)
    }

    pub fn add_position(&self, token_id: u64, tick_lower: i32, tick_upper: i32, liquidity: u128) -> Position {
        let position = Position {
            token_id: U256::from(token_id),
            token0: self.token0,
            token1: self.token1,
            fee: 3000,
            tick_lower,
            tick_upper,
            liquidity,
            tokens_owed0: 0,
            tokens_owed1: 0,
        };
        self.state().positions.insert(position.token_id, position.clone());
        position
    }

    fn submit(&self, kind: TxKind, effect: Effect) -> PendingTx {
        let mut state = self.state();
        state.tx_counter += 1;
        let hash = B256::from(U256::from(state.tx_counter).to_be_bytes::<32>());
        state.pending.insert(hash, effect);
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        PendingTx { hash, kind }
    }

    fn price(state: &FakeState) -> f64 {
        state.pool_state.map(|p| p.price).unwrap_or(1.0)
    }
}

impl Default for FakeChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn pool_address(&self, _token_a: Address, _token_b: Address, _fee: u32) -> Result<Address, ExecutionError> {
        Ok(self.pool)
    }

    async fn pool_state(&self, _pool: Address) -> Result<PoolState, ExecutionError> {
        let mut state = self.state();
        if state.pool_unavailable {
            return Err(ExecutionError::Rpc("pool unavailable".into()));
        }
        if state.pool_read_failures > 0 {
            state.pool_read_failures -= 1;
            return Err(ExecutionError::Rpc("pool read failed".into()));
        }
        state
            .pool_state
            .ok_or_else(|| ExecutionError::Rpc("pool not initialised".into()))
    }

    async fn position(&self, token_id: TokenId) -> Result<Position, ExecutionError> {
        self.state()
            .positions
            .get(&token_id)
            .cloned()
            .ok_or_else(|| ExecutionError::Rpc(format!("position {} not found", token_id)))
    }

    async fn send_swap(&self, request: &SwapRequest) -> Result<PendingTx, ExecutionError> {
        {
            let mut state = self.state();
            state.calls.push("swap");
            state.swaps.push(request.clone());
            if state.fail_all_swaps {
                return Err(ExecutionError::Submission("swap rejected".into()));
            }
            if state.swap_failures > 0 {
                state.swap_failures -= 1;
                return Err(ExecutionError::Submission("swap rejected".into()));
            }
        }
        Ok(self.submit(TxKind::Swap, Effect::Swap(request.clone())))
    }

    async fn send_mint(&self, request: &MintRequest) -> Result<PendingTx, ExecutionError> {
        let token_id = {
            let mut state = self.state();
            state.calls.push("mint");
            state.mints.push(request.clone());
            if state.mint_failures > 0 {
                state.mint_failures -= 1;
                return Err(ExecutionError::Submission("mint rejected".into()));
            }
            state.next_token_id += 1;
            U256::from(state.next_token_id)
        };
        Ok(self.submit(TxKind::Mint, Effect::Mint(request.clone(), token_id)))
    }

    async fn send_decrease_liquidity(&self, token_id: TokenId, _liquidity: u128) -> Result<PendingTx, ExecutionError> {
        {
            let mut state = self.state();
            state.calls.push("decrease_liquidity");
            if state.decrease_failures > 0 {
                state.decrease_failures -= 1;
                return Err(ExecutionError::Submission("decrease rejected".into()));
            }
        }
        Ok(self.submit(TxKind::DecreaseLiquidity, Effect::Decrease(token_id)))
    }

    async fn send_collect(&self, token_id: TokenId) -> Result<PendingTx, ExecutionError> {
        self.state().calls.push("collect");
        Ok(self.submit(TxKind::Collect, Effect::Collect(token_id)))
    }

    async fn wait_for_confirmation(&self, tx: &PendingTx, timeout: Duration) -> Result<Confirmation, ExecutionError> {
        // Let any other task run while this transaction is "in flight"
        tokio::task::yield_now().await;

        let mut state = self.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        let effect = state
            .pending
            .remove(&tx.hash)
            .ok_or_else(|| ExecutionError::Rpc("unknown transaction".into()))?;

        if state.confirmation_timeouts > 0 {
            state.confirmation_timeouts -= 1;
            return Err(ExecutionError::ConfirmationTimeout(timeout));
        }

        let mut minted_token_id = None;
        match effect {
            Effect::Swap(req) => {
                let price = Self::price(&state);
                let out = if req.token_in == self.token0 {
                    req.amount_in * price
                } else {
                    req.amount_in / price
                };
                *state.balances.entry(Asset::Token(req.token_in)).or_default() -= req.amount_in;
                *state.balances.entry(Asset::Token(req.token_out)).or_default() += out;
            }
            Effect::Mint(req, token_id) => {
                *state.balances.entry(Asset::Token(req.token0)).or_default() -= req.amount0;
                *state.balances.entry(Asset::Token(req.token1)).or_default() -= req.amount1;
                state.positions.insert(
                    token_id,
                    Position {
                        token_id,
                        token0: req.token0,
                        token1: req.token1,
                        fee: req.fee,
                        tick_lower: req.tick_lower,
                        tick_upper: req.tick_upper,
                        liquidity: 1_000_000,
                        tokens_owed0: 0,
                        tokens_owed1: 0,
                    },
                );
                if !state.hide_minted_id {
                    minted_token_id = Some(token_id);
                }
            }
            Effect::Decrease(token_id) => {
                if let Some(position) = state.positions.get_mut(&token_id) {
                    position.liquidity = 0;
                }
            }
            Effect::Collect(token_id) => {
                if let Some(position) = state.positions.get_mut(&token_id) {
                    position.tokens_owed0 = 0;
                    position.tokens_owed1 = 0;
                }
                let (p0, p1) = state.collect_proceeds;
                *state.balances.entry(Asset::Token(self.token0)).or_default() += p0;
                *state.balances.entry(Asset::Token(self.token1)).or_default() += p1;
                state.collect_proceeds = (0.0, 0.0);
            }
        }

        Ok(Confirmation {
            hash: tx.hash,
            block_number: Some(state.tx_counter),
            minted_token_id,
        })
    }
}

#[async_trait]
impl WalletClient for FakeChain {
    fn address(&self) -> Address {
        self.owner
    }

    async fn balance_of(&self, asset: Asset) -> Result<f64, ExecutionError> {
        Ok(self.balance(asset))
    }

    async fn token_info(&self, token: Address) -> Result<TokenInfo, ExecutionError> {
        let symbol = if token == self.token0 { "TK0" } else { "TK1" };
        Ok(TokenInfo {
            address: token,
            symbol: symbol.to_string(),
            decimals: 18,
        })
    }

    async fn ensure_approval(&self, token: Address, spender: Address, min_amount: f64) -> Result<bool, ExecutionError> {
        let mut state = self.state();
        state.approvals.push((token, spender, min_amount));
        Ok(!state.approval_denied)
    }
}
