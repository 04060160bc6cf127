use alloy_network::EthereumWallet;
use alloy_primitives::{Address, U256};
use alloy_provider::{Provider, ProviderBuilder};
use alloy_rpc_types::{TransactionInput, TransactionReceipt, TransactionRequest};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::abi::{INonfungiblePositionManager, ISwapRouter, IUniswapV3Factory, IUniswapV3Pool};
use super::{
    to_base_units, ChainClient, Confirmation, MintRequest, PendingTx, SwapRequest, TokenInfo,
    TxKind, WalletClient,
};
use crate::error::ExecutionError;
use crate::models::{PoolState, Position, TokenId};
use crate::networks::NetworkConfig;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEADLINE_SECS: i64 = 900;

/// Uniswap V3 over JSON-RPC.
///
/// Reads go through the shared provider; sends build a signing provider from the
/// wallet key for each transaction.
pub struct UniswapV3Client<P> {
    pub(super) provider: Arc<P>,
    pub(super) signer: PrivateKeySigner,
    rpc_url: url::Url,
    pub(super) network: NetworkConfig,
    pub(super) tokens: DashMap<Address, TokenInfo>,
}

impl<P> UniswapV3Client<P>
where
    P: Provider + 'static,
{
    pub fn new(provider: Arc<P>, signer: PrivateKeySigner, rpc_url: &str, network: NetworkConfig) -> eyre::Result<Self> {
        Ok(Self {
            provider,
            signer,
            rpc_url: rpc_url.parse()?,
            network,
            tokens: DashMap::new(),
        })
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub(super) async fn read<C: SolCall>(&self, to: Address, call: C) -> Result<C::Return, ExecutionError> {
        let request = TransactionRequest {
            to: Some(to.into()),
            input: TransactionInput::new(call.abi_encode().into()),
            ..Default::default()
        };
        let output = self.provider.call(&request).await?;
        Ok(C::abi_decode_returns(&output, true)?)
    }

    pub(super) async fn send(&self, to: Address, data: Vec<u8>, kind: TxKind) -> Result<PendingTx, ExecutionError> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let signer_provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());

        let request = TransactionRequest {
            from: Some(self.signer.address()),
            to: Some(to.into()),
            input: TransactionInput::new(data.into()),
            ..Default::default()
        };

        let pending = signer_provider
            .send_transaction(request)
            .await
            .map_err(|e| ExecutionError::Submission(e.to_string()))?;
        let hash = *pending.tx_hash();
        info!("🚀 {:?} transaction submitted: {}", kind, self.network.tx_url(&format!("{:#x}", hash)));

        Ok(PendingTx { hash, kind })
    }

    async fn decimals_of(&self, token: Address) -> Result<u8, ExecutionError> {
        Ok(WalletClient::token_info(self, token).await?.decimals)
    }

    fn deadline() -> U256 {
        U256::from((Utc::now().timestamp() + DEADLINE_SECS).max(0) as u64)
    }

    /// NFT id from the position manager's mint Transfer (from the zero address).
    fn minted_token_id(&self, receipt: &TransactionReceipt) -> Option<TokenId> {
        receipt
            .inner
            .logs()
            .iter()
            .filter(|log| log.inner.address == self.network.position_manager)
            .filter_map(|log| INonfungiblePositionManager::Transfer::decode_log(&log.inner, true).ok())
            .find(|transfer| transfer.from == Address::ZERO)
            .map(|transfer| transfer.tokenId)
    }
}

fn int24<T: TryInto<i32>>(value: T, field: &str) -> Result<i32, ExecutionError> {
    value
        .try_into()
        .map_err(|_| ExecutionError::Rpc(format!("{} out of int24 range", field)))
}

#[async_trait]
impl<P> ChainClient for UniswapV3Client<P>
where
    P: Provider + 'static,
{
    async fn pool_address(&self, token_a: Address, token_b: Address, fee: u32) -> Result<Address, ExecutionError> {
        let call = IUniswapV3Factory::getPoolCall {
            tokenA: token_a,
            tokenB: token_b,
            fee: fee
                .try_into()
                .map_err(|_| ExecutionError::InvalidParams(format!("fee {} out of range", fee)))?,
        };
        let pool = self.read(self.network.factory, call).await?.pool;
        if pool == Address::ZERO {
            return Err(ExecutionError::InvalidParams(format!(
                "no pool for {:#x}/{:#x} at fee {}",
                token_a, token_b, fee
            )));
        }
        Ok(pool)
    }

    async fn pool_state(&self, pool: Address) -> Result<PoolState, ExecutionError> {
        let slot0 = self.read(pool, IUniswapV3Pool::slot0Call {}).await?;
        let tick = int24(slot0.tick, "slot0.tick")?;
        Ok(PoolState::from_slot0(pool, U256::from(slot0.sqrtPriceX96), tick))
    }

    async fn position(&self, token_id: TokenId) -> Result<Position, ExecutionError> {
        let p = self
            .read(
                self.network.position_manager,
                INonfungiblePositionManager::positionsCall { tokenId: token_id },
            )
            .await?;
        let fee: u32 = p
            .fee
            .try_into()
            .map_err(|_| ExecutionError::Rpc("position fee out of range".into()))?;

        Ok(Position {
            token_id,
            token0: p.token0,
            token1: p.token1,
            fee,
            tick_lower: int24(p.tickLower, "tickLower")?,
            tick_upper: int24(p.tickUpper, "tickUpper")?,
            liquidity: p.liquidity,
            tokens_owed0: p.tokensOwed0,
            tokens_owed1: p.tokensOwed1,
        })
    }

    async fn send_swap(&self, request: &SwapRequest) -> Result<PendingTx, ExecutionError> {
        let decimals_in = self.decimals_of(request.token_in).await?;
        let decimals_out = self.decimals_of(request.token_out).await?;
        let amount_in = to_base_units(request.amount_in, decimals_in);
        if amount_in.is_zero() {
            return Err(ExecutionError::InvalidParams("swap amount rounds to zero".into()));
        }

        let params = ISwapRouter::ExactInputSingleParams {
            tokenIn: request.token_in,
            tokenOut: request.token_out,
            fee: request
                .fee
                .try_into()
                .map_err(|_| ExecutionError::InvalidParams(format!("fee {} out of range", request.fee)))?,
            recipient: self.signer.address(),
            deadline: Self::deadline(),
            amountIn: amount_in,
            amountOutMinimum: to_base_units(request.min_amount_out, decimals_out),
            sqrtPriceLimitX96: Default::default(),
        };
        debug!("exactInputSingle params: {:?}", params);

        let data = ISwapRouter::exactInputSingleCall { params }.abi_encode();
        self.send(self.network.swap_router, data, TxKind::Swap).await
    }

    async fn send_mint(&self, request: &MintRequest) -> Result<PendingTx, ExecutionError> {
        let decimals0 = self.decimals_of(request.token0).await?;
        let decimals1 = self.decimals_of(request.token1).await?;

        let params = INonfungiblePositionManager::MintParams {
            token0: request.token0,
            token1: request.token1,
            fee: request
                .fee
                .try_into()
                .map_err(|_| ExecutionError::InvalidParams(format!("fee {} out of range", request.fee)))?,
            tickLower: request
                .tick_lower
                .try_into()
                .map_err(|_| ExecutionError::InvalidParams("tick_lower out of int24 range".into()))?,
            tickUpper: request
                .tick_upper
                .try_into()
                .map_err(|_| ExecutionError::InvalidParams("tick_upper out of int24 range".into()))?,
            amount0Desired: to_base_units(request.amount0, decimals0),
            amount1Desired: to_base_units(request.amount1, decimals1),
            amount0Min: to_base_units(request.amount0_min, decimals0),
            amount1Min: to_base_units(request.amount1_min, decimals1),
            recipient: self.signer.address(),
            deadline: Self::deadline(),
        };
        debug!("mint params: {:?}", params);

        let data = INonfungiblePositionManager::mintCall { params }.abi_encode();
        self.send(self.network.position_manager, data, TxKind::Mint).await
    }

    async fn send_decrease_liquidity(&self, token_id: TokenId, liquidity: u128) -> Result<PendingTx, ExecutionError> {
        let params = INonfungiblePositionManager::DecreaseLiquidityParams {
            tokenId: token_id,
            liquidity,
            amount0Min: U256::ZERO,
            amount1Min: U256::ZERO,
            deadline: Self::deadline(),
        };
        let data = INonfungiblePositionManager::decreaseLiquidityCall { params }.abi_encode();
        self.send(self.network.position_manager, data, TxKind::DecreaseLiquidity)
            .await
    }

    async fn send_collect(&self, token_id: TokenId) -> Result<PendingTx, ExecutionError> {
        let params = INonfungiblePositionManager::CollectParams {
            tokenId: token_id,
            recipient: self.signer.address(),
            amount0Max: u128::MAX,
            amount1Max: u128::MAX,
        };
        let data = INonfungiblePositionManager::collectCall { params }.abi_encode();
        self.send(self.network.position_manager, data, TxKind::Collect).await
    }

    async fn wait_for_confirmation(&self, tx: &PendingTx, timeout: Duration) -> Result<Confirmation, ExecutionError> {
        info!("⏳ Waiting up to {:?} for {:#x}", timeout, tx.hash);

        let poll = async {
            let mut polls: u32 = 0;
            loop {
                match self.provider.get_transaction_receipt(tx.hash).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {
                        polls += 1;
                        if polls % 15 == 0 {
                            info!("⏳ Still waiting for {:#x} ({} polls)", tx.hash, polls);
                        }
                    }
                    Err(e) => warn!("Failed to get transaction receipt: {}", e),
                }
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };

        let receipt = tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ExecutionError::ConfirmationTimeout(timeout))?;

        if !receipt.status() {
            error!("❌ Transaction {:#x} reverted", tx.hash);
            return Err(ExecutionError::Reverted(format!("{:#x}", tx.hash)));
        }
        info!(
            "✅ Transaction confirmed in block {:?}",
            receipt.block_number
        );

        let minted_token_id = match tx.kind {
            TxKind::Mint => self.minted_token_id(&receipt),
            _ => None,
        };

        Ok(Confirmation {
            hash: tx.hash,
            block_number: receipt.block_number,
            minted_token_id,
        })
    }
}
