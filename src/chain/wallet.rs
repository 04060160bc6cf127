use alloy_primitives::{Address, U256};
use alloy_provider::Provider;
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::abi::IERC20;
use super::uniswap::UniswapV3Client;
use super::{from_base_units, to_base_units, Asset, ChainClient, TokenInfo, TxKind, WalletClient};
use crate::error::ExecutionError;

pub const APPROVAL_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);

const NATIVE_DECIMALS: u8 = 18;

#[async_trait]
impl<P> WalletClient for UniswapV3Client<P>
where
    P: Provider + 'static,
{
    fn address(&self) -> Address {
        self.signer.address()
    }

    async fn balance_of(&self, asset: Asset) -> Result<f64, ExecutionError> {
        let owner = self.signer.address();
        match asset {
            Asset::Native => {
                let wei = self.provider.get_balance(owner).await?;
                Ok(from_base_units(wei, NATIVE_DECIMALS))
            }
            Asset::Token(token) => {
                let decimals = self.token_info(token).await?.decimals;
                let raw = self
                    .read(token, IERC20::balanceOfCall { account: owner })
                    .await?
                    .balance;
                Ok(from_base_units(raw, decimals))
            }
        }
    }

    async fn token_info(&self, token: Address) -> Result<TokenInfo, ExecutionError> {
        if let Some(info) = self.tokens.get(&token) {
            return Ok(info.clone());
        }

        let decimals = self.read(token, IERC20::decimalsCall {}).await?.decimals;
        let symbol = match self.read(token, IERC20::symbolCall {}).await {
            Ok(ret) => ret.symbol,
            Err(e) => {
                warn!("Could not read symbol of {:#x}: {}", token, e);
                format!("{:#x}", token)
            }
        };

        let info = TokenInfo {
            address: token,
            symbol,
            decimals,
        };
        debug!("Token {:#x}: {} ({} decimals)", token, info.symbol, info.decimals);
        self.tokens.insert(token, info.clone());
        Ok(info)
    }

    async fn ensure_approval(&self, token: Address, spender: Address, min_amount: f64) -> Result<bool, ExecutionError> {
        let info = self.token_info(token).await?;
        let required = to_base_units(min_amount, info.decimals);
        if required.is_zero() {
            return Ok(true);
        }

        let allowance = self
            .read(
                token,
                IERC20::allowanceCall {
                    owner: self.signer.address(),
                    spender,
                },
            )
            .await?
            .remaining;
        if allowance_shortfall(allowance, required).is_zero() {
            debug!("{} allowance for {:#x} already sufficient", info.symbol, spender);
            return Ok(true);
        }

        info!(
            "🔓 Approving {:.6} {} for {:#x}",
            min_amount, info.symbol, spender
        );
        let data = IERC20::approveCall {
            spender,
            amount: required,
        }
        .abi_encode();
        let tx = self.send(token, data, TxKind::Approval).await?;

        match self.wait_for_confirmation(&tx, APPROVAL_CONFIRMATION_TIMEOUT).await {
            Ok(_) => Ok(true),
            Err(ExecutionError::Reverted(hash)) => {
                warn!("⚠️ Approval {} reverted", hash);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Allowance short of `required`, in base units. Zero when already covered.
pub fn allowance_shortfall(allowance: U256, required: U256) -> U256 {
    required.saturating_sub(allowance)
}
