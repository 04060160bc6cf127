use alloy_primitives::{address, Address};

/// Uniswap V3 deployment on one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub name: &'static str,
    pub chain_id: u64,
    pub rpc_url: &'static str,
    pub explorer_url: &'static str,
    pub native_symbol: &'static str,
    pub factory: Address,
    pub swap_router: Address,
    pub position_manager: Address,
    pub quoter: Address,
}

impl NetworkConfig {
    pub fn tx_url(&self, tx_hash: &str) -> String {
        format!("{}/tx/{}", self.explorer_url, tx_hash)
    }
}

pub fn celo() -> NetworkConfig {
    NetworkConfig {
        name: "celo",
        chain_id: 42220,
        rpc_url: "https://forno.celo.org",
        explorer_url: "https://celoscan.io",
        native_symbol: "CELO",
        factory: address!("AfE208a311B21f13EF87E33A90049fC17A7acDEc"),
        swap_router: address!("5615CDAb10dc425a742d643d949a7F474C01abc4"),
        position_manager: address!("3d79EdAaBC0EaB6F08ED885C05Fc0B014290D95A"),
        quoter: address!("82825d0554fA07f7FC52Ab63c961F330fdEFa8E8"),
    }
}

pub fn polygon() -> NetworkConfig {
    NetworkConfig {
        name: "polygon",
        chain_id: 137,
        rpc_url: "https://polygon-rpc.com/",
        explorer_url: "https://polygonscan.com",
        native_symbol: "MATIC",
        factory: address!("1F98431c8aD98523631AE4a59f267346ea31F984"),
        swap_router: address!("E592427A0AEce92De3Edee1F18E0157C05861564"),
        position_manager: address!("C36442b4a4522E871399CD717aBDD847Ab11FE88"),
        quoter: address!("b27308f9F90D607463bb33eA1BeBb41C27CE5AB6"),
    }
}

pub fn get(name: &str) -> Option<NetworkConfig> {
    match name.trim().to_ascii_lowercase().as_str() {
        "celo" => Some(celo()),
        "polygon" | "matic" => Some(polygon()),
        _ => None,
    }
}

pub const FEE_TIERS: [u32; 4] = [100, 500, 3000, 10000];

pub fn is_valid_fee(fee: u32) -> bool {
    FEE_TIERS.contains(&fee)
}

/// Tick spacing enforced by the factory for each fee tier.
pub fn tick_spacing_for_fee(fee: u32) -> i32 {
    match fee {
        100 => 1,
        500 => 10,
        3000 => 60,
        10000 => 200,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_spacing_for_fee() {
        assert_eq!(tick_spacing_for_fee(100), 1);
        assert_eq!(tick_spacing_for_fee(500), 10);
        assert_eq!(tick_spacing_for_fee(3000), 60);
        assert_eq!(tick_spacing_for_fee(10000), 200);
        assert_eq!(tick_spacing_for_fee(42), 1);
    }

    #[test]
    fn test_network_lookup() {
        assert_eq!(get("CELO").unwrap().chain_id, 42220);
        assert_eq!(get("polygon").unwrap().chain_id, 137);
        assert!(get("base").is_none());
    }

    #[test]
    fn test_fee_validation() {
        assert!(is_valid_fee(3000));
        assert!(!is_valid_fee(2500));
    }
}
