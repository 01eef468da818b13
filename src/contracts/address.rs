//! Address syntax checks and EIP-55 checksum formatting

use crate::error::{CoordinatorError, CoordinatorResult};

use ethers::types::Address;
use ethers::utils::to_checksum;

fn strip_hex_prefix(candidate: &str) -> &str {
    candidate
        .strip_prefix("0x")
        .or_else(|| candidate.strip_prefix("0X"))
        .unwrap_or(candidate)
}

/// 40 hex characters with an optional `0x` prefix, in any letter case
pub fn is_address(candidate: &str) -> bool {
    let hex = strip_hex_prefix(candidate);
    hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse a textual address, rejecting anything `is_address` rejects
pub fn parse_address(candidate: &str) -> CoordinatorResult<Address> {
    if !is_address(candidate) {
        return Err(CoordinatorError::InvalidInput(format!(
            "Invalid address [{}]",
            candidate
        )));
    }

    let bytes = hex::decode(strip_hex_prefix(candidate))
        .map_err(|e| CoordinatorError::InvalidInput(format!("Invalid address: {}", e)))?;
    Ok(Address::from_slice(&bytes))
}

/// Lower-case `0x`-prefixed rendering used for store keys and registry lookups
pub fn format_address(address: &Address) -> String {
    format!("{:#x}", address)
}

/// EIP-55 mixed-case checksum encoding
pub fn to_checksum_address(address: &str) -> CoordinatorResult<String> {
    let address = parse_address(address)?;
    Ok(to_checksum(&address, None))
}
