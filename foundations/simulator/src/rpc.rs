use jsonrpsee::{
    core::client::ClientT as _,
    rpc_params,
    ws_client::{WsClient, WsClientBuilder},
};
use moonwall_foundation_core::{
    DynError,
    policy::defaults,
    readiness::{JsonRpcProbe, ReadinessCheck, check_ready},
};
use serde::Deserialize;

pub async fn connect(endpoint: &str) -> Result<WsClient, DynError> {
    Ok(WsClientBuilder::default()
        .connection_timeout(defaults::WEBSOCKET_CONNECT)
        .request_timeout(defaults::RPC_CALL)
        .build(endpoint)
        .await?)
}

/// Waits until `endpoint` answers `system_chain`.
pub async fn wait_until_ready(endpoint: &str) -> Result<(), DynError> {
    if check_ready(&JsonRpcProbe::default(), endpoint, false, ReadinessCheck::default()).await? {
        Ok(())
    } else {
        Err(format!("{endpoint} never reported ready").into())
    }
}

#[derive(Debug, Deserialize)]
pub struct Header {
    pub number: String,
}

pub fn parse_hex_number(raw: &str) -> Result<u64, DynError> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    Ok(u64::from_str_radix(digits, 16)?)
}

/// Current best block number reported by `chain_getHeader`.
pub async fn best_block_number(client: &WsClient) -> Result<u64, DynError> {
    let header: Header = client.request("chain_getHeader", rpc_params![]).await?;
    parse_hex_number(&header.number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_block_numbers() {
        assert_eq!(parse_hex_number("0x1a").unwrap(), 26);
        assert_eq!(parse_hex_number("0").unwrap(), 0);
        assert!(parse_hex_number("0xzz").is_err());
    }
}
