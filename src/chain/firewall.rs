//! JSON-RPC method table and the outbound allow-list derived from it
//!
//! `RPC_METHODS` is the single source of truth: the generic proxy stubs in
//! `RpcClient::call_method` and the firewall check both read it.

use crate::error::{CoordinatorError, CoordinatorResult};

use lazy_static::lazy_static;
use std::collections::HashSet;

/// One row of the JSON-RPC table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcMethod {
    /// Wire name, e.g. `eth_getBalance`
    pub rpc: &'static str,
    pub namespace: &'static str,
    /// Name of the proxy stub, e.g. `getBalance`
    pub method: &'static str,
    pub params: &'static [&'static str],
    /// Whether callers get the result through an async callback rather than inline
    pub asynchronous: bool,
    pub forbidden: bool,
}

const fn row(
    rpc: &'static str,
    namespace: &'static str,
    method: &'static str,
    params: &'static [&'static str],
    asynchronous: bool,
    forbidden: bool,
) -> RpcMethod {
    RpcMethod {
        rpc,
        namespace,
        method,
        params,
        asynchronous,
        forbidden,
    }
}

pub static RPC_METHODS: &[RpcMethod] = &[
    row("web3_clientVersion", "web3", "clientVersion", &[], false, false),
    row("web3_sha3", "web3", "sha3", &["data"], false, false),
    row("net_version", "net", "version", &[], false, false),
    row("net_peerCount", "net", "peerCount", &[], false, false),
    row("net_listening", "net", "listening", &[], false, false),
    row("eth_protocolVersion", "eth", "protocolVersion", &[], false, false),
    row("eth_syncing", "eth", "syncing", &[], false, false),
    row("eth_coinbase", "eth", "coinbase", &[], false, true),
    row("eth_coinbase", "eth", "getCoinbase", &[], true, true),
    row("eth_mining", "eth", "mining", &[], false, true),
    row("eth_hashrate", "eth", "hashrate", &[], false, true),
    row("eth_gasPrice", "eth", "gasPrice", &[], false, false),
    row("eth_accounts", "eth", "accounts", &[], false, true),
    row("eth_blockNumber", "eth", "blockNumber", &[], false, false),
    row("eth_getBalance", "eth", "getBalance", &["address", "defaultBlock"], true, false),
    row("eth_getStorageAt", "eth", "getStorageAt", &["address", "position", "defaultBlock"], true, false),
    row("eth_getTransactionCount", "eth", "transactionCount", &["address", "defaultBlock"], false, false),
    row("eth_getBlockTransactionCountByHash", "eth", "getBlockTransactionCountByHash", &["data"], true, false),
    row("eth_getBlockTransactionCountByNumber", "eth", "getBlockTransactionCountByNumber", &["quantityOrTag"], true, false),
    row("eth_getUncleCountByBlockHash", "eth", "getUncleCountByBlockHash", &["data"], true, false),
    row("eth_getUncleCountByBlockNumber", "eth", "getUncleCountByBlockNumber", &["quantityOrTag"], true, false),
    row("eth_getCode", "eth", "getCode", &["address", "defaultBlock"], true, false),
    row("eth_sign", "eth", "sign", &["address", "message"], false, true),
    row("eth_sendTransaction", "eth", "sendTransaction", &["ethObject"], true, true),
    row("eth_sendRawTransaction", "eth", "sendRawTransaction", &["data"], true, false),
    row("eth_call", "eth", "call", &["callObject", "defaultBlock"], true, false),
    row("eth_estimateGas", "eth", "estimateGas", &["ethObject"], false, false),
    row("eth_getBlockByHash", "eth", "blockByHash", &["data", "isReturnedFullObject"], false, false),
    row("eth_getBlockByNumber", "eth", "blockByNumber", &["data", "isReturnedFullObject"], false, false),
    row("eth_getTransactionByHash", "eth", "transactionByHash", &["data"], false, false),
    row("eth_getTransactionByBlockHashAndIndex", "eth", "transactionByBlockHashAndIndex", &["data", "quantity"], false, false),
    row("eth_getTransactionByBlockNumberAndIndex", "eth", "transactionByBlockNumberAndIndex", &["blockNumber", "quantity"], false, false),
    row("eth_getTransactionReceipt", "eth", "transactionReceipt", &["data"], false, false),
    row("eth_getUncleByBlockHashAndIndex", "eth", "uncleByBlockHashAndIndex", &["data", "quantity"], false, false),
    row("eth_getUncleByBlockNumberAndIndex", "eth", "uncleByBlockNumberAndIndex", &["quantityOrTag", "quantity"], false, false),
    row("eth_getCompilers", "eth", "getCompilers", &[], false, true),
    row("eth_compileSolidity", "eth", "compileSolidity", &["sourceString"], false, true),
    row("eth_compileLLL", "eth", "compileLLL", &["sourceString"], false, true),
    row("eth_compileSerpent", "eth", "compileSerpent", &["sourceString"], false, true),
    row("eth_newFilter", "eth", "newFilter", &["filterOptions"], false, true),
    row("eth_newBlockFilter", "eth", "newBlockFilter", &[], false, true),
    row("eth_newPendingTransactionFilter", "eth", "newPendingTransactionFilter", &[], false, true),
    row("eth_uninstallFilter", "eth", "uninstallFilter", &["quantity"], false, true),
    row("eth_getFilterChanges", "eth", "filterChanges", &["quantity"], false, true),
    row("eth_getFilterLogs", "eth", "filterLogs", &["quantity"], false, true),
    // Unbounded log scans stay internal; contract events come from the block follower
    row("eth_getLogs", "eth", "getLogs", &["filterObject"], true, true),
    // Mining work is not proxied, including eth_getWork; the coordinator fronts
    // transaction submission, not block production
    row("eth_getWork", "eth", "getWork", &[], true, true),
    row("eth_submitWork", "eth", "submitWork", &["nonce", "headers", "mixDigest"], true, true),
    row("eth_submitHashrate", "eth", "submitHashrate", &["hashrate", "clientId"], true, true),
    row("db_putString", "db", "putString", &["db", "key", "value"], false, true),
    row("db_getString", "db", "getString", &["db", "key"], false, true),
    row("db_putHex", "db", "putHex", &["db", "key", "value"], false, true),
    row("db_getHex", "db", "getHex", &["db", "key"], false, true),
    row("shh_post", "shh", "post", &["postObject"], false, true),
    row("shh_version", "shh", "version", &[], false, true),
    row("shh_newIdentity", "shh", "newIdentity", &[], false, true),
    row("shh_hasIdentity", "shh", "hasIdentity", &["data"], false, true),
    row("shh_newGroup", "shh", "newGroup", &[], false, true),
    row("shh_addToGroup", "shh", "addToGroup", &["data"], false, true),
    row("shh_newFilter", "shh", "newFilter", &["filterOptions"], false, true),
    row("shh_uninstallFilter", "shh", "uninstallFilter", &["filterId"], false, true),
    row("shh_getFilterChanges", "shh", "getFilterChanges", &["filterId"], false, true),
    row("shh_getMessages", "shh", "getMessages", &["filterId"], false, true),
    // Node-held keys stay out of reach, every personal_* row included: keys are
    // only ever used through the key ring
    row("personal_listAccounts", "personal", "listAccounts", &[], false, true),
    row("personal_newAccount", "personal", "newAccount", &["password"], false, true),
    row("personal_sendTransaction", "personal", "sendTransaction", &["data"], false, true),
    row("personal_unlockAccount", "personal", "unlockAccount", &["address", "passphrase", "quantity"], false, true),
];

lazy_static! {
    static ref ALLOW_LIST: HashSet<&'static str> = RPC_METHODS
        .iter()
        .filter(|m| !m.forbidden)
        .map(|m| m.rpc)
        .collect();
}

/// Whether a wire method may leave the process
pub fn is_allowed(method: &str) -> bool {
    ALLOW_LIST.contains(method)
}

/// Reject anything not on the allow-list
pub fn check(method: &str) -> CoordinatorResult<()> {
    if is_allowed(method) {
        Ok(())
    } else {
        Err(CoordinatorError::Forbidden(method.to_string()))
    }
}

/// Wire names of every allowed method
pub fn allowed_methods() -> Vec<&'static str> {
    let mut methods: Vec<_> = ALLOW_LIST.iter().copied().collect();
    methods.sort_unstable();
    methods
}

/// Find the allowed stub row for `namespace.method`
pub fn lookup(namespace: &str, method: &str) -> Option<&'static RpcMethod> {
    RPC_METHODS
        .iter()
        .find(|m| !m.forbidden && m.namespace == namespace && m.method == method)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_methods_are_allowed() {
        for method in [
            "net_version",
            "eth_gasPrice",
            "eth_estimateGas",
            "eth_getTransactionCount",
            "eth_sendRawTransaction",
            "eth_getTransactionReceipt",
            "eth_blockNumber",
            "eth_call",
        ] {
            assert!(is_allowed(method), "{} should be allowed", method);
        }
    }

    #[test]
    fn test_key_and_mining_methods_are_forbidden() {
        for method in ["eth_accounts", "eth_sign", "eth_sendTransaction", "eth_coinbase", "personal_unlockAccount"] {
            assert!(!is_allowed(method), "{} should be forbidden", method);
        }

        for method in [
            "eth_getWork",
            "eth_submitWork",
            "eth_getLogs",
            "personal_listAccounts",
            "personal_newAccount",
            "personal_sendTransaction",
        ] {
            assert!(!is_allowed(method), "{} should be forbidden", method);
            assert!(RPC_METHODS.iter().any(|m| m.rpc == method && m.forbidden));
        }

        let err = check("eth_accounts").unwrap_err();
        assert_eq!(err.to_string(), "Forbidden eth_accounts");
        assert!(check("made_up").is_err());
    }

    #[test]
    fn test_lookup_uses_stub_names() {
        let balance = lookup("eth", "getBalance").unwrap();
        assert_eq!(balance.rpc, "eth_getBalance");
        assert_eq!(balance.params, &["address", "defaultBlock"]);
        assert!(lookup("eth", "accounts").is_none());
    }

    #[test]
    fn test_allowed_methods_are_unique_and_sorted() {
        let methods = allowed_methods();
        let mut deduped = methods.clone();
        deduped.dedup();
        assert_eq!(methods, deduped);
        assert!(methods.contains(&"eth_getBalance"));
    }
}
