//! Derivation workers, one per derived concern.
//!
//! | Worker | Reads | Writes |
//! |---|---|---|
//! | `token_worker` | raw events | `token_transfers` |
//! | `evm_worker` | raw events | `evm_transactions` |
//! | `meta_worker` | token transfers | `token_catalog` |
//! | `accounts_worker` | raw txs + events | `accounts` |
//! | `ft_holdings_worker` | token transfers | `ft_holding_deltas` |
//! | `nft_ownership_worker` | token transfers | `nft_ownership` |
//! | `tx_contracts_worker` | raw txs | `tx_contract_tags` |
//! | `tx_metrics_worker` | raw blocks | `block_metrics` |
//! | `analytics_worker` | block metrics | `daily_stats` |
//! | `staking_worker` | raw events | `staking_events` |
//! | `account_keys_worker` | raw txs + events | `account_keys` |

use std::sync::Arc;

use ledgermirror_core::worker::Processor;

use crate::stores::Stores;

pub mod account_keys;
pub mod accounts;
pub mod analytics;
pub mod evm;
pub mod ft_holdings;
pub mod meta;
pub mod nft_ownership;
pub mod staking;
pub mod token;
pub mod tx_contracts;
pub mod tx_metrics;

pub use account_keys::AccountKeysWorker;
pub use accounts::AccountsWorker;
pub use analytics::AnalyticsWorker;
pub use evm::EvmWorker;
pub use ft_holdings::FtHoldingsWorker;
pub use meta::MetaWorker;
pub use nft_ownership::NftOwnershipWorker;
pub use staking::StakingWorker;
pub use token::TokenWorker;
pub use tx_contracts::TxContractsWorker;
pub use tx_metrics::TxMetricsWorker;

/// Every built-in worker, wired to `stores`.
pub fn standard_workers(stores: &Stores) -> Vec<Arc<dyn Processor>> {
    let raw = &stores.raw;
    let derived = &stores.derived;
    vec![
        Arc::new(TokenWorker::new(raw.clone(), derived.clone())),
        Arc::new(EvmWorker::new(raw.clone(), derived.clone())),
        Arc::new(MetaWorker::new(derived.clone())),
        Arc::new(AccountsWorker::new(raw.clone(), derived.clone())),
        Arc::new(FtHoldingsWorker::new(derived.clone())),
        Arc::new(NftOwnershipWorker::new(derived.clone())),
        Arc::new(TxContractsWorker::new(raw.clone(), derived.clone())),
        Arc::new(TxMetricsWorker::new(raw.clone(), derived.clone())),
        Arc::new(AnalyticsWorker::new(derived.clone())),
        Arc::new(StakingWorker::new(raw.clone(), derived.clone())),
        Arc::new(AccountKeysWorker::new(raw.clone(), derived.clone())),
    ]
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    use ledgermirror_core::derived::TokenTransfer;
    use ledgermirror_core::ledger::{LedgerBlock, LedgerEvent, LedgerTransaction};

    pub fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    pub fn block(height: u64) -> LedgerBlock {
        LedgerBlock {
            height,
            id: format!("b{height}"),
            parent_id: format!("b{}", height.saturating_sub(1)),
            timestamp: ts(),
            transactions: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn tx(height: u64, id: &str, payer: &str, authorizers: &[&str]) -> LedgerTransaction {
        LedgerTransaction {
            id: id.into(),
            block_height: height,
            tx_index: 0,
            proposer: payer.into(),
            proposer_key_index: 0,
            payer: payer.into(),
            authorizers: authorizers.iter().map(|a| a.to_string()).collect(),
            script: String::new(),
            status: "SEALED".into(),
            error_message: None,
            gas_used: 100,
        }
    }

    pub fn event(
        height: u64,
        tx_id: &str,
        index: u32,
        event_type: &str,
        payload: serde_json::Value,
    ) -> LedgerEvent {
        LedgerEvent {
            block_height: height,
            tx_id: tx_id.into(),
            tx_index: 0,
            event_index: index,
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn transfer(
        height: u64,
        contract: &str,
        from: Option<&str>,
        to: Option<&str>,
        amount: &str,
    ) -> TokenTransfer {
        TokenTransfer {
            block_height: height,
            tx_id: format!("t{height}"),
            event_index: 0,
            contract: contract.into(),
            from: from.map(str::to_string),
            to: to.map(str::to_string),
            amount: Decimal::from_str(amount).unwrap(),
            token_id: None,
            is_nft: false,
            timestamp: ts(),
        }
    }
}
