//! Token transfers from fungible and non-fungible deposit/withdraw events.
//!
//! A transfer on this ledger is emitted as two legs, a withdraw from the
//! sender's vault and a deposit into the receiver's. Legs are paired per
//! transaction by resource uuid, then token id (NFT) or amount (FT), in event
//! order. Unpaired legs become mints (deposit only) or burns (withdraw only).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use ledgermirror_core::derived::{DerivedStore, TokenTransfer};
use ledgermirror_core::error::IndexerError;
use ledgermirror_core::ledger::{LedgerEvent, RawLedgerStore};
use ledgermirror_core::types::HeightRange;
use ledgermirror_core::worker::Processor;

use crate::payload::{event_fields, field_address, field_str, normalize_address, parse_amount};

pub const TOKEN_WORKER: &str = "token_worker";

const FROM_KEYS: &[&str] = &[
    "from", "fromAddress", "sender", "fromAccount", "fromAddr", "from_address",
    "withdrawnFrom", "withdrawFrom", "fromVault", "burnedFrom", "owner",
];
const TO_KEYS: &[&str] = &[
    "to", "toAddress", "recipient", "receiver", "toAccount", "toAddr", "to_address",
    "depositTo", "depositedTo", "toVault", "newOwner",
];

/// `Some(is_nft)` for token movement events, `None` for everything else.
pub fn classify(event_type: &str) -> Option<bool> {
    let deposit_or_withdraw = event_type.contains(".Deposited") || event_type.contains(".Withdrawn");
    if event_type.contains("NonFungibleToken.") && deposit_or_withdraw {
        return Some(true);
    }
    if event_type.contains("FungibleToken.") && deposit_or_withdraw {
        return Some(false);
    }
    if event_type.ends_with(".Deposit") || event_type.ends_with(".Withdraw") {
        return Some(true);
    }
    if event_type.contains(".TokensDeposited") || event_type.contains(".TokensWithdrawn") {
        return Some(false);
    }
    if event_type.ends_with(".Deposited") || event_type.ends_with(".Withdrawn") {
        return Some(false);
    }
    if (event_type.contains(".TokensMinted") || event_type.contains(".TokensBurned"))
        && !event_type.contains("FlowToken.")
    {
        return Some(false);
    }
    None
}

/// Generic interface contracts that re-emit every concrete token's events.
pub fn is_wrapper_contract(name: &str) -> bool {
    matches!(name, "FungibleToken" | "NonFungibleToken")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegKind {
    Withdraw,
    Deposit,
    Direct,
}

fn leg_kind(event_type: &str, from: bool, to: bool) -> Option<LegKind> {
    let lower = event_type.to_ascii_lowercase();
    if lower.contains("withdraw") || lower.contains("burned") {
        Some(LegKind::Withdraw)
    } else if lower.contains("deposit") || lower.contains("minted") {
        Some(LegKind::Deposit)
    } else {
        match (from, to) {
            (true, true) => Some(LegKind::Direct),
            (true, false) => Some(LegKind::Withdraw),
            (false, true) => Some(LegKind::Deposit),
            (false, false) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Matcher {
    Resource(String),
    TokenId(Option<String>),
    Amount(Decimal),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PairKey {
    contract: String,
    is_nft: bool,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
struct Leg {
    block_height: u64,
    tx_id: String,
    event_index: u32,
    contract: String,
    kind: LegKind,
    from: Option<String>,
    to: Option<String>,
    amount: Decimal,
    token_id: Option<String>,
    uuid: Option<String>,
    is_nft: bool,
    timestamp: DateTime<Utc>,
}

impl Leg {
    fn key(&self) -> PairKey {
        let matcher = match (&self.uuid, self.is_nft) {
            (Some(uuid), _) => Matcher::Resource(uuid.clone()),
            (None, true) => Matcher::TokenId(self.token_id.clone()),
            (None, false) => Matcher::Amount(self.amount.normalize()),
        };
        PairKey {
            contract: self.contract.clone(),
            is_nft: self.is_nft,
            matcher,
        }
    }

    fn owner(&self) -> Option<String> {
        match self.kind {
            LegKind::Withdraw => self.from.clone(),
            LegKind::Deposit | LegKind::Direct => self.to.clone(),
        }
    }

    fn into_row(self, from: Option<String>, to: Option<String>) -> TokenTransfer {
        TokenTransfer {
            block_height: self.block_height,
            tx_id: self.tx_id,
            event_index: self.event_index,
            contract: self.contract,
            from,
            to,
            amount: self.amount,
            token_id: self.token_id,
            is_nft: self.is_nft,
            timestamp: self.timestamp,
        }
    }
}

/// Decode one token event into a leg. `Ok(None)` for events that carry no
/// usable movement, `Err` for payloads that are not objects.
fn parse_leg(
    event: &LedgerEvent,
    is_nft: bool,
    timestamp: DateTime<Utc>,
) -> Result<Option<Leg>, IndexerError> {
    let fields = event_fields(event)?;
    let (Some(address), Some(name)) = (
        event.contract_address().and_then(normalize_address),
        event.contract_name(),
    ) else {
        return Ok(None);
    };

    let from = field_address(&fields, FROM_KEYS);
    let to = field_address(&fields, TO_KEYS);
    let token_id = field_str(&fields, "id").or_else(|| field_str(&fields, "tokenId"));
    let amount = match (field_str(&fields, "amount"), is_nft) {
        (Some(raw), _) => parse_amount(&raw)?,
        (None, true) => Decimal::ONE,
        (None, false) => return Ok(None),
    };
    let Some(kind) = leg_kind(&event.event_type, from.is_some(), to.is_some()) else {
        return Ok(None);
    };

    let uuid = if is_nft {
        field_str(&fields, "uuid")
    } else {
        let specific = match kind {
            LegKind::Withdraw => field_str(&fields, "withdrawnUUID"),
            LegKind::Deposit => field_str(&fields, "depositedUUID"),
            LegKind::Direct => None,
        };
        specific.or_else(|| field_str(&fields, "uuid"))
    };

    Ok(Some(Leg {
        block_height: event.block_height,
        tx_id: event.tx_id.clone(),
        event_index: event.event_index,
        contract: format!("{address}.{name}"),
        kind,
        from,
        to,
        amount,
        token_id,
        uuid,
        is_nft,
        timestamp,
    }))
}

/// Pair the legs of one transaction.
fn pair_legs(legs: Vec<Leg>) -> Vec<TokenTransfer> {
    let mut out = Vec::with_capacity(legs.len());
    let mut withdrawals: BTreeMap<PairKey, Vec<Leg>> = BTreeMap::new();
    let mut deposits: BTreeMap<PairKey, Vec<Leg>> = BTreeMap::new();

    for leg in legs {
        match leg.kind {
            LegKind::Direct => {
                let (from, to) = (leg.from.clone(), leg.to.clone());
                out.push(leg.into_row(from, to));
            }
            LegKind::Withdraw => withdrawals.entry(leg.key()).or_default().push(leg),
            LegKind::Deposit => deposits.entry(leg.key()).or_default().push(leg),
        }
    }

    for (key, mut outs) in withdrawals {
        let mut ins = deposits.remove(&key).unwrap_or_default();
        outs.sort_by_key(|l| l.event_index);
        ins.sort_by_key(|l| l.event_index);

        let mut ins = ins.into_iter();
        for w in outs {
            match ins.next() {
                Some(d) => {
                    let from = w.owner();
                    let to = d.owner();
                    let token_id = w.token_id.clone().or_else(|| d.token_id.clone());
                    out.push(TokenTransfer {
                        token_id,
                        ..d.into_row(from, to)
                    });
                }
                None => {
                    let from = w.owner();
                    out.push(w.into_row(from, None));
                }
            }
        }
        for d in ins {
            let to = d.owner();
            out.push(d.into_row(None, to));
        }
    }

    for (_, mut ins) in deposits {
        ins.sort_by_key(|l| l.event_index);
        for d in ins {
            let to = d.owner();
            out.push(d.into_row(None, to));
        }
    }
    out
}

/// Extract transfers from a set of blocks' events.
pub fn extract_transfers<'a>(
    events: impl IntoIterator<Item = (&'a LedgerEvent, DateTime<Utc>)>,
) -> Result<Vec<TokenTransfer>, IndexerError> {
    let mut by_tx: BTreeMap<(u64, u32, String), Vec<Leg>> = BTreeMap::new();
    for (event, timestamp) in events {
        let Some(is_nft) = classify(&event.event_type) else {
            continue;
        };
        if let Some(leg) = parse_leg(event, is_nft, timestamp)? {
            by_tx
                .entry((event.block_height, event.tx_index, event.tx_id.clone()))
                .or_default()
                .push(leg);
        }
    }

    let mut rows: Vec<TokenTransfer> = by_tx
        .into_values()
        .flat_map(pair_legs)
        .filter(|t| {
            let name = t.contract.rsplit('.').next().unwrap_or_default();
            !is_wrapper_contract(name)
        })
        .collect();
    rows.sort_by(|a, b| a.key().cmp(&b.key()));
    Ok(rows)
}

pub struct TokenWorker {
    raw: Arc<dyn RawLedgerStore>,
    derived: Arc<dyn DerivedStore>,
}

impl TokenWorker {
    pub fn new(raw: Arc<dyn RawLedgerStore>, derived: Arc<dyn DerivedStore>) -> Self {
        Self { raw, derived }
    }
}

#[async_trait]
impl Processor for TokenWorker {
    fn name(&self) -> &str {
        TOKEN_WORKER
    }

    async fn process_range(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let range = HeightRange::new(from, to);
        let blocks = self.raw.blocks_in_range(range).await?;
        let rows = extract_transfers(
            blocks
                .iter()
                .flat_map(|b| b.events.iter().map(move |e| (e, b.timestamp))),
        )?;
        let deleted = self.derived.replace_token_transfers(range, &rows).await?;
        debug!(worker = TOKEN_WORKER, from, to, rows = rows.len(), deleted, "token transfers written");
        Ok(())
    }
}
