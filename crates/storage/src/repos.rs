use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use jarindex_core::{DecodedEvent, EventArgs, EventKey, StreamId};
use sqlx::{Executor, FromRow, PgConnection, Postgres};

use crate::models::*;
use crate::mutation::{MutationOp, PurgeScope, Row, RowKey, WriteSet};
use crate::store::StoreError;

// ─── Column conversions ─────────────────────────────────────────────────────

fn to_db(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Query(format!("{value} does not fit in BIGINT")))
}

fn to_int(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Query(format!("{value} does not fit in INTEGER")))
}

fn from_db(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

fn amount(value: &str, column: &str) -> Result<u128, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("bad {column} amount '{value}'")))
}

fn narrow<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

fn lock_clause(for_update: bool) -> &'static str {
    if for_update { " FOR UPDATE" } else { "" }
}

// ─── Row records ────────────────────────────────────────────────────────────

#[derive(FromRow)]
struct HolderRecord {
    collection: String,
    chain_id: i64,
    address: String,
    balance: i64,
    total_minted: i64,
    first_mint_time: Option<i64>,
    last_activity_time: i64,
}

impl TryFrom<HolderRecord> for Holder {
    type Error = StoreError;

    fn try_from(r: HolderRecord) -> Result<Self, StoreError> {
        Ok(Holder {
            address: r.address,
            collection: r.collection,
            chain_id: from_db(r.chain_id, "chain_id")?,
            balance: from_db(r.balance, "balance")?,
            total_minted: from_db(r.total_minted, "total_minted")?,
            first_mint_time: r.first_mint_time,
            last_activity_time: r.last_activity_time,
        })
    }
}

#[derive(FromRow)]
struct TokenRecord {
    collection: String,
    chain_id: i64,
    token_id: i64,
    owner: String,
    minted_by: String,
    is_burned: bool,
    minted_at: i64,
    last_transfer_time: i64,
}

impl TryFrom<TokenRecord> for Token {
    type Error = StoreError;

    fn try_from(r: TokenRecord) -> Result<Self, StoreError> {
        Ok(Token {
            collection: r.collection,
            chain_id: from_db(r.chain_id, "chain_id")?,
            token_id: from_db(r.token_id, "token_id")?,
            owner: r.owner,
            minted_by: r.minted_by,
            is_burned: r.is_burned,
            minted_at: r.minted_at,
            last_transfer_time: r.last_transfer_time,
        })
    }
}

#[derive(FromRow)]
struct UserBalanceRecord {
    address: String,
    generation: i16,
    home_chain_id: i64,
    buckets: String,
    balance_total: i64,
    minted_total: i64,
    last_activity_time: i64,
}

impl TryFrom<UserBalanceRecord> for UserBalance {
    type Error = StoreError;

    fn try_from(r: UserBalanceRecord) -> Result<Self, StoreError> {
        let buckets: BTreeMap<u64, ChainBucket> = serde_json::from_str(&r.buckets)
            .map_err(|e| StoreError::Corrupt(format!("user_balances.buckets: {e}")))?;
        Ok(UserBalance {
            address: r.address,
            generation: narrow(r.generation.into(), "generation")?,
            home_chain_id: from_db(r.home_chain_id, "home_chain_id")?,
            buckets,
            balance_total: from_db(r.balance_total, "balance_total")?,
            minted_total: from_db(r.minted_total, "minted_total")?,
            last_activity_time: r.last_activity_time,
        })
    }
}

#[derive(FromRow)]
struct CollectionStatRecord {
    collection: String,
    chain_id: i64,
    total_supply: i64,
    total_minted: i64,
    total_burned: i64,
    unique_holders: i64,
    last_mint_time: Option<i64>,
}

impl TryFrom<CollectionStatRecord> for CollectionStat {
    type Error = StoreError;

    fn try_from(r: CollectionStatRecord) -> Result<Self, StoreError> {
        Ok(CollectionStat {
            collection: r.collection,
            chain_id: from_db(r.chain_id, "chain_id")?,
            total_supply: from_db(r.total_supply, "total_supply")?,
            total_minted: from_db(r.total_minted, "total_minted")?,
            total_burned: from_db(r.total_burned, "total_burned")?,
            unique_holders: from_db(r.unique_holders, "unique_holders")?,
            last_mint_time: r.last_mint_time,
        })
    }
}

#[derive(FromRow)]
struct VaultRecord {
    chain_id: i64,
    user_address: String,
    account_index: i32,
    honeycomb_id: i64,
    is_active: bool,
    shares: String,
    total_burned: i32,
    burned_generations: i16,
    created_at: i64,
    closed_at: Option<i64>,
    last_activity_time: i64,
}

impl TryFrom<VaultRecord> for Vault {
    type Error = StoreError;

    fn try_from(r: VaultRecord) -> Result<Self, StoreError> {
        Ok(Vault {
            user: r.user_address,
            account_index: narrow(r.account_index.into(), "account_index")?,
            chain_id: from_db(r.chain_id, "chain_id")?,
            honeycomb_id: from_db(r.honeycomb_id, "honeycomb_id")?,
            is_active: r.is_active,
            shares: amount(&r.shares, "shares")?,
            total_burned: narrow(r.total_burned.into(), "total_burned")?,
            burned_generations: BurnedGenerations::from_bits(narrow(
                r.burned_generations.into(),
                "burned_generations",
            )?),
            created_at: r.created_at,
            closed_at: r.closed_at,
            last_activity_time: r.last_activity_time,
        })
    }
}

#[derive(FromRow)]
struct VaultActivityRecord {
    chain_id: i64,
    transaction_hash: String,
    log_index: i32,
    user_address: String,
    account_index: Option<i32>,
    kind: String,
    timestamp: i64,
    block_number: i64,
    honeycomb_id: Option<i64>,
    hj_gen: Option<i16>,
    shares: Option<String>,
    reward: Option<String>,
}

impl TryFrom<VaultActivityRecord> for VaultActivity {
    type Error = StoreError;

    fn try_from(r: VaultActivityRecord) -> Result<Self, StoreError> {
        Ok(VaultActivity {
            chain_id: from_db(r.chain_id, "chain_id")?,
            transaction_hash: r.transaction_hash,
            log_index: narrow(r.log_index.into(), "log_index")?,
            user: r.user_address,
            account_index: r
                .account_index
                .map(|i| narrow(i.into(), "account_index"))
                .transpose()?,
            kind: VaultActivityKind::parse(&r.kind)
                .ok_or_else(|| StoreError::Corrupt(format!("vault activity kind '{}'", r.kind)))?,
            timestamp: r.timestamp,
            block_number: from_db(r.block_number, "block_number")?,
            honeycomb_id: r
                .honeycomb_id
                .map(|v| from_db(v, "honeycomb_id"))
                .transpose()?,
            hj_gen: r.hj_gen.map(|v| narrow(v.into(), "hj_gen")).transpose()?,
            shares: r.shares.as_deref().map(|v| amount(v, "shares")).transpose()?,
            reward: r.reward.as_deref().map(|v| amount(v, "reward")).transpose()?,
        })
    }
}

#[derive(FromRow)]
struct SummaryRecord {
    chain_id: i64,
    user_address: String,
    total_vaults: i64,
    active_vaults: i64,
    total_shares: String,
    total_rewards_claimed: String,
    total_hjs_burned: i64,
    first_vault_time: Option<i64>,
    last_activity_time: i64,
}

impl TryFrom<SummaryRecord> for UserVaultSummary {
    type Error = StoreError;

    fn try_from(r: SummaryRecord) -> Result<Self, StoreError> {
        Ok(UserVaultSummary {
            user: r.user_address,
            chain_id: from_db(r.chain_id, "chain_id")?,
            total_vaults: from_db(r.total_vaults, "total_vaults")?,
            active_vaults: from_db(r.active_vaults, "active_vaults")?,
            total_shares: amount(&r.total_shares, "total_shares")?,
            total_rewards_claimed: amount(&r.total_rewards_claimed, "total_rewards_claimed")?,
            total_hjs_burned: from_db(r.total_hjs_burned, "total_hjs_burned")?,
            first_vault_time: r.first_vault_time,
            last_activity_time: r.last_activity_time,
        })
    }
}

#[derive(FromRow)]
struct NftTransferRecord {
    chain_id: i64,
    transaction_hash: String,
    log_index: i32,
    collection: String,
    token_id: i64,
    from_address: String,
    to_address: String,
    kind: String,
    timestamp: i64,
    block_number: i64,
}

impl TryFrom<NftTransferRecord> for TransferRecord {
    type Error = StoreError;

    fn try_from(r: NftTransferRecord) -> Result<Self, StoreError> {
        Ok(TransferRecord {
            collection: r.collection,
            chain_id: from_db(r.chain_id, "chain_id")?,
            transaction_hash: r.transaction_hash,
            log_index: narrow(r.log_index.into(), "log_index")?,
            token_id: from_db(r.token_id, "token_id")?,
            from: r.from_address,
            to: r.to_address,
            kind: TransferKind::parse(&r.kind)
                .ok_or_else(|| StoreError::Corrupt(format!("transfer kind '{}'", r.kind)))?,
            timestamp: r.timestamp,
            block_number: from_db(r.block_number, "block_number")?,
        })
    }
}

const HOLDER_COLUMNS: &str =
    "collection, chain_id, address, balance, total_minted, first_mint_time, last_activity_time";
const TOKEN_COLUMNS: &str = "collection, chain_id, token_id, owner, minted_by, is_burned, minted_at, last_transfer_time";
const USER_BALANCE_COLUMNS: &str = "address, generation, home_chain_id, buckets, balance_total, minted_total, last_activity_time";
const STAT_COLUMNS: &str = "collection, chain_id, total_supply, total_minted, total_burned, unique_holders, last_mint_time";
const VAULT_COLUMNS: &str = "chain_id, user_address, account_index, honeycomb_id, is_active, shares, total_burned, burned_generations, created_at, closed_at, last_activity_time";
const ACTIVITY_COLUMNS: &str = "chain_id, transaction_hash, log_index, user_address, account_index, kind, timestamp, block_number, honeycomb_id, hj_gen, shares, reward";
const SUMMARY_COLUMNS: &str = "chain_id, user_address, total_vaults, active_vaults, total_shares, total_rewards_claimed, total_hjs_burned, first_vault_time, last_activity_time";
const TRANSFER_COLUMNS: &str = "chain_id, transaction_hash, log_index, collection, token_id, from_address, to_address, kind, timestamp, block_number";

// ─── Point reads ────────────────────────────────────────────────────────────

/// Load one aggregate row, optionally locking it for the rest of the transaction.
pub async fn load_row(
    conn: &mut PgConnection,
    key: &RowKey,
    for_update: bool,
) -> Result<Option<Row>, StoreError> {
    let lock = lock_clause(for_update);
    let row = match key {
        RowKey::Holder(k) => {
            let sql = format!(
                "SELECT {HOLDER_COLUMNS} FROM holders WHERE collection = $1 AND chain_id = $2 AND address = $3{lock}"
            );
            sqlx::query_as::<_, HolderRecord>(&sql)
                .bind(&k.collection)
                .bind(to_db(k.chain_id)?)
                .bind(&k.address)
                .fetch_optional(conn)
                .await?
                .map(|r| Holder::try_from(r).map(Row::Holder))
                .transpose()?
        }
        RowKey::Token(k) => {
            let sql = format!(
                "SELECT {TOKEN_COLUMNS} FROM nft_tokens WHERE collection = $1 AND chain_id = $2 AND token_id = $3{lock}"
            );
            sqlx::query_as::<_, TokenRecord>(&sql)
                .bind(&k.collection)
                .bind(to_db(k.chain_id)?)
                .bind(to_db(k.token_id)?)
                .fetch_optional(conn)
                .await?
                .map(|r| Token::try_from(r).map(Row::Token))
                .transpose()?
        }
        RowKey::UserBalance(k) => {
            let sql = format!(
                "SELECT {USER_BALANCE_COLUMNS} FROM user_balances WHERE address = $1 AND generation = $2{lock}"
            );
            sqlx::query_as::<_, UserBalanceRecord>(&sql)
                .bind(&k.address)
                .bind(i16::from(k.generation))
                .fetch_optional(conn)
                .await?
                .map(|r| UserBalance::try_from(r).map(Row::UserBalance))
                .transpose()?
        }
        RowKey::CollectionStat(k) => {
            let sql = format!(
                "SELECT {STAT_COLUMNS} FROM collection_stats WHERE collection = $1 AND chain_id = $2{lock}"
            );
            sqlx::query_as::<_, CollectionStatRecord>(&sql)
                .bind(&k.collection)
                .bind(to_db(k.chain_id)?)
                .fetch_optional(conn)
                .await?
                .map(|r| CollectionStat::try_from(r).map(Row::CollectionStat))
                .transpose()?
        }
        RowKey::Vault(k) => {
            let sql = format!(
                "SELECT {VAULT_COLUMNS} FROM vaults WHERE chain_id = $1 AND user_address = $2 AND account_index = $3{lock}"
            );
            sqlx::query_as::<_, VaultRecord>(&sql)
                .bind(to_db(k.chain_id)?)
                .bind(&k.user)
                .bind(to_int(k.account_index)?)
                .fetch_optional(conn)
                .await?
                .map(|r| Vault::try_from(r).map(Row::Vault))
                .transpose()?
        }
        RowKey::UserVaultSummary(k) => {
            let sql = format!(
                "SELECT {SUMMARY_COLUMNS} FROM user_vault_summaries WHERE chain_id = $1 AND user_address = $2{lock}"
            );
            sqlx::query_as::<_, SummaryRecord>(&sql)
                .bind(to_db(k.chain_id)?)
                .bind(&k.user)
                .fetch_optional(conn)
                .await?
                .map(|r| UserVaultSummary::try_from(r).map(Row::UserVaultSummary))
                .transpose()?
        }
        RowKey::VaultActivity(k) => {
            let sql = format!(
                "SELECT {ACTIVITY_COLUMNS} FROM vault_activity WHERE chain_id = $1 AND transaction_hash = $2 AND log_index = $3{lock}"
            );
            sqlx::query_as::<_, VaultActivityRecord>(&sql)
                .bind(to_db(k.chain_id)?)
                .bind(&k.transaction_hash)
                .bind(to_int(k.log_index)?)
                .fetch_optional(conn)
                .await?
                .map(|r| VaultActivity::try_from(r).map(Row::VaultActivity))
                .transpose()?
        }
        RowKey::TransferRecord(k) => {
            let sql = format!(
                "SELECT {TRANSFER_COLUMNS} FROM nft_transfers WHERE chain_id = $1 AND transaction_hash = $2 AND log_index = $3{lock}"
            );
            sqlx::query_as::<_, NftTransferRecord>(&sql)
                .bind(to_db(k.chain_id)?)
                .bind(&k.transaction_hash)
                .bind(to_int(k.log_index)?)
                .fetch_optional(conn)
                .await?
                .map(|r| TransferRecord::try_from(r).map(Row::TransferRecord))
                .transpose()?
        }
    };
    Ok(row)
}

/// Number of tokens in a collection/chain minted to an address.
pub async fn minted_count<'e, E>(executor: E, holder: &HolderKey) -> Result<u64, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM nft_tokens WHERE collection = $1 AND chain_id = $2 AND minted_by = $3",
    )
    .bind(&holder.collection)
    .bind(to_db(holder.chain_id)?)
    .bind(&holder.address)
    .fetch_one(executor)
    .await?;
    from_db(row.0, "count")
}

/// Newest transfer in a collection/chain that an address sent or received.
pub async fn last_transfer_time<'e, E>(
    executor: E,
    holder: &HolderKey,
) -> Result<Option<i64>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT MAX(timestamp) FROM nft_transfers \
         WHERE collection = $1 AND chain_id = $2 AND (from_address = $3 OR to_address = $3)",
    )
    .bind(&holder.collection)
    .bind(to_db(holder.chain_id)?)
    .bind(&holder.address)
    .fetch_one(executor)
    .await?;
    Ok(row.0)
}

// ─── Row writes ─────────────────────────────────────────────────────────────

/// Insert `row`; with `upsert` an existing row is overwritten instead of conflicting.
async fn write_row(conn: &mut PgConnection, row: &Row, upsert: bool) -> Result<(), StoreError> {
    match row {
        Row::Holder(h) => {
            let mut sql = format!(
                "INSERT INTO holders ({HOLDER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
            );
            if upsert {
                sql.push_str(
                    " ON CONFLICT (collection, chain_id, address) DO UPDATE SET \
                     balance = EXCLUDED.balance, total_minted = EXCLUDED.total_minted, \
                     first_mint_time = EXCLUDED.first_mint_time, \
                     last_activity_time = EXCLUDED.last_activity_time",
                );
            }
            sqlx::query(&sql)
                .bind(&h.collection)
                .bind(to_db(h.chain_id)?)
                .bind(&h.address)
                .bind(to_db(h.balance)?)
                .bind(to_db(h.total_minted)?)
                .bind(h.first_mint_time)
                .bind(h.last_activity_time)
                .execute(conn)
                .await?;
        }
        Row::Token(t) => {
            let mut sql = format!(
                "INSERT INTO nft_tokens ({TOKEN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
            );
            if upsert {
                sql.push_str(
                    " ON CONFLICT (collection, chain_id, token_id) DO UPDATE SET \
                     owner = EXCLUDED.owner, is_burned = EXCLUDED.is_burned, \
                     last_transfer_time = EXCLUDED.last_transfer_time",
                );
            }
            sqlx::query(&sql)
                .bind(&t.collection)
                .bind(to_db(t.chain_id)?)
                .bind(to_db(t.token_id)?)
                .bind(&t.owner)
                .bind(&t.minted_by)
                .bind(t.is_burned)
                .bind(t.minted_at)
                .bind(t.last_transfer_time)
                .execute(conn)
                .await?;
        }
        Row::UserBalance(ub) => {
            let buckets = serde_json::to_string(&ub.buckets)
                .map_err(|e| StoreError::Query(format!("encode buckets: {e}")))?;
            let mut sql = format!(
                "INSERT INTO user_balances ({USER_BALANCE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
            );
            if upsert {
                sql.push_str(
                    " ON CONFLICT (address, generation) DO UPDATE SET \
                     home_chain_id = EXCLUDED.home_chain_id, buckets = EXCLUDED.buckets, \
                     balance_total = EXCLUDED.balance_total, minted_total = EXCLUDED.minted_total, \
                     last_activity_time = EXCLUDED.last_activity_time",
                );
            }
            sqlx::query(&sql)
                .bind(&ub.address)
                .bind(i16::from(ub.generation))
                .bind(to_db(ub.home_chain_id)?)
                .bind(buckets)
                .bind(to_db(ub.balance_total)?)
                .bind(to_db(ub.minted_total)?)
                .bind(ub.last_activity_time)
                .execute(conn)
                .await?;
        }
        Row::CollectionStat(s) => {
            let mut sql = format!(
                "INSERT INTO collection_stats ({STAT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
            );
            if upsert {
                sql.push_str(
                    " ON CONFLICT (collection, chain_id) DO UPDATE SET \
                     total_supply = EXCLUDED.total_supply, total_minted = EXCLUDED.total_minted, \
                     total_burned = EXCLUDED.total_burned, unique_holders = EXCLUDED.unique_holders, \
                     last_mint_time = EXCLUDED.last_mint_time",
                );
            }
            sqlx::query(&sql)
                .bind(&s.collection)
                .bind(to_db(s.chain_id)?)
                .bind(to_db(s.total_supply)?)
                .bind(to_db(s.total_minted)?)
                .bind(to_db(s.total_burned)?)
                .bind(to_db(s.unique_holders)?)
                .bind(s.last_mint_time)
                .execute(conn)
                .await?;
        }
        Row::Vault(v) => {
            let mut sql = format!(
                "INSERT INTO vaults ({VAULT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
            );
            if upsert {
                sql.push_str(
                    " ON CONFLICT (chain_id, user_address, account_index) DO UPDATE SET \
                     honeycomb_id = EXCLUDED.honeycomb_id, is_active = EXCLUDED.is_active, \
                     shares = EXCLUDED.shares, total_burned = EXCLUDED.total_burned, \
                     burned_generations = EXCLUDED.burned_generations, \
                     closed_at = EXCLUDED.closed_at, last_activity_time = EXCLUDED.last_activity_time",
                );
            }
            sqlx::query(&sql)
                .bind(to_db(v.chain_id)?)
                .bind(&v.user)
                .bind(to_int(v.account_index)?)
                .bind(to_db(v.honeycomb_id)?)
                .bind(v.is_active)
                .bind(v.shares.to_string())
                .bind(to_int(v.total_burned)?)
                .bind(i16::from(v.burned_generations.bits()))
                .bind(v.created_at)
                .bind(v.closed_at)
                .bind(v.last_activity_time)
                .execute(conn)
                .await?;
        }
        Row::UserVaultSummary(s) => {
            let mut sql = format!(
                "INSERT INTO user_vault_summaries ({SUMMARY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            );
            if upsert {
                sql.push_str(
                    " ON CONFLICT (chain_id, user_address) DO UPDATE SET \
                     total_vaults = EXCLUDED.total_vaults, active_vaults = EXCLUDED.active_vaults, \
                     total_shares = EXCLUDED.total_shares, \
                     total_rewards_claimed = EXCLUDED.total_rewards_claimed, \
                     total_hjs_burned = EXCLUDED.total_hjs_burned, \
                     first_vault_time = EXCLUDED.first_vault_time, \
                     last_activity_time = EXCLUDED.last_activity_time",
                );
            }
            sqlx::query(&sql)
                .bind(to_db(s.chain_id)?)
                .bind(&s.user)
                .bind(to_db(s.total_vaults)?)
                .bind(to_db(s.active_vaults)?)
                .bind(s.total_shares.to_string())
                .bind(s.total_rewards_claimed.to_string())
                .bind(to_db(s.total_hjs_burned)?)
                .bind(s.first_vault_time)
                .bind(s.last_activity_time)
                .execute(conn)
                .await?;
        }
        // Append-only: always a plain insert.
        Row::VaultActivity(a) => {
            let sql = format!(
                "INSERT INTO vault_activity ({ACTIVITY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
            );
            sqlx::query(&sql)
                .bind(to_db(a.chain_id)?)
                .bind(&a.transaction_hash)
                .bind(to_int(a.log_index)?)
                .bind(&a.user)
                .bind(a.account_index.map(to_int).transpose()?)
                .bind(a.kind.as_str())
                .bind(a.timestamp)
                .bind(to_db(a.block_number)?)
                .bind(a.honeycomb_id.map(to_db).transpose()?)
                .bind(a.hj_gen.map(i16::from))
                .bind(a.shares.map(|v| v.to_string()))
                .bind(a.reward.map(|v| v.to_string()))
                .execute(conn)
                .await?;
        }
        Row::TransferRecord(r) => {
            let sql = format!(
                "INSERT INTO nft_transfers ({TRANSFER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
            );
            sqlx::query(&sql)
                .bind(to_db(r.chain_id)?)
                .bind(&r.transaction_hash)
                .bind(to_int(r.log_index)?)
                .bind(&r.collection)
                .bind(to_db(r.token_id)?)
                .bind(&r.from)
                .bind(&r.to)
                .bind(r.kind.as_str())
                .bind(r.timestamp)
                .bind(to_db(r.block_number)?)
                .execute(conn)
                .await?;
        }
    }
    Ok(())
}

async fn delete_row(conn: &mut PgConnection, key: &RowKey) -> Result<u64, StoreError> {
    let result = match key {
        RowKey::Holder(k) => {
            sqlx::query("DELETE FROM holders WHERE collection = $1 AND chain_id = $2 AND address = $3")
                .bind(&k.collection)
                .bind(to_db(k.chain_id)?)
                .bind(&k.address)
                .execute(conn)
                .await?
        }
        RowKey::UserBalance(k) => {
            sqlx::query("DELETE FROM user_balances WHERE address = $1 AND generation = $2")
                .bind(&k.address)
                .bind(i16::from(k.generation))
                .execute(conn)
                .await?
        }
        other => {
            return Err(StoreError::Query(format!(
                "{} rows are never deleted individually",
                other.entity()
            )));
        }
    };
    Ok(result.rows_affected())
}

/// Verify every read against the locked current row, then apply the mutations.
///
/// Creates of existing rows, and updates or deletes of missing ones, are conflicts.
pub async fn apply_write_set(conn: &mut PgConnection, write: &WriteSet) -> Result<(), StoreError> {
    for (key, expected) in &write.reads {
        let current = load_row(&mut *conn, key, true).await?;
        if &current != expected {
            return Err(StoreError::Conflict(format!(
                "{} row changed since read",
                key.entity()
            )));
        }
    }

    for m in &write.mutations {
        match m.op {
            MutationOp::Create => write_row(&mut *conn, &m.row, false).await?,
            MutationOp::Update => {
                if load_row(&mut *conn, &m.key(), true).await?.is_none() {
                    return Err(StoreError::Conflict(format!(
                        "Update on {} row that does not exist",
                        m.row.entity()
                    )));
                }
                write_row(&mut *conn, &m.row, true).await?
            }
            MutationOp::Delete => {
                if delete_row(&mut *conn, &m.key()).await? == 0 {
                    return Err(StoreError::Conflict(format!(
                        "{} row vanished before delete",
                        m.row.entity()
                    )));
                }
            }
        }
    }
    Ok(())
}

// ─── Idempotency index & raw log ────────────────────────────────────────────

/// Record an idempotency key. Returns `false` if it was already present.
pub async fn mark_applied<'e, E>(
    executor: E,
    key: &EventKey,
    stream: &StreamId,
) -> Result<bool, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO applied_events (chain_id, transaction_hash, log_index, contract)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (chain_id, transaction_hash, log_index) DO NOTHING
        "#,
    )
    .bind(to_db(key.chain_id)?)
    .bind(&key.transaction_hash)
    .bind(to_int(key.log_index)?)
    .bind(&stream.contract)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn is_applied<'e, E>(executor: E, key: &EventKey) -> Result<bool, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<(i32,)> = sqlx::query_as(
        "SELECT 1 FROM applied_events WHERE chain_id = $1 AND transaction_hash = $2 AND log_index = $3",
    )
    .bind(to_db(key.chain_id)?)
    .bind(&key.transaction_hash)
    .bind(to_int(key.log_index)?)
    .fetch_optional(executor)
    .await?;
    Ok(row.is_some())
}

pub async fn insert_raw_event<'e, E>(executor: E, event: &DecodedEvent) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let args = serde_json::to_string(&event.args)
        .map_err(|e| StoreError::Query(format!("encode event args: {e}")))?;
    sqlx::query(
        r#"
        INSERT INTO raw_events (chain_id, contract, block_number, log_index, block_hash, parent_hash, transaction_hash, timestamp, event_type, args)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (chain_id, contract, block_number, log_index) DO UPDATE
        SET block_hash = $5, parent_hash = $6, transaction_hash = $7, timestamp = $8, event_type = $9, args = $10
        "#,
    )
    .bind(to_db(event.chain_id)?)
    .bind(&event.contract)
    .bind(to_db(event.block_number)?)
    .bind(to_int(event.log_index)?)
    .bind(&event.block_hash)
    .bind(&event.parent_hash)
    .bind(&event.transaction_hash)
    .bind(event.timestamp)
    .bind(event.event_type().as_str())
    .bind(args)
    .execute(executor)
    .await?;
    Ok(())
}

#[derive(FromRow)]
struct RawEventRecord {
    chain_id: i64,
    contract: String,
    block_number: i64,
    log_index: i32,
    block_hash: String,
    parent_hash: String,
    transaction_hash: String,
    timestamp: i64,
    args: String,
}

pub async fn get_raw_events<'e, E>(
    executor: E,
    stream: &StreamId,
) -> Result<Vec<DecodedEvent>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows = sqlx::query_as::<_, RawEventRecord>(
        r#"
        SELECT chain_id, contract, block_number, log_index, block_hash, parent_hash, transaction_hash, timestamp, args
        FROM raw_events
        WHERE chain_id = $1 AND contract = $2
        ORDER BY block_number, log_index
        "#,
    )
    .bind(to_db(stream.chain_id)?)
    .bind(&stream.contract)
    .fetch_all(executor)
    .await?;

    rows.into_iter()
        .map(|r| {
            let args: EventArgs = serde_json::from_str(&r.args)
                .map_err(|e| StoreError::Corrupt(format!("raw_events.args: {e}")))?;
            Ok(DecodedEvent {
                chain_id: from_db(r.chain_id, "chain_id")?,
                contract: r.contract,
                block_number: from_db(r.block_number, "block_number")?,
                block_hash: r.block_hash,
                parent_hash: r.parent_hash,
                log_index: narrow(r.log_index.into(), "log_index")?,
                transaction_hash: r.transaction_hash,
                timestamp: r.timestamp,
                args,
            })
        })
        .collect()
}

pub async fn insert_skipped_event<'e, E>(executor: E, skipped: &SkippedEvent) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO skipped_events (chain_id, transaction_hash, log_index, contract, block_number, reason)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (chain_id, transaction_hash, log_index) DO NOTHING
        "#,
    )
    .bind(to_db(skipped.key.chain_id)?)
    .bind(&skipped.key.transaction_hash)
    .bind(to_int(skipped.key.log_index)?)
    .bind(&skipped.contract)
    .bind(to_db(skipped.block_number)?)
    .bind(&skipped.reason)
    .execute(executor)
    .await?;
    Ok(())
}

#[derive(FromRow)]
struct SkippedEventRecord {
    chain_id: i64,
    transaction_hash: String,
    log_index: i32,
    contract: String,
    block_number: i64,
    reason: String,
}

pub async fn get_skipped_events<'e, E>(
    executor: E,
    stream: &StreamId,
) -> Result<Vec<SkippedEvent>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows = sqlx::query_as::<_, SkippedEventRecord>(
        r#"
        SELECT chain_id, transaction_hash, log_index, contract, block_number, reason
        FROM skipped_events
        WHERE chain_id = $1 AND contract = $2
        ORDER BY block_number, log_index
        "#,
    )
    .bind(to_db(stream.chain_id)?)
    .bind(&stream.contract)
    .fetch_all(executor)
    .await?;

    rows.into_iter()
        .map(|r| {
            Ok(SkippedEvent {
                key: EventKey {
                    chain_id: from_db(r.chain_id, "chain_id")?,
                    transaction_hash: r.transaction_hash,
                    log_index: narrow(r.log_index.into(), "log_index")?,
                },
                contract: r.contract,
                block_number: from_db(r.block_number, "block_number")?,
                reason: r.reason,
            })
        })
        .collect()
}

/// Drop a stream's raw events above `after_block`, plus all of its
/// idempotency keys and dead letters. Runs inside the caller's transaction.
pub async fn truncate_stream(
    conn: &mut PgConnection,
    stream: &StreamId,
    after_block: Option<u64>,
) -> Result<u64, StoreError> {
    let chain_id = to_db(stream.chain_id)?;
    let after = match after_block {
        Some(block) => to_db(block)?,
        None => -1,
    };

    let removed = sqlx::query(
        "DELETE FROM raw_events WHERE chain_id = $1 AND contract = $2 AND block_number > $3",
    )
    .bind(chain_id)
    .bind(&stream.contract)
    .bind(after)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    sqlx::query("DELETE FROM applied_events WHERE chain_id = $1 AND contract = $2")
        .bind(chain_id)
        .bind(&stream.contract)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM skipped_events WHERE chain_id = $1 AND contract = $2")
        .bind(chain_id)
        .bind(&stream.contract)
        .execute(&mut *conn)
        .await?;

    Ok(removed)
}

/// Delete an aggregate family. Runs inside the caller's transaction.
pub async fn purge(
    conn: &mut PgConnection,
    scope: &PurgeScope,
) -> Result<BTreeSet<String>, StoreError> {
    let mut addresses = BTreeSet::new();
    match scope {
        PurgeScope::Collection {
            collection,
            chain_id,
        } => {
            let chain_id = to_db(*chain_id)?;
            let holders: Vec<(String,)> = sqlx::query_as(
                "DELETE FROM holders WHERE collection = $1 AND chain_id = $2 RETURNING address",
            )
            .bind(collection)
            .bind(chain_id)
            .fetch_all(&mut *conn)
            .await?;
            let minters: Vec<(String,)> = sqlx::query_as(
                "DELETE FROM nft_tokens WHERE collection = $1 AND chain_id = $2 RETURNING minted_by",
            )
            .bind(collection)
            .bind(chain_id)
            .fetch_all(&mut *conn)
            .await?;
            addresses.extend(holders.into_iter().chain(minters).map(|(a,)| a));

            for table in ["collection_stats", "nft_transfers"] {
                let sql = format!("DELETE FROM {table} WHERE collection = $1 AND chain_id = $2");
                sqlx::query(&sql)
                    .bind(collection)
                    .bind(chain_id)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        PurgeScope::Vault { chain_id } => {
            let chain_id = to_db(*chain_id)?;
            for table in ["vaults", "vault_activity", "user_vault_summaries"] {
                let sql = format!("DELETE FROM {table} WHERE chain_id = $1");
                sqlx::query(&sql).bind(chain_id).execute(&mut *conn).await?;
            }
        }
    }
    Ok(addresses)
}

/// Wipe every table. Used by `FORCE_REINDEX`.
pub async fn reset<'e, E>(executor: E) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        TRUNCATE cursors, indexed_blocks, raw_events, applied_events, skipped_events,
                 holders, nft_tokens, user_balances, collection_stats, nft_transfers,
                 vaults, vault_activity, user_vault_summaries
        "#,
    )
    .execute(executor)
    .await?;
    Ok(())
}

// ─── Cursor & block queries ─────────────────────────────────────────────────

#[derive(FromRow)]
struct CursorRecord {
    chain_id: i64,
    contract: String,
    block_number: i64,
    block_hash: String,
    log_index: Option<i32>,
    updated_at: DateTime<Utc>,
}

pub async fn get_cursor<'e, E>(executor: E, stream: &StreamId) -> Result<Option<Cursor>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let row = sqlx::query_as::<_, CursorRecord>(
        r#"
        SELECT chain_id, contract, block_number, block_hash, log_index, updated_at
        FROM cursors WHERE chain_id = $1 AND contract = $2
        "#,
    )
    .bind(to_db(stream.chain_id)?)
    .bind(&stream.contract)
    .fetch_optional(executor)
    .await?;

    row.map(|r| {
        Ok(Cursor {
            stream: StreamId::new(from_db(r.chain_id, "chain_id")?, r.contract),
            block_number: from_db(r.block_number, "block_number")?,
            block_hash: r.block_hash,
            log_index: r
                .log_index
                .map(|i| narrow(i.into(), "log_index"))
                .transpose()?,
            updated_at: r.updated_at,
        })
    })
    .transpose()
}

pub async fn set_cursor<'e, E>(executor: E, cursor: &Cursor) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO cursors (chain_id, contract, block_number, block_hash, log_index, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (chain_id, contract) DO UPDATE
        SET block_number = $3, block_hash = $4, log_index = $5, updated_at = $6
        "#,
    )
    .bind(to_db(cursor.stream.chain_id)?)
    .bind(&cursor.stream.contract)
    .bind(to_db(cursor.block_number)?)
    .bind(&cursor.block_hash)
    .bind(cursor.log_index.map(to_int).transpose()?)
    .bind(cursor.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn delete_cursor<'e, E>(executor: E, stream: &StreamId) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("DELETE FROM cursors WHERE chain_id = $1 AND contract = $2")
        .bind(to_db(stream.chain_id)?)
        .bind(&stream.contract)
        .execute(executor)
        .await?;
    Ok(())
}

/// Insert a processed block.
pub async fn insert_block<'e, E>(executor: E, block: &IndexedBlock) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO indexed_blocks (chain_id, contract, block_number, block_hash, parent_hash, timestamp)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (chain_id, contract, block_number) DO UPDATE
        SET block_hash = $4, parent_hash = $5, timestamp = $6
        "#,
    )
    .bind(to_db(block.stream.chain_id)?)
    .bind(&block.stream.contract)
    .bind(to_db(block.block_number)?)
    .bind(&block.block_hash)
    .bind(&block.parent_hash)
    .bind(block.timestamp)
    .execute(executor)
    .await?;
    Ok(())
}

#[derive(FromRow)]
struct IndexedBlockRecord {
    chain_id: i64,
    contract: String,
    block_number: i64,
    block_hash: String,
    parent_hash: String,
    timestamp: i64,
}

pub async fn get_blocks<'e, E>(
    executor: E,
    stream: &StreamId,
    from: u64,
    to: u64,
) -> Result<Vec<IndexedBlock>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows = sqlx::query_as::<_, IndexedBlockRecord>(
        r#"
        SELECT chain_id, contract, block_number, block_hash, parent_hash, timestamp
        FROM indexed_blocks
        WHERE chain_id = $1 AND contract = $2 AND block_number BETWEEN $3 AND $4
        ORDER BY block_number DESC
        "#,
    )
    .bind(to_db(stream.chain_id)?)
    .bind(&stream.contract)
    .bind(to_db(from)?)
    .bind(to_db(to)?)
    .fetch_all(executor)
    .await?;

    rows.into_iter()
        .map(|r| {
            Ok(IndexedBlock {
                stream: StreamId::new(from_db(r.chain_id, "chain_id")?, r.contract),
                block_number: from_db(r.block_number, "block_number")?,
                block_hash: r.block_hash,
                parent_hash: r.parent_hash,
                timestamp: r.timestamp,
            })
        })
        .collect()
}

/// Delete recorded blocks above `after_block` (all when `None`).
pub async fn delete_blocks_after<'e, E>(
    executor: E,
    stream: &StreamId,
    after_block: Option<u64>,
) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let after = match after_block {
        Some(block) => to_db(block)?,
        None => -1,
    };
    sqlx::query(
        "DELETE FROM indexed_blocks WHERE chain_id = $1 AND contract = $2 AND block_number > $3",
    )
    .bind(to_db(stream.chain_id)?)
    .bind(&stream.contract)
    .bind(after)
    .execute(executor)
    .await?;
    Ok(())
}

// ─── Leaderboards & feeds ───────────────────────────────────────────────────

/// Get top holders of a collection on one chain, ordered by balance descending.
pub async fn get_top_holders<'e, E>(
    executor: E,
    collection: &str,
    chain_id: u64,
    limit: i64,
) -> Result<Vec<Holder>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "SELECT {HOLDER_COLUMNS} FROM holders WHERE collection = $1 AND chain_id = $2 \
         ORDER BY balance DESC, address LIMIT $3"
    );
    sqlx::query_as::<_, HolderRecord>(&sql)
        .bind(collection)
        .bind(to_db(chain_id)?)
        .bind(limit)
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(Holder::try_from)
        .collect()
}

pub async fn get_top_user_balances<'e, E>(
    executor: E,
    generation: u8,
    limit: i64,
) -> Result<Vec<UserBalance>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "SELECT {USER_BALANCE_COLUMNS} FROM user_balances WHERE generation = $1 \
         ORDER BY balance_total DESC, address LIMIT $2"
    );
    sqlx::query_as::<_, UserBalanceRecord>(&sql)
        .bind(i16::from(generation))
        .bind(limit)
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(UserBalance::try_from)
        .collect()
}

pub async fn get_recent_transfers<'e, E>(
    executor: E,
    collection: &str,
    chain_id: Option<u64>,
    mints_only: bool,
    limit: i64,
) -> Result<Vec<TransferRecord>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "SELECT {TRANSFER_COLUMNS} FROM nft_transfers \
         WHERE collection = $1 AND ($2::BIGINT IS NULL OR chain_id = $2) AND (NOT $3 OR kind = 'mint') \
         ORDER BY timestamp DESC, block_number DESC, log_index DESC LIMIT $4"
    );
    sqlx::query_as::<_, NftTransferRecord>(&sql)
        .bind(collection)
        .bind(chain_id.map(to_db).transpose()?)
        .bind(mints_only)
        .bind(limit)
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(TransferRecord::try_from)
        .collect()
}

pub async fn get_vault_activity<'e, E>(
    executor: E,
    user: &str,
    limit: i64,
) -> Result<Vec<VaultActivity>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "SELECT {ACTIVITY_COLUMNS} FROM vault_activity WHERE user_address = $1 \
         ORDER BY timestamp DESC, block_number DESC, log_index DESC LIMIT $2"
    );
    sqlx::query_as::<_, VaultActivityRecord>(&sql)
        .bind(user)
        .bind(limit)
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(VaultActivity::try_from)
        .collect()
}
