//! User CRUD operations

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{get_ts, sql_text_enum, ts};
use crate::amount::Amount;
use crate::error::{LedgerError, Result};

/// KYC status, owned by the identity collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl KycStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KycStatus::Pending => "pending",
            KycStatus::Approved => "approved",
            KycStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for KycStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KycStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(KycStatus::Pending),
            "approved" => Ok(KycStatus::Approved),
            "rejected" => Ok(KycStatus::Rejected),
            other => Err(LedgerError::InvalidInput(format!("unknown KYC status '{}'", other))),
        }
    }
}

sql_text_enum!(KycStatus);

/// User row from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRow {
    pub wallet: String,
    pub kyc_status: KycStatus,
    pub active_balance: Amount,
    pub pending_deposits: Amount,
    pub pending_withdrawals: Amount,
    pub reward_balance: Amount,
    pub total_deposited: Amount,
    pub total_withdrawn: Amount,
    pub total_borrowed: Amount,
    pub last_accrual_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub archived: bool,
    pub updated_at: DateTime<Utc>,
}

impl UserRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            wallet: row.get("wallet")?,
            kyc_status: row.get("kyc_status")?,
            active_balance: row.get("active_balance")?,
            pending_deposits: row.get("pending_deposits")?,
            pending_withdrawals: row.get("pending_withdrawals")?,
            reward_balance: row.get("reward_balance")?,
            total_deposited: row.get("total_deposited")?,
            total_withdrawn: row.get("total_withdrawn")?,
            total_borrowed: row.get("total_borrowed")?,
            last_accrual_at: get_ts(row, "last_accrual_at")?,
            registered_at: get_ts(row, "registered_at")?,
            archived: row.get::<_, i64>("archived")? != 0,
            updated_at: get_ts(row, "updated_at")?,
        })
    }
}

/// Get user by wallet
pub fn get_user(conn: &Connection, wallet: &str) -> Result<Option<UserRow>> {
    conn.query_row(
        "SELECT * FROM users WHERE wallet = ?",
        params![wallet],
        UserRow::from_row,
    )
    .optional()
    .map_err(|e| LedgerError::db("Query failed", e))
}

/// Get user by wallet, failing with `NotRegistered` when absent or archived
pub fn require_active_user(conn: &Connection, wallet: &str) -> Result<UserRow> {
    match get_user(conn, wallet)? {
        Some(user) if !user.archived => Ok(user),
        _ => Err(LedgerError::NotRegistered(wallet.to_string())),
    }
}

/// Insert a fresh user with zero balances
pub fn insert_user(conn: &Connection, wallet: &str, now: DateTime<Utc>) -> Result<UserRow> {
    if get_user(conn, wallet)?.is_some() {
        return Err(LedgerError::AlreadyRegistered(wallet.to_string()));
    }

    let stamp = ts(&now);
    conn.execute(
        "INSERT INTO users (wallet, last_accrual_at, registered_at, updated_at) VALUES (?1, ?2, ?2, ?2)",
        params![wallet, stamp],
    )
    .map_err(|e| LedgerError::db("Insert failed", e))?;

    debug!(wallet = %wallet, "Inserted user");

    get_user(conn, wallet)?.ok_or_else(|| LedgerError::db("Insert failed", "user row missing after insert"))
}

/// Persist every mutable balance field of `user`
pub fn save_balances(conn: &Connection, user: &UserRow) -> Result<()> {
    let changed = conn
        .execute(
            r#"
            UPDATE users SET
                active_balance = ?2,
                pending_deposits = ?3,
                pending_withdrawals = ?4,
                reward_balance = ?5,
                total_deposited = ?6,
                total_withdrawn = ?7,
                total_borrowed = ?8,
                last_accrual_at = ?9,
                updated_at = ?10
            WHERE wallet = ?1
            "#,
            params![
                user.wallet,
                user.active_balance,
                user.pending_deposits,
                user.pending_withdrawals,
                user.reward_balance,
                user.total_deposited,
                user.total_withdrawn,
                user.total_borrowed,
                ts(&user.last_accrual_at),
                ts(&user.updated_at),
            ],
        )
        .map_err(|e| LedgerError::db("Update failed", e))?;

    if changed == 0 {
        return Err(LedgerError::NotRegistered(user.wallet.clone()));
    }
    Ok(())
}

pub fn set_kyc_status(conn: &Connection, wallet: &str, status: KycStatus, now: DateTime<Utc>) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE users SET kyc_status = ?2, updated_at = ?3 WHERE wallet = ?1",
            params![wallet, status, ts(&now)],
        )
        .map_err(|e| LedgerError::db("Update failed", e))?;

    if changed == 0 {
        return Err(LedgerError::NotRegistered(wallet.to_string()));
    }
    Ok(())
}

/// Soft-archive; the row and its history are kept
pub fn set_archived(conn: &Connection, wallet: &str, now: DateTime<Utc>) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE users SET archived = 1, updated_at = ?2 WHERE wallet = ?1",
            params![wallet, ts(&now)],
        )
        .map_err(|e| LedgerError::db("Update failed", e))?;

    if changed == 0 {
        return Err(LedgerError::NotRegistered(wallet.to_string()));
    }
    Ok(())
}

/// List users ordered by registration
pub fn list_users(conn: &Connection, limit: u32, offset: u32) -> Result<Vec<UserRow>> {
    let mut stmt = conn
        .prepare("SELECT * FROM users ORDER BY registered_at, wallet LIMIT ? OFFSET ?")
        .map_err(|e| LedgerError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![limit, offset], UserRow::from_row)
        .map_err(|e| LedgerError::db("Query failed", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| LedgerError::db("Row parse failed", e))?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerDb;

    #[test]
    fn test_insert_and_get() {
        let db = LedgerDb::open_in_memory().unwrap();
        let now = Utc::now();
        let user = db.with_tx(|tx| insert_user(tx, "0xalice", now)).unwrap();
        assert_eq!(user.kyc_status, KycStatus::Pending);
        assert_eq!(user.active_balance, Amount::ZERO);
        assert!(!user.archived);

        let dup = db.with_tx(|tx| insert_user(tx, "0xalice", now));
        assert!(matches!(dup, Err(LedgerError::AlreadyRegistered(_))));
    }

    #[test]
    fn test_save_balances_round_trips_large_amounts() {
        let db = LedgerDb::open_in_memory().unwrap();
        let mut user = db.with_tx(|tx| insert_user(tx, "0xbob", Utc::now())).unwrap();
        user.active_balance = Amount::new(10u128.pow(30));
        user.reward_balance = Amount::new(7);
        db.with_tx(|tx| save_balances(tx, &user)).unwrap();

        let back = db.with_conn(|c| get_user(c, "0xbob")).unwrap().unwrap();
        assert_eq!(back.active_balance, Amount::new(10u128.pow(30)));
        assert_eq!(back.reward_balance, Amount::new(7));
    }

    #[test]
    fn test_archived_user_is_not_active() {
        let db = LedgerDb::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_tx(|tx| insert_user(tx, "0xcarol", now)).unwrap();
        db.with_tx(|tx| set_archived(tx, "0xcarol", now)).unwrap();

        let result = db.with_conn(|c| require_active_user(c, "0xcarol"));
        assert!(matches!(result, Err(LedgerError::NotRegistered(_))));
        assert!(db.with_conn(|c| get_user(c, "0xcarol")).unwrap().is_some());
    }

    #[test]
    fn test_kyc_status_update() {
        let db = LedgerDb::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_tx(|tx| insert_user(tx, "0xdave", now)).unwrap();
        db.with_tx(|tx| set_kyc_status(tx, "0xdave", KycStatus::Approved, now)).unwrap();
        let user = db.with_conn(|c| get_user(c, "0xdave")).unwrap().unwrap();
        assert_eq!(user.kyc_status, KycStatus::Approved);

        let missing = db.with_tx(|tx| set_kyc_status(tx, "0xnobody", KycStatus::Approved, now));
        assert!(matches!(missing, Err(LedgerError::NotRegistered(_))));
    }
}
