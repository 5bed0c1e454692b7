//! Resource pools and their balance arithmetic.
//!
//! A pool is the only place resource balances live. Every mutation moves
//! an amount between the two buckets (or, for minting, into the charged
//! bucket from outside) and keeps `charged + discharged == total_minted`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("charged balance {available} is less than {requested}")]
    InsufficientCharged { available: u64, requested: u64 },

    #[error("discharged balance {available} is less than {requested}")]
    InsufficientDischarged { available: u64, requested: u64 },

    #[error("balance arithmetic overflow")]
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub pool_id: String,
    /// The society that owns the balances.
    pub owner_id: String,
    /// Identity allowed to sign mint requests.
    pub custodian_id: String,
    /// Operational contexts whose relationships draw on this pool.
    pub contexts: Vec<String>,
    pub charged_balance: u64,
    pub discharged_balance: u64,
    pub total_minted: u64,
    pub total_discharged: u64,
    pub total_recharged: u64,
    /// Number of mints so far; custodian proofs sign over it.
    pub mint_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Point-in-time balances of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBalance {
    pub pool_id: String,
    pub charged: u64,
    pub discharged: u64,
    pub total: u64,
}

impl ResourcePool {
    pub fn new(
        pool_id: &str,
        owner_id: &str,
        custodian_id: &str,
        contexts: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            pool_id: pool_id.to_string(),
            owner_id: owner_id.to_string(),
            custodian_id: custodian_id.to_string(),
            contexts,
            charged_balance: 0,
            discharged_balance: 0,
            total_minted: 0,
            total_discharged: 0,
            total_recharged: 0,
            mint_count: 0,
            created_at: now,
            last_updated: now,
        }
    }

    pub fn balance(&self) -> PoolBalance {
        PoolBalance {
            pool_id: self.pool_id.clone(),
            charged: self.charged_balance,
            discharged: self.discharged_balance,
            total: self.charged_balance.saturating_add(self.discharged_balance),
        }
    }

    /// Nothing was created or destroyed outside of minting.
    pub fn is_conserved(&self) -> bool {
        self.charged_balance as u128 + self.discharged_balance as u128 == self.total_minted as u128
    }

    pub(crate) fn mint(&mut self, amount: u64, now: DateTime<Utc>) -> Result<(), BalanceError> {
        let total_minted = self.total_minted.checked_add(amount).ok_or(BalanceError::Overflow)?;
        let charged = self.charged_balance.checked_add(amount).ok_or(BalanceError::Overflow)?;
        self.total_minted = total_minted;
        self.charged_balance = charged;
        self.mint_count += 1;
        self.touch(now);
        Ok(())
    }

    /// charged → discharged.
    pub(crate) fn discharge(&mut self, amount: u64, now: DateTime<Utc>) -> Result<(), BalanceError> {
        let charged = self.charged_balance.checked_sub(amount).ok_or(
            BalanceError::InsufficientCharged {
                available: self.charged_balance,
                requested: amount,
            },
        )?;
        let discharged = self
            .discharged_balance
            .checked_add(amount)
            .ok_or(BalanceError::Overflow)?;
        let total = self.total_discharged.checked_add(amount).ok_or(BalanceError::Overflow)?;
        self.charged_balance = charged;
        self.discharged_balance = discharged;
        self.total_discharged = total;
        self.touch(now);
        Ok(())
    }

    /// discharged → charged.
    pub(crate) fn recharge(&mut self, amount: u64, now: DateTime<Utc>) -> Result<(), BalanceError> {
        let discharged = self.discharged_balance.checked_sub(amount).ok_or(
            BalanceError::InsufficientDischarged {
                available: self.discharged_balance,
                requested: amount,
            },
        )?;
        let charged = self.charged_balance.checked_add(amount).ok_or(BalanceError::Overflow)?;
        let total = self.total_recharged.checked_add(amount).ok_or(BalanceError::Overflow)?;
        self.discharged_balance = discharged;
        self.charged_balance = charged;
        self.total_recharged = total;
        self.touch(now);
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_updated {
            self.last_updated = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ResourcePool {
        ResourcePool::new("grid", "society-1", "treasurer", vec!["energy".into()], Utc::now())
    }

    #[test]
    fn test_cycle_keeps_conservation() {
        let mut p = pool();
        let now = Utc::now();
        p.mint(1_000_000, now).unwrap();
        p.discharge(100, now).unwrap();
        assert_eq!((p.charged_balance, p.discharged_balance), (999_900, 100));
        p.recharge(50, now).unwrap();
        assert_eq!((p.charged_balance, p.discharged_balance), (999_950, 50));
        assert!(p.is_conserved());
        assert_eq!(p.total_discharged, 100);
        assert_eq!(p.total_recharged, 50);
        assert_eq!(p.mint_count, 1);
    }

    #[test]
    fn test_insufficient_balances_leave_pool_untouched() {
        let mut p = pool();
        p.mint(10, Utc::now()).unwrap();
        let before = p.clone();
        assert_eq!(
            p.discharge(11, Utc::now()),
            Err(BalanceError::InsufficientCharged {
                available: 10,
                requested: 11
            })
        );
        assert_eq!(
            p.recharge(1, Utc::now()),
            Err(BalanceError::InsufficientDischarged {
                available: 0,
                requested: 1
            })
        );
        assert_eq!(p, before);
    }

    #[test]
    fn test_mint_overflow_rejected() {
        let mut p = pool();
        p.mint(u64::MAX, Utc::now()).unwrap();
        assert_eq!(p.mint(1, Utc::now()), Err(BalanceError::Overflow));
        assert_eq!(p.charged_balance, u64::MAX);
        assert!(p.is_conserved());
    }

    #[test]
    fn test_balance_total() {
        let mut p = pool();
        p.mint(70, Utc::now()).unwrap();
        p.discharge(20, Utc::now()).unwrap();
        let b = p.balance();
        assert_eq!((b.charged, b.discharged, b.total), (50, 20, 70));
    }
}
