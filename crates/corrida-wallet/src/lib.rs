//! Corrida Wallet - the driver wallet ledger
//!
//! The ledger is:
//! - Account-keyed by driver id, single currency per deployment
//! - Append-only (transactions are never mutated or deleted)
//! - Idempotent on ride references (a duplicate completion credit is a
//!   no-op returning the existing transaction)
//! - Hold-based: ride credits enter blocked_balance and move to
//!   available_balance only after the hold period, via a background
//!   sweep
//!
//! # Invariants
//!
//! 1. available_balance and blocked_balance are never negative
//! 2. available + blocked equals the signed sum of the account's
//!    transactions at all times (hold release moves funds between the
//!    two buckets without changing the sum)
//! 3. Balance update and transaction append commit together or not at
//!    all; postings for one account serialize
//! 4. No lock is held across the external payout call - the debit
//!    commits first and a payout failure is reconciled by a
//!    compensating credit

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use corrida_realtime::EventObserver;
use corrida_types::{
    round_money, CoreError, Currency, DriverId, Result, RideEvent, RideId, TransactionId,
    WithdrawalId,
};

/// Wallet configuration
#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub currency: Currency,
    /// How long ride credits stay blocked before release (D+N)
    pub hold_period: Duration,
    /// Smallest withdrawal the platform pays out
    pub minimum_withdrawal: Decimal,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            currency: Currency::BRL,
            hold_period: Duration::hours(24),
            minimum_withdrawal: Decimal::new(5000, 2),
        }
    }
}

/// Ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    RideCredit,
    Withdrawal,
    Adjustment,
}

/// A single ledger entry (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub driver_id: DriverId,
    /// Signed amount: positive for credits, negative for withdrawals
    pub amount: Decimal,
    /// available + blocked after this posting
    pub balance_after: Decimal,
    pub tx_type: TransactionType,
    pub description: String,
    /// Ride id for credits, withdrawal id for debits and adjustments
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-driver balance aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletAccount {
    pub driver_id: DriverId,
    pub available_balance: Decimal,
    pub blocked_balance: Decimal,
    pub currency: Currency,
}

impl WalletAccount {
    /// A zero-balance account (also what wallet reads return before the
    /// first credit).
    pub fn empty(driver_id: DriverId, currency: Currency) -> Self {
        Self {
            driver_id,
            available_balance: Decimal::ZERO,
            blocked_balance: Decimal::ZERO,
            currency,
        }
    }

    pub fn total(&self) -> Decimal {
        self.available_balance + self.blocked_balance
    }
}

/// Blocked funds waiting out the hold period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hold {
    pub driver_id: DriverId,
    pub amount: Decimal,
    pub ride_id: RideId,
    pub release_at: DateTime<Utc>,
}

/// A committed withdrawal, ready for the payout handoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: WithdrawalId,
    pub driver_id: DriverId,
    pub amount: Decimal,
    pub payout_target: String,
    pub transaction_id: TransactionId,
    pub created_at: DateTime<Utc>,
}

/// The external payout capability (bank/PIX rails), out of scope here.
///
/// Called only AFTER the withdrawal debit has committed; a failure is
/// reconciled with `WalletLedger::reconcile_failed_payout`, never by
/// rolling the debit back under a lock.
#[async_trait]
pub trait PayoutGateway: Send + Sync {
    /// Hand a committed withdrawal to the payout rails; returns the
    /// provider transaction id.
    async fn send_payout(&self, withdrawal: &Withdrawal) -> Result<String>;
}

/// Gateway stub that acknowledges every payout
pub struct LoggingPayoutGateway;

#[async_trait]
impl PayoutGateway for LoggingPayoutGateway {
    async fn send_payout(&self, withdrawal: &Withdrawal) -> Result<String> {
        info!(
            withdrawal = %withdrawal.id,
            driver = %withdrawal.driver_id,
            amount = %withdrawal.amount,
            target = %withdrawal.payout_target,
            "payout handed off"
        );
        Ok(format!("payout_{}", withdrawal.id))
    }
}

/// The driver wallet ledger
///
/// Thread-safe. All postings take the account and transaction locks
/// together (fixed order: accounts, transactions, refs, holds) so a
/// posting is all-or-nothing and per-account mutations serialize.
pub struct WalletLedger {
    config: WalletConfig,
    accounts: RwLock<HashMap<DriverId, WalletAccount>>,
    /// All entries (append-only)
    transactions: RwLock<Vec<Transaction>>,
    /// Ride id → credit transaction, the idempotency guard
    credit_refs: RwLock<HashMap<RideId, TransactionId>>,
    /// Outstanding holds, drained by the release sweep
    holds: RwLock<Vec<Hold>>,
}

impl WalletLedger {
    pub fn new(config: WalletConfig) -> Self {
        Self {
            config,
            accounts: RwLock::new(HashMap::new()),
            transactions: RwLock::new(Vec::new()),
            credit_refs: RwLock::new(HashMap::new()),
            holds: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    /// Credit a completed ride's fare into blocked funds.
    ///
    /// Idempotent on `ride_id`: a second credit for the same ride returns
    /// the original transaction without touching balances.
    pub fn credit(&self, driver: DriverId, amount: Decimal, ride_id: RideId) -> Result<Transaction> {
        if amount <= Decimal::ZERO {
            return Err(CoreError::invalid_input(
                "amount",
                format!("credit amount {amount} must be positive"),
            ));
        }
        let amount = round_money(amount);

        let mut accounts = self.accounts.write();
        let mut transactions = self.transactions.write();
        let mut credit_refs = self.credit_refs.write();
        let mut holds = self.holds.write();

        if let Some(existing_id) = credit_refs.get(&ride_id) {
            let existing = transactions
                .iter()
                .find(|t| t.id == *existing_id)
                .cloned()
                .ok_or_else(|| CoreError::not_found("transaction", existing_id))?;
            info!(ride = %ride_id, driver = %driver, "duplicate ride credit ignored");
            return Ok(existing);
        }

        let account = accounts
            .entry(driver)
            .or_insert_with(|| WalletAccount::empty(driver, self.config.currency));
        account.blocked_balance += amount;

        let transaction = Transaction {
            id: TransactionId::new(),
            driver_id: driver,
            amount,
            balance_after: account.total(),
            tx_type: TransactionType::RideCredit,
            description: "Ride fare credit".to_string(),
            reference: Some(ride_id.to_string()),
            created_at: Utc::now(),
        };
        credit_refs.insert(ride_id, transaction.id);
        holds.push(Hold {
            driver_id: driver,
            amount,
            ride_id,
            release_at: transaction.created_at + self.config.hold_period,
        });
        transactions.push(transaction.clone());

        info!(
            driver = %driver,
            ride = %ride_id,
            %amount,
            blocked = %account.blocked_balance,
            "ride credit posted"
        );
        Ok(transaction)
    }

    /// Move funds whose hold period elapsed from blocked to available.
    ///
    /// Runs from a periodic sweep; returns the number of holds released.
    /// The account total does not change, so no ledger entry is written.
    pub fn release_due_holds(&self, now: DateTime<Utc>) -> usize {
        let mut accounts = self.accounts.write();
        let mut holds = self.holds.write();

        let mut released = 0;
        holds.retain(|hold| {
            if hold.release_at > now {
                return true;
            }
            if let Some(account) = accounts.get_mut(&hold.driver_id) {
                account.blocked_balance -= hold.amount;
                account.available_balance += hold.amount;
                info!(
                    driver = %hold.driver_id,
                    ride = %hold.ride_id,
                    amount = %hold.amount,
                    "hold released"
                );
            }
            released += 1;
            false
        });
        released
    }

    /// Debit available funds for a withdrawal and append the entry.
    ///
    /// The returned `Withdrawal` is what the caller hands to the payout
    /// gateway - after this method returns, outside any wallet lock.
    pub fn request_withdrawal(
        &self,
        driver: DriverId,
        amount: Decimal,
        payout_target: impl Into<String>,
    ) -> Result<Withdrawal> {
        if amount <= Decimal::ZERO {
            return Err(CoreError::invalid_input(
                "amount",
                format!("withdrawal amount {amount} must be positive"),
            ));
        }
        let amount = round_money(amount);
        if amount < self.config.minimum_withdrawal {
            return Err(CoreError::invalid_input(
                "amount",
                format!(
                    "withdrawal {amount} below minimum {}",
                    self.config.minimum_withdrawal
                ),
            ));
        }

        let mut accounts = self.accounts.write();
        let mut transactions = self.transactions.write();

        let account = accounts
            .get_mut(&driver)
            .ok_or_else(|| CoreError::not_found("wallet", driver))?;
        if amount > account.available_balance {
            return Err(CoreError::InsufficientFunds {
                requested: amount,
                available: account.available_balance,
            });
        }
        account.available_balance -= amount;

        let payout_target = payout_target.into();
        let withdrawal_id = WithdrawalId::new();
        let transaction = Transaction {
            id: TransactionId::new(),
            driver_id: driver,
            amount: -amount,
            balance_after: account.total(),
            tx_type: TransactionType::Withdrawal,
            description: format!("Withdrawal to {payout_target}"),
            reference: Some(withdrawal_id.to_string()),
            created_at: Utc::now(),
        };
        transactions.push(transaction.clone());

        info!(
            driver = %driver,
            withdrawal = %withdrawal_id,
            %amount,
            available = %account.available_balance,
            "withdrawal debited"
        );
        Ok(Withdrawal {
            id: withdrawal_id,
            driver_id: driver,
            amount,
            payout_target,
            transaction_id: transaction.id,
            created_at: transaction.created_at,
        })
    }

    /// Compensating credit after the payout rails rejected a committed
    /// withdrawal.
    pub fn reconcile_failed_payout(&self, withdrawal: &Withdrawal) -> Result<Transaction> {
        let mut accounts = self.accounts.write();
        let mut transactions = self.transactions.write();

        let account = accounts
            .get_mut(&withdrawal.driver_id)
            .ok_or_else(|| CoreError::not_found("wallet", withdrawal.driver_id))?;
        account.available_balance += withdrawal.amount;

        let transaction = Transaction {
            id: TransactionId::new(),
            driver_id: withdrawal.driver_id,
            amount: withdrawal.amount,
            balance_after: account.total(),
            tx_type: TransactionType::Adjustment,
            description: format!("Payout {} failed, funds returned", withdrawal.id),
            reference: Some(withdrawal.id.to_string()),
            created_at: Utc::now(),
        };
        transactions.push(transaction.clone());

        warn!(
            driver = %withdrawal.driver_id,
            withdrawal = %withdrawal.id,
            amount = %withdrawal.amount,
            "failed payout reconciled"
        );
        Ok(transaction)
    }

    /// Account snapshot, if the driver has ever been credited
    pub fn account(&self, driver: DriverId) -> Option<WalletAccount> {
        self.accounts.read().get(&driver).cloned()
    }

    /// A driver's entries, newest first
    pub fn transactions_for(&self, driver: DriverId) -> Vec<Transaction> {
        self.transactions
            .read()
            .iter()
            .filter(|t| t.driver_id == driver)
            .rev()
            .cloned()
            .collect()
    }

    /// Outstanding holds for a driver
    pub fn holds_for(&self, driver: DriverId) -> Vec<Hold> {
        self.holds
            .read()
            .iter()
            .filter(|h| h.driver_id == driver)
            .cloned()
            .collect()
    }

    /// Total number of ledger entries
    pub fn entry_count(&self) -> usize {
        self.transactions.read().len()
    }
}

impl Default for WalletLedger {
    fn default() -> Self {
        Self::new(WalletConfig::default())
    }
}

/// Settlement hook: posts the ride credit when a completion commits.
impl EventObserver for WalletLedger {
    fn on_event(&self, event: &RideEvent) {
        if let RideEvent::RideCompleted {
            ride_id,
            driver_id,
            final_price,
            ..
        } = event
        {
            if let Err(e) = self.credit(*driver_id, *final_price, *ride_id) {
                warn!(ride = %ride_id, driver = %driver_id, error = %e, "ride credit failed");
            }
        }
    }
}
