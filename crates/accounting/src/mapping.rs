//! Payment-method to chart-of-accounts resolution.

use std::collections::HashMap;

use crate::ledger::Account;
use crate::transaction::PaymentMethodId;

/// Ledger accounts configured for one payment method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMethodAccount {
    pub payment_method_id: PaymentMethodId,
    pub name: String,
    /// Account set directly on the payment method.
    pub account: Option<Account>,
    /// Account of the settlement bank account, used when `account` is unset.
    pub bank_account: Option<Account>,
}

impl PaymentMethodAccount {
    pub fn resolved(&self) -> Option<&Account> {
        self.account.as_ref().or(self.bank_account.as_ref())
    }
}

/// Everything journal generation needs to turn a sale into ledger legs.
///
/// Only the sales revenue account is mandatory. Tax, service charge and
/// discount amounts fold into the revenue line when their accounts are unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountMapping {
    payment_methods: HashMap<PaymentMethodId, PaymentMethodAccount>,
    sales_revenue: Option<Account>,
    tax_payable: Option<Account>,
    service_charge: Option<Account>,
    sales_discount: Option<Account>,
}

impl AccountMapping {
    pub fn new(sales_revenue: Option<Account>) -> Self {
        Self {
            sales_revenue,
            ..Self::default()
        }
    }

    pub fn with_payment_method(mut self, pm: PaymentMethodAccount) -> Self {
        self.payment_methods.insert(pm.payment_method_id, pm);
        self
    }

    pub fn with_tax_account(mut self, account: Account) -> Self {
        self.tax_payable = Some(account);
        self
    }

    pub fn with_service_charge_account(mut self, account: Account) -> Self {
        self.service_charge = Some(account);
        self
    }

    pub fn with_discount_account(mut self, account: Account) -> Self {
        self.sales_discount = Some(account);
        self
    }

    pub fn payment_method(&self, id: PaymentMethodId) -> Option<&PaymentMethodAccount> {
        self.payment_methods.get(&id)
    }

    /// Debit account for a payment method, falling back to its bank account.
    pub fn debit_account(&self, id: PaymentMethodId) -> Option<&Account> {
        self.payment_methods.get(&id).and_then(PaymentMethodAccount::resolved)
    }

    pub fn sales_revenue(&self) -> Option<&Account> {
        self.sales_revenue.as_ref()
    }

    pub fn tax_payable(&self) -> Option<&Account> {
        self.tax_payable.as_ref()
    }

    pub fn service_charge(&self) -> Option<&Account> {
        self.service_charge.as_ref()
    }

    pub fn sales_discount(&self) -> Option<&Account> {
        self.sales_discount.as_ref()
    }

    pub fn payment_method_count(&self) -> usize {
        self.payment_methods.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AccountKind;

    #[test]
    fn bank_account_is_used_when_payment_method_has_no_account() {
        let bank = Account::new("1120", "Bank BCA", AccountKind::Asset);
        let mapping = AccountMapping::new(None).with_payment_method(PaymentMethodAccount {
            payment_method_id: PaymentMethodId(7),
            name: "Debit Card".to_string(),
            account: None,
            bank_account: Some(bank.clone()),
        });

        assert_eq!(mapping.debit_account(PaymentMethodId(7)), Some(&bank));
        assert_eq!(mapping.debit_account(PaymentMethodId(8)), None);
    }

    #[test]
    fn direct_account_wins_over_bank_fallback() {
        let cash = Account::new("1101", "Cash", AccountKind::Asset);
        let bank = Account::new("1120", "Bank", AccountKind::Asset);
        let mapping = AccountMapping::new(None).with_payment_method(PaymentMethodAccount {
            payment_method_id: PaymentMethodId(1),
            name: "Cash".to_string(),
            account: Some(cash.clone()),
            bank_account: Some(bank),
        });

        assert_eq!(mapping.debit_account(PaymentMethodId(1)), Some(&cash));
    }
}
