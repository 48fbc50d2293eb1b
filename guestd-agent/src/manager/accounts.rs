//! Account manager: provisions local users from the descriptor's
//! published key entries.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use super::{Cycle, Manager};
use crate::os::AccountOps;

pub struct AccountManager {
    accounts: Arc<dyn AccountOps>,
    /// Usernames provisioned on the last converge.
    last_users: Mutex<BTreeSet<String>>,
}

impl AccountManager {
    pub fn new(accounts: Arc<dyn AccountOps>) -> Self {
        Self {
            accounts,
            last_users: Mutex::new(BTreeSet::new()),
        }
    }

    /// Usernames named by the descriptor's key entries, instance scope
    /// first. Entries are `user:key` lines; malformed lines are dropped.
    fn desired_users(cycle: &Cycle) -> BTreeSet<String> {
        let instance = cycle.new.instance.attributes.user_keys.as_deref();
        let project = cycle.new.project.attributes.user_keys.as_deref();
        [instance, project]
            .into_iter()
            .flatten()
            .flat_map(str::lines)
            .filter_map(|line| {
                let user = line.split(':').next()?.trim();
                (!user.is_empty()).then(|| user.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl Manager for AccountManager {
    fn name(&self) -> &'static str {
        "accounts"
    }

    async fn disabled(&self, cycle: &Cycle) -> Result<bool> {
        // No descriptor attribute for this toggle; the local file is the
        // only override.
        Ok(cycle.config.accounts.disable.unwrap_or(false))
    }

    async fn drifted(&self, cycle: &Cycle) -> Result<bool> {
        Ok(Self::desired_users(cycle) != *self.last_users.lock().await)
    }

    async fn converge(&self, cycle: &Cycle) -> Result<()> {
        let desired = Self::desired_users(cycle);
        let mut applied = self.last_users.lock().await;
        let already = applied.clone();

        // Accounts that disappear from the descriptor are forgotten, not
        // deleted from the OS; deprovisioning is a host-side policy.
        let mut next: BTreeSet<String> =
            already.intersection(&desired).cloned().collect();

        for user in desired.difference(&already) {
            match self.accounts.ensure_user(user).await {
                Ok(()) => {
                    next.insert(user.clone());
                }
                Err(e) => warn!(user = %user, "failed to provision account: {e}"),
            }
        }

        *applied = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::metadata::descriptor::Descriptor;
    use crate::os::OsError;

    #[derive(Default)]
    struct FakeAccounts {
        provisioned: Mutex<Vec<String>>,
        fail_for: Option<&'static str>,
    }

    #[async_trait]
    impl AccountOps for FakeAccounts {
        async fn ensure_user(&self, username: &str) -> Result<(), OsError> {
            if self.fail_for == Some(username) {
                return Err(OsError::Command("useradd failed".into()));
            }
            self.provisioned.lock().await.push(username.to_string());
            Ok(())
        }
    }

    fn cycle_with_keys(keys: &str) -> Cycle {
        let mut descriptor = Descriptor::default();
        descriptor.instance.attributes.user_keys = Some(keys.to_string());
        Cycle::new(None, Arc::new(descriptor), Arc::new(AgentConfig::default()))
    }

    #[tokio::test]
    async fn provisions_each_user_once() {
        let accounts = Arc::new(FakeAccounts::default());
        let accounts_dyn: Arc<dyn AccountOps> = accounts.clone();
        let manager = AccountManager::new(accounts_dyn);
        let cycle = cycle_with_keys("alice:ssh-rsa AAA\nbob:ssh-rsa BBB\nalice:ssh-rsa CCC");

        assert!(manager.drifted(&cycle).await.unwrap());
        manager.converge(&cycle).await.unwrap();

        assert_eq!(*accounts.provisioned.lock().await, vec!["alice", "bob"]);
        assert!(!manager.drifted(&cycle).await.unwrap());
    }

    #[tokio::test]
    async fn failed_provisioning_is_retried_next_cycle() {
        let accounts = Arc::new(FakeAccounts {
            fail_for: Some("bob"),
            ..FakeAccounts::default()
        });
        let accounts_dyn: Arc<dyn AccountOps> = accounts.clone();
        let manager = AccountManager::new(accounts_dyn);
        let cycle = cycle_with_keys("alice:ssh-rsa AAA\nbob:ssh-rsa BBB");

        manager.converge(&cycle).await.unwrap();

        // bob never landed in the memo, so the next drift check fires.
        assert!(manager.drifted(&cycle).await.unwrap());
        assert_eq!(*accounts.provisioned.lock().await, vec!["alice"]);
    }

    #[tokio::test]
    async fn removed_users_are_forgotten_without_os_deletion() {
        let accounts = Arc::new(FakeAccounts::default());
        let accounts_dyn: Arc<dyn AccountOps> = accounts.clone();
        let manager = AccountManager::new(accounts_dyn);

        manager
            .converge(&cycle_with_keys("alice:ssh-rsa AAA\nbob:ssh-rsa BBB"))
            .await
            .unwrap();
        manager
            .converge(&cycle_with_keys("alice:ssh-rsa AAA"))
            .await
            .unwrap();

        assert_eq!(*manager.last_users.lock().await, {
            let mut expected = BTreeSet::new();
            expected.insert("alice".to_string());
            expected
        });
        // No extra provisioning happened for the removal.
        assert_eq!(*accounts.provisioned.lock().await, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn local_config_can_disable() {
        let manager = AccountManager::new(Arc::new(FakeAccounts::default()));
        let mut config = AgentConfig::default();
        config.accounts.disable = Some(true);
        let cycle = Cycle::new(
            None,
            Arc::new(Descriptor::default()),
            Arc::new(config),
        );
        assert!(manager.disabled(&cycle).await.unwrap());
    }
}
