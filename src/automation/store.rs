//! Persistence seam for automation rules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;

use super::models::RuleRecord;

/// Rule CRUD backing the automation engine.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn get_rule(&self, id: i64) -> Result<RuleRecord, StoreError>;

    /// All rules, enabled or not.
    async fn list_rules(&self) -> Result<Vec<RuleRecord>, StoreError>;

    /// Only the rules the engine should evaluate.
    async fn get_enabled_rules(&self) -> Result<Vec<RuleRecord>, StoreError>;

    /// Insert a rule, assigning its id. Returns the stored record.
    async fn create_rule(&self, rule: RuleRecord) -> Result<RuleRecord, StoreError>;

    async fn update_rule(&self, rule: RuleRecord) -> Result<(), StoreError>;

    async fn delete_rule(&self, id: i64) -> Result<(), StoreError>;

    async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<(), StoreError>;
}

/// In-memory rule store for tests and the demo binary.
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: RwLock<HashMap<i64, RuleRecord>>,
    next_id: AtomicI64,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn get_rule(&self, id: i64) -> Result<RuleRecord, StoreError> {
        self.rules
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "rule",
                id: id.to_string(),
            })
    }

    async fn list_rules(&self) -> Result<Vec<RuleRecord>, StoreError> {
        let mut rules: Vec<RuleRecord> = self.rules.read().await.values().cloned().collect();
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }

    async fn get_enabled_rules(&self) -> Result<Vec<RuleRecord>, StoreError> {
        let mut rules: Vec<RuleRecord> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }

    async fn create_rule(&self, mut rule: RuleRecord) -> Result<RuleRecord, StoreError> {
        rule.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.rules.write().await.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, rule: RuleRecord) -> Result<(), StoreError> {
        let mut rules = self.rules.write().await;
        if !rules.contains_key(&rule.id) {
            return Err(StoreError::NotFound {
                entity: "rule",
                id: rule.id.to_string(),
            });
        }
        rules.insert(rule.id, rule);
        Ok(())
    }

    async fn delete_rule(&self, id: i64) -> Result<(), StoreError> {
        self.rules
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                entity: "rule",
                id: id.to_string(),
            })
    }

    async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<(), StoreError> {
        let mut rules = self.rules.write().await;
        match rules.get_mut(&id) {
            Some(rule) => {
                rule.enabled = enabled;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "rule",
                id: id.to_string(),
            }),
        }
    }
}
