//! Automation rule model: stored definitions and their compiled form.
//!
//! A rule is a list of definitions; a definition is a conjunction of
//! conditions plus the actions to apply when they all hold. Within one
//! rule the first matching definition wins; independent rules all run.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AutomationError;
use crate::models::{Conversation, ConversationStatus, Priority};

/// Which event class a rule reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    NewConversation,
    ConversationUpdate,
    TimeTrigger,
}

/// A stored automation rule, as persisted and edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub rule_type: RuleType,
    pub definitions: Vec<RuleDefinition>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: ConditionField,
    pub op: Operator,
    #[serde(default)]
    pub value: Option<String>,
}

/// Conversation fields a condition can inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Subject,
    /// The denormalized last-message summary.
    Content,
    Status,
    Priority,
    AssignedUser,
    AssignedTeam,
    Inbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    /// Regular expression match against the raw field value.
    Matches,
    /// Field has a non-empty value.
    Set,
    NotSet,
}

/// Mutations a matching definition applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    AssignUser { user_id: i64 },
    AssignTeam { team_id: i64 },
    SetStatus { status: ConversationStatus },
    SetPriority { priority: Priority },
}

// ── Compiled form ───────────────────────────────────────────────────

/// A rule with regexes pre-compiled, held in the engine's snapshot.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: i64,
    pub name: String,
    pub rule_type: RuleType,
    pub definitions: Vec<CompiledDefinition>,
}

#[derive(Debug, Clone)]
pub struct CompiledDefinition {
    pub conditions: Vec<CompiledCondition>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub field: ConditionField,
    pub matcher: Matcher,
}

#[derive(Debug, Clone)]
pub enum Matcher {
    Equals(String),
    NotEquals(String),
    Contains(String),
    Regex(Regex),
    Set,
    NotSet,
}

impl CompiledRule {
    /// Compile a stored record, validating condition values and regexes.
    pub fn compile(record: &RuleRecord) -> Result<Self, AutomationError> {
        let mut definitions = Vec::with_capacity(record.definitions.len());
        for definition in &record.definitions {
            let mut conditions = Vec::with_capacity(definition.conditions.len());
            for condition in &definition.conditions {
                conditions.push(CompiledCondition {
                    field: condition.field,
                    matcher: compile_matcher(condition)?,
                });
            }
            if definition.actions.is_empty() {
                return Err(AutomationError::InvalidDefinition(format!(
                    "rule {} has a definition with no actions",
                    record.id
                )));
            }
            definitions.push(CompiledDefinition {
                conditions,
                actions: definition.actions.clone(),
            });
        }
        Ok(Self {
            id: record.id,
            name: record.name.clone(),
            rule_type: record.rule_type,
            definitions,
        })
    }

    /// Actions of the first definition whose conditions all hold, if any.
    pub fn evaluate(&self, conversation: &Conversation) -> Option<&[Action]> {
        for definition in &self.definitions {
            let matched = definition
                .conditions
                .iter()
                .all(|c| c.matches(conversation));
            if matched {
                return Some(&definition.actions);
            }
        }
        None
    }
}

impl CompiledCondition {
    fn matches(&self, conversation: &Conversation) -> bool {
        let value = field_value(conversation, self.field);
        match &self.matcher {
            Matcher::Set => value.as_deref().is_some_and(|v| !v.is_empty()),
            Matcher::NotSet => !value.as_deref().is_some_and(|v| !v.is_empty()),
            Matcher::Equals(expected) => value
                .as_deref()
                .is_some_and(|v| v.eq_ignore_ascii_case(expected)),
            Matcher::NotEquals(expected) => !value
                .as_deref()
                .is_some_and(|v| v.eq_ignore_ascii_case(expected)),
            Matcher::Contains(needle) => value
                .as_deref()
                .is_some_and(|v| v.to_lowercase().contains(&needle.to_lowercase())),
            Matcher::Regex(re) => value.as_deref().is_some_and(|v| re.is_match(v)),
        }
    }
}

fn compile_matcher(condition: &Condition) -> Result<Matcher, AutomationError> {
    let require_value = || {
        condition.value.clone().ok_or_else(|| {
            AutomationError::InvalidDefinition(format!(
                "operator {:?} requires a value",
                condition.op
            ))
        })
    };
    Ok(match condition.op {
        Operator::Set => Matcher::Set,
        Operator::NotSet => Matcher::NotSet,
        Operator::Equals => Matcher::Equals(require_value()?),
        Operator::NotEquals => Matcher::NotEquals(require_value()?),
        Operator::Contains => Matcher::Contains(require_value()?),
        Operator::Matches => {
            let pattern = require_value()?;
            let re = Regex::new(&pattern).map_err(|e| {
                AutomationError::InvalidDefinition(format!("bad regex {pattern:?}: {e}"))
            })?;
            Matcher::Regex(re)
        }
    })
}

fn field_value(conversation: &Conversation, field: ConditionField) -> Option<String> {
    match field {
        ConditionField::Subject => conversation.subject.clone(),
        ConditionField::Content => conversation.last_message.clone(),
        ConditionField::Status => Some(conversation.status.as_str().to_string()),
        ConditionField::Priority => conversation.priority.map(|p| p.as_str().to_string()),
        ConditionField::AssignedUser => conversation.assigned_user_id.map(|id| id.to_string()),
        ConditionField::AssignedTeam => conversation.assigned_team_id.map(|id| id.to_string()),
        ConditionField::Inbox => Some(conversation.inbox_id.to_string()),
    }
}
