//! Automatic update rules owned by a domain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Workflow an automatic update rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleWorkflow {
    CaseUpdate,
    Scheduling,
}

impl RuleWorkflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleWorkflow::CaseUpdate => "case_update",
            RuleWorkflow::Scheduling => "scheduling",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "scheduling" => RuleWorkflow::Scheduling,
            _ => RuleWorkflow::CaseUpdate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AutomaticUpdateRule {
    pub rule_id: Uuid,
    pub domain: String,
    pub name: String,
    pub workflow: String,
    /// Scheduling rule that sends a survey and so needs inbound SMS.
    pub uses_survey: bool,
    pub active: bool,
    pub deleted: bool,
    pub last_modified_utc: DateTime<Utc>,
}

impl AutomaticUpdateRule {
    pub fn parsed_workflow(&self) -> RuleWorkflow {
        RuleWorkflow::from_string(&self.workflow)
    }

    pub fn is_live(&self) -> bool {
        self.active && !self.deleted
    }

    pub fn matches(&self, selector: RuleSelector) -> bool {
        self.parsed_workflow() == selector.workflow && (!selector.survey_only || self.uses_survey)
    }
}

/// Subset of a domain's rules affected by a lost privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleSelector {
    pub workflow: RuleWorkflow,
    pub survey_only: bool,
}

impl RuleSelector {
    pub fn all(workflow: RuleWorkflow) -> Self {
        Self {
            workflow,
            survey_only: false,
        }
    }

    pub fn surveys() -> Self {
        Self {
            workflow: RuleWorkflow::Scheduling,
            survey_only: true,
        }
    }
}
