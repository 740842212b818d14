//! A single statement to run through a transaction manager.

use crate::models::{CommandKind, ParameterSet};

/// Statement text, parameters, command kind and transaction policy for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementInvocation {
    command_text: String,
    kind: CommandKind,
    parameters: ParameterSet,
    owns_transaction: Option<bool>,
}

impl StatementInvocation {
    /// Plain SQL text with `@name` placeholders.
    pub fn text(sql: impl Into<String>, parameters: ParameterSet) -> Self {
        Self {
            command_text: sql.into(),
            kind: CommandKind::Text,
            parameters,
            owns_transaction: None,
        }
    }

    /// Stored procedure call; every parameter is passed in order.
    pub fn procedure(name: impl Into<String>, parameters: ParameterSet) -> Self {
        Self {
            command_text: name.into(),
            kind: CommandKind::StoredProcedure,
            parameters,
            owns_transaction: None,
        }
    }

    /// Override whether this call begins and ends its own transaction.
    pub fn owning_transaction(mut self, owns: bool) -> Self {
        self.owns_transaction = Some(owns);
        self
    }

    pub fn command_text(&self) -> &str {
        &self.command_text
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    /// The explicit override, or `default` when none was given.
    pub fn owns_transaction_or(&self, default: bool) -> bool {
        self.owns_transaction.unwrap_or(default)
    }
}
