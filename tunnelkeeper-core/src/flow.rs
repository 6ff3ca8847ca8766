//! Connection flow: login to the primary, optionally the secondary, switch the
//! active context, then reinitialize every service.
//!
//! The flow is linear. Any failed step aborts it; the operator re-submits to retry.

use thiserror::Error;

use crate::cluster::{ClusterCatalog, complete};
use crate::model::{ClusterPair, ClusterRole};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowStep {
    AwaitingPrimaryLogin,
    AwaitingSecondaryLogin,
    SwitchingContext,
    Reinitializing,
    Done,
    Failed,
}

impl FlowStep {
    pub fn label(&self) -> &'static str {
        match self {
            FlowStep::AwaitingPrimaryLogin => "logging in to primary",
            FlowStep::AwaitingSecondaryLogin => "logging in to secondary",
            FlowStep::SwitchingContext => "switching context",
            FlowStep::Reinitializing => "reinitializing services",
            FlowStep::Done => "done",
            FlowStep::Failed => "failed",
        }
    }

    /// The login step that authenticates `role`.
    pub fn login_for(role: ClusterRole) -> FlowStep {
        match role {
            ClusterRole::Primary => FlowStep::AwaitingPrimaryLogin,
            ClusterRole::Secondary => FlowStep::AwaitingSecondaryLogin,
        }
    }
}

/// An in-progress reconnection.
#[derive(Clone, Debug)]
pub struct ConnectionFlowState {
    pub id: u64,
    pub target: ClusterPair,
    pub step: FlowStep,
    pub transcript: Vec<String>,
}

impl ConnectionFlowState {
    pub fn new(id: u64, target: ClusterPair) -> Self {
        Self {
            id,
            target,
            step: FlowStep::AwaitingPrimaryLogin,
            transcript: Vec::new(),
        }
    }

    pub fn advance(&mut self, step: FlowStep) {
        self.transcript.push(format!("-> {}", step.label()));
        self.step = step;
    }

    /// Appends non-empty lines of tool output to the transcript.
    pub fn record(&mut self, source: &str, output: &str) {
        for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.transcript.push(format!("[{}] {}", source, line));
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("primary cluster name is required")]
    MissingPrimary,
    #[error("invalid character {ch:?} in {field} cluster name")]
    InvalidCharacter { field: &'static str, ch: char },
}

fn check_name(field: &'static str, name: &str) -> Result<(), InputError> {
    match name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        Some(ch) => Err(InputError::InvalidCharacter { field, ch }),
        None => Ok(()),
    }
}

/// Validates connection input: primary required, secondary optional.
pub fn validate_input(primary: &str, secondary: &str) -> Result<ClusterPair, InputError> {
    let primary = primary.trim();
    let secondary = secondary.trim();
    if primary.is_empty() {
        return Err(InputError::MissingPrimary);
    }
    check_name("primary", primary)?;
    check_name("secondary", secondary)?;
    Ok(ClusterPair::new(
        primary,
        (!secondary.is_empty()).then(|| secondary.to_string()),
    ))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InputField {
    #[default]
    Primary,
    Secondary,
}

/// Text fields of the connection input overlay.
#[derive(Clone, Debug, Default)]
pub struct ConnectionForm {
    pub primary: String,
    pub secondary: String,
    pub focus: InputField,
}

impl ConnectionForm {
    pub fn prefilled(pair: Option<&ClusterPair>) -> Self {
        match pair {
            Some(pair) => Self {
                primary: pair.primary.clone(),
                secondary: pair.secondary.clone().unwrap_or_default(),
                focus: InputField::Primary,
            },
            None => Self::default(),
        }
    }

    fn focused_mut(&mut self) -> &mut String {
        match self.focus {
            InputField::Primary => &mut self.primary,
            InputField::Secondary => &mut self.secondary,
        }
    }

    pub fn push(&mut self, ch: char) {
        self.focused_mut().push(ch);
    }

    pub fn backspace(&mut self) {
        self.focused_mut().pop();
    }

    pub fn toggle_focus(&mut self) {
        self.focus = match self.focus {
            InputField::Primary => InputField::Secondary,
            InputField::Secondary => InputField::Primary,
        };
    }

    /// Tab completion of the focused field. Secondary candidates are scoped to
    /// the typed primary. Returns whether the field changed.
    pub fn complete(&mut self, catalog: &ClusterCatalog) -> bool {
        let candidates = match self.focus {
            InputField::Primary => catalog.primaries.clone(),
            InputField::Secondary => catalog.secondaries_of(self.primary.trim()).to_vec(),
        };
        let field = self.focused_mut();
        match complete(field.as_str(), &candidates) {
            Some(completed) => {
                *field = completed;
                true
            }
            None => false,
        }
    }

    pub fn submit(&self) -> Result<ClusterPair, InputError> {
        validate_input(&self.primary, &self.secondary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_primary() {
        assert_eq!(validate_input("  ", "prod"), Err(InputError::MissingPrimary));
    }

    #[test]
    fn test_validate_secondary_optional() {
        let pair = validate_input("alpha", "").unwrap();
        assert_eq!(pair, ClusterPair::new("alpha", None));
        let pair = validate_input(" alpha ", " edge ").unwrap();
        assert_eq!(pair.secondary.as_deref(), Some("edge"));
    }

    #[test]
    fn test_validate_rejects_odd_characters() {
        assert_eq!(
            validate_input("al pha", ""),
            Err(InputError::InvalidCharacter {
                field: "primary",
                ch: ' '
            })
        );
        assert!(validate_input("alpha", "ed/ge").is_err());
    }

    #[test]
    fn test_form_completion_scopes_secondary_to_primary() {
        let catalog = ClusterCatalog::from_names(["acme", "acme-prod", "beta", "beta-perf"]);
        let mut form = ConnectionForm::default();
        form.push('a');
        assert!(form.complete(&catalog));
        assert_eq!(form.primary, "acme");

        form.toggle_focus();
        form.push('p');
        assert!(form.complete(&catalog));
        assert_eq!(form.secondary, "prod");
    }

    #[test]
    fn test_transcript_records_non_empty_lines() {
        let mut flow = ConnectionFlowState::new(1, ClusterPair::new("alpha", None));
        flow.record("login", "Logged in as ops\n\n  \nValid until tomorrow\n");
        flow.advance(FlowStep::SwitchingContext);
        assert_eq!(
            flow.transcript,
            vec![
                "[login] Logged in as ops",
                "[login] Valid until tomorrow",
                "-> switching context",
            ]
        );
    }
}
