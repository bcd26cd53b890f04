//! Health test results shared by stores, probes and the controller.

use serde::Serialize;

/// Outcome of a health test on one component.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub component: String,
    /// The component is not doing its job and should be restarted.
    pub restart_required: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl HealthReport {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            ..Self::default()
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn is_healthy(&self) -> bool {
        !self.restart_required && self.warnings.is_empty() && self.errors.is_empty()
    }

    /// One line per finding, prefixed with the component.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for error in &self.errors {
            lines.push(format!("{}: error: {error}", self.component));
        }
        for warning in &self.warnings {
            lines.push(format!("{}: warning: {warning}", self.component));
        }
        if self.restart_required {
            lines.push(format!("{}: restart required", self.component));
        }
        lines
    }
}
