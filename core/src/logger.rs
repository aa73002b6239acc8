// Namespaced logging facade over `tracing`
//
// Every engine component logs through a scope like `push-manager:mediator`
// so one process hosting several managers stays readable.

use crate::store::join_namespaces;

#[derive(Debug, Clone)]
pub struct Logger {
    scope: String,
}

impl Logger {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }

    /// Derive a logger with the suffix appended to this scope.
    pub fn scoped(&self, suffix: &str) -> Logger {
        Logger {
            scope: join_namespaces(&self.scope, suffix, ":"),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        tracing::debug!(scope = %self.scope, "{}", message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        tracing::info!(scope = %self.scope, "{}", message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        tracing::warn!(scope = %self.scope, "{}", message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        tracing::error!(scope = %self.scope, "{}", message.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_joins_with_colon() {
        let log = Logger::new("push-manager");
        assert_eq!(log.scoped("mediator").scope(), "push-manager:mediator");
    }

    #[test]
    fn test_scoped_elides_empty_root() {
        let log = Logger::new("");
        assert_eq!(log.scoped("mediator").scope(), "mediator");
    }
}
