use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::definition::SagaDefinition;
use crate::error::ValidationError;
use crate::step::StepHandler;

/// Maps operation names to step handlers.
///
/// Populated before any saga runs; sagas naming an unknown handler are
/// rejected when they start, not when the step is reached.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateHandler`] if the name is taken.
    pub fn register(&mut self, handler: impl StepHandler + 'static) -> Result<(), ValidationError> {
        self.register_arc(Arc::new(handler))
    }

    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateHandler`] if the name is taken.
    pub fn register_arc(&mut self, handler: Arc<dyn StepHandler>) -> Result<(), ValidationError> {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(ValidationError::DuplicateHandler { name });
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Check that every step of `definition` has a registered handler.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::UnregisteredHandler`] for the first step
    /// whose handler is missing.
    pub fn validate(&self, definition: &SagaDefinition) -> Result<(), ValidationError> {
        match definition
            .steps()
            .iter()
            .find(|step| !self.contains(&step.handler))
        {
            Some(step) => Err(ValidationError::UnregisteredHandler {
                step: step.name.clone(),
                handler: step.handler.clone(),
            }),
            None => Ok(()),
        }
    }
}
