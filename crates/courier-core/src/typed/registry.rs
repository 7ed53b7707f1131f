//! TypedRegistry - Handler の登録と管理
//!
//! 起動時に登録（mutable）、実行時は読み取りのみ（immutable）。
//! ロックは不要です。

use crate::typed::handler::TypedHandler;

use super::handler::{DynHandler, Handler};
use super::task::Task;
use std::collections::HashMap;
use std::sync::Arc;

/// task_type -> handler.
#[derive(Default)]
pub struct TypedRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for task type '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl TypedRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let task_type = T::TYPE.to_string();
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        let typed_handler = TypedHandler::new(handler);
        self.handlers.insert(task_type, Arc::new(typed_handler));
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
