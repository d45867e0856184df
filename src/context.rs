use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Supplies whatever the host document currently exposes (selection, text, ...).
pub trait HostContextProvider: Send + Sync {
    fn context(&self) -> Option<Value>;
}

/// Context shapes the Office hosts produce.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum HostContext {
    /// Selected range in a spreadsheet.
    ExcelSelection { address: String, values: Vec<Vec<Value>> },
    /// Body text of a document.
    WordDocument(String),
}

/// Context set explicitly by the embedding UI.
#[derive(Default)]
pub struct SharedContext {
    current: ArcSwapOption<Value>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, context: Option<Value>) {
        self.current.store(context.map(Arc::new));
    }

    pub fn set_host(&self, context: &HostContext) {
        match serde_json::to_value(context) {
            Ok(value) => self.set(Some(value)),
            Err(e) => log::error!("Failed to serialize host context: {}", e),
        }
    }
}

impl HostContextProvider for SharedContext {
    fn context(&self) -> Option<Value> {
        self.current.load_full().map(|v| (*v).clone())
    }
}

pub fn context_message(context: &Value) -> String {
    format!("Current context: {}", context)
}
