//! Standard node library
//!
//! Collection of built-in nodes for common operations

mod basic;
mod debug;
mod files;
mod http;
mod logic;
mod time;

pub use basic::{EchoNode, EchoNodeFactory, MergeNode, MergeNodeFactory};
pub use debug::{DebugNode, DebugNodeFactory};
pub use files::{
    FileLoadNode, FileLoadNodeFactory, FileWriteNode, FileWriteNodeFactory, WRITTEN_FILES_KEY,
};
pub use http::{HttpRequestNode, HttpRequestNodeFactory};
pub use logic::{IfNode, IfNodeFactory, PORT_FALSE, PORT_TRUE};
pub use time::{DelayNode, DelayNodeFactory};

use brookruntime::NodeRegistry;
use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &NodeRegistry) {
    registry.register(Arc::new(basic::EchoNodeFactory));
    registry.register(Arc::new(basic::MergeNodeFactory));
    registry.register(Arc::new(logic::IfNodeFactory));
    registry.register(Arc::new(debug::DebugNodeFactory));
    registry.register(Arc::new(time::DelayNodeFactory));
    registry.register(Arc::new(http::HttpRequestNodeFactory));
    registry.register(Arc::new(files::FileWriteNodeFactory));
    registry.register(Arc::new(files::FileLoadNodeFactory));
}
