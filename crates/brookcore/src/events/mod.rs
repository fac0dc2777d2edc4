mod base;

pub use base::{
    BroadcastEventBus, EventBus, EventEmitter, ExecutionEvent, ExecutionId, NodeEvent,
    NullEventBus,
};
