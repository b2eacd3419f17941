//! 连接层：注册表 + 生命周期控制

mod lifecycle;
mod registry;

pub use lifecycle::{
    CloseReason, ConnectionActor, ConnectionContext, ConnectionState, SpawnedConnection,
};
pub use registry::{ConnectionHandle, ConnectionRegistry, ControlSignal, DeliverResult};
