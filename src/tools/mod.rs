//! 工具层：注册表、视图、执行器与内置工具

pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod view;

pub use echo::EchoTool;
pub use executor::{ToolCallResult, ToolExecutor};
pub use filesystem::{ListDirTool, ReadFileTool, SafeFs, WriteFileTool};
pub use registry::{FnTool, Tool, ToolKind, ToolRegistry};
pub use schema::{args_schema, ToolSchema};
pub use view::ToolView;
