//! Built-in commands: the envelope, the loopback-aware reply, and a node
//! introspection command.

pub mod add_response;
pub mod command_wrapper;
pub mod get_node_infos;

pub use add_response::AddResponse;
pub use command_wrapper::CommandWrapper;
pub use get_node_infos::GetNodeInfos;
