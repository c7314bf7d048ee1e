//! Event-sourced aggregates of the document store.

pub mod aggregate;
pub mod command;
pub mod descriptor;
pub mod handle;

pub use aggregate::Aggregate;
pub use command::CommandContext;
pub use descriptor::{ContentDescriptor, DescriptorCommand, DescriptorError, DescriptorEvent};
pub use handle::{Handle, HandleCommand, HandleError, HandleEvent};
