//! Command dispatcher: per-connection request pipeline and command handlers.

pub mod handler;
pub mod handlers;
pub mod worker;

pub use handler::{CommandContext, CommandHandler, HandlerFactory, HandlerRegistry, WorkerInfo};
pub use worker::{DispatchReply, Dispatcher};
