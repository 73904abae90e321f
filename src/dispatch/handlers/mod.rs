//! Built-in handlers for services that need more than static content.

pub mod log;
pub mod login;

use std::sync::Arc;

use crate::dispatch::router::Dispatcher;

pub use log::LogHandler;
pub use login::LoginHandler;

/// Register every built-in handler on `dispatcher`.
pub fn register_builtin(dispatcher: &mut Dispatcher) {
    dispatcher.register("wtv-head-waiter:/login", Arc::new(LoginHandler));
    dispatcher.register("wtv-log:/log", Arc::new(LogHandler));
}
