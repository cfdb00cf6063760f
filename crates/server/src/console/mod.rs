//! Admin command console.

pub mod commands;
pub mod grammar;
mod session;

pub use commands::{CommandContext, build_dispatcher};
pub use grammar::{
    ArgKind, Arguments, CommandError, DispatchError, Dispatcher, Node, ParseError, ParseErrorKind,
    Privilege, Reply, Usage,
};
pub use session::{Console, privilege_for};
