pub mod platform;
pub mod streams;

pub use platform::{ExecutionContext, Promise, Resolver, StreamFuture};
pub use streams::*;
