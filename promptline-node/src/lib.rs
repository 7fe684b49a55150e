//! The execution unit: a prompt, a config, a parser and a provider bound
//! together with a private usage ledger.

mod node;

pub use node::{Node, NodeBuilder};
