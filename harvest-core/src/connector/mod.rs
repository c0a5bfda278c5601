//! Contracts between the traversal core and repository-specific code.
//!
//! Repository adapters, document sinks, and connector type factories are
//! supplied by the embedding application. The core never branches on a
//! connector's type name; it only talks to these traits.

pub mod document;
pub mod repository;
pub mod sink;

pub use document::*;
pub use repository::*;
pub use sink::*;
