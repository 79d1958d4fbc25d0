//! Store queries and closure resolution.

mod query;
mod resolve;

pub use query::{parse_path_info, NixCli, PathInfo, StoreQuery};
pub use resolve::resolve_closure;

#[cfg(test)]
pub(crate) use resolve::list_object;
