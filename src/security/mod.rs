pub mod command_policy;
pub mod path_guard;

pub use command_policy::CommandPolicy;
pub use path_guard::{PathGuard, ResolvedPath};
