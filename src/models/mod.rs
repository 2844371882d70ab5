pub mod endpoint;
pub mod execution_log;
pub mod variable_bundle;

pub use endpoint::{is_reserved_path, normalize_path, Endpoint, HttpMethod, NewEndpoint};
pub use execution_log::ExecutionLogEntry;
pub use variable_bundle::{with_prelude, VariableBundle};
