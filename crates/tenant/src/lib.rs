// Request-side entry point: turns the identity resolved from a request
// into a tenant-scoped connection instance

pub mod configure;
pub mod context;

pub use configure::{configure_instance, identity_from_raw, resolve_context};
pub use context::TenantContext;
