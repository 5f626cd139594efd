pub mod identity;
pub mod instance;

pub use identity::{IdentityKey, RawIdentity, SessionKey};
pub use instance::InstanceInfo;
