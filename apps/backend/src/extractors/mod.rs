pub mod admin_identity;
pub mod validated;

pub use admin_identity::AdminIdentity;
pub use validated::{ValidatedJson, ValidatedQuery};
