pub mod jwt;
pub mod models;
pub mod rbac;
pub mod users;

pub use jwt::TokenVerifier;
pub use models::{Permission, Principal, Role, TokenPair};
pub use rbac::PermissionLogic;
pub use users::UserStore;
