//! CLI command implementations

pub mod calibrate;
pub mod config;
pub mod delete;
pub mod list;
pub mod purge;
pub mod put;
pub mod status;

pub use calibrate::execute as calibrate;
pub use config::execute as config;
pub use delete::execute as delete;
pub use list::execute as list;
pub use purge::execute as purge;
pub use put::execute as put;
pub use status::execute as status;
