pub mod migrator_config;
pub mod secret;
pub mod sources;
pub mod validation;

pub use migrator_config::*;
pub use secret::*;
pub use sources::*;
pub use validation::*;
