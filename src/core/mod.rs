pub mod error;
pub mod types;

pub use self::error::{EnvError, EnvResult};
