pub mod core;
pub mod public;
pub use self::core::*;
pub use self::public::*;
