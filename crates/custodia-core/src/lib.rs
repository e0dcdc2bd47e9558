pub mod catalog;
pub mod error;
pub mod record;
pub mod traits;
pub mod types;

pub use catalog::*;
pub use error::*;
pub use record::*;
pub use traits::*;
pub use types::*;
