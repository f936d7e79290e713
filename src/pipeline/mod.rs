mod definitions;
pub mod schema;

pub use definitions::*;
