pub mod errors;
pub mod policy;

pub use errors::*;
pub use policy::*;
