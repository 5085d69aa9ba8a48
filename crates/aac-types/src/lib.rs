pub mod course;
pub mod cost;
pub mod errors;
pub mod run;
pub mod space;

pub use course::*;
pub use cost::*;
pub use errors::*;
pub use run::*;
pub use space::*;
