mod experiments;
mod sets;

pub use self::experiments::*;
pub use self::sets::*;
