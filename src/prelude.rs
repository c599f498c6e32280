pub use anyhow::{anyhow, bail, Context, Result as Fallible};
pub use log::{debug, error, info, trace, warn};
pub use serde_derive::{Deserialize, Serialize};
