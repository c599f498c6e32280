use crate::prelude::*;
use std::any::Any;

#[macro_use]
mod macros;

pub fn report_panic(e: &dyn Any) {
    if let Some(e) = e.downcast_ref::<String>() {
        error!("panicked: {}", e)
    } else if let Some(e) = e.downcast_ref::<&'static str>() {
        error!("panicked: {}", e)
    } else {
        error!("panicked")
    }
}

pub fn report_failure(err: &anyhow::Error) {
    error!("{}", err);

    for cause in err.chain().skip(1) {
        error!("caused by: {}", cause);
    }
}
