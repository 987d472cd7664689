use anyhow::anyhow;
use std::any::Any;

/// Turn a `catch_unwind` payload into a useful error message.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("Job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("Job panicked: {message}")
    } else {
        anyhow!("Job panicked")
    }
}
