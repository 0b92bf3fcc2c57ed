//! Background work owned by a tick scheduler.

pub(crate) mod flusher;
