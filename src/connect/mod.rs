//! Link establishment: racing candidate proxies until one of them accepts a link.

pub mod backoff;
pub mod pipeline;
pub mod prober;
