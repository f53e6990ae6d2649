//! A virtual socket layer: application code performs bind / connect / listen / send / receive
//!  against a [socket::ProxySocket], but the actual network traffic originates at a remote
//!  *proxy* process. Setup, teardown and socket options travel over an RPC control channel,
//!  payload travels over a separate message stream.
//!
//! ## Overview
//!
//! * A socket resolves its destination through the name service, and the [connect] pipeline
//!   races candidate proxies until one of them accepts a *link* (first success wins, all other
//!   in-flight work is cancelled).
//! * A [link::ProxyLink] owns exactly one data plane: a bounded send stage that splits payload
//!   to fit the stream's buffer size, and a bounded receive stage that filters and classifies
//!   inbound messages.
//! * Closing a link runs the 'unlink' RPC and stream termination concurrently. Teardown is
//!   fatal only if *both* fail.
//! * The [server] module is the proxy's half: it answers control requests against real network
//!   sockets and pumps payload between those sockets and the links' message streams.
//!
//! ## Wire format
//!
//! Messages are MessagePack encoded, and the layout must stay compatible with the native proxy
//!  implementation. All structures are encoded as arrays ('object headers') with a fixed number
//!  of fields:
//!
//! ```ascii
//! Message (9 fields):
//!  0: version (u32) - the upper 16 bits must match the local protocol epoch
//!  1: source reference (bin 16)
//!  2: proxy reference (bin 16)
//!  3: target reference (bin 16)
//!  4: sequence id (u32)
//!  5: error code (i32)
//!  6: is response (bool)
//!  7: content type id (u32)
//!  8: content - selected by (type id, is response); 'void' content is an explicit nil
//!
//! SocketAddress (field count depends on the family):
//!  Any:       [family]
//!  Unix:      [family, path]
//!  Inet4:     [family, port, address (bin 4)]
//!  Inet6:     [family, port, flow, address (bin 16), scope id]
//!  ProxyName: [family, port, flags, interface index, host]
//! ```

pub mod config;
pub mod connect;
pub mod error;
pub mod link;
pub mod model;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod socket;
pub mod test_util;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
