/*

udprpc makes a distinction between calls, responses and acknowledgments. Calls and responses are
JSON arrays; an acknowledgment is the bare 3-byte marker ACK. Every datagram carries one frame.

# Call handshake

A call is acknowledged in two phases:

  client                 server
    ----- call (seq n) ---->
    <-------- ACK ----------     request received
    <--- response (seq n) --     handler finished
    --------- ACK --------->     response received (optional)

If no ACK arrives within ACK_TIMEOUT, the request is resent. Once the request has been acknowledged
the client waits RESPONSE_TIMEOUT for the response, then resends the request as well. Both phases
draw on one budget of MAX_RETRIES sends.

A response which arrives before the ACK implies the ACK.

The server keeps a short cache of recent responses for each client. A resent request whose
sequence is in the cache is re-acknowledged and answered from the cache, so neither a lost ACK nor
a lost response executes the handler again. Since the server handles one datagram at a time, a
request resent while its handler runs is only read once the response is cached.

# Response acknowledgment

When enabled, the client acknowledges every response it receives, including stale duplicates, and
the server resends each response every ACK_TIMEOUT until it is acknowledged or MAX_RETRIES sends
have been made. When disabled on the server, a lost response is recovered through the client's
request retransmission and the response cache.

An ACK may release the wrong response on the server (see below). The client still recovers such a
response by resending its request.

ACKs carry no sequence number. An ACK is credited to the oldest call awaiting one on the client,
and to the oldest unacknowledged response on the server.

# Batched acknowledgment

The server may acknowledge only every Nth request of a client, sending the ACK after the response.
A client talking to such a server cannot wait for per-request ACKs, so its calls are pipelined:
after sending, it waits for the response directly and resends the request every ACK_TIMEOUT.

# Window

The client bounds the number of outstanding calls with an AIMD window:

  success:  window <- window + 1
  timeout:  window <- max(1, window / 2)

Calls beyond the window wait in a backlog. The window never drops below 1, so a call can always
be sent.

The server keeps an advisory buffer hint per client, growing by the base size per request up to
a ceiling and then starting over. It shapes nothing; it is reported for sizing decisions made
elsewhere.

*/

mod ack;
pub mod client;
pub mod codec;
pub mod dispatch;
mod epoch;
mod flow;
mod sequence;
pub mod server;
mod socket;

pub use ack::{AckPolicy, FailureReason};
pub use client::{Call, CallError, ClientHandle, PendingReply, Reply, ThreadedClient};
pub use codec::{RemoteError, RpcResult};
pub use dispatch::{Args, HandlerError, MethodRegistry, RegisterError};
pub use socket::Waker;

pub type Client = client::Client;
pub type Server = server::Server;
