//! Constellation RPC - client side of the request/response protocol
//!
//! Many concurrent calls share one connection. Each request carries a
//! sequence number. One background task writes requests in order; another
//! reads responses and routes them back to the waiting caller by that
//! number.
//!
//! # Example
//!
//! ```no_run
//! use constellation_rpc::{Client, Options, codec::CodecType};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let addr = "127.0.0.1:8080".parse()?;
//! let client = Client::dial_tcp(addr, Some(Options::with_codec(CodecType::Json))).await?;
//!
//! // Wait for the reply
//! let sum: i32 = client.call("Arith", "Add", &(2, 3)).await?;
//!
//! // Or submit now and collect the reply later
//! let submission = client.go::<_, i32>("Arith", "Mul", &(4, 5), None).await;
//! if let Some(call) = submission.wait().await {
//!     let product = call.into_result()?;
//! }
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod client;
pub mod codec;
pub mod error;
pub mod options;
mod receiver;
mod registry;
mod sender;
pub mod transport;

// Re-exports for convenience
pub use call::{call_channel, Call, CallReceiver, CallSender, Submission};
pub use client::Client;
pub use error::{Error, Result};
pub use options::{Options, MAGIC_NUMBER};
