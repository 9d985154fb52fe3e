//! A multiplexing FastCGI server runtime.
//!
//! `switchboard` implements the server side of the FastCGI protocol for
//! multi-threaded applications. One thread owns an [`FcgiInterface`] built
//! over an already-listening socket and calls
//! [`accept_requests`](FcgiInterface::accept_requests) in a loop; each
//! returned [`FcgiRequest`] can be moved to a worker thread and serviced
//! there, writing back over its originating connection without any
//! explicit synchronization with the interface thread. Multiple
//! concurrent requests per connection (request multiplexing) and multiple
//! concurrent connections are both supported.
//!
//! ```no_run
//! use switchboard::{FcgiInterface, InterfaceConfig};
//! use std::net::TcpListener;
//!
//! let listener = TcpListener::bind("localhost:9000")?;
//! let mut interface = FcgiInterface::new(listener, InterfaceConfig::new(10, 10))?;
//! loop {
//!     for mut request in interface.accept_requests()? {
//!         std::thread::spawn(move || {
//!             request.write_stdout(b"Content-Type: text/plain\n\nhello");
//!             request.complete(0);
//!         });
//!     }
//! }
//! # Ok::<(), switchboard::InterfaceError>(())
//! ```
#![allow(dead_code)]

mod assembler;
pub mod codec;
mod connection;
mod error;
mod id;
mod interface;
pub mod protocol;
mod request;
mod store;

pub use error::{IdExhausted, InterfaceError, StoreError};
pub use id::RequestIdAllocator;
pub use interface::{FcgiInterface, InterfaceConfig, InterfaceStatus};
pub use protocol::{ProtocolStatus, Role};
pub use request::FcgiRequest;
pub use store::{ConnId, RequestKey};
