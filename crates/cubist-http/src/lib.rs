//! REST transport for cubist
//!
//! A thin async layer over reqwest that speaks to a cube server:
//!
//! - [`HttpClient`] with connection pooling, timeouts and credentials
//! - [`Request`] describing a single call relative to the service root
//! - [`Transport`], the seam every higher layer talks through
//! - [`SessionContext`] carrying the server version and active sandbox

pub mod client;
pub mod config;
pub mod error;
pub mod request;
pub mod response;
pub mod session;
pub mod transport;

pub use client::HttpClient;
pub use config::{Credentials, HttpClientConfig};
pub use error::{HttpError, HttpErrorCategory, HttpResult};
pub use request::{odata_quote, Request, RequestBody};
pub use response::{HttpResponse, HttpResponseBuilder};
pub use session::SessionContext;
pub use transport::Transport;

pub use cubist_common::{HttpMethod, HttpStatus};
