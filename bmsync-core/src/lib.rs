mod client;
mod multistatus;

pub use client::{DavClient, DavError, DavErrorClass, DavOptions, ModifiedAt, RemoteEntry};
pub use multistatus::{PropResponse, parse_multistatus};
pub use reqwest::StatusCode;
