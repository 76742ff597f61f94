#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use annotation_webhook_core as core;

mod admission;
mod args;
mod object;
mod server;
pub mod tls;

pub use self::{
    admission::{Admission, Error},
    args::Args,
    object::{DecodeError, Object},
    server::Bound,
};
