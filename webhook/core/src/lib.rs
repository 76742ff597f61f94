#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod policy;

pub use self::policy::{Annotation, ConfigError, Decision, PolicyConfig};

/// The message attached to an admitted pod.
pub const ALLOWED_MESSAGE: &str = "pod is valid";

/// The message attached to a denied pod.
pub const DENIED_MESSAGE: &str = "no matching annotation found";
