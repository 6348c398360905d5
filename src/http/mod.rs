//! HTTP call model and wire codec.

pub mod body;
pub mod call;
pub mod codec;

pub use body::{RequestBody, ResponseStore};
pub use call::{Call, CondensedStatus, MethodDescriptor, ReconnectMode, RedirectMode};
pub use codec::{BodyFraming, ResponseHead};
