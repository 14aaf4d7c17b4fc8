//! Built-in node definitions.

pub mod array_sum;
pub mod delta_time;
pub mod pass_through;

pub use array_sum::ArraySum;
pub use delta_time::DeltaTime;
pub use pass_through::{BufferPassThrough, PassThrough, Relay};
