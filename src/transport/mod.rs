//! Drivers that turn an agent process or service into a [`RunStream`](crate::runner::stream::RunStream).

pub mod client;
pub mod line_stream;
pub mod service_stream;
