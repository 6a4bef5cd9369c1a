//! Wire formats: raw line/SSE decoding, claude's stream-json model, and
//! OpenCode request bodies.

pub mod emit;
pub mod parse;
pub mod types;
