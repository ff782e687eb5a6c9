pub mod client;
pub mod user_stream;
