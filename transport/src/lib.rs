pub mod dns;
pub mod endpoint;
pub mod stream;
pub mod tls;
