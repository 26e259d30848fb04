pub mod fs;
pub mod http_client;
pub mod rate_limit;
