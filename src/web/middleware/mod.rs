pub mod caller_tier;
pub mod request_id;
