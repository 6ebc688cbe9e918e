pub mod fake_client;
pub mod objects;
