pub mod bencode;
pub mod chunker;
pub mod config;
pub mod crypto;
pub mod meta;
pub mod path;
pub mod proto;
pub mod secret;
pub mod transport;
