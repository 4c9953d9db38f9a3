pub mod data_header;
pub mod hello;
pub mod meta;
