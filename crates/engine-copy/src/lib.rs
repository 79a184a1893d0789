pub mod classify;
pub mod error;
pub mod extensions;
pub mod indexes;
pub mod schema;
pub mod sequences;
pub mod tabledata;
