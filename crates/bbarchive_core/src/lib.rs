pub mod archive;
pub mod checksum;
pub mod cleanup;
pub mod config;
pub mod css;
pub mod dom;
pub mod fragments;
pub mod overview;
pub mod runtime;
pub mod scripts;
pub mod session;
pub mod stream;
pub mod urls;
