// Library crate alongside the binaries so the modules can be unit tested
// and shared between main.rs and bin/gen_certs.rs.

pub mod acme;
pub mod certs;
pub mod config;
pub mod report;
pub mod server;
