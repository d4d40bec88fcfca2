//! Process-level infrastructure shared by the binary and the web layer:
//! command line / environment configuration and console logging.

pub mod config;
pub mod logging;
