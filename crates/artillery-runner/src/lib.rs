pub mod config;
pub mod doctor;
pub mod guard;
pub mod process;
pub mod runner;
pub mod status;

pub use config::*;
pub use doctor::*;
pub use guard::*;
pub use process::*;
pub use runner::*;
pub use status::*;
