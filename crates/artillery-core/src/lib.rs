pub mod command;
pub mod engine;
pub mod error;
pub mod ids;
pub mod model;
pub mod snapshot;
pub mod time;
pub mod types;

pub use command::*;
pub use engine::*;
pub use error::*;
pub use ids::*;
pub use model::*;
pub use snapshot::*;
pub use time::*;
pub use types::*;
