pub mod desktop;
mod error;
pub mod exe;
mod exemap;
pub mod family;
mod map;
mod markov;
mod memstat;
pub mod pattern;
pub mod pause;
pub mod proc;
pub mod session;
mod state;
pub mod statefile;
pub mod utils;

pub use error::Error;
pub use exe::Exe;
pub use exemap::ExeMap;
pub use family::Family;
pub use map::{Map, RuntimeStats};
pub use markov::{Markov, MarkovState};
pub use memstat::MemStat;
pub use state::State;
