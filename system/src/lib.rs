mod document;
mod history;
mod message;
mod operation;
mod room;
mod sequencer;
mod types;

pub use document::*;
pub use history::*;
pub use message::*;
pub use operation::*;
pub use room::*;
pub use sequencer::*;
pub use types::*;

pub extern crate bincode;
pub extern crate euclid;
pub extern crate serde;
pub extern crate serde_json;
pub extern crate uuid;
